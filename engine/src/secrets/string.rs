use std::fmt;

/// Credential value that never prints itself.
///
/// `Debug` and `Display` both render `[REDACTED]`, so a config or context
/// struct holding one can be logged safely. Use [`SecretString::expose`] at the
/// single point where the raw value goes into a request header or URL.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw credential
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting_hides_value() {
        let secret = SecretString::from("sk-live-value");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert!(!format!("{:?}", secret).contains("live"));
        assert_eq!(secret.expose(), "sk-live-value");
    }
}
