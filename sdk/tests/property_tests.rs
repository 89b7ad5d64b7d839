use proptest::prelude::*;
use sdk::errors::{BriefErrorExt, EngineError};
use sdk::types::ConversationId;

// User hints are static text: whatever the underlying failure carries
// must never reach the chat user verbatim.
proptest! {
    #[test]
    fn test_error_user_hint_completeness(detail in "[a-zA-Z0-9/_.:-]{12,64}") {
        let errs = vec![
            EngineError::Config(detail.clone()),
            EngineError::Storage(detail.clone()),
            EngineError::UnknownCapability(detail.clone()),
            EngineError::capability("search_code", &detail),
            EngineError::Transcription(detail.clone()),
            EngineError::Reasoning(detail.clone()),
            EngineError::Network(detail.clone()),
            EngineError::DocumentCollision(std::path::PathBuf::from(&detail)),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(hint.starts_with("Sorry"));
            prop_assert!(!hint.contains(&detail));
        }
    }
}

proptest! {
    #[test]
    fn test_conversation_id_is_opaque(raw in "\\PC{1,40}") {
        let id = ConversationId::new(raw.clone());
        prop_assert_eq!(id.as_str(), raw.as_str());

        let json = serde_json::to_string(&id).unwrap();
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, id);
    }
}
