//! Code-search collaborator backed by the GitHub REST API.
//!
//! Exposed to the reasoning collaborator as four capabilities:
//! `search_code`, `describe_repository`, `list_pull_requests` and
//! `get_pull_request`. Every capability accepts an optional `repository`
//! argument and falls back to the configured default.

use super::{CapabilityHandler, CapabilityRegistry, CapabilitySchema};
use crate::secrets::SecretString;
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("brief/", env!("CARGO_PKG_VERSION"));
const SNIPPET_LIMIT: usize = 400;

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeHit {
    pub path: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub full_name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub open_issues: u64,
    pub pushed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub author: Option<String>,
    pub url: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestDetail {
    #[serde(flatten)]
    pub summary: PullRequestSummary,
    pub body: Option<String>,
    pub merged: bool,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

/// Read-only view of a code repository
#[async_trait]
pub trait CodeSearch: Send + Sync {
    async fn search(&self, query: &str, repo: &str) -> Result<Vec<CodeHit>, EngineError>;

    async fn describe(&self, repo: &str) -> Result<RepositorySummary, EngineError>;

    /// Most recently updated pull requests in `state` (open, closed or all)
    async fn list_pull_requests(
        &self,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequestSummary>, EngineError>;

    async fn pull_request(&self, repo: &str, number: u64) -> Result<PullRequestDetail, EngineError>;
}

pub struct GithubCodeSearch {
    base_url: String,
    token: SecretString,
    max_results: usize,
    client: reqwest::Client,
}

impl GithubCodeSearch {
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build GitHub client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            max_results: max_results.max(1),
            client,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)], accept: &str) -> Result<Value, EngineError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("GitHub request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let remaining = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), remaining.as_deref(), &text));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::capability("github", format!("invalid response: {}", e)))
    }
}

fn classify_failure(status: u16, rate_remaining: Option<&str>, body: &str) -> EngineError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status));

    match status {
        429 => EngineError::RateLimited(message),
        403 if rate_remaining == Some("0") => EngineError::RateLimited(message),
        401 => EngineError::capability("github", "authentication failed"),
        404 => EngineError::capability("github", "repository or resource not found"),
        s if s >= 500 => EngineError::Network(format!("GitHub returned {}: {}", s, message)),
        _ => EngineError::capability("github", message),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn pr_summary(pr: &Value) -> Option<PullRequestSummary> {
    Some(PullRequestSummary {
        number: pr.get("number")?.as_u64()?,
        title: str_field(pr, "title").unwrap_or_default(),
        state: str_field(pr, "state").unwrap_or_default(),
        author: pr.get("user").and_then(|u| str_field(u, "login")),
        url: str_field(pr, "html_url").unwrap_or_default(),
        created_at: str_field(pr, "created_at"),
    })
}

#[async_trait]
impl CodeSearch for GithubCodeSearch {
    async fn search(&self, query: &str, repo: &str) -> Result<Vec<CodeHit>, EngineError> {
        let q = format!("{} repo:{}", query, repo);
        let data = self
            .get(
                "/search/code",
                &[("q", q), ("per_page", self.max_results.to_string())],
                "application/vnd.github.text-match+json",
            )
            .await?;

        let items = data
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        Ok(items
            .iter()
            .take(self.max_results)
            .filter_map(|item| {
                let path = str_field(item, "path")?;
                let snippet = item
                    .get("text_matches")
                    .and_then(Value::as_array)
                    .map(|matches| {
                        matches
                            .iter()
                            .filter_map(|m| m.get("fragment").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("\n…\n")
                    })
                    .unwrap_or_default();
                Some(CodeHit {
                    path,
                    snippet: truncate(&snippet, SNIPPET_LIMIT),
                    url: str_field(item, "html_url"),
                })
            })
            .collect())
    }

    async fn describe(&self, repo: &str) -> Result<RepositorySummary, EngineError> {
        let data = self
            .get(&format!("/repos/{}", repo), &[], "application/vnd.github+json")
            .await?;

        Ok(RepositorySummary {
            full_name: str_field(&data, "full_name").unwrap_or_else(|| repo.to_string()),
            description: str_field(&data, "description"),
            default_branch: str_field(&data, "default_branch").unwrap_or_else(|| "main".to_string()),
            language: str_field(&data, "language"),
            topics: data
                .get("topics")
                .and_then(Value::as_array)
                .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
            open_issues: data
                .get("open_issues_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            pushed_at: str_field(&data, "pushed_at"),
        })
    }

    async fn list_pull_requests(
        &self,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequestSummary>, EngineError> {
        let data = self
            .get(
                &format!("/repos/{}/pulls", repo),
                &[
                    ("state", state.to_string()),
                    ("sort", "updated".to_string()),
                    ("direction", "desc".to_string()),
                    ("per_page", self.max_results.to_string()),
                ],
                "application/vnd.github+json",
            )
            .await?;

        Ok(data
            .as_array()
            .map(|prs| prs.iter().filter_map(pr_summary).collect())
            .unwrap_or_default())
    }

    async fn pull_request(&self, repo: &str, number: u64) -> Result<PullRequestDetail, EngineError> {
        let data = self
            .get(
                &format!("/repos/{}/pulls/{}", repo, number),
                &[],
                "application/vnd.github+json",
            )
            .await?;

        let summary = pr_summary(&data)
            .ok_or_else(|| EngineError::capability("github", "pull request payload without number"))?;

        Ok(PullRequestDetail {
            summary,
            body: str_field(&data, "body").map(|b| truncate(&b, 2000)),
            merged: data.get("merged").and_then(Value::as_bool).unwrap_or(false),
            additions: data.get("additions").and_then(Value::as_u64).unwrap_or(0),
            deletions: data.get("deletions").and_then(Value::as_u64).unwrap_or(0),
            changed_files: data.get("changed_files").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// Shared state of the GitHub capability handlers
struct RepoScope {
    search: Arc<dyn CodeSearch>,
    default_repo: Option<String>,
}

impl RepoScope {
    fn repository(&self, capability: &str, arguments: &Map<String, Value>) -> Result<String, EngineError> {
        arguments
            .get("repository")
            .and_then(Value::as_str)
            .filter(|r| !r.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.default_repo.clone())
            .ok_or_else(|| EngineError::capability(capability, "no repository configured"))
    }
}

fn to_value<T: Serialize>(capability: &str, value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::capability(capability, e))
}

struct SearchCode(Arc<RepoScope>);

#[async_trait]
impl CapabilityHandler for SearchCode {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, EngineError> {
        let repo = self.0.repository("search_code", arguments)?;
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let hits = self.0.search.search(query, &repo).await?;
        Ok(json!({ "repository": repo, "total": hits.len(), "hits": hits }))
    }
}

struct DescribeRepository(Arc<RepoScope>);

#[async_trait]
impl CapabilityHandler for DescribeRepository {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, EngineError> {
        let repo = self.0.repository("describe_repository", arguments)?;
        let summary = self.0.search.describe(&repo).await?;
        to_value("describe_repository", summary)
    }
}

struct ListPullRequests(Arc<RepoScope>);

#[async_trait]
impl CapabilityHandler for ListPullRequests {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, EngineError> {
        let repo = self.0.repository("list_pull_requests", arguments)?;
        let state = arguments
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("open");
        let prs = self.0.search.list_pull_requests(&repo, state).await?;
        Ok(json!({ "repository": repo, "state": state, "pull_requests": prs }))
    }
}

struct GetPullRequest(Arc<RepoScope>);

#[async_trait]
impl CapabilityHandler for GetPullRequest {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, EngineError> {
        let repo = self.0.repository("get_pull_request", arguments)?;
        let number = arguments
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::capability("get_pull_request", "number must be positive"))?;
        let pr = self.0.search.pull_request(&repo, number).await?;
        to_value("get_pull_request", pr)
    }
}

/// Register the code-search capabilities on `registry`.
pub fn register_code_search(
    registry: &CapabilityRegistry,
    search: Arc<dyn CodeSearch>,
    default_repo: Option<String>,
) {
    let scope = Arc::new(RepoScope {
        search,
        default_repo,
    });
    let repository = json!({
        "type": "string",
        "description": "Repository as owner/name; defaults to the configured repository"
    });

    registry.register(
        CapabilitySchema::new(
            "search_code",
            "Search the repository source code. Use it to check whether a feature, \
             module or integration already exists before asking the user about it.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Keywords or identifiers to search for" },
                "repository": repository
            },
            "required": ["query"],
            "additionalProperties": false
        })),
        Arc::new(SearchCode(Arc::clone(&scope))),
    );

    registry.register(
        CapabilitySchema::new(
            "describe_repository",
            "Describe the repository: description, main language, default branch, topics.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": { "repository": repository },
            "additionalProperties": false
        })),
        Arc::new(DescribeRepository(Arc::clone(&scope))),
    );

    registry.register(
        CapabilitySchema::new(
            "list_pull_requests",
            "List recently updated pull requests, to see what work is already in progress.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "repository": repository,
                "state": { "type": "string", "enum": ["open", "closed", "all"] }
            },
            "additionalProperties": false
        })),
        Arc::new(ListPullRequests(Arc::clone(&scope))),
    );

    registry.register(
        CapabilitySchema::new(
            "get_pull_request",
            "Fetch one pull request with its description and change size.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "repository": repository,
                "number": { "type": "integer", "description": "Pull request number" }
            },
            "required": ["number"],
            "additionalProperties": false
        })),
        Arc::new(GetPullRequest(scope)),
    );
}
