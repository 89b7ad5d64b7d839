use super::{
    DraftRequest, LLMError, Message, MessageRole, Reasoning, ReasoningCollaborator,
    ReasoningRequest, ToolCall,
};
use crate::capability::CapabilitySchema;
use crate::secrets::SecretString;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{CapabilityCall, CapabilityRecord, Turn, TurnRole};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Reserved function: store an agreed decision
pub const RECORD_FACT: &str = "record_fact";

/// Reserved function: the conversation is ready for a document
pub const EMIT_DOCUMENT: &str = "emit_document";

const SYSTEM_PROMPT: &str = "You are a product manager collecting requirements from a stakeholder \
for a software product. Ask short, focused questions until the feature is clear. Before answering \
anything about what the product already does, check the code repository with the available tools \
and say what you found. Whenever the stakeholder agrees on a decision (deadline, priority, scope, \
platform...), call record_fact with a short key and value. When the stakeholder asks for the PRD \
or the requirements are complete, call emit_document with a concise feature title. Always answer \
in the stakeholder's language, in plain conversational text suitable for being read aloud.";

const DRAFT_PROMPT: &str = "You are a technical writer producing a product requirements document \
from a requirements conversation. Answer with a single JSON object whose keys are exactly the \
requested section names and whose values are the markdown bodies of those sections, without \
headings. Use the agreed decisions verbatim. Write in the language of the conversation.";

/// Reasoning collaborator over the OpenAI Chat Completions API with
/// native function calling.
pub struct OpenAiReasoner {
    base_url: String,
    api_key: SecretString,
    model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiReasoner {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build OpenAI client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout_secs: timeout.as_secs(),
            client,
        })
    }

    async fn complete(&self, payload: &Value) -> super::Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout(self.timeout_secs)
                } else {
                    LLMError::NetworkError(e.without_url().to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();

            return Err(match status {
                401 | 403 => LLMError::AuthenticationFailed(text),
                429 => LLMError::RateLimitExceeded,
                s if s >= 500 => LLMError::NetworkError(format!("server returned {}", s)),
                _ => LLMError::InvalidRequest(text),
            });
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        data.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .cloned()
            .ok_or_else(|| LLMError::ParseError("No message in response".to_string()))
    }

    fn tools(capabilities: &[CapabilitySchema]) -> Vec<Value> {
        let mut tools: Vec<Value> = capabilities
            .iter()
            .map(|c| function_tool(&c.name, &c.description, c.parameters.clone()))
            .collect();

        tools.push(function_tool(
            RECORD_FACT,
            "Store a decision the stakeholder agreed on.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "description": "Short snake_case name, e.g. deadline" },
                    "value": { "type": "string" }
                },
                "required": ["key", "value"],
                "additionalProperties": false
            }),
        ));
        tools.push(function_tool(
            EMIT_DOCUMENT,
            "Generate the PRD document for this conversation now.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Concise feature title" }
                },
                "required": ["title"],
                "additionalProperties": false
            }),
        ));
        tools
    }
}

fn function_tool(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters
        }
    })
}

fn facts_prompt(facts: &BTreeMap<String, String>) -> Option<String> {
    if facts.is_empty() {
        return None;
    }
    let lines: Vec<String> = facts.iter().map(|(k, v)| format!("- {}: {}", k, v)).collect();
    Some(format!("Decisions already agreed:\n{}", lines.join("\n")))
}

/// Stored history → chat messages.
///
/// A capability turn becomes an assistant tool request followed by its tool
/// result, which is the pairing the API requires.
pub(crate) fn history_messages(history: &[Turn]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len());
    for turn in history {
        match turn.role {
            TurnRole::User => messages.push(Message::user(&turn.content)),
            TurnRole::Assistant => messages.push(Message::assistant(&turn.content)),
            TurnRole::Capability => match serde_json::from_str::<CapabilityRecord>(&turn.content) {
                Ok(record) => {
                    let arguments = Value::Object(record.call.arguments.clone()).to_string();
                    messages.push(Message::tool_request(vec![ToolCall::new(
                        &record.call.id,
                        &record.call.name,
                        arguments,
                    )]));
                    let result = serde_json::to_string(&record.outcome).unwrap_or_default();
                    messages.push(Message::tool_result(result, &record.call.id));
                }
                Err(e) => warn!("Skipping unreadable capability record: {}", e),
            },
            TurnRole::Audit => {}
        }
    }
    messages
}

fn to_wire(message: &Message) -> Value {
    match message.role {
        MessageRole::Tool => json!({
            "role": "tool",
            "content": message.content,
            "tool_call_id": message.tool_call_id
        }),
        MessageRole::Assistant if !message.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": message.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments }
            })).collect::<Vec<_>>()
        }),
        role => json!({ "role": role.to_string(), "content": message.content }),
    }
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let function = c.get("function")?;
                    Some(ToolCall::new(
                        c.get("id").and_then(Value::as_str).unwrap_or_default(),
                        function.get("name")?.as_str()?,
                        function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}"),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_arguments(call: &ToolCall) -> Map<String, Value> {
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!("Function '{}' returned non-object arguments", call.name);
            Map::new()
        }
    }
}

/// Split the model's function calls into facts, the emit signal and
/// capability requests.
pub(crate) fn interpret(content: &str, calls: &[ToolCall]) -> Reasoning {
    let mut reasoning = Reasoning::reply(content.trim());

    for call in calls {
        let arguments = parse_arguments(call);
        match call.name.as_str() {
            RECORD_FACT => {
                let key = arguments.get("key").and_then(Value::as_str).map(str::trim);
                let value = arguments.get("value").and_then(Value::as_str).map(str::trim);
                match (key, value) {
                    (Some(k), Some(v)) if !k.is_empty() => {
                        reasoning.facts.insert(k.to_string(), v.to_string());
                    }
                    _ => warn!("Ignoring malformed record_fact call"),
                }
            }
            EMIT_DOCUMENT => {
                reasoning.ready_to_emit = true;
                reasoning.title_hint = arguments
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            name => reasoning
                .capability_requests
                .push(CapabilityCall::new(&call.id, name, arguments)),
        }
    }

    reasoning
}

#[async_trait]
impl ReasoningCollaborator for OpenAiReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> Result<Reasoning, EngineError> {
        let mut messages = vec![Message::system(SYSTEM_PROMPT)];
        if let Some(facts) = facts_prompt(&request.facts) {
            messages.push(Message::system(facts));
        }
        messages.extend(history_messages(&request.history));

        let tools = Self::tools(&request.capabilities);
        let wire: Vec<Value> = messages.iter().map(to_wire).collect();
        let payload = json!({
            "model": self.model,
            "messages": wire,
            "tools": tools,
            "tool_choice": "auto"
        });

        debug!(
            conversation_id = %request.conversation_id,
            messages = messages.len(),
            "Requesting reasoning"
        );

        let message = self.complete(&payload).await?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let calls = parse_tool_calls(&message);
        let mut reasoning = interpret(content, &calls);

        // Only reserved functions and no text: acknowledge them and ask for the reply.
        if reasoning.text.is_empty() && !reasoning.wants_capabilities() && !calls.is_empty() {
            let mut wire = wire;
            wire.push(to_wire(&Message::tool_request(calls.clone())));
            for call in &calls {
                wire.push(to_wire(&Message::tool_result(r#"{"status":"ok"}"#, &call.id)));
            }
            let follow_up = json!({
                "model": self.model,
                "messages": wire,
                "tools": tools,
                "tool_choice": "none"
            });
            let message = self.complete(&follow_up).await?;
            reasoning.text = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
        }

        if reasoning.text.is_empty() && !reasoning.wants_capabilities() {
            return Err(EngineError::Reasoning("empty reply".to_string()));
        }

        Ok(reasoning)
    }

    async fn draft_sections(&self, request: &DraftRequest) -> Result<BTreeMap<String, String>, EngineError> {
        let mut messages = vec![Message::system(DRAFT_PROMPT)];
        if let Some(facts) = facts_prompt(&request.facts) {
            messages.push(Message::system(facts));
        }

        let transcript: Vec<String> = request
            .history
            .iter()
            .filter(|t| matches!(t.role, TurnRole::User | TurnRole::Assistant))
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect();
        messages.push(Message::user(format!(
            "Feature: {}\nSections: {}\n\nConversation:\n{}",
            request.title,
            request.sections.join(", "),
            transcript.join("\n")
        )));

        let payload = json!({
            "model": self.model,
            "messages": messages.iter().map(to_wire).collect::<Vec<_>>(),
            "response_format": { "type": "json_object" }
        });

        let message = self.complete(&payload).await?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Reasoning("empty draft".to_string()))?;

        let parsed: Map<String, Value> = serde_json::from_str(content)
            .map_err(|e| EngineError::Reasoning(format!("draft is not a JSON object: {}", e)))?;

        Ok(parsed
            .into_iter()
            .filter_map(|(name, body)| match body {
                Value::String(text) => Some((name, text)),
                Value::Null => None,
                other => Some((name, other.to_string())),
            })
            .collect())
    }
}
