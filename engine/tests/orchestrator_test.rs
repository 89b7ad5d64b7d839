/// Integration tests for the turn orchestrator
///
/// Drives full turns through a real SQLite session store, the capability
/// registry with a fake code search, and the document emitter writing to a
/// temporary directory.
mod common;

use brief_engine::agent::orchestrator::INCOMPLETE_REPLY;
use brief_engine::capability::CodeSearch;
use brief_engine::document::REQUIRED_SECTIONS;
use brief_engine::llm::{Reasoning, ReasoningCollaborator};
use common::{capability_records, harness, settings, FakeCodeSearch, RuleReasoner};
use sdk::errors::EngineError;
use sdk::types::{CapabilityCall, CapabilityOutcome, ConversationId, TurnRole};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn search_request(query: &str) -> CapabilityCall {
    let mut args = Map::new();
    args.insert("query".to_string(), json!(query));
    CapabilityCall::new("", "search_code", args)
}

fn hit_paths(value: &Value) -> Vec<String> {
    value["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .filter_map(|h| h["path"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Search for "login" once, then answer from whatever came back
fn social_login_reasoner() -> RuleReasoner {
    RuleReasoner::new(|request| {
        let records = capability_records(request);
        let Some(record) = records.last() else {
            return Ok(Reasoning {
                capability_requests: vec![search_request("login")],
                ..Reasoning::default()
            });
        };
        match &record.outcome {
            CapabilityOutcome::Success { value } => Ok(Reasoning::reply(format!(
                "The codebase already has {}. Which providers do you need?",
                hit_paths(value).join(" and ")
            ))),
            CapabilityOutcome::Failure { error } => Ok(Reasoning::reply(format!(
                "I couldn't search the code ({}). Which providers do you need?",
                error
            ))),
        }
    })
}

#[tokio::test]
async fn test_social_login_search_scenario() {
    let search = Arc::new(FakeCodeSearch::with_files(&[
        ("src/auth/login.rs", "pub fn password_login()"),
        ("web/components/LoginForm.tsx", "export function LoginForm() { login() }"),
        ("src/cart.rs", "pub struct Cart"),
    ]));
    let reasoner = Arc::new(social_login_reasoner());
    let h = harness(
        Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>,
        Some(search as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");

    assert!(h.store.load(&id).await.unwrap().is_empty());

    let outcome = h.orchestrator.handle_message(&id, "add social login").await.unwrap();

    assert!(!outcome.degraded);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.reply.contains("src/auth/login.rs"));
    assert!(outcome.reply.contains("web/components/LoginForm.tsx"));
    assert!(!outcome.reply.contains("cart"));

    let session = h.store.load(&id).await.unwrap();
    let roles: Vec<TurnRole> = session.turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![TurnRole::User, TurnRole::Capability, TurnRole::Assistant]
    );
    assert_eq!(session.turns[0].content, "add social login");
    assert_eq!(session.turns[2].content, outcome.reply);
}

#[tokio::test]
async fn test_failed_search_is_retried_then_fed_back() {
    let search = Arc::new(FakeCodeSearch::failing(|| {
        EngineError::Network("connection reset".to_string())
    }));
    let h = harness(
        Arc::new(social_login_reasoner()),
        Some(Arc::clone(&search) as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");

    let outcome = h.orchestrator.handle_message(&id, "add social login").await.unwrap();

    // one retry for a transient failure
    assert_eq!(search.searches.load(Ordering::SeqCst), 2);
    assert!(!outcome.degraded);
    assert!(outcome.reply.contains("capability unavailable"));

    let session = h.store.load(&id).await.unwrap();
    let record: sdk::types::CapabilityRecord = serde_json::from_str(&session.turns[1].content).unwrap();
    assert_eq!(record.call.name, "search_code");
    assert_eq!(
        record.outcome,
        CapabilityOutcome::Failure {
            error: "capability unavailable".to_string()
        }
    );
}

#[tokio::test]
async fn test_ready_to_emit_produces_document() {
    let reasoner = RuleReasoner::new(|_| {
        Ok(Reasoning {
            text: "Great, I have everything I need.".to_string(),
            facts: BTreeMap::from([
                ("deadline".to_string(), "2 weeks".to_string()),
                ("priority".to_string(), "high".to_string()),
            ]),
            ready_to_emit: true,
            title_hint: Some("Social login".to_string()),
            ..Reasoning::default()
        })
    })
    .with_sections(&[("Objective", "Let shoppers sign in with Google and Apple.")]);
    let h = harness(Arc::new(reasoner), None, settings()).await;
    let id = ConversationId::from("u1");

    let outcome = h
        .orchestrator
        .handle_message(&id, "deadline is two weeks, high priority")
        .await
        .unwrap();

    let emitted = outcome.document.expect("document emitted");
    assert_eq!(emitted.document.title, "Social login");
    assert!(emitted.handle.file_name().starts_with("PRD_Social_login_"));
    assert!(emitted.handle.path.starts_with(h.output_dir()));

    let body = h.emitter.read(&emitted.handle).await.unwrap();
    for section in REQUIRED_SECTIONS {
        assert!(body.contains(&format!(". {}\n", section)), "missing section {section}");
    }
    assert!(body.contains("| deadline | 2 weeks |"));
    assert!(body.contains("| priority | high |"));
    assert!(body.contains("Let shoppers sign in with Google and Apple."));

    let facts = h.store.get_facts(&id).await.unwrap();
    assert_eq!(facts.get("deadline").map(String::as_str), Some("2 weeks"));
    assert_eq!(facts.get("priority").map(String::as_str), Some("high"));

    // the reply is the last thing recorded
    let session = h.store.load(&id).await.unwrap();
    assert_eq!(session.turns.last().map(|t| t.role), Some(TurnRole::Assistant));
}

#[tokio::test]
async fn test_two_emissions_produce_distinct_handles() {
    let h = harness(Arc::new(RuleReasoner::new(|_| Ok(Reasoning::reply("ok")))), None, settings()).await;
    let id = ConversationId::from("u1");
    h.orchestrator.handle_message(&id, "add social login").await.unwrap();

    let first = h
        .orchestrator
        .generate_document(&id, Some("Social login"))
        .await
        .unwrap()
        .document
        .unwrap();
    let second = h
        .orchestrator
        .generate_document(&id, Some("Social login"))
        .await
        .unwrap()
        .document
        .unwrap();

    assert_ne!(first.handle, second.handle);
    assert!(first.handle.path.exists());
    assert!(second.handle.path.exists());
    assert_eq!(std::fs::read_dir(h.output_dir()).unwrap().count(), 2);
}

#[tokio::test]
async fn test_iteration_cap_degrades_instead_of_looping() {
    let search = Arc::new(FakeCodeSearch::with_files(&[("src/a.rs", "x")]));
    let reasoner = Arc::new(RuleReasoner::new(|_| {
        Ok(Reasoning {
            capability_requests: vec![search_request("x")],
            ..Reasoning::default()
        })
    }));
    let h = harness(
        Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>,
        Some(search as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        h.orchestrator.handle_message(&id, "loop forever"),
    )
    .await
    .expect("turn terminates")
    .unwrap();

    assert!(outcome.degraded);
    assert_eq!(outcome.reply, INCOMPLETE_REPLY);
    assert_eq!(outcome.iterations, settings().max_iterations);
    assert_eq!(reasoner.calls(), settings().max_iterations);

    let session = h.store.load(&id).await.unwrap();
    let capability_turns = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::Capability)
        .count();
    assert_eq!(capability_turns, settings().max_iterations);
    assert!(session.turns.iter().any(|t| t.role == TurnRole::Audit));
    assert_eq!(session.turns.last().map(|t| t.role), Some(TurnRole::Assistant));
}

#[tokio::test]
async fn test_unknown_capability_has_no_side_effect() {
    let search = Arc::new(FakeCodeSearch::with_files(&[("src/a.rs", "x")]));
    let h = harness(
        Arc::new(RuleReasoner::new(|_| Ok(Reasoning::reply("ok")))),
        Some(Arc::clone(&search) as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");
    h.orchestrator.handle_message(&id, "hello").await.unwrap();
    let before = h.store.load(&id).await.unwrap();

    for name in ["fly_to_moon", "SEARCH_CODE", ""] {
        let err = h.registry.invoke(name, &Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCapability(ref n) if n == name));
    }

    assert_eq!(search.searches.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.load(&id).await.unwrap(), before);
}

#[tokio::test]
async fn test_same_conversation_turns_are_serialized() {
    let reasoner = Arc::new(
        RuleReasoner::new(|request| {
            let users = request.history.iter().filter(|t| t.role == TurnRole::User).count();
            Ok(Reasoning::reply(format!("seen {} messages", users)))
        })
        .with_delay(Duration::from_millis(50)),
    );
    let h = harness(Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>, None, settings()).await;
    let id = ConversationId::from("u1");

    let a = {
        let orchestrator = Arc::clone(&h.orchestrator);
        let id = id.clone();
        tokio::spawn(async move { orchestrator.handle_message(&id, "first").await })
    };
    let b = {
        let orchestrator = Arc::clone(&h.orchestrator);
        let id = id.clone();
        tokio::spawn(async move { orchestrator.handle_message(&id, "second").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(reasoner.max_active.load(Ordering::SeqCst), 1);

    // whichever turn ran second saw the first one's full exchange
    let requests = reasoner.requests.lock().unwrap().clone();
    let later = &requests[1];
    let roles: Vec<TurnRole> = later.history.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![TurnRole::User, TurnRole::Assistant, TurnRole::User]
    );

    let session = h.store.load(&id).await.unwrap();
    assert_eq!(session.turns.len(), 4);
}

#[tokio::test]
async fn test_different_conversations_run_in_parallel() {
    let reasoner = Arc::new(
        RuleReasoner::new(|_| Ok(Reasoning::reply("ok"))).with_delay(Duration::from_millis(200)),
    );
    let h = harness(Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>, None, settings()).await;

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|id| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.handle_message(&ConversationId::from(id), "hi").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(reasoner.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reasoning_timeout_is_retried_then_audited() {
    let reasoner = Arc::new(
        RuleReasoner::new(|_| Ok(Reasoning::reply("too late"))).with_delay(Duration::from_millis(300)),
    );
    let mut tight = settings();
    tight.reasoning_timeout = Duration::from_millis(50);
    let h = harness(Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>, None, tight).await;
    let id = ConversationId::from("u1");

    let outcome = h.orchestrator.handle_message(&id, "hello").await.unwrap();

    assert!(outcome.degraded);
    assert!(outcome.reply.starts_with("Sorry"));
    assert_eq!(reasoner.calls(), 2);

    let session = h.store.load(&id).await.unwrap();
    let audit = session
        .turns
        .iter()
        .find(|t| t.role == TurnRole::Audit)
        .expect("audit turn");
    assert!(audit.content.contains("timed out"));
}

#[tokio::test]
async fn test_storage_failure_aborts_turn_without_partial_state() {
    let h = harness(Arc::new(RuleReasoner::new(|_| Ok(Reasoning::reply("ok")))), None, settings()).await;
    let id = ConversationId::from("u1");
    h.orchestrator.handle_message(&id, "hello").await.unwrap();
    let before = h.store.load(&id).await.unwrap();

    sqlx::query(
        "CREATE TRIGGER storage_offline BEFORE INSERT ON turns
         BEGIN SELECT RAISE(FAIL, 'storage offline'); END",
    )
    .execute(h.database.pool())
    .await
    .unwrap();

    let err = h.orchestrator.handle_message(&id, "second").await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));

    let after = h.store.load(&id).await.unwrap();
    assert_eq!(after.turns, before.turns);
}

#[tokio::test]
async fn test_storage_failure_late_in_turn_leaves_no_partial_turn() {
    let search = Arc::new(FakeCodeSearch::with_files(&[("src/auth/login.rs", "pub fn login()")]));
    let reasoner = RuleReasoner::new(|request| {
        if capability_records(request).is_empty() {
            return Ok(Reasoning {
                capability_requests: vec![search_request("login")],
                ..Reasoning::default()
            });
        }
        Ok(Reasoning {
            text: "Noted, high priority.".to_string(),
            facts: BTreeMap::from([("priority".to_string(), "high".to_string())]),
            ..Reasoning::default()
        })
    });
    let h = harness(
        Arc::new(reasoner) as Arc<dyn ReasoningCollaborator>,
        Some(search as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");

    h.store.append_turn(&id, TurnRole::User, "earlier").await.unwrap();
    let before = h.store.load(&id).await.unwrap();

    // turns can still be written; only the fact upsert fails
    sqlx::query(
        "CREATE TRIGGER facts_offline BEFORE INSERT ON facts
         BEGIN SELECT RAISE(FAIL, 'storage offline'); END",
    )
    .execute(h.database.pool())
    .await
    .unwrap();

    let err = h.orchestrator.handle_message(&id, "make it high priority").await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));

    let after = h.store.load(&id).await.unwrap();
    assert_eq!(after.turns, before.turns);
    assert!(after.facts.is_empty());
}

#[tokio::test]
async fn test_turn_is_visible_to_reasoning_before_commit() {
    let search = Arc::new(FakeCodeSearch::with_files(&[("src/auth/login.rs", "pub fn login()")]));
    let reasoner = Arc::new(social_login_reasoner());
    let h = harness(
        Arc::clone(&reasoner) as Arc<dyn ReasoningCollaborator>,
        Some(search as Arc<dyn CodeSearch>),
        settings(),
    )
    .await;
    let id = ConversationId::from("u1");

    h.orchestrator.handle_message(&id, "add social login").await.unwrap();

    let requests = reasoner.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    let roles: Vec<TurnRole> = requests[1].history.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![TurnRole::User, TurnRole::Capability]);
}

#[tokio::test]
async fn test_reset_keeps_facts_unless_asked() {
    let reasoner = RuleReasoner::new(|_| {
        Ok(Reasoning {
            text: "Noted.".to_string(),
            facts: BTreeMap::from([("priority".to_string(), "high".to_string())]),
            ..Reasoning::default()
        })
    });
    let h = harness(Arc::new(reasoner), None, settings()).await;
    let id = ConversationId::from("u1");
    h.orchestrator.handle_message(&id, "high priority").await.unwrap();

    let report = h.orchestrator.reset(&id, false).await.unwrap();
    assert_eq!(report.turns_removed, 2);
    assert_eq!(report.facts_removed, 0);

    let session = h.store.load(&id).await.unwrap();
    assert!(session.turns.is_empty());
    assert_eq!(session.facts.len(), 1);

    let report = h.orchestrator.reset(&id, true).await.unwrap();
    assert_eq!(report.facts_removed, 1);
    assert!(h.store.load(&id).await.unwrap().is_empty());
}
