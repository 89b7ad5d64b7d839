/// Integration tests for the SQLite session store: ordering under concurrent
/// writers and durability across reopen.
use brief_engine::db::{Database, SessionStore};
use proptest::prelude::*;
use sdk::types::{ConversationId, TurnRole};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_concurrent_appends_keep_contiguous_order() {
    let dir = TempDir::new().unwrap();
    let database = Database::new(&dir.path().join("brief.db")).await.unwrap();
    let store = Arc::new(database.sessions());
    let id = ConversationId::from("telegram:7");

    let mut handles = Vec::new();
    for writer in 0..4 {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                store
                    .append_turn(&id, TurnRole::User, &format!("{writer}-{i}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let session = store.load(&id).await.unwrap();
    assert_eq!(session.turns.len(), 40);

    // each writer's own turns appear in the order it wrote them
    for writer in 0..4 {
        let prefix = format!("{writer}-");
        let mine: Vec<String> = session
            .turns
            .iter()
            .filter(|t| t.content.starts_with(&prefix))
            .map(|t| t.content.clone())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("{writer}-{i}")).collect();
        assert_eq!(mine, expected);
    }

    let seqs: Vec<i64> = sqlx::query_scalar(
        "SELECT seq FROM turns WHERE conversation_id = ? ORDER BY seq ASC",
    )
    .bind(id.as_str())
    .fetch_all(database.pool())
    .await
    .unwrap();
    assert_eq!(seqs, (1..=40).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("brief.db");
    let id = ConversationId::from("telegram:8");

    {
        let database = Database::new(&path).await.unwrap();
        let store = database.sessions();
        store.append_turn(&id, TurnRole::User, "we need exports").await.unwrap();
        store
            .append_turn(&id, TurnRole::Assistant, "CSV or Excel?")
            .await
            .unwrap();
        store.set_fact(&id, "format", "CSV").await.unwrap();
        database.close().await.unwrap();
    }

    let database = Database::new(&path).await.unwrap();
    let store = database.sessions();
    let session = store.load(&id).await.unwrap();

    let dialogue: Vec<(TurnRole, &str)> = session
        .dialogue()
        .map(|t| (t.role, t.content.as_str()))
        .collect();
    assert_eq!(dialogue, vec![
        (TurnRole::User, "we need exports"),
        (TurnRole::Assistant, "CSV or Excel?"),
    ]);
    assert_eq!(session.facts["format"], "CSV");

    let listed = store.list_conversations().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].turn_count, 2);
    assert_eq!(listed[0].fact_count, 1);
}

#[tokio::test]
async fn test_list_orders_by_latest_activity() {
    let dir = TempDir::new().unwrap();
    let database = Database::new(&dir.path().join("brief.db")).await.unwrap();
    let store = database.sessions();
    let old = ConversationId::from("old");
    let new = ConversationId::from("new");

    store.append_turn(&old, TurnRole::User, "first").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.append_turn(&new, TurnRole::User, "second").await.unwrap();

    let listed = store.list_conversations().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);
}

fn role() -> impl Strategy<Value = TurnRole> {
    prop_oneof![
        Just(TurnRole::User),
        Just(TurnRole::Assistant),
        Just(TurnRole::Capability),
        Just(TurnRole::Audit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_load_returns_turns_in_append_order(
        turns in prop::collection::vec((role(), "[a-zA-Z0-9 ']{0,40}"), 1..20)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let loaded = runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let database = Database::new(&dir.path().join("brief.db")).await.unwrap();
            let store = database.sessions();
            let id = ConversationId::from("prop");

            for (role, content) in &turns {
                store.append_turn(&id, *role, content).await.unwrap();
            }
            let session = store.load(&id).await.unwrap();
            session
                .turns
                .into_iter()
                .map(|t| (t.role, t.content))
                .collect::<Vec<_>>()
        });

        prop_assert_eq!(loaded, turns);
    }
}
