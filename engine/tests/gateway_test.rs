/// Integration tests for the chat gateway: voice handling, reply policy and
/// bot commands, with a recording transport in place of Telegram.
mod common;

use brief_engine::llm::{Reasoning, ReasoningCollaborator};
use brief_engine::speech::SpeechCollaborator;
use brief_engine::transport::{
    ChatGateway, ChatTransport, Command, ConversationDispatcher, EventHandler, InboundEvent,
    InboundKind, ReplySettings,
};
use common::{harness, settings, FakeSpeech, Harness, RecordingTransport, RuleReasoner, Sent};
use sdk::types::{ConversationId, TurnRole};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    h: Harness,
    transport: Arc<RecordingTransport>,
    speech: Arc<FakeSpeech>,
    gateway: Arc<ChatGateway>,
}

async fn fixture(transport: RecordingTransport, speech: FakeSpeech, reply_with_voice: bool) -> Fixture {
    let reasoner = RuleReasoner::new(|request| {
        Ok(Reasoning::reply(format!("You said: {}", request.message)))
    });
    let h = harness(Arc::new(reasoner) as Arc<dyn ReasoningCollaborator>, None, settings()).await;
    let transport = Arc::new(transport);
    let speech = Arc::new(speech);
    let gateway = Arc::new(ChatGateway::new(
        Arc::clone(&h.orchestrator),
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&speech) as Arc<dyn SpeechCollaborator>,
        ReplySettings {
            reply_with_voice,
            language_hint: Some("pt".to_string()),
        },
    ));
    Fixture {
        h,
        transport,
        speech,
        gateway,
    }
}

fn event(kind: InboundKind) -> InboundEvent {
    InboundEvent {
        conversation_id: ConversationId::from("telegram:42"),
        reply_to: "555".to_string(),
        kind,
    }
}

fn text(body: &str) -> InboundEvent {
    event(InboundKind::Text(body.to_string()))
}

fn voice() -> InboundEvent {
    event(InboundKind::Voice {
        file_ref: "F1".to_string(),
        file_name: "voice.ogg".to_string(),
    })
}

#[tokio::test]
async fn test_text_reply_when_voice_disabled() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), true), false).await;

    f.gateway.handle(text("add social login")).await;

    assert_eq!(
        f.transport.sent(),
        vec![Sent::Text("555".to_string(), "You said: add social login".to_string())]
    );
}

#[tokio::test]
async fn test_voice_message_is_transcribed_and_answered_with_voice() {
    let f = fixture(
        RecordingTransport {
            audio: b"OggS-in".to_vec(),
            ..RecordingTransport::default()
        },
        FakeSpeech::new(Ok("quero login social"), true),
        true,
    )
    .await;

    f.gateway.handle(voice()).await;

    assert_eq!(
        f.transport.sent(),
        vec![Sent::Voice("555".to_string(), b"OggS-reply".len())]
    );
    assert_eq!(
        f.speech.language_hints.lock().unwrap().clone(),
        vec![Some("pt".to_string())]
    );

    let session = f.h.store.load(&ConversationId::from("telegram:42")).await.unwrap();
    assert_eq!(session.turns[0].content, "quero login social");
}

#[tokio::test]
async fn test_unclear_audio_asks_for_text() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Err("garbled"), true), true).await;

    f.gateway.handle(voice()).await;

    let sent = f.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Sent::Text(_, t) if t.contains("repeat that in text")));

    // nothing reached the conversation
    let session = f.h.store.load(&ConversationId::from("telegram:42")).await.unwrap();
    assert!(session.turns.is_empty());
}

#[tokio::test]
async fn test_synthesis_failure_falls_back_to_text() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), false), true).await;

    f.gateway.handle(text("hello")).await;

    assert_eq!(
        f.transport.sent(),
        vec![Sent::Text("555".to_string(), "You said: hello".to_string())]
    );
}

#[tokio::test]
async fn test_voice_upload_failure_falls_back_to_text() {
    let f = fixture(
        RecordingTransport {
            fail_voice: true,
            ..RecordingTransport::default()
        },
        FakeSpeech::new(Ok(""), true),
        true,
    )
    .await;

    f.gateway.handle(text("hello")).await;

    assert_eq!(
        f.transport.sent(),
        vec![Sent::Text("555".to_string(), "You said: hello".to_string())]
    );
}

#[tokio::test]
async fn test_document_command_sends_file_then_reply() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), true), false).await;

    f.gateway.handle(text("add social login")).await;
    f.gateway
        .handle(event(InboundKind::Command(Command::Document {
            title: Some("Social login".to_string()),
        })))
        .await;

    let sent = f.transport.sent();
    assert_eq!(sent.len(), 3);
    match &sent[1] {
        Sent::Document {
            to,
            file_name,
            caption,
        } => {
            assert_eq!(to, "555");
            assert!(file_name.starts_with("PRD_Social_login_"));
            assert_eq!(caption.as_deref(), Some("PRD: Social login"));
        }
        other => panic!("expected a document, got {:?}", other),
    }
    assert!(matches!(&sent[2], Sent::Text(_, t) if t.contains("Social login")));
    assert_eq!(std::fs::read_dir(f.h.output_dir()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_failed_document_upload_still_replies() {
    let f = fixture(
        RecordingTransport {
            fail_document: true,
            ..RecordingTransport::default()
        },
        FakeSpeech::new(Ok(""), true),
        false,
    )
    .await;

    f.gateway.handle(text("add social login")).await;
    f.gateway
        .handle(event(InboundKind::Command(Command::Document {
            title: Some("Social login".to_string()),
        })))
        .await;

    let sent = f.transport.sent();
    assert_eq!(sent.len(), 2);
    match &sent[1] {
        Sent::Text(to, t) => {
            assert_eq!(to, "555");
            assert!(t.starts_with("Here is the PRD for \"Social login\"."));
            assert!(t.contains("couldn't attach the document"));
            assert!(t.contains("PRD_Social_login_"));
        }
        other => panic!("expected text, got {:?}", other),
    }
    // the document itself was kept
    assert_eq!(std::fs::read_dir(f.h.output_dir()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_reset_and_help_commands() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), true), false).await;
    let id = ConversationId::from("telegram:42");

    f.gateway.handle(text("hello")).await;
    f.h.store.set_fact(&id, "priority", "high").await.unwrap();

    f.gateway
        .handle(event(InboundKind::Command(Command::Reset { facts: false })))
        .await;
    let session = f.h.store.load(&id).await.unwrap();
    assert!(session.turns.is_empty());
    assert_eq!(session.facts.len(), 1);

    f.gateway.handle(event(InboundKind::Command(Command::Help))).await;
    f.gateway
        .handle(event(InboundKind::Command(Command::Unknown("deploy".to_string()))))
        .await;

    let sent = f.transport.sent();
    assert!(matches!(&sent[2], Sent::Text(_, t) if t.contains("/prd")));
    assert!(matches!(&sent[3], Sent::Text(_, t) if t.contains("Unknown command /deploy")));
}

#[tokio::test]
async fn test_storage_failure_gets_apology_not_crash() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), true), false).await;
    sqlx::query(
        "CREATE TRIGGER storage_offline BEFORE INSERT ON turns
         BEGIN SELECT RAISE(FAIL, 'storage offline'); END",
    )
    .execute(f.h.database.pool())
    .await
    .unwrap();

    f.gateway.handle(text("hello")).await;

    let sent = f.transport.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Text(_, t) => {
            assert!(t.starts_with("Sorry"));
            assert!(!t.contains("storage offline"));
        }
        other => panic!("expected text, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dispatcher_keeps_conversation_order_end_to_end() {
    let f = fixture(RecordingTransport::default(), FakeSpeech::new(Ok(""), true), false).await;
    let dispatcher = ConversationDispatcher::new(Arc::clone(&f.gateway) as Arc<dyn EventHandler>);

    for i in 0..5 {
        dispatcher.dispatch(text(&format!("message {}", i)));
    }
    assert!(dispatcher.drain(Duration::from_secs(10)).await);

    let session = f.h.store.load(&ConversationId::from("telegram:42")).await.unwrap();
    let users: Vec<&str> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .map(|t| t.content.as_str())
        .collect();
    assert_eq!(
        users,
        vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
    );
}
