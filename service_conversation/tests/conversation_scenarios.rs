// service_conversation/tests/conversation_scenarios.rs

//! 进程内端到端场景：服务端与客户端通过内存传输直接相连。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use conversation_models::ConversationState;
use service_conversation::server::ServiceFactory;
use service_conversation::transport::FnTransport;
use service_conversation::{
    CLIENT_TIMEOUT_ERROR_NAME, CONVERSATION_ERROR_TYPE_NAME, ConversationClient, ConversationError,
    ConversationMessage, ConversationServer, ConversationServerConfig, MessageTransport,
    OPAQUE_ERROR_TYPE_NAME, PANIC_ERROR_NAME, ServiceDefinition, ServiceMessenger,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn echo(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    loop {
        let text: String = messenger.receive().await?;
        messenger.send(&text)?;
    }
}

fn echo_service(service_type_id: &str, client_timeout: Duration) -> Arc<dyn ServiceFactory> {
    Arc::new(ServiceDefinition::new(service_type_id, client_timeout, echo))
}

fn new_server() -> ConversationServer {
    let server = ConversationServer::new(ConversationServerConfig {
        reaper_interval: Duration::from_millis(20),
        ..Default::default()
    });
    server.start().unwrap();
    server
}

/// 把客户端接到服务端：客户端出站 -> 服务端入站，服务端响应 -> 客户端路由。
fn connect(server: &ConversationServer, client_id: &str) -> ConversationClient {
    let client = ConversationClient::new(client_id, Arc::new(server.clone()), server.incoming_message_transport());
    server.add_client_response_transport(client_id, client.incoming_response_transport());
    client
}

/// 每条消息都投递两次的传输，模拟至少一次投递。
fn doubling(inner: Arc<dyn MessageTransport>) -> Arc<dyn MessageTransport> {
    Arc::new(FnTransport(move |message: ConversationMessage| {
        inner.send(message.clone())?;
        inner.send(message)
    }))
}

async fn wait_until_gone(server: &ConversationServer, conversation_id: &str) -> bool {
    for _ in 0..100 {
        if !server.has_conversation(conversation_id) {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_with_duplicates_and_terminate() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();

    let client = ConversationClient::new(
        "client-1",
        Arc::new(server.clone()),
        doubling(server.incoming_message_transport()),
    );
    server.add_client_response_transport("client-1", doubling(client.incoming_response_transport()));

    let mut conversation = client.start_conversation("echo").await.unwrap();
    assert!(server.has_conversation(conversation.conversation_id()));

    conversation.send("One").unwrap();
    let reply: String = conversation.receive().await.unwrap();
    assert_eq!(reply, "One");

    conversation.send("Two").unwrap();
    let reply: String = conversation.receive().await.unwrap();
    assert_eq!(reply, "Two");

    // 每条消息在两个方向上都被投递了两次，消费者仍只看到一次
    let extra: Option<String> = conversation
        .try_receive(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(extra.is_none());

    let conversation_id = conversation.conversation_id().to_string();
    conversation.terminate().unwrap();
    assert!(wait_until_gone(&server, &conversation_id).await);
    server.shutdown().await;
}

async fn count_messages(mut messenger: ServiceMessenger, counter: Arc<AtomicUsize>) -> anyhow::Result<()> {
    loop {
        let _: String = messenger.receive().await?;
        let total = counter.fetch_add(1, Ordering::SeqCst) + 1;
        messenger.send(&total)?;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_index_is_delivered_to_service_once() {
    init_logger();
    let server = new_server();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "counter",
            Duration::from_secs(30),
            move |messenger| count_messages(messenger, Arc::clone(&counter)),
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("counter").await.unwrap();
    let id = conversation.conversation_id().to_string();

    let incoming = server.incoming_message_transport();
    let message = ConversationMessage::payload(&id, 0, "Two").unwrap();
    incoming.send(message.clone()).unwrap();
    incoming.send(message).unwrap();

    let total: usize = conversation.receive().await.unwrap();
    assert_eq!(total, 1);
    let extra: Option<usize> = conversation.try_receive(Duration::from_millis(100)).await.unwrap();
    assert!(extra.is_none());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interleaved_conversations_do_not_cross_talk() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let client = connect(&server, "client-1");

    let mut a = client.start_conversation("echo").await.unwrap();
    let mut b = client.start_conversation("echo").await.unwrap();
    assert_ne!(a.conversation_id(), b.conversation_id());

    for round in 0..5 {
        a.send(&format!("a-{}", round)).unwrap();
        b.send(&format!("b-{}", round)).unwrap();
    }
    for round in 0..5 {
        let from_b: String = b.receive().await.unwrap();
        let from_a: String = a.receive().await.unwrap();
        assert_eq!(from_a, format!("a-{}", round));
        assert_eq!(from_b, format!("b-{}", round));
    }
    server.shutdown().await;
}

async fn receive_once(
    mut messenger: ServiceMessenger,
    outcome_tx: mpsc::UnboundedSender<Result<String, ConversationError>>,
) -> anyhow::Result<()> {
    let result = messenger.receive::<String>().await;
    let _ = outcome_tx.send(result);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_timeout_reaps_conversation_and_notifies_both_sides() {
    init_logger();
    let server = new_server();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Result<String, ConversationError>>();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "slow",
            Duration::from_millis(10),
            move |messenger| receive_once(messenger, outcome_tx.clone()),
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("slow").await.unwrap();
    let id = conversation.conversation_id().to_string();

    assert!(wait_until_gone(&server, &id).await);

    let err = conversation
        .receive::<String>()
        .await
        .expect_err("超时后客户端应收到服务端错误");
    match err {
        ConversationError::ServiceExecution { description, .. } => {
            assert!(description.starts_with(CLIENT_TIMEOUT_ERROR_NAME), "{}", description);
        }
        other => panic!("意外的错误: {:?}", other),
    }

    let service_side = outcome_rx.recv().await.unwrap();
    assert!(matches!(service_side, Err(ConversationError::ClientTimeout { .. })));

    // 服务端已报告失败，之后的发送直接失败
    assert!(matches!(
        conversation.send("late"),
        Err(ConversationError::ServiceExecution { .. })
    ));
    server.shutdown().await;
}

async fn fail_on_input(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    let text: String = messenger.receive().await?;
    Err(anyhow!("无法处理输入 '{}'", text))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_service_surfaces_description_to_client() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "fragile",
            Duration::from_secs(30),
            fail_on_input,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("fragile").await.unwrap();
    let id = conversation.conversation_id().to_string();

    conversation.send("bad").unwrap();
    let err = conversation.receive::<String>().await.unwrap_err();
    match err {
        ConversationError::ServiceExecution { conversation_id, description } => {
            assert_eq!(conversation_id, id);
            assert_eq!(description, format!("{}: 无法处理输入 'bad'", OPAQUE_ERROR_TYPE_NAME));
        }
        other => panic!("意外的错误: {:?}", other),
    }
    assert!(matches!(
        conversation.send("again"),
        Err(ConversationError::ServiceExecution { .. })
    ));
    assert!(wait_until_gone(&server, &id).await);
    server.shutdown().await;
}

async fn panic_on_input(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    let _: String = messenger.receive().await?;
    panic!("服务崩溃");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_service_is_reported_as_failure() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "panicky",
            Duration::from_secs(30),
            panic_on_input,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("panicky").await.unwrap();

    conversation.send("go").unwrap();
    let err = conversation.receive::<String>().await.unwrap_err();
    match err {
        ConversationError::ServiceExecution { description, .. } => {
            assert!(description.starts_with(&format!("{}: ", PANIC_ERROR_NAME)), "{}", description);
            assert!(description.contains("服务崩溃"), "{}", description);
        }
        other => panic!("意外的错误: {:?}", other),
    }
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_rejects_unknown_service_type_and_client() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let client = connect(&server, "client-1");

    let result = client.start_conversation("missing").await;
    assert!(matches!(result, Err(ConversationError::UnknownServiceType(id)) if id == "missing"));

    let stranger = ConversationClient::new(
        "stranger",
        Arc::new(server.clone()),
        server.incoming_message_transport(),
    );
    let result = stranger.start_conversation("echo").await;
    assert!(matches!(result, Err(ConversationError::UnknownClient(id)) if id == "stranger"));
    assert_eq!(server.conversation_count(), 0);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_service_type_registration_fails() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let result = server.add_service_type(echo_service("echo", Duration::from_secs(5)));
    assert!(matches!(result, Err(ConversationError::DuplicateServiceType(_))));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_receive_timeout_leaves_conversation_running() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("echo").await.unwrap();

    let err = conversation
        .receive_with_timeout::<String>(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::Timeout { waited_ms: 50, .. }));

    let polled: Option<String> = conversation.try_receive(Duration::ZERO).await.unwrap();
    assert!(polled.is_none());

    conversation.send("still here").unwrap();
    let reply: String = conversation.receive().await.unwrap();
    assert_eq!(reply, "still here");
    assert!(server.has_conversation(conversation.conversation_id()));
    server.shutdown().await;
}

async fn report_client_errors(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    loop {
        match messenger.receive::<String>().await {
            Ok(text) => messenger.send(&format!("ok: {}", text))?,
            Err(ConversationError::ClientExecution { description, .. }) => {
                messenger.send(&format!("client error: {}", description))?
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_error_is_queued_for_service_by_default() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "reporter",
            Duration::from_secs(30),
            report_client_errors,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("reporter").await.unwrap();

    conversation.report_error("disk full").unwrap();
    conversation.send("next").unwrap();
    let first: String = conversation.receive().await.unwrap();
    let second: String = conversation.receive().await.unwrap();
    assert_eq!(first, "client error: disk full");
    assert_eq!(second, "ok: next");
    assert!(server.has_conversation(conversation.conversation_id()));
    server.shutdown().await;
}

async fn capture_error(
    mut messenger: ServiceMessenger,
    outcome_tx: mpsc::UnboundedSender<ConversationError>,
) -> anyhow::Result<()> {
    if let Err(e) = messenger.receive::<String>().await {
        let _ = outcome_tx.send(e);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_error_interrupts_service_when_configured() {
    init_logger();
    let server = new_server();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ConversationError>();
    server
        .add_service_type(Arc::new(
            ServiceDefinition::new("strict", Duration::from_secs(30), move |messenger| {
                capture_error(messenger, outcome_tx.clone())
            })
            .with_interrupt_on_client_exception(true),
        ))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("strict").await.unwrap();
    let id = conversation.conversation_id().to_string();

    conversation.report_error("bad state").unwrap();
    let err = outcome_rx.recv().await.unwrap();
    assert!(matches!(err, ConversationError::ClientExecution { description, .. } if description == "bad state"));
    assert!(wait_until_gone(&server, &id).await);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gap_is_buffered_until_contiguous() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("echo").await.unwrap();
    let id = conversation.conversation_id().to_string();

    let incoming = server.incoming_message_transport();
    incoming
        .send(ConversationMessage::payload(&id, 1, "second").unwrap())
        .unwrap();
    let early: Option<String> = conversation
        .try_receive(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(early.is_none());

    incoming
        .send(ConversationMessage::payload(&id, 0, "first").unwrap())
        .unwrap();
    let first: String = conversation.receive().await.unwrap();
    let second: String = conversation.receive().await.unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("first", "second"));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_for_unknown_conversation_are_swallowed() {
    init_logger();
    let server = new_server();
    let incoming = server.incoming_message_transport();
    incoming
        .send(ConversationMessage::payload("nobody--echo--0", 0, "hi").unwrap())
        .unwrap();
    incoming.send(ConversationMessage::terminate("nobody--echo--0")).unwrap();
    assert_eq!(server.conversation_count(), 0);
    server.shutdown().await;
}

async fn shout_once(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    let text: String = messenger.receive().await?;
    messenger.send(&text.to_uppercase())?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_returning_normally_closes_conversation() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "once",
            Duration::from_secs(30),
            shout_once,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("once").await.unwrap();
    let id = conversation.conversation_id().to_string();

    conversation.send("done").unwrap();
    let reply: String = conversation.receive().await.unwrap();
    assert_eq!(reply, "DONE");
    assert!(wait_until_gone(&server, &id).await);
    server.shutdown().await;
}

async fn expect_number(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    let value: i64 = messenger.receive().await?;
    messenger.send(&value)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conversation_error_failure_names_its_variant() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "number",
            Duration::from_secs(30),
            expect_number,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("number").await.unwrap();

    conversation.send("not a number").unwrap();
    let err = conversation.receive::<i64>().await.unwrap_err();
    match err {
        ConversationError::ServiceExecution { description, .. } => {
            let prefix = format!("{}::DeserializationError: ", CONVERSATION_ERROR_TYPE_NAME);
            assert!(description.starts_with(&prefix), "{}", description);
        }
        other => panic!("意外的错误: {:?}", other),
    }
    server.shutdown().await;
}

type TimedOutcome = (Duration, Result<Option<String>, ConversationError>);

async fn poll_then_wait(
    mut messenger: ServiceMessenger,
    outcome_tx: mpsc::UnboundedSender<TimedOutcome>,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let polled = messenger.try_receive::<String>(Duration::ZERO).await;
    let _ = outcome_tx.send((started.elapsed(), polled));

    let started = Instant::now();
    let waited = messenger.try_receive::<String>(Duration::from_millis(50)).await;
    let _ = outcome_tx.send((started.elapsed(), waited));

    messenger.send("waiting")?;
    let started = Instant::now();
    let interrupted = messenger.try_receive::<String>(Duration::from_secs(5)).await;
    let _ = outcome_tx.send((started.elapsed(), interrupted));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_try_receive_polls_waits_and_observes_terminate() {
    init_logger();
    let server = new_server();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TimedOutcome>();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "poller",
            Duration::from_secs(30),
            move |messenger| poll_then_wait(messenger, outcome_tx.clone()),
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("poller").await.unwrap();

    let (elapsed, polled) = outcome_rx.recv().await.unwrap();
    assert!(matches!(polled, Ok(None)), "{:?}", polled);
    assert!(elapsed < Duration::from_millis(50), "{:?}", elapsed);

    let (elapsed, waited) = outcome_rx.recv().await.unwrap();
    assert!(matches!(waited, Ok(None)), "{:?}", waited);
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);

    let status: String = conversation.receive().await.unwrap();
    assert_eq!(status, "waiting");
    conversation.terminate().unwrap();

    let (elapsed, interrupted) = outcome_rx.recv().await.unwrap();
    assert!(
        matches!(interrupted, Err(ConversationError::Terminated { .. })),
        "{:?}",
        interrupted
    );
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    server.shutdown().await;
}

async fn wait_long(
    mut messenger: ServiceMessenger,
    outcome_tx: mpsc::UnboundedSender<TimedOutcome>,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let result = messenger.try_receive::<String>(Duration::from_secs(5)).await;
    let _ = outcome_tx.send((started.elapsed(), result));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_try_receive_is_interrupted_by_client_timeout() {
    init_logger();
    let server = new_server();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TimedOutcome>();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "patient",
            Duration::from_millis(100),
            move |messenger| wait_long(messenger, outcome_tx.clone()),
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let conversation = client.start_conversation("patient").await.unwrap();

    let (elapsed, result) = outcome_rx.recv().await.unwrap();
    assert!(
        matches!(result, Err(ConversationError::ClientTimeout { timeout_ms: 100, .. })),
        "{:?}",
        result
    );
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert!(wait_until_gone(&server, conversation.conversation_id()).await);
    server.shutdown().await;
}

async fn echo_ignoring_send_failures(mut messenger: ServiceMessenger) -> anyhow::Result<()> {
    loop {
        let text: String = messenger.receive().await?;
        // 客户端传输已注销时发送失败，继续等待下一条
        let _ = messenger.send(&text);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removing_client_transport_leaves_conversation_to_the_reaper() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(Arc::new(ServiceDefinition::new(
            "tolerant",
            Duration::from_millis(300),
            echo_ignoring_send_failures,
        )))
        .unwrap();
    let client = connect(&server, "client-1");
    let mut conversation = client.start_conversation("tolerant").await.unwrap();
    let id = conversation.conversation_id().to_string();

    conversation.send("before").unwrap();
    let reply: String = conversation.receive().await.unwrap();
    assert_eq!(reply, "before");

    assert!(server.remove_client_response_transport("client-1"));
    assert!(!server.has_client("client-1"));
    assert!(!server.remove_client_response_transport("client-1"));
    assert_eq!(server.conversation_state(&id), Some(ConversationState::Running));

    // 服务的下一次发送找不到客户端传输，会话标记为 Failed 但仍留在会话表中
    conversation.send("after").unwrap();
    let mut failed = false;
    for _ in 0..100 {
        if server.conversation_state(&id) == Some(ConversationState::Failed) {
            failed = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(failed);

    assert!(wait_until_gone(&server, &id).await);
    let unseen: Option<String> = conversation.try_receive(Duration::ZERO).await.unwrap();
    assert!(unseen.is_none());

    let result = client.start_conversation("tolerant").await;
    assert!(matches!(result, Err(ConversationError::UnknownClient(client_id)) if client_id == "client-1"));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_routing_table_is_empty_after_conversations_close() {
    init_logger();
    let server = new_server();
    server
        .add_service_type(echo_service("echo", Duration::from_secs(30)))
        .unwrap();
    let client = connect(&server, "client-1");

    for round in 0..100 {
        let mut conversation = client.start_conversation("echo").await.unwrap();
        let text = format!("m-{}", round);
        conversation.send(&text).unwrap();
        let reply: String = conversation.receive().await.unwrap();
        assert_eq!(reply, text);
        conversation.terminate().unwrap();
        conversation.close();
    }

    assert_eq!(client.tracked_conversation_count(), 0);
    for _ in 0..100 {
        if server.conversation_count() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.conversation_count(), 0);
    server.shutdown().await;
}
