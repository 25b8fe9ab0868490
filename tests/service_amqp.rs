//! AMQP service integration tests using testcontainers.
//!
//! Run with: cargo test --test service_amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::time::{Duration, Instant};

use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use dripline::config::ServiceConfig;
use dripline::message::{Alert, Info, MsgOp, Reply, Request, ReturnCode};
use dripline::service::{AmqpService, ServiceError};

/// Start RabbitMQ container.
///
/// Returns (container, broker_url) where broker_url is suitable for AMQP
/// connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let broker_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", broker_url);

    (container, broker_url)
}

fn test_config(broker: &str, queue: &str) -> ServiceConfig {
    ServiceConfig {
        broker: broker.to_string(),
        queue: queue.to_string(),
        ..ServiceConfig::default()
    }
}

fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Echo responder: replies to every inbound request with its own payload.
fn spawn_echo_responder(mut service: AmqpService) -> tokio::task::JoinHandle<()> {
    let handle = service.handle();
    tokio::spawn(async move {
        while let Some(request) = service.inbound.requests.recv().await {
            let reply = Reply::to_request(
                &request,
                ReturnCode::SUCCESS,
                "",
                request.payload.clone(),
            );
            if handle.send_reply(reply).await.is_err() {
                break;
            }
        }
    })
}

#[tokio::test]
async fn test_service_starts_and_stops() {
    println!("=== Service Start/Stop Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let service = AmqpService::start_with_defaults(&broker, unique_queue("lifecycle"))
        .await
        .expect("Failed to start service");
    let handle = service.handle();
    assert!(service.is_connected());
    assert!(handle.is_connected());

    service.stop();
    service.join().await;

    assert!(!handle.is_connected());

    // Sends and subscriptions are rejected once the service is gone.
    let err = handle
        .send_alert(Alert::to("status.alarm", json!(null)))
        .await
        .expect_err("send after stop should fail");
    assert!(matches!(err, ServiceError::NotRunning));

    let err = handle
        .subscribe_to_requests("anything.#")
        .await
        .expect_err("subscribe after stop should fail");
    assert!(matches!(err, ServiceError::NotConnected));

    println!("=== Service Start/Stop Test PASSED ===");
}

#[tokio::test]
async fn test_dial_failure_reported_after_single_retry() {
    println!("=== Dial Failure Test ===");

    // Nothing listens here; both attempts should fail fast.
    let config = ServiceConfig {
        broker: "amqp://127.0.0.1:1".to_string(),
        dial_retry_delay_secs: 1,
        ..ServiceConfig::default()
    };

    let started = Instant::now();
    let err = AmqpService::start(config)
        .await
        .expect_err("start against a dead broker should fail");
    let elapsed = started.elapsed();

    assert!(matches!(err, ServiceError::Connect(_)));
    assert!(err.is_connection_error());
    assert!(
        elapsed >= Duration::from_secs(1),
        "the retry delay should have elapsed, got {:?}",
        elapsed
    );

    println!("=== Dial Failure Test PASSED ===");
}

#[tokio::test]
async fn test_send_only_service_rejects_subscriptions() {
    println!("=== Send-Only Service Test ===");
    let (_container, broker) = start_rabbitmq().await;

    // An empty queue name means the service can send but never receive.
    let service = AmqpService::start(test_config(&broker, ""))
        .await
        .expect("Failed to start send-only service");
    let handle = service.handle();
    assert!(handle.is_connected());

    let err = handle
        .subscribe_to_alerts("status.#")
        .await
        .expect_err("subscribe without a queue should fail");
    assert!(matches!(err, ServiceError::InvalidConfig(_)));

    handle
        .send_alert(Alert::to("status.alarm", json!({"level": "warning"})))
        .await
        .expect("send-only service should still send alerts");
    handle
        .send_info(Info::to("status.note", json!("running")))
        .await
        .expect("send-only service should still send infos");

    service.stop();
    service.join().await;
    println!("=== Send-Only Service Test PASSED ===");
}

#[tokio::test]
async fn test_external_json_request_is_dispatched() {
    println!("=== External Request Dispatch Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let mut service = AmqpService::start_with_defaults(&broker, unique_queue("gauges"))
        .await
        .expect("Failed to start service");
    let handle = service.handle();
    handle
        .subscribe_to_requests("gauges.#")
        .await
        .expect("Failed to subscribe");

    // Give the consumer time to arm
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Publish a request the way a peer in another language would: raw JSON
    // body, metadata in the AMQP properties.
    let connection = lapin::Connection::connect(&broker, lapin::ConnectionProperties::default())
        .await
        .expect("Failed to connect raw client");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to open raw channel");
    let body = serde_json::to_vec(&json!({
        "msgtype": 3,
        "msgop": 1,
        "timestamp": "2026-08-25T12:00:00Z",
        "sender_info": {"package": "labview-client"},
        "payload": {"values": []}
    }))
    .expect("Failed to serialize body");
    channel
        .basic_publish(
            "requests",
            "gauges.pressure",
            lapin::options::BasicPublishOptions::default(),
            &body,
            lapin::BasicProperties::default()
                .with_content_encoding("application/json".into())
                .with_correlation_id("ext-1".into())
                .with_reply_to("replies.nowhere".into()),
        )
        .await
        .expect("Failed to publish")
        .await
        .expect("Publish was not confirmed");

    let request = tokio::time::timeout(Duration::from_secs(5), service.inbound.requests.recv())
        .await
        .expect("Timed out waiting for the request")
        .expect("Inbound stream closed");

    assert_eq!(request.envelope.target, "gauges.pressure");
    assert_eq!(request.op, MsgOp::Get);
    assert_eq!(request.envelope.corr_id, "ext-1");
    assert_eq!(request.envelope.reply_to, "replies.nowhere");
    assert_eq!(request.envelope.sender_info.package, "labview-client");
    assert_eq!(request.payload, json!({"values": []}));

    handle.stop();
    service.join().await;
    println!("=== External Request Dispatch Test PASSED ===");
}

#[tokio::test]
async fn test_alert_reaches_subscriber() {
    println!("=== Alert Fanout Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let mut listener = AmqpService::start_with_defaults(&broker, unique_queue("listener"))
        .await
        .expect("Failed to start listener");
    listener
        .handle()
        .subscribe_to_alerts("status.#")
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sender = AmqpService::start_with_defaults(&broker, unique_queue("sender"))
        .await
        .expect("Failed to start sender");
    sender
        .handle()
        .send_alert(Alert::to("status.alarm", json!({"level": "critical"})))
        .await
        .expect("Failed to send alert");

    let alert = tokio::time::timeout(Duration::from_secs(5), listener.inbound.alerts.recv())
        .await
        .expect("Timed out waiting for the alert")
        .expect("Inbound stream closed");

    assert_eq!(alert.envelope.target, "status.alarm");
    assert_eq!(alert.payload, json!({"level": "critical"}));
    // The router stamps provenance and correlation on the way out.
    assert_eq!(alert.envelope.sender_info.package, "dripline");
    assert!(!alert.envelope.corr_id.is_empty());

    sender.stop();
    sender.join().await;
    listener.stop();
    listener.join().await;
    println!("=== Alert Fanout Test PASSED ===");
}

#[tokio::test]
async fn test_second_subscription_keeps_deliveries_flowing() {
    println!("=== Subsequent Subscription Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let mut listener = AmqpService::start_with_defaults(&broker, unique_queue("sentry"))
        .await
        .expect("Failed to start listener");
    let listener_handle = listener.handle();
    listener_handle
        .subscribe_to_alerts("watch.#")
        .await
        .expect("Failed to subscribe to alerts");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sender = AmqpService::start_with_defaults(&broker, unique_queue("talker"))
        .await
        .expect("Failed to start sender");
    let sender_handle = sender.handle();

    sender_handle
        .send_alert(Alert::to("watch.alarm", json!({"n": 1})))
        .await
        .expect("Failed to send the first alert");
    let first = tokio::time::timeout(Duration::from_secs(5), listener.inbound.alerts.recv())
        .await
        .expect("Timed out waiting for the first alert")
        .expect("Inbound stream closed");
    assert_eq!(first.payload, json!({"n": 1}));

    // A second subscription on the running service swaps in a fresh
    // consumer; alerts must keep arriving across the swap.
    listener_handle
        .subscribe_to_infos("watch.#")
        .await
        .expect("Failed to subscribe to infos");
    tokio::time::sleep(Duration::from_millis(200)).await;

    sender_handle
        .send_info(Info::to("watch.note", json!({"n": 2})))
        .await
        .expect("Failed to send the info");
    sender_handle
        .send_alert(Alert::to("watch.alarm", json!({"n": 3})))
        .await
        .expect("Failed to send the second alert");

    let note = tokio::time::timeout(Duration::from_secs(5), listener.inbound.infos.recv())
        .await
        .expect("Timed out waiting for the info")
        .expect("Inbound stream closed");
    assert_eq!(note.envelope.target, "watch.note");
    assert_eq!(note.payload, json!({"n": 2}));

    let second = tokio::time::timeout(Duration::from_secs(5), listener.inbound.alerts.recv())
        .await
        .expect("Timed out waiting for the second alert")
        .expect("Inbound stream closed");
    assert_eq!(second.payload, json!({"n": 3}));

    sender.stop();
    sender.join().await;
    listener_handle.stop();
    listener.join().await;
    println!("=== Subsequent Subscription Test PASSED ===");
}

#[tokio::test]
async fn test_request_receives_matching_reply() {
    println!("=== Request/Reply Round Trip Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let responder = AmqpService::start_with_defaults(&broker, unique_queue("calibrator"))
        .await
        .expect("Failed to start responder");
    let responder_handle = responder.handle();
    responder_handle
        .subscribe_to_requests("calibrator.#")
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let responder_task = spawn_echo_responder(responder);

    let requester = AmqpService::start_with_defaults(&broker, unique_queue("requester"))
        .await
        .expect("Failed to start requester");
    let mut request = Request::to("calibrator.run", MsgOp::Cmd, json!({"values": ["start"]}));
    request.envelope.corr_id = "round-trip-1".to_string();

    let reply_rx = requester
        .handle()
        .send_request(request, Some(Duration::from_secs(10)))
        .await
        .expect("Failed to send request");
    let reply = tokio::time::timeout(Duration::from_secs(10), reply_rx)
        .await
        .expect("Timed out waiting for the reply")
        .expect("Reply channel failed");

    assert_eq!(reply.envelope.corr_id, "round-trip-1");
    assert!(reply.ret_code.is_success());
    assert_eq!(reply.payload, json!({"values": ["start"]}));

    responder_handle.stop();
    responder_task.abort();
    requester.stop();
    requester.join().await;
    println!("=== Request/Reply Round Trip Test PASSED ===");
}

#[tokio::test]
async fn test_request_timeout_synthesizes_reply() {
    println!("=== Request Timeout Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let requester = AmqpService::start_with_defaults(&broker, unique_queue("impatient"))
        .await
        .expect("Failed to start requester");

    // Nobody listens on this key; the reply can only be the synthesized one.
    let mut request = Request::to("void.run", MsgOp::Run, json!(null));
    request.envelope.corr_id = "patience-0".to_string();

    let started = Instant::now();
    let reply_rx = requester
        .handle()
        .send_request(request, Some(Duration::from_secs(2)))
        .await
        .expect("Failed to send request");
    let reply = tokio::time::timeout(Duration::from_secs(10), reply_rx)
        .await
        .expect("The timeout reply never arrived")
        .expect("Reply channel failed");
    let elapsed = started.elapsed();

    assert_eq!(reply.ret_code, ReturnCode::CLIENT_ERROR_TIMEOUT);
    assert_eq!(reply.envelope.corr_id, "patience-0");
    assert_eq!(reply.return_msg, "timeout while waiting for reply");
    // Synthesized locally, so it carries our own provenance.
    assert_eq!(reply.envelope.sender_info.package, "dripline");
    assert!(
        elapsed >= Duration::from_secs(2),
        "reply arrived before the timeout, after {:?}",
        elapsed
    );

    requester.stop();
    requester.join().await;
    println!("=== Request Timeout Test PASSED ===");
}

#[tokio::test]
async fn test_request_without_timeout_waits_for_late_reply() {
    println!("=== Indefinite Wait Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let mut responder = AmqpService::start_with_defaults(&broker, unique_queue("slowpoke"))
        .await
        .expect("Failed to start responder");
    let responder_handle = responder.handle();
    responder_handle
        .subscribe_to_requests("slowpoke.#")
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requester = AmqpService::start_with_defaults(&broker, unique_queue("patient"))
        .await
        .expect("Failed to start requester");
    let mut request = Request::to("slowpoke.run", MsgOp::Run, json!("take your time"));
    request.envelope.corr_id = "patience-forever".to_string();

    let mut reply_rx = requester
        .handle()
        .send_request(request, None)
        .await
        .expect("Failed to send request");

    // The responder holds the request without answering.
    let pending = tokio::time::timeout(Duration::from_secs(5), responder.inbound.requests.recv())
        .await
        .expect("Timed out waiting for the request")
        .expect("Inbound stream closed");

    // Without a timeout, only an actual reply may resolve the call.
    assert!(
        tokio::time::timeout(Duration::from_secs(3), &mut reply_rx)
            .await
            .is_err(),
        "an unanswered request without a timeout resolved spontaneously"
    );

    responder_handle
        .send_reply(Reply::to_request(
            &pending,
            ReturnCode::SUCCESS,
            "",
            json!("worth the wait"),
        ))
        .await
        .expect("Failed to send the late reply");

    let reply = tokio::time::timeout(Duration::from_secs(10), reply_rx)
        .await
        .expect("The late reply never arrived")
        .expect("Reply channel failed");
    assert_eq!(reply.envelope.corr_id, "patience-forever");
    assert!(reply.ret_code.is_success());
    assert_eq!(reply.payload, json!("worth the wait"));

    responder_handle.stop();
    responder.join().await;
    requester.stop();
    requester.join().await;
    println!("=== Indefinite Wait Test PASSED ===");
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    println!("=== Concurrent Requests Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let responder = AmqpService::start_with_defaults(&broker, unique_queue("echo"))
        .await
        .expect("Failed to start responder");
    let responder_handle = responder.handle();
    responder_handle
        .subscribe_to_requests("echo.#")
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let responder_task = spawn_echo_responder(responder);

    let requester = AmqpService::start_with_defaults(&broker, unique_queue("caller"))
        .await
        .expect("Failed to start requester");
    let handle = requester.handle();

    let mut first = Request::to("echo.a", MsgOp::Get, json!("payload-a"));
    first.envelope.corr_id = "corr-a".to_string();
    let mut second = Request::to("echo.b", MsgOp::Get, json!("payload-b"));
    second.envelope.corr_id = "corr-b".to_string();

    let first_rx = handle
        .send_request(first, Some(Duration::from_secs(10)))
        .await
        .expect("Failed to send first request");
    let second_rx = handle
        .send_request(second, Some(Duration::from_secs(10)))
        .await
        .expect("Failed to send second request");

    let (first_reply, second_reply) = tokio::join!(first_rx, second_rx);
    let first_reply = first_reply.expect("First reply channel failed");
    let second_reply = second_reply.expect("Second reply channel failed");

    assert_eq!(first_reply.envelope.corr_id, "corr-a");
    assert_eq!(first_reply.payload, json!("payload-a"));
    assert_eq!(second_reply.envelope.corr_id, "corr-b");
    assert_eq!(second_reply.payload, json!("payload-b"));

    responder_handle.stop();
    responder_task.abort();
    requester.stop();
    requester.join().await;
    println!("=== Concurrent Requests Test PASSED ===");
}

#[tokio::test]
async fn test_stop_ends_inbound_streams() {
    println!("=== Stop Semantics Test ===");
    let (_container, broker) = start_rabbitmq().await;

    let mut service = AmqpService::start_with_defaults(&broker, unique_queue("stopper"))
        .await
        .expect("Failed to start service");
    let handle = service.handle();
    handle
        .subscribe_to_infos("notes.#")
        .await
        .expect("Failed to subscribe");

    handle.stop();

    // Teardown drops the inbound senders, ending every stream.
    let next = tokio::time::timeout(Duration::from_secs(10), service.inbound.infos.recv())
        .await
        .expect("Teardown did not finish in time");
    assert!(next.is_none(), "inbound stream should have ended");

    service.join().await;
    assert!(!handle.is_connected());

    println!("=== Stop Semantics Test PASSED ===");
}

#[tokio::test]
async fn test_broker_loss_tears_the_service_down() {
    println!("=== Broker Loss Test ===");
    let (container, broker) = start_rabbitmq().await;

    let mut service = AmqpService::start_with_defaults(&broker, unique_queue("watcher"))
        .await
        .expect("Failed to start service");
    let handle = service.handle();
    assert!(handle.is_connected());

    // No subscription: the only way the idle service can notice the loss
    // is the connection-error feed.
    container.stop().await.expect("Failed to stop the broker");

    let deadline = Instant::now() + Duration::from_secs(30);
    while handle.is_connected() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        !handle.is_connected(),
        "service still reports a live connection after broker loss"
    );

    let next = tokio::time::timeout(Duration::from_secs(10), service.inbound.infos.recv())
        .await
        .expect("Inbound streams did not end after broker loss");
    assert!(next.is_none(), "inbound stream should have ended");

    let err = handle
        .send_info(Info::to("status.note", json!(null)))
        .await
        .expect_err("send after broker loss should fail");
    assert!(matches!(err, ServiceError::NotRunning));

    service.join().await;
    println!("=== Broker Loss Test PASSED ===");
}
