use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forge_core::config::{BatchConfig, RegistryConfig};
use forge_core::{Channel, ConnectionId, DomainEvent, EventLevel};
use forge_gateway::{
    BroadcastGateway, GatewayOptions, HealthProducer, RegistryStatusProducer, SnapshotProducer,
    SystemMetricsProducer,
};
use forge_pipeline::{BatchPipeline, SourceFilter};
use forge_protocol::{Envelope, Status};
use forge_registry::ConnectionRegistry;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

fn gateway() -> Arc<BroadcastGateway> {
    BroadcastGateway::new(
        ConnectionRegistry::new(RegistryConfig::default()),
        GatewayOptions::default(),
    )
}

fn connect(
    gw: &BroadcastGateway,
    id: &str,
    channel: Channel,
    capacity: usize,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(capacity);
    gw.admit(ConnectionId::from(id), channel, "127.0.0.1:9000", "test", tx)
        .unwrap();
    rx
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

fn counting_producer(gw: &BroadcastGateway, channel: Channel) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    gw.register_poller(channel, move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        json!({ "cpu": 10.0, "memory": 20.0, "disk": 30.0, "network": 5.0, "n": n })
    });
    calls
}

#[tokio::test(start_paused = true)]
async fn burst_reaches_subscribers_as_two_batches() {
    let gw = gateway();
    let pipeline = BatchPipeline::spawn(
        BatchConfig {
            flush_window_ms: 1000,
            max_batch_size: 100,
        },
        Arc::new(SourceFilter::default()),
    );
    gw.attach_pipeline(&pipeline, Channel::Logs);

    let _metrics_rx = connect(&gw, "c1", Channel::Metrics, 16);
    assert_eq!(gw.registry().metrics().active_connections, 1);
    let mut logs_rx = connect(&gw, "viewer", Channel::Logs, 16);

    for i in 0..150 {
        pipeline
            .submit(DomainEvent::new(EventLevel::Info, "api", format!("line {i}")))
            .unwrap();
    }
    sleep(Duration::from_millis(1200)).await;

    let envelopes = drain(&mut logs_rx);
    let sizes: Vec<usize> = envelopes
        .iter()
        .map(|e| e.data["events"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![100, 50]);
    assert!(envelopes.iter().all(|e| e.event == "log-batch"));
    assert_eq!(envelopes[0].data["reason"], "size");
    assert_eq!(envelopes[1].data["reason"], "window");
    assert_eq!(pipeline.stats().batches, 2);
}

#[tokio::test(start_paused = true)]
async fn idle_channel_never_polls() {
    let gw = gateway();
    let calls = counting_producer(&gw, Channel::Metrics);
    let before = gw.registry().metrics().messages_sent;

    let pollers = gw.spawn_pollers();
    // Default cadence is one second; ten ticks.
    sleep(Duration::from_millis(10_500)).await;
    for _ in 0..10 {
        assert!(gw.poll_once(Channel::Metrics).is_none());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(gw.registry().metrics().messages_sent, before);
    let (run, skipped) = gw.poll_stats();
    assert_eq!(run, 0);
    assert!(skipped >= 20);

    gw.shutdown();
    for p in pollers {
        p.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn pollers_reach_subscribers_at_default_cadence() {
    let gw = gateway();
    let calls = counting_producer(&gw, Channel::Metrics);
    let mut rx = connect(&gw, "c1", Channel::Metrics, 64);

    let pollers = gw.spawn_pollers();
    sleep(Duration::from_millis(3_500)).await;
    gw.shutdown();
    for p in pollers {
        p.await.unwrap();
    }

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 3);
    assert!(envelopes.iter().all(|e| e.event == "system-metrics"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(gw.registry().metrics().messages_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_cadence_keeps_previous_override() {
    let gw = gateway();
    counting_producer(&gw, Channel::Metrics);
    let mut rx = connect(&gw, "c1", Channel::Metrics, 64);
    let id = ConnectionId::from("c1");

    gw.handle_client_message(&id, r#"{"event":"set-interval","data":500}"#)
        .unwrap();
    gw.handle_client_message(&id, r#"{"event":"set-interval","data":50}"#)
        .unwrap();
    assert_eq!(gw.cadence_of(&id), Some(Duration::from_millis(500)));

    let acks = drain(&mut rx);
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].status, Status::Success);
    assert_eq!(acks[0].data["interval"], 500);
    assert_eq!(acks[1].status, Status::Error);
    assert_eq!(acks[1].event, "interval-set");
    assert_eq!(acks[1].data["success"], false);
    assert_eq!(acks[1].data["message"], "Invalid interval");

    sleep(Duration::from_millis(2_050)).await;
    let ticks = drain(&mut rx);
    assert_eq!(ticks.len(), 4, "500 ms cadence over 2 s");
    assert!(ticks.iter().all(|e| e.event == "system-metrics"));

    // The overridden connection is not part of the channel-wide tick.
    assert!(gw.poll_once(Channel::Metrics).is_none());
    gw.shutdown();
}

#[tokio::test(start_paused = true)]
async fn replacing_an_override_stops_the_old_timer() {
    let gw = gateway();
    counting_producer(&gw, Channel::Health);
    let mut rx = connect(&gw, "c1", Channel::Health, 64);
    let id = ConnectionId::from("c1");

    gw.set_cadence(&id, 200).unwrap();
    sleep(Duration::from_millis(50)).await;
    gw.set_cadence(&id, 1_000).unwrap();
    sleep(Duration::from_millis(2_100)).await;

    // Only the 1 s timer may have delivered.
    assert_eq!(drain(&mut rx).len(), 2);
    gw.shutdown();
}

#[tokio::test(start_paused = true)]
async fn release_cancels_override_timer() {
    let gw = gateway();
    let calls = counting_producer(&gw, Channel::Metrics);
    let _rx = connect(&gw, "c1", Channel::Metrics, 64);
    let id = ConnectionId::from("c1");

    gw.set_cadence(&id, 100).unwrap();
    sleep(Duration::from_millis(350)).await;
    let before = calls.load(Ordering::SeqCst);
    assert_eq!(before, 3);

    assert!(gw.release(&id, "client-close"));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), before);
    assert_eq!(gw.cadence_of(&id), None);
}

#[tokio::test]
async fn cadence_on_event_driven_channel_is_rejected() {
    let gw = gateway();
    let mut rx = connect(&gw, "c1", Channel::Logs, 8);
    gw.handle_client_message(&ConnectionId::from("c1"), r#"{"event":"set-interval","data":500}"#)
        .unwrap();
    let reply = drain(&mut rx).pop().unwrap();
    assert_eq!(reply.event, "interval-set");
    assert_eq!(reply.status, Status::Error);
}

#[tokio::test]
async fn failed_send_closes_only_that_connection() {
    let gw = gateway();
    let mut ok_rx = connect(&gw, "ok", Channel::Board, 8);
    let dead_rx = connect(&gw, "dead", Channel::Board, 8);
    drop(dead_rx);
    let mut full_rx = connect(&gw, "full", Channel::Board, 1);

    let fan_out = gw.publish(Channel::Board, Envelope::success("board-update", json!({"v": 1})));
    assert_eq!((fan_out.delivered, fan_out.failed), (2, 1));

    // "full" now has one queued frame and no room for the next.
    let fan_out = gw.publish(Channel::Board, Envelope::success("board-update", json!({"v": 2})));
    assert_eq!((fan_out.delivered, fan_out.failed), (1, 1));

    let m = gw.registry().metrics();
    assert_eq!(m.active_connections, 1);
    assert_eq!(m.disconnections, 2);
    assert_eq!(m.total_connections, 3);
    assert_eq!(m.messages_sent, 3);

    let dead = gw.registry().get(&ConnectionId::from("dead")).unwrap();
    assert_eq!(dead.close_reason.as_deref(), Some("send-failure"));
    assert_eq!(drain(&mut ok_rx).len(), 2);
    assert_eq!(drain(&mut full_rx).len(), 1);
}

#[tokio::test]
async fn control_messages_are_answered() {
    let gw = gateway();
    counting_producer(&gw, Channel::Metrics);
    let mut rx = connect(&gw, "c1", Channel::Metrics, 16);
    let id = ConnectionId::from("c1");

    gw.handle_client_message(&id, r#"{"event":"ping"}"#).unwrap();
    gw.handle_client_message(&id, r#"{"event":"request-snapshot"}"#)
        .unwrap();
    gw.handle_client_message(&id, r#"{"event":"subscribe-kanban"}"#)
        .unwrap();
    gw.handle_client_message(&id, "{not json").unwrap();
    gw.handle_client_message(&id, r#"{"event":"set-interval","data":"fast"}"#)
        .unwrap();

    let replies = drain(&mut rx);
    let events: Vec<&str> = replies.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(
        events,
        vec!["pong", "system-metrics", "error", "error", "interval-set"]
    );
    assert_eq!(replies[2].data["code"], "UNKNOWN_EVENT");
    assert_eq!(replies[3].data["code"], "BAD_FRAME");
    assert_eq!(replies[4].status, Status::Error);

    let m = gw.registry().metrics();
    assert_eq!(m.messages_received, 4);
    assert_eq!(m.errors, 1);
}

#[tokio::test]
async fn messages_from_closed_connection_are_refused() {
    let gw = gateway();
    let _rx = connect(&gw, "c1", Channel::Health, 8);
    let id = ConnectionId::from("c1");
    gw.release(&id, "client-close");

    let err = gw.handle_client_message(&id, r#"{"event":"ping"}"#).unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_CONNECTION");
    assert_eq!(gw.registry().metrics().messages_received, 0);
}

#[tokio::test(start_paused = true)]
async fn channel_cadence_change_restarts_the_poller() {
    let gw = gateway();
    let calls = counting_producer(&gw, Channel::Metrics);
    let mut rx = connect(&gw, "c1", Channel::Metrics, 64);
    let id = ConnectionId::from("c1");

    let pollers = gw.spawn_pollers();
    assert_eq!(gw.channel_cadence(Channel::Metrics), Duration::from_secs(1));
    assert_eq!(
        gw.set_channel_cadence(Channel::Metrics, 250).unwrap(),
        Duration::from_millis(250)
    );
    assert_eq!(gw.cadence_of(&id), Some(Duration::from_millis(250)));

    // The one-second timer is gone; only the 250 ms timer delivers.
    sleep(Duration::from_millis(1_050)).await;
    assert_eq!(drain(&mut rx).len(), 4);

    let err = gw.set_channel_cadence(Channel::Metrics, 50).unwrap_err();
    assert_eq!(err.code(), "INVALID_CADENCE");
    assert_eq!(gw.channel_cadence(Channel::Metrics), Duration::from_millis(250));
    sleep(Duration::from_millis(500)).await;
    assert_eq!(drain(&mut rx).len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    let err = gw.set_channel_cadence(Channel::Logs, 500).unwrap_err();
    assert_eq!(err.code(), "NOT_POLL_DRIVEN");

    gw.shutdown();
    for p in pollers {
        p.await.unwrap();
    }
}

#[test]
fn admission_racing_publish_sees_every_value_after_its_replay() {
    const PUBLISHES: u64 = 2_000;
    let gw = gateway();

    let publisher = {
        let gw = Arc::clone(&gw);
        std::thread::spawn(move || {
            for v in 1..=PUBLISHES {
                gw.publish(
                    Channel::Board,
                    Envelope::success("board-update", json!({ "v": v })),
                );
            }
        })
    };

    let mut receivers = Vec::new();
    for i in 0..100 {
        receivers.push(connect(&gw, &format!("c{i}"), Channel::Board, 4_096));
        std::thread::yield_now();
    }
    publisher.join().unwrap();

    for mut rx in receivers {
        let seen: Vec<u64> = drain(&mut rx)
            .iter()
            .map(|e| e.data["v"].as_u64().unwrap())
            .collect();
        let first = *seen.first().unwrap();
        assert_eq!(seen, (first..=PUBLISHES).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn send_to_released_connection_is_not_an_error() {
    let gw = gateway();
    let _rx = connect(&gw, "c1", Channel::Board, 8);
    let id = ConnectionId::from("c1");
    assert!(gw.release(&id, "client-close"));

    assert!(gw
        .send_to(&id, &Envelope::success("board-update", json!({})))
        .is_err());
    let m = gw.registry().metrics();
    assert_eq!(m.errors, 0);
    assert_eq!(m.last_error, None);
    assert_eq!(m.disconnections, 1);
    let closed = gw.registry().get(&id).unwrap();
    assert_eq!(closed.close_reason.as_deref(), Some("client-close"));
}

fn keys(v: &Value) -> BTreeSet<String> {
    v.as_object().unwrap().keys().cloned().collect()
}

#[tokio::test]
async fn synthetic_payloads_have_the_gateway_shape() {
    let at = chrono::Utc::now();
    let synthetic = |channel| forge_resilience::generator_for(channel, 7).generate(at);

    let gw = gateway();
    let real = [
        (Channel::Metrics, SystemMetricsProducer::new().snapshot()),
        (Channel::Health, HealthProducer::new().snapshot()),
        (
            Channel::Diagnostics,
            RegistryStatusProducer::new(Arc::clone(gw.registry())).snapshot(),
        ),
    ];
    for (channel, payload) in real {
        assert_eq!(keys(&synthetic(channel)), keys(&payload), "{channel}");
    }
    assert_eq!(
        keys(&synthetic(Channel::Diagnostics)["metrics"]),
        keys(&json!(gw.registry().metrics()))
    );

    let pipeline = BatchPipeline::spawn(BatchConfig::default(), Arc::new(SourceFilter::default()));
    gw.attach_pipeline(&pipeline, Channel::Logs);
    let mut rx = connect(&gw, "viewer", Channel::Logs, 8);
    pipeline
        .submit(DomainEvent::new(EventLevel::Info, "api", "request completed"))
        .unwrap();
    pipeline.flush();
    sleep(Duration::from_millis(50)).await;
    let batch = drain(&mut rx).pop().unwrap();
    let synthetic_batch = synthetic(Channel::Logs);
    assert_eq!(keys(&synthetic_batch), keys(&batch.data));
    assert_eq!(
        keys(&synthetic_batch["events"][0]),
        keys(&batch.data["events"][0])
    );
}
