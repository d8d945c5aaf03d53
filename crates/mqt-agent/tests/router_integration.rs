//! Router and control protocol integration tests
//!
//! Drives the topic router and control handler against the in-memory
//! broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::MemoryBroker;
use mqt_agent::{
    ControlHandler, ControlOutcome, Dispatch, InboundMessage, RouterSettings, TopicRouter, TunnelStatus,
};
use mqt_core::{BrokerError, MqtError, TunnelError};
use mqt_protocol::{CloseTunnel, ControlCommand, OpenTunnel, QualityLevel, TopicName};

const CONTROL: &str = "test/control";

fn setup() -> (Arc<MemoryBroker>, Arc<TopicRouter>, ControlHandler) {
    let (broker, _events) = MemoryBroker::standalone();
    let router = Arc::new(TopicRouter::new(
        TopicName::from(CONTROL),
        broker.clone(),
        RouterSettings {
            inbound_capacity: 4,
            ..RouterSettings::default()
        },
    ));
    let handler = ControlHandler::new("local-peer", QualityLevel::AtMostOnce, Arc::clone(&router));
    (broker, router, handler)
}

fn open(topic: &str) -> ControlCommand {
    ControlCommand::Open(OpenTunnel::new(TopicName::from(topic)))
}

fn close(topic: &str) -> ControlCommand {
    ControlCommand::Close(CloseTunnel::new(TopicName::from(topic)))
}

#[tokio::test]
async fn test_open_twice_yields_one_entry_and_one_subscription() {
    let (broker, router, handler) = setup();

    let first = handler.apply(open("data/a")).await;
    assert!(matches!(first, ControlOutcome::Opened(_)));

    let second = handler.apply(open("data/a")).await;
    match second {
        ControlOutcome::AlreadyOpen(topic) => assert_eq!(topic.as_str(), "data/a"),
        other => panic!("Expected AlreadyOpen, got {:?}", other),
    }

    assert_eq!(router.len(), 1);
    assert_eq!(broker.subscribe_calls(), 1);
    assert!(broker.is_subscribed(&TopicName::from("data/a")));
    assert!(broker.is_subscribed(&TopicName::from(CONTROL)));
}

#[tokio::test]
async fn test_close_unregistered_is_noop() {
    let (broker, router, handler) = setup();

    let outcome = handler.apply(close("data/missing")).await;

    assert!(matches!(outcome, ControlOutcome::NotRegistered(_)));
    assert!(router.is_empty());
    assert_eq!(broker.unsubscribe_calls(), 0);
}

#[tokio::test]
async fn test_close_unsubscribes_and_drains_queue() {
    let (broker, router, handler) = setup();

    let ControlOutcome::Opened(opened) = handler.apply(open("data/a")).await else {
        panic!("open did not create a tunnel");
    };
    let mut handle = opened.handle;
    router
        .dispatch(InboundMessage::new("data/a", Bytes::from("queued")))
        .await;

    let outcome = handler.apply(close("data/a")).await;
    assert!(matches!(outcome, ControlOutcome::Closed(_)));
    assert!(router.is_empty());
    assert!(!broker.is_subscribed(&TopicName::from("data/a")));

    assert_eq!(handle.recv().await.unwrap(), "queued");
    assert!(handle.recv().await.is_none());
    assert!(handle.publish(Bytes::from("late")).await.is_err());
}

#[tokio::test]
async fn test_failed_subscribe_leaves_registry_unchanged() {
    let (broker, router, _handler) = setup();
    broker.fail_next_subscribe(BrokerError::Timeout {
        operation: "subscribe",
    });

    let spec = mqt_agent::TunnelSpec::new(TopicName::from("data/a"), QualityLevel::AtMostOnce);
    let err = router.open(spec).await.unwrap_err();

    assert!(matches!(err, MqtError::Broker(BrokerError::Timeout { .. })));
    assert!(router.is_empty());
}

#[tokio::test]
async fn test_failed_unsubscribe_keeps_tunnel_registered() {
    let (broker, router, handler) = setup();
    handler.apply(open("data/a")).await;
    broker.fail_next_unsubscribe(BrokerError::Timeout {
        operation: "unsubscribe",
    });

    let outcome = handler.apply(close("data/a")).await;

    assert!(matches!(outcome, ControlOutcome::Failed(_)));
    assert!(router.contains(&TopicName::from("data/a")));
}

#[tokio::test]
async fn test_dispatch_reaches_only_the_owning_tunnel() {
    let (_broker, router, handler) = setup();
    let ControlOutcome::Opened(a) = handler.apply(open("data/a")).await else {
        panic!("open a failed");
    };
    let ControlOutcome::Opened(b) = handler.apply(open("data/b")).await else {
        panic!("open b failed");
    };
    let (mut a, mut b) = (a.handle, b.handle);

    let routed = router
        .dispatch(InboundMessage::new("data/a", Bytes::from("for-a")))
        .await;
    assert!(matches!(routed, Dispatch::Delivered));

    let unrouted = router
        .dispatch(InboundMessage::new("data/nobody", Bytes::from("lost")))
        .await;
    assert!(matches!(unrouted, Dispatch::Unrouted));

    assert_eq!(a.recv().await.unwrap(), "for-a");
    assert!(timeout(Duration::from_millis(50), b.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(50), a.recv()).await.is_err());
    assert_eq!(router.len(), 2);
}

#[tokio::test]
async fn test_control_topic_is_never_tunnel_payload() {
    let (_broker, router, handler) = setup();

    let outcome = handler.apply(open(CONTROL)).await;
    assert!(matches!(
        outcome,
        ControlOutcome::Failed(MqtError::Tunnel(TunnelError::ReservedTopic(_)))
    ));
    assert!(router.is_empty());

    let payload = br#"{"kind":"close","topic":"data/a"}"#;
    let dispatched = router
        .dispatch(InboundMessage::new(CONTROL, Bytes::from_static(payload)))
        .await;
    match dispatched {
        Dispatch::Control(command) => assert_eq!(command.kind(), "close"),
        other => panic!("Expected control dispatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_control_packet_changes_nothing() {
    let (broker, router, handler) = setup();
    handler.apply(open("data/a")).await;
    let calls = broker.subscribe_calls();

    let dispatched = router
        .dispatch(InboundMessage::new(CONTROL, Bytes::from_static(br#"{"kind":"open"}"#)))
        .await;

    assert!(matches!(dispatched, Dispatch::MalformedControl));
    assert_eq!(router.topics(), vec![TopicName::from("data/a")]);
    assert_eq!(broker.subscribe_calls(), calls);
}

#[tokio::test]
async fn test_unknown_kind_and_own_packets_are_ignored() {
    let (_broker, router, handler) = setup();

    let unknown = ControlCommand::Unknown {
        kind: "resize".to_string(),
        topic: Some(TopicName::from("data/a")),
    };
    assert!(matches!(handler.apply(unknown).await, ControlOutcome::Ignored));

    let mut own = OpenTunnel::new(TopicName::from("data/a"));
    own.params.origin = Some("local-peer".to_string());
    assert!(matches!(
        handler.apply(ControlCommand::Open(own)).await,
        ControlOutcome::Ignored
    ));
    assert!(router.is_empty());
}

#[tokio::test]
async fn test_requested_quality_overrides_default() {
    let (_broker, router, handler) = setup();

    let mut request = OpenTunnel::new(TopicName::from("data/q"));
    request.quality = Some(QualityLevel::AtLeastOnce);
    handler.apply(ControlCommand::Open(request)).await;

    let tunnel = router.get(&TopicName::from("data/q")).unwrap();
    assert_eq!(tunnel.quality(), QualityLevel::AtLeastOnce);
    assert_eq!(
        router.subscription_set().get(&TopicName::from("data/q")),
        Some(&QualityLevel::AtLeastOnce)
    );
}

#[tokio::test]
async fn test_release_tells_the_peer_to_close() {
    let (broker, router, handler) = setup();
    let mut request = OpenTunnel::new(TopicName::from("data/a"));
    request.params.peer_topic = Some(TopicName::from("data/b"));
    handler.apply(ControlCommand::Open(request)).await;

    assert!(handler.release(&TopicName::from("data/a")).await.unwrap());
    assert!(router.is_empty());

    let published = broker.published();
    let (topic, payload) = published.last().unwrap();
    assert_eq!(topic.as_str(), CONTROL);
    match mqt_protocol::decode(payload).unwrap() {
        ControlCommand::Close(close) => {
            assert_eq!(close.topic.as_str(), "data/b");
            assert_eq!(close.params.origin.as_deref(), Some("local-peer"));
        }
        other => panic!("Expected close packet, got {:?}", other),
    }

    // Second release finds nothing and publishes nothing
    assert!(!handler.release(&TopicName::from("data/a")).await.unwrap());
    assert_eq!(broker.published().len(), published.len());
}

#[tokio::test]
async fn test_full_queue_blocks_dispatch_until_drained() {
    let (_broker, router, handler) = setup();
    let ControlOutcome::Opened(opened) = handler.apply(open("data/a")).await else {
        panic!("open failed");
    };
    let mut handle = opened.handle;

    for i in 0..4u8 {
        router
            .dispatch(InboundMessage::new("data/a", Bytes::from(vec![i])))
            .await;
    }

    let blocked = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .dispatch(InboundMessage::new("data/a", Bytes::from(vec![4u8])))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    assert_eq!(handle.recv().await.unwrap().as_ref(), &[0u8]);
    assert!(matches!(blocked.await.unwrap(), Dispatch::Delivered));
    for expected in 1..5u8 {
        assert_eq!(handle.recv().await.unwrap().as_ref(), &[expected]);
    }
}

#[tokio::test]
async fn test_undrained_queue_releases_tunnel_instead_of_blocking() {
    let (broker, _events) = MemoryBroker::standalone();
    let (release_tx, mut release_rx) = mpsc::unbounded_channel();
    let router = Arc::new(
        TopicRouter::new(
            TopicName::from(CONTROL),
            broker.clone(),
            RouterSettings {
                inbound_capacity: 1,
                delivery_timeout: Duration::from_millis(100),
                ..RouterSettings::default()
            },
        )
        .with_release_channel(release_tx),
    );
    let handler = ControlHandler::new("local-peer", QualityLevel::AtMostOnce, Arc::clone(&router));
    let ControlOutcome::Opened(opened) = handler.apply(open("data/a")).await else {
        panic!("open failed");
    };
    let mut handle = opened.handle;

    let first = router.dispatch(InboundMessage::new("data/a", "1")).await;
    assert!(matches!(first, Dispatch::Delivered));

    let stalled = timeout(
        Duration::from_secs(1),
        router.dispatch(InboundMessage::new("data/a", "2")),
    )
    .await
    .expect("dispatch must give up on a full queue");
    assert!(matches!(stalled, Dispatch::Stalled));
    assert_eq!(handle.status(), TunnelStatus::Closing);
    assert_eq!(release_rx.recv().await.unwrap().as_str(), "data/a");

    // Later chunks for the stalled tunnel are refused at once
    let late = timeout(
        Duration::from_millis(50),
        router.dispatch(InboundMessage::new("data/a", "3")),
    )
    .await
    .unwrap();
    assert!(matches!(late, Dispatch::TunnelClosed));

    assert_eq!(handle.recv().await.unwrap(), "1");
    assert!(handle.recv().await.is_none());

    // Releasing it unsubscribes and tells nobody, it has no peer topic
    assert!(handler.release(&TopicName::from("data/a")).await.unwrap());
    assert!(!broker.is_subscribed(&TopicName::from("data/a")));
}
