//! Connection Lifecycle Tests
//!
//! Connect, disconnect, reset and dispose of a basket:
//! - Aggregate connection events under both connect policies
//! - Requests queued before any adapter is connected
//! - Reset and dispose releasing every inner resource
//! - Per-adapter pipelines rebuilt on each connect

mod common;

use basket_adapter::{
    BasketConfig, BasketError, Capabilities, ConnectReply, ConnectionState, LayerKind,
    MessageAdapter, ScriptedAdapter,
};
use common::*;
use std::sync::Arc;
use types::{DataType, Message, MessageBody, MessageError, MessageType};

fn silent(name: &str) -> Arc<ScriptedAdapter> {
    Arc::new(
        ScriptedAdapter::new(name, Capabilities::market_data([DataType::Level1]))
            .with_connect_reply(ConnectReply::Silent),
    )
}

fn failing(name: &str) -> Arc<ScriptedAdapter> {
    Arc::new(
        ScriptedAdapter::new(name, Capabilities::market_data([DataType::Level1]))
            .with_connect_reply(ConnectReply::Fail(format!("{} unreachable", name))),
    )
}

fn connect_error(message: &Message) -> Option<MessageError> {
    match &message.body {
        MessageBody::Connect(c) => c.error.clone(),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_without_adapters_is_rejected() {
    let h = Harness::new(BasketConfig::default());
    let result = h.basket.send_in(Message::connect(), &h.cancel).await;
    assert!(matches!(result, Err(BasketError::NoAdapters)));
}

#[tokio::test]
async fn test_first_connected_adapter_connects_basket() {
    let fast = venue("fast", [DataType::Level1]);
    let slow = silent("slow");

    let mut h = Harness::new(BasketConfig::default());
    h.add(&fast, 1);
    h.add(&slow, 2);

    let connected = h.connect().await;
    assert_eq!(connect_error(&connected), None);
    assert_eq!(h.basket.connection_state(), ConnectionState::Connected);
    assert_eq!(h.basket.adapter_state(slow.id()), ConnectionState::Connecting);

    // the late adapter does not produce a second aggregate event
    slow.emit(Message::connect_result(None));
    assert!(!h.drain().iter().any(is_aggregate_connect));
}

#[tokio::test]
async fn test_wait_for_every_adapter_policy() {
    let fast = venue("fast", [DataType::Level1]);
    let slow = silent("slow");

    let config = BasketConfig {
        connect_on_first_adapter: false,
        ..BasketConfig::default()
    };
    let mut h = Harness::new(config);
    h.add(&fast, 1);
    h.add(&slow, 2);

    h.send(Message::connect()).await;
    let published = h.drain();
    assert!(published
        .iter()
        .any(|m| m.adapter == Some(fast.id()) && matches!(m.body, MessageBody::Connect(_))));
    assert!(!published.iter().any(is_aggregate_connect));

    slow.emit(Message::connect_result(None));
    let connected = h.next_where(is_aggregate_connect).await;
    assert_eq!(connect_error(&connected), None);
}

#[tokio::test]
async fn test_last_pending_failure_still_connects_when_one_succeeded() {
    let fast = venue("fast", [DataType::Level1]);
    let slow = silent("slow");

    let config = BasketConfig {
        connect_on_first_adapter: false,
        ..BasketConfig::default()
    };
    let mut h = Harness::new(config);
    h.add(&fast, 1);
    h.add(&slow, 2);
    h.send(Message::connect()).await;

    slow.emit(Message::connect_result(Some(MessageError::Connection(
        "timeout".to_string(),
    ))));
    let connected = h.next_where(is_aggregate_connect).await;
    assert_eq!(connect_error(&connected), None);
    assert!(matches!(
        h.basket.adapter_state(slow.id()),
        ConnectionState::Failed(_)
    ));
}

#[tokio::test]
async fn test_all_adapters_failing_reports_combined_error() {
    let mut h = Harness::new(BasketConfig::default());
    h.add(&failing("alpha"), 1);
    h.add(&failing("beta"), 2);

    let result = h.connect().await;
    match connect_error(&result) {
        Some(MessageError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_pending_requests_replay_in_order() {
    let venue = silent("venue");
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.send(Message::connect()).await;

    let first = h.next_transaction_id();
    let second = h.next_transaction_id();
    h.send(subscribe(first, DataType::Level1)).await;
    h.send(subscribe(second, DataType::Level1)).await;

    assert_eq!(h.basket.pending_count(), 2);
    assert!(venue.sent_of(MessageType::MarketData).is_empty());

    venue.emit(Message::connect_result(None));
    h.next_where(response_to(second)).await;

    assert_eq!(h.basket.pending_count(), 0);
    assert_eq!(market_data_ids(&venue), vec![first, second]);
}

#[tokio::test]
async fn test_pending_requests_fail_when_nothing_connects() {
    let venue = silent("venue");
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.send(Message::connect()).await;

    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::Level1)).await;
    assert_eq!(h.basket.pending_count(), 1);

    venue.emit(Message::connect_result(Some(MessageError::Connection(
        "refused".to_string(),
    ))));
    let response = h.next_where(response_to(tx)).await;

    match &response.body {
        MessageBody::SubscriptionResponse(r) => {
            assert!(matches!(r.error, Some(MessageError::NoAdapter(_))))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.basket.pending_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_of_queued_subscription_answers_immediately() {
    let venue = silent("venue");
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.send(Message::connect()).await;

    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::Level1)).await;

    let unsub = h.next_transaction_id();
    h.send(unsubscribe(unsub, tx, DataType::Level1)).await;
    let response = h.next_where(response_to(unsub)).await;

    assert!(matches!(&response.body, MessageBody::SubscriptionResponse(r) if r.is_ok()));
    assert_eq!(h.basket.pending_count(), 0);

    venue.emit(Message::connect_result(None));
    h.next_where(is_aggregate_connect).await;
    assert!(venue.sent_of(MessageType::MarketData).is_empty());
}

#[tokio::test]
async fn test_disconnect_reports_once_all_adapters_are_down() {
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue("a", [DataType::Level1]), 1);
    h.add(&venue("b", [DataType::Level1]), 2);
    h.connect().await;

    h.send(Message::disconnect()).await;
    let aggregate: Vec<_> = h
        .drain()
        .into_iter()
        .filter(is_aggregate_disconnect)
        .collect();

    assert_eq!(aggregate.len(), 1);
    assert_eq!(h.basket.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_while_idle_answers_directly() {
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue("a", [DataType::Level1]), 1);

    h.send(Message::disconnect()).await;
    h.next_where(is_aggregate_disconnect).await;
}

#[tokio::test]
async fn test_reset_is_idempotent_and_releases_pipelines() {
    let venue = venue("venue", [DataType::Level1]);
    let mut h = Harness::new(BasketConfig::default());

    h.send(Message::reset()).await;
    h.send(Message::reset()).await;
    assert!(h.basket.is_idle());

    h.add(&venue, 0);
    h.connect().await;
    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::Level1)).await;
    assert!(!h.basket.is_idle());

    h.send(Message::reset()).await;
    assert!(h.basket.is_idle());
    assert_eq!(venue.output().handler_count(), 0);
    assert!(h.basket.composed_adapter(venue.id()).is_none());

    h.send(Message::reset()).await;
    assert!(h.basket.is_idle());

    // the basket can be connected again after a reset
    h.connect().await;
    assert_eq!(venue.output().handler_count(), 1);
}

#[tokio::test]
async fn test_dispose_runs_once() {
    let venue = venue("venue", [DataType::Level1]);
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.connect().await;

    h.basket.dispose().await;
    h.basket.dispose().await;

    assert_eq!(venue.dispose_count(), 1);
    assert_eq!(venue.output().handler_count(), 0);
    assert_eq!(h.basket.output().handler_count(), 0);
    assert!(matches!(
        h.basket.send_in(Message::connect(), &h.cancel).await,
        Err(BasketError::Disposed)
    ));
}

#[tokio::test]
async fn test_pipeline_rebuilt_with_heartbeat_switch() {
    let mut config = BasketConfig::default();
    config.pipeline = basket_adapter::PipelineConfig::disabled()
        .with(LayerKind::Heartbeat, true)
        .with(LayerKind::Latency, true)
        .with(LayerKind::GapFilling, true);

    let venue = trading_venue("venue");
    let mut h = Harness::new(config);
    h.add(&venue, 0);
    h.connect().await;

    let composed = h.basket.composed_adapter(venue.id()).unwrap();
    assert_eq!(
        composed.layers(),
        vec![LayerKind::Heartbeat, LayerKind::Latency, LayerKind::GapFilling]
    );
    assert_eq!(composed.adapter().id(), venue.id());

    // latency is measured through the whole stack
    let order = h.next_transaction_id();
    h.send(register(order, "main")).await;
    let execution = h.next_where(execution_for(order)).await;
    match &execution.body {
        MessageBody::Execution(e) => assert!(e.latency.is_some()),
        other => panic!("unexpected {:?}", other),
    }

    h.basket.apply_heartbeat(venue.id(), false).unwrap();
    h.connect().await;
    assert_eq!(
        h.basket.composed_adapter(venue.id()).unwrap().layers(),
        vec![LayerKind::Latency, LayerKind::GapFilling]
    );
}

#[tokio::test]
async fn test_config_loaded_from_toml_drives_pipeline() {
    let config = BasketConfig::from_toml_str(
        r#"
        name = "equities"
        connect_on_first_adapter = false

        [pipeline]
        heartbeat = false
        lookup_tracking = false
        subscription_lifecycle = false
        order_log_synthesis = false
        candle_compression = false
        order_book_truncation = true
        order_book_depth = 5
        "#,
    )
    .unwrap();

    let depth = venue("depth", [DataType::MarketDepth]);
    let mut h = Harness::new(config);
    h.add(&depth, 0);
    h.connect().await;
    assert_eq!(h.basket.name(), "equities");
    assert_eq!(
        h.basket.composed_adapter(depth.id()).unwrap().layers(),
        vec![LayerKind::OrderBookTruncation]
    );

    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::MarketDepth)).await;
    match &depth.sent_of(MessageType::MarketData)[0].body {
        MessageBody::MarketData(md) => assert_eq!(md.max_depth, Some(5)),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_pending_replayed_when_connecting_adapter_drops() {
    let fast = venue("fast", [DataType::Level1]);
    let slow = Arc::new(
        ScriptedAdapter::new("slow", Capabilities::market_data([DataType::Ticks]))
            .with_connect_reply(ConnectReply::Silent),
    );

    let mut h = Harness::new(BasketConfig::default());
    h.add(&fast, 1);
    h.add(&slow, 2);
    h.connect().await;

    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::Ticks)).await;
    assert_eq!(h.basket.pending_count(), 1);

    slow.emit(Message::disconnect_result(None));
    let response = h.next_where(response_to(tx)).await;

    match &response.body {
        MessageBody::SubscriptionResponse(r) => {
            assert!(matches!(r.error, Some(MessageError::NoAdapter(_))))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.basket.pending_count(), 0);
    assert!(fast.sent_of(MessageType::MarketData).is_empty());
}

#[tokio::test]
async fn test_pending_failed_on_disconnect_while_connecting() {
    let venue = silent("venue");
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.send(Message::connect()).await;

    let tx = h.next_transaction_id();
    h.send(subscribe(tx, DataType::Level1)).await;
    assert_eq!(h.basket.pending_count(), 1);

    h.send(Message::disconnect()).await;
    let published = h.drain();

    let response = published
        .iter()
        .find(|m| response_to(tx)(m))
        .expect("queued subscription answered");
    assert!(matches!(
        &response.body,
        MessageBody::SubscriptionResponse(r) if matches!(r.error, Some(MessageError::NoAdapter(_)))
    ));
    assert!(published.iter().any(is_aggregate_disconnect));
    assert_eq!(h.basket.pending_count(), 0);
    assert!(venue.sent_of(MessageType::MarketData).is_empty());
}

#[tokio::test]
async fn test_replay_honors_caller_cancellation() {
    let venue = silent("venue");
    let mut h = Harness::new(BasketConfig::default());
    h.add(&venue, 0);
    h.send(Message::connect()).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let tx = h.next_transaction_id();
    h.basket
        .send_in(subscribe(tx, DataType::Level1), &cancel)
        .await
        .unwrap();
    assert_eq!(h.basket.pending_count(), 1);
    cancel.cancel();

    venue.emit(Message::connect_result(None));
    let response = h.next_where(response_to(tx)).await;

    match &response.body {
        MessageBody::SubscriptionResponse(r) => assert_eq!(r.error, Some(MessageError::Cancelled)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(venue.sent_of(MessageType::MarketData).is_empty());
}
