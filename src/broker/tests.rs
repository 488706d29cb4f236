use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;

use super::Broker;
use super::message::{
    MAX_MESSAGE_ID_LEN, Message, MessageOptions, Qos, copy_message_id, is_valid_message_id,
};
use super::pattern::{MAX_TOPIC_LEN, Subscription, is_valid_topic};
use super::registry::{ClientRegistry, RegistryEvent};
use super::routing::{RouterRule, RoutingEngine};
use super::scheduler::{lock, run_garbage_loop, run_heartbeat_loop};
use super::topic::TopicIndex;
use crate::auth::AuthRecord;
use crate::client::Session;
use crate::config::BrokerSettings;
use crate::persistence::{LoadProgress, MemoryStore, ResourceStore, SledStore, Storage};
use crate::persistence::documents::ResourceDocument;
use crate::transport::message::{DeliveryAck, Hello, Outbound, ServerFrame};
use crate::utils::{BrokerError, Result, now_millis};

// ----- helpers -------------------------------------------------------------

fn msg(id: &str, topic: &str, priority: i32, publish_time: i64) -> Message {
    Message::new(
        topic,
        json!({"id": id}),
        MessageOptions {
            message_id: id.to_string(),
            priority,
            ..Default::default()
        },
        publish_time,
    )
}

fn rule(description: &str, topic: &str, copy_to: &[&str], move_to: &[&str]) -> RouterRule {
    RouterRule {
        description: description.to_string(),
        topic: topic.to_string(),
        copy_to: copy_to.iter().map(|s| s.to_string()).collect(),
        move_to: move_to.iter().map(|s| s.to_string()).collect(),
    }
}

fn hello(client_id: &str, max_workers: usize) -> Hello {
    Hello {
        client_id: client_id.to_string(),
        version: "1.0".to_string(),
        max_workers: Some(max_workers),
        auth_token: None,
    }
}

fn connect(
    broker: &mut Broker,
    client_id: &str,
    max_workers: usize,
    now: i64,
) -> (u64, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let uid = broker
        .open_session(hello(client_id, max_workers), tx, now)
        .unwrap();
    // welcome
    assert!(matches!(
        rx.try_recv(),
        Ok(Outbound::Frame(ServerFrame::Welcome { .. }))
    ));
    (uid, rx)
}

fn frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerFrame> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Frame(frame) = item {
            out.push(frame);
        }
    }
    out
}

fn delivered_ids(frames: &[ServerFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::Delivery { options, .. } => Some(options.message_id.clone()),
            _ => None,
        })
        .collect()
}

fn broker() -> Broker {
    Broker::in_memory(BrokerSettings::default())
}

// ----- pattern -------------------------------------------------------------

#[test]
fn test_exact_subscription_ignores_case() {
    let sub = Subscription::compile("Orders.EU").unwrap();
    assert!(matches!(sub, Subscription::Exact(_)));
    assert!(sub.matches("orders.eu"));
    assert!(!sub.matches("orders.eu.x"));
}

#[test]
fn test_hash_matches_one_segment() {
    let sub = Subscription::compile("orders.#").unwrap();
    assert!(sub.matches("orders.eu"));
    assert!(sub.matches("ORDERS.us"));
    assert!(!sub.matches("orders."));
    assert!(!sub.matches("orders.eu.paris"));
}

#[test]
fn test_star_matches_inside_segment() {
    let sub = Subscription::compile("log.err*").unwrap();
    assert!(sub.matches("log.err"));
    assert!(sub.matches("log.errors"));
    assert!(!sub.matches("log.err.x"));
    assert_eq!(sub.as_str(), "log.err*");
}

#[test]
fn test_invalid_masks_are_rejected() {
    assert!(Subscription::compile("").is_none());
    assert!(Subscription::compile("bad topic").is_none());
    assert!(Subscription::compile("a/b").is_none());
    assert!(Subscription::compile(&"a".repeat(MAX_TOPIC_LEN + 1)).is_none());
    assert!(is_valid_topic(&"a".repeat(MAX_TOPIC_LEN)));
    assert!(!is_valid_topic("a.#"));
}

// ----- message -------------------------------------------------------------

#[test]
fn test_message_validation() {
    assert!(msg("ok_id-1", "t", 0, 0).validate().is_ok());
    assert!(msg("ok", "", 0, 0).validate().unwrap_err().is_validation());
    assert!(msg("bad id", "t", 0, 0).validate().is_err());
    assert!(!is_valid_message_id(&"x".repeat(129)));

    let mut m = msg("ok", "t", 0, 0);
    m.options.delay_ms = -1;
    assert!(m.validate().is_err());
}

#[test]
fn test_message_delay_and_expiry_windows() {
    let mut m = msg("m", "t", 0, 1_000);
    m.options.delay_ms = 500;
    m.options.expiration_ms = 2_000;
    assert!(m.is_delayed(1_499));
    assert!(!m.is_delayed(1_500));
    assert!(!m.is_expired(2_999));
    assert!(m.is_expired(3_000));

    m.options.expiration_ms = 0;
    assert!(!m.is_expired(i64::MAX / 2));
}

#[test]
fn test_maximum_delay_and_expiration_do_not_wrap() {
    let mut m = msg("m", "t", 0, 1_000);
    m.options.delay_ms = i64::MAX;
    m.options.expiration_ms = i64::MAX;
    assert!(m.validate().is_ok());
    assert!(m.is_delayed(i64::MAX - 1));
    assert!(!m.is_expired(i64::MAX - 1));

    let mut broker = broker();
    let (uid, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(uid, &["t"]);
    let mut delayed = msg("delayed", "t", 0, 0);
    delayed.options.delay_ms = i64::MAX;
    broker.add_message(delayed, true, 0).unwrap();
    let mut kept = msg("kept", "u", 0, 0);
    kept.options.expiration_ms = i64::MAX;
    broker.add_message(kept, true, 0).unwrap();

    assert_eq!(broker.run_pass(2_000), 0);
    assert!(delivered_ids(&frames(&mut rx)).is_empty());
    for _ in 0..4 {
        assert_eq!(broker.collect_garbage(2_000).deleted, 0);
    }
    assert_eq!(broker.message_count(), 2);
}

#[test]
fn test_copy_ids_fit_the_id_limit() {
    assert_eq!(copy_message_id("order", 2), "order-2");
    let long = "a".repeat(MAX_MESSAGE_ID_LEN);
    let copy = copy_message_id(&long, 12);
    assert_eq!(copy.len(), MAX_MESSAGE_ID_LEN);
    assert!(copy.ends_with("-12"));
    assert!(is_valid_message_id(&copy));
}

// ----- topic index ---------------------------------------------------------

#[test]
fn test_sorted_order_is_priority_then_publish_time() {
    let mut index = TopicIndex::new();
    let items = [(3, 10), (1, 30), (3, 5), (1, 20), (2, 0), (-1, 100)];
    for (n, (priority, time)) in items.iter().enumerate() {
        index.add_bulk(Arc::new(msg(&format!("m{n}"), "t", *priority, *time)));
    }
    index.sort_all(0);

    let sorted = index.messages("t");
    for pair in sorted.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.priority() < b.priority()
                || (a.priority() == b.priority() && a.publish_time <= b.publish_time)
        );
    }
    assert_eq!(sorted[0].priority(), -1);
}

#[test]
fn test_insert_within_window_defers_sort() {
    let mut index = TopicIndex::new();
    // long after the (zero) last sort: sorts immediately
    index.add(Arc::new(msg("low", "t", 5, 10_000)), 10_000);
    assert!(!index.is_sort_pending("t"));

    index.add(Arc::new(msg("high", "t", 1, 10_100)), 10_100);
    assert!(index.is_sort_pending("t"));
    assert_eq!(index.messages("t")[0].id(), "low");

    assert_eq!(index.flush_due_sorts(10_200), 0);
    assert_eq!(index.flush_due_sorts(10_349), 1);
    assert!(!index.is_sort_pending("t"));
    assert_eq!(index.messages("t")[0].id(), "high");
}

#[test]
fn test_deliverable_skips_delayed_and_expired() {
    let mut index = TopicIndex::new();
    let mut delayed = msg("delayed", "t", 0, 0);
    delayed.options.delay_ms = 1_000;
    let mut expired = msg("expired", "t", 0, 0);
    expired.options.expiration_ms = 100;
    index.add_bulk(Arc::new(delayed));
    index.add_bulk(Arc::new(expired));
    index.add_bulk(Arc::new(msg("ready", "t", 0, 0)));
    index.sort_all(0);

    let ids: Vec<&str> = index.deliverable("t", 500).map(|m| m.id()).collect();
    assert_eq!(ids, vec!["ready"]);
    // restartable, and does not consume anything
    assert_eq!(index.deliverable("t", 500).count(), 1);
    assert_eq!(index.deliverable("t", 1_000).count(), 2);
    assert_eq!(index.len("t"), 3);
}

#[test]
fn test_remove_clear_and_rates() {
    let mut index = TopicIndex::new();
    for n in 0..3 {
        index.add(Arc::new(msg(&format!("m{n}"), "t", 0, 0)), 60_000);
    }
    assert!(index.remove("t", "m1", 60_000).is_some());
    assert!(index.remove("t", "m1", 60_000).is_none());
    assert_eq!(index.clear("t", 60_000), vec!["m0", "m2"]);
    assert!(index.is_empty());
    assert!(index.active_topics().is_empty());

    let rates = index.rates("t", 60_500).unwrap();
    assert_eq!(rates.added, [3, 3, 3]);
    assert_eq!(rates.removed, [3, 3, 3]);
    let later = index.rates("t", 60_000 + 6 * 60_000).unwrap();
    assert_eq!(later.added, [0, 0, 3]);
}

#[test]
fn test_prune_idle_drops_quiet_empty_topics() {
    let mut index = TopicIndex::new();
    index.add(Arc::new(msg("a", "busy", 0, 0)), 60_000);
    index.add(Arc::new(msg("b", "drained", 0, 0)), 60_000);
    index.remove("drained", "b", 60_000);

    assert_eq!(index.prune_idle(60_500), 0);
    assert!(index.rates("drained", 60_500).is_some());

    let quiet = 60_000 + 15 * 60_000;
    assert_eq!(index.prune_idle(quiet), 1);
    assert!(index.rates("drained", quiet).is_none());
    assert_eq!(index.len("busy"), 1);
}

#[test]
fn test_expired_query() {
    let mut index = TopicIndex::new();
    assert!(index.expired(0).is_empty());
    let mut m = msg("old", "t", 0, 0);
    m.options.expiration_ms = 10;
    index.add_bulk(Arc::new(m));
    index.add_bulk(Arc::new(msg("fresh", "t", 0, 0)));
    assert_eq!(index.expired(5), Vec::<String>::new());
    assert_eq!(index.expired(10), vec!["old".to_string()]);
}

// ----- routing -------------------------------------------------------------

fn router(rules: Vec<RouterRule>) -> RoutingEngine {
    let mut engine = RoutingEngine::default();
    engine.set_rules(rules).unwrap();
    engine
}

#[test]
fn test_expand_without_rules_is_noop() {
    let e = router(vec![]).expand("x").unwrap();
    assert!(e.noop);
    assert!(e.keep_original);
    assert_eq!(e.destinations, vec!["x"]);
}

#[test]
fn test_expand_copy_keeps_original() {
    let e = router(vec![rule("c", "x", &["y"], &[])]).expand("x").unwrap();
    assert!(!e.noop);
    assert!(e.keep_original);
    assert_eq!(e.destinations, vec!["x", "y"]);
}

#[test]
fn test_expand_move_drops_original() {
    let e = router(vec![rule("m", "x", &[], &["y"])]).expand("x").unwrap();
    assert!(!e.keep_original);
    assert_eq!(e.destinations, vec!["y"]);
}

#[test]
fn test_expand_follows_chains_to_fixed_point() {
    let engine = router(vec![
        rule("one", "x", &["y"], &[]),
        rule("two", "y", &["z"], &[]),
        rule("back", "z", &["x"], &[]),
    ]);
    let e = engine.expand("x").unwrap();
    assert_eq!(e.destinations, vec!["x", "y", "z"]);
}

#[test]
fn test_any_copy_suppresses_move_removal() {
    let engine = router(vec![rule("c", "x", &["y"], &[]), rule("m", "y", &[], &["z"])]);
    let e = engine.expand("x").unwrap();
    assert!(e.keep_original);
    assert_eq!(e.destinations, vec!["x", "y", "z"]);
}

#[test]
fn test_move_cycle_is_a_routing_error() {
    let engine = router(vec![rule("a", "x", &[], &["y"]), rule("b", "y", &[], &["x"])]);
    assert!(matches!(engine.expand("x"), Err(BrokerError::Routing(_))));
}

#[test]
fn test_expansion_guard() {
    let rules: Vec<RouterRule> = (0..10)
        .map(|n| {
            let from = format!("t{n}");
            let to = format!("t{}", n + 1);
            rule(&from, &from, &[to.as_str()], &[])
        })
        .collect();
    let mut engine = RoutingEngine::new(4, 1024);
    engine.set_rules(rules.clone()).unwrap();
    assert!(matches!(engine.expand("t0"), Err(BrokerError::Routing(_))));

    let mut engine = RoutingEngine::new(64, 5);
    engine.set_rules(rules).unwrap();
    assert!(matches!(engine.expand("t0"), Err(BrokerError::Routing(_))));
}

#[test]
fn test_rule_set_validation() {
    let mut engine = RoutingEngine::default();
    let dup = vec![rule("same", "x", &["y"], &[]), rule("SAME", "z", &["y"], &[])];
    assert!(engine.set_rules(dup).is_err());
    assert!(engine.set_rules(vec![rule("empty", "x", &[], &[])]).is_err());
    assert!(engine.set_rules(vec![rule("bad", "x", &["a b"], &[])]).is_err());

    engine.upsert_rule(rule("r", "x", &["y"], &[])).unwrap();
    engine.upsert_rule(rule("R", "x", &["z"], &[])).unwrap();
    assert_eq!(engine.rules().len(), 1);
    assert_eq!(engine.expand("x").unwrap().destinations, vec!["x", "z"]);
    assert!(engine.remove_rule("r"));
    assert!(!engine.remove_rule("r"));
    assert!(engine.expand("x").unwrap().noop);
}

// ----- registry ------------------------------------------------------------

#[test]
fn test_registry_events_and_groups() {
    let mut registry = ClientRegistry::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let a = registry.next_unique_id();
    let b = registry.next_unique_id();
    assert!(b > a);

    registry.add(Session::new(a, "svc", "1", 1, None, tx.clone(), 0));
    registry.add(Session::new(b, "svc", "1", 1, None, tx, 0));
    assert_eq!(registry.group("svc").len(), 2);
    assert_eq!(registry.subscribe(a, &["x.#"]), Some(1));
    assert_eq!(registry.subscribe(99, &["x"]), None);
    assert!(registry.remove(a).is_some());
    assert!(registry.remove(a).is_none());

    let events = registry.drain_events();
    assert_eq!(events.len(), 4);
    assert!(matches!(events[2], RegistryEvent::SubscriptionsChanged { count: 1, .. }));
    assert!(matches!(events[3], RegistryEvent::Removed { unique_id, .. } if unique_id == a));
    assert!(registry.drain_events().is_empty());
    assert_eq!(registry.shuffled_ids(), vec![b]);
}

// ----- engine: publish -----------------------------------------------------

#[test]
fn test_publish_acks_supplied_and_generated_ids() {
    let mut broker = broker();
    let (publisher, mut rx) = connect(&mut broker, "pub", 1, 0);

    let options = MessageOptions {
        message_id: "order-1".to_string(),
        ..Default::default()
    };
    assert_eq!(
        broker.publish(publisher, "orders", json!(1), options, 0).unwrap(),
        "order-1"
    );
    let generated = broker
        .publish(publisher, "orders", json!(2), MessageOptions::default(), 0)
        .unwrap();
    assert_eq!(generated.len(), 32);
    assert!(generated.chars().all(|c| c.is_ascii_hexdigit()));

    let acks = frames(&mut rx);
    assert_eq!(
        acks[0],
        ServerFrame::PublishAck {
            message_id: "order-1".to_string(),
            error_message: None
        }
    );
    assert!(matches!(&acks[1], ServerFrame::PublishAck { message_id, error_message: None } if *message_id == generated));
    assert_eq!(broker.topic_len("orders"), 2);
    assert_eq!(broker.message("order-1").unwrap().source_client_id, "pub");
}

#[test]
fn test_invalid_publish_answers_with_error() {
    let mut broker = broker();
    let (publisher, mut rx) = connect(&mut broker, "pub", 1, 0);

    let options = MessageOptions {
        message_id: "m1".to_string(),
        delay_ms: -5,
        ..Default::default()
    };
    let err = broker
        .publish(publisher, "orders", json!(null), options, 0)
        .unwrap_err();
    assert!(err.is_validation());

    match frames(&mut rx).as_slice() {
        [ServerFrame::PublishAck { message_id, error_message: Some(reason) }] => {
            assert_eq!(message_id, "m1");
            assert!(reason.contains("delayMs"));
        }
        other => panic!("unexpected frames {other:?}"),
    }
    assert_eq!(broker.message_count(), 0);
    // the session is still usable
    assert!(broker.session(publisher).is_some());
}

#[test]
fn test_copy_rule_stores_under_both_topics() {
    let mut broker = broker();
    broker.install_rules(vec![rule("audit", "x", &["y"], &[])]).unwrap();

    let id = broker.add_message(msg("m", "x", 0, 0), true, 0).unwrap();
    assert_eq!(id, "m");
    assert_eq!(broker.topic_len("x"), 1);
    assert_eq!(broker.topic_len("y"), 1);
    assert_eq!(broker.topic_messages("y")[0].id(), "m-1");
    assert_eq!(broker.topic_messages("y")[0].payload, json!({"id": "m"}));
}

#[test]
fn test_move_rule_stores_only_under_target() {
    let mut broker = broker();
    broker.install_rules(vec![rule("move", "x", &[], &["y"])]).unwrap();

    broker.add_message(msg("m", "x", 0, 0), true, 0).unwrap();
    assert_eq!(broker.topic_len("x"), 0);
    assert_eq!(broker.topic_len("y"), 1);
    assert!(broker.message("m").is_none());
}

#[test]
fn test_routing_error_is_reported() {
    let mut broker = broker();
    broker
        .install_rules(vec![rule("a", "x", &[], &["y"]), rule("b", "y", &[], &["x"])])
        .unwrap();
    assert!(matches!(
        broker.add_message(msg("m", "x", 0, 0), true, 0),
        Err(BrokerError::Routing(_))
    ));
    assert_eq!(broker.message_count(), 0);
}

#[test]
fn test_republish_supersedes_previous_instance() {
    let mut broker = broker();
    broker.add_message(msg("m", "old", 0, 0), true, 0).unwrap();
    broker.add_message(msg("m", "new", 0, 10), true, 10).unwrap();

    assert_eq!(broker.topic_len("old"), 0);
    assert_eq!(broker.topic_len("new"), 1);
    assert_eq!(broker.message_count(), 1);
    assert_eq!(broker.message("m").unwrap().publish_time, 10);
}

#[test]
fn test_delete_and_clear_topic() {
    let mut broker = broker();
    for id in ["a", "b", "c"] {
        broker.add_message(msg(id, "t", 0, 0), true, 0).unwrap();
    }
    assert!(broker.delete_message("b", 0).unwrap());
    assert!(!broker.delete_message("b", 0).unwrap());
    assert_eq!(broker.clear_topic("t", 0).unwrap(), 2);
    assert_eq!(broker.message_count(), 0);
}

// ----- engine: delivery ----------------------------------------------------

#[test]
fn test_deliver_then_complete() {
    let mut broker = broker();
    let (worker, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["jobs.#"]);
    broker.add_message(msg("j1", "jobs.build", 0, 0), true, 0).unwrap();

    assert_eq!(broker.run_pass(100), 1);
    assert_eq!(delivered_ids(&frames(&mut rx)), vec!["j1"]);
    assert_eq!(broker.in_flight_owner("j1"), Some(worker));
    // in flight: nothing more to hand out
    assert_eq!(broker.run_pass(200), 0);

    let ack = DeliveryAck {
        message_id: "j1".to_string(),
        percent: Some(100),
        ..Default::default()
    };
    assert!(broker.handle_delivery_ack(worker, &ack, 300));
    assert_eq!(broker.topic_len("jobs.build"), 0);
    assert_eq!(broker.in_flight_owner("j1"), None);
    assert!(broker.message("j1").is_none());
    assert_eq!(broker.session(worker).unwrap().in_flight(), 0);
}

#[test]
fn test_progress_ack_keeps_delivery_in_flight() {
    let mut broker = broker();
    let (worker, mut rx) = connect(&mut broker, "worker", 2, 0);
    broker.subscribe(worker, &["t"]);
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();
    broker.run_pass(0);
    frames(&mut rx);

    let ack = DeliveryAck {
        message_id: "m".to_string(),
        percent: Some(50),
        ..Default::default()
    };
    assert!(!broker.handle_delivery_ack(worker, &ack, 10));
    assert_eq!(broker.in_flight_owner("m"), Some(worker));
    assert_eq!(broker.run_pass(20), 0);
    assert!(frames(&mut rx).is_empty());

    // unknown ids are ignored
    let stray = DeliveryAck {
        message_id: "nope".to_string(),
        percent: Some(100),
        ..Default::default()
    };
    assert!(!broker.handle_delivery_ack(worker, &stray, 30));
}

#[test]
fn test_reject_with_retry_delay_requeues() {
    let mut broker = broker();
    let (worker, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["t"]);
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();
    broker.run_pass(100);
    frames(&mut rx);

    let ack = DeliveryAck {
        message_id: "m".to_string(),
        reject_reason: Some("busy".to_string()),
        reject_retry_delay_ms: Some(5_000),
        ..Default::default()
    };
    assert!(broker.handle_delivery_ack(worker, &ack, 2_000));

    assert_eq!(broker.in_flight_owner("m"), None);
    assert_eq!(broker.topic_len("t"), 1);
    let stored = broker.message("m").unwrap();
    assert_eq!(stored.options.delay_ms, 5_000);
    assert_eq!(stored.publish_time, 2_000);

    assert_eq!(broker.run_pass(6_999), 0);
    assert_eq!(broker.run_pass(7_000), 1);
    assert_eq!(delivered_ids(&frames(&mut rx)), vec!["m"]);
}

#[test]
fn test_reject_without_delay_deletes() {
    let mut broker = broker();
    let (worker, _rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["t"]);
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();
    broker.run_pass(0);

    let ack = DeliveryAck {
        message_id: "m".to_string(),
        reject_reason: Some("bad payload".to_string()),
        ..Default::default()
    };
    assert!(broker.handle_delivery_ack(worker, &ack, 1));
    assert_eq!(broker.topic_len("t"), 0);
}

#[test]
fn test_feedback_ack_reaches_publisher() {
    let mut broker = broker();
    let (publisher, mut pub_rx) = connect(&mut broker, "pub", 1, 0);
    let (worker, _rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["t"]);

    let options = MessageOptions {
        message_id: "fb".to_string(),
        qos: Qos::Feedback,
        ..Default::default()
    };
    broker.publish(publisher, "t", json!({}), options, 0).unwrap();
    broker.run_pass(0);
    frames(&mut pub_rx);

    let progress = DeliveryAck {
        message_id: "fb".to_string(),
        percent: Some(40),
        ..Default::default()
    };
    broker.handle_delivery_ack(worker, &progress, 1);
    let done = DeliveryAck {
        message_id: "fb".to_string(),
        resolve_reason: Some("done".to_string()),
        ..Default::default()
    };
    broker.handle_delivery_ack(worker, &done, 2);

    let reports = frames(&mut pub_rx);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0], ServerFrame::report("t", &progress));
    assert_eq!(reports[1].kind(), "deliveryreport");
    assert!(broker.message("fb").is_none());
}

#[test]
fn test_full_session_is_never_selected() {
    let mut broker = broker();
    let (worker, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["a", "b"]);
    broker.add_message(msg("ma", "a", 0, 0), true, 0).unwrap();
    broker.add_message(msg("mb", "b", 0, 0), true, 0).unwrap();

    assert_eq!(broker.run_pass(0), 1);
    assert_eq!(broker.run_pass(1), 0);
    let first = delivered_ids(&frames(&mut rx));
    assert_eq!(first.len(), 1);

    let ack = DeliveryAck {
        message_id: first[0].clone(),
        percent: Some(100),
        ..Default::default()
    };
    broker.handle_delivery_ack(worker, &ack, 2);
    assert_eq!(broker.run_pass(3), 1);
    let second = delivered_ids(&frames(&mut rx));
    assert_ne!(first, second);
}

#[test]
fn test_priority_order_after_debounce() {
    let mut broker = broker();
    let (publisher, _pub_rx) = connect(&mut broker, "pub", 1, 0);
    let (worker, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["a.b"]);

    let low = MessageOptions {
        message_id: "p5".to_string(),
        priority: 5,
        ..Default::default()
    };
    let high = MessageOptions {
        message_id: "p1".to_string(),
        priority: 1,
        ..Default::default()
    };
    broker.publish(publisher, "a.b", json!(5), low, 10_000).unwrap();
    broker.publish(publisher, "a.b", json!(1), high, 10_100).unwrap();

    assert_eq!(broker.run_pass(10_400), 1);
    assert_eq!(delivered_ids(&frames(&mut rx)), vec!["p1"]);
}

#[test]
fn test_disconnect_releases_in_flight() {
    let mut broker = broker();
    let (first, mut first_rx) = connect(&mut broker, "svc", 1, 0);
    broker.subscribe(first, &["t"]);
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();
    broker.run_pass(0);
    assert_eq!(broker.in_flight_owner("m"), Some(first));

    assert!(broker.disconnect(first));
    assert!(!broker.disconnect(first));
    assert_eq!(broker.in_flight_owner("m"), None);
    frames(&mut first_rx);
    assert!(matches!(first_rx.try_recv(), Err(_)));

    let (second, mut second_rx) = connect(&mut broker, "svc", 1, 0);
    broker.subscribe(second, &["t"]);
    assert_eq!(broker.run_pass(1), 1);
    assert_eq!(delivered_ids(&frames(&mut second_rx)), vec!["m"]);
}

#[test]
fn test_no_delivery_without_matching_session() {
    let mut broker = broker();
    let (worker, mut rx) = connect(&mut broker, "worker", 1, 0);
    broker.subscribe(worker, &["other"]);
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();
    assert_eq!(broker.run_pass(0), 0);
    assert!(frames(&mut rx).is_empty());
}

// ----- engine: sessions ----------------------------------------------------

#[test]
fn test_handshake_refused_without_anonymous_access() {
    let settings = BrokerSettings {
        allow_anonymous: false,
        ..Default::default()
    };
    let mut broker = Broker::in_memory(settings);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = broker.open_session(hello("anon", 1), tx, 0).unwrap_err();
    assert_eq!(err, "authentication required");
    match frames(&mut rx).as_slice() {
        [ServerFrame::Welcome { heartbeat_sec, error_message, .. }] => {
            assert_eq!(*heartbeat_sec, 0);
            assert_eq!(error_message.as_deref(), Some("authentication required"));
        }
        other => panic!("unexpected frames {other:?}"),
    }
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn test_handshake_with_token_attaches_record() {
    let settings = BrokerSettings {
        allow_anonymous: false,
        max_workers: 4,
        ..Default::default()
    };
    let mut broker = Broker::in_memory(settings);
    broker
        .install_auth(vec![AuthRecord {
            description: "backend".to_string(),
            token: "s3cret".to_string(),
            publish_to: vec!["orders".to_string()],
            ..Default::default()
        }])
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut h = hello("svc", 50);
    h.auth_token = Some("wrong".to_string());
    assert_eq!(
        broker.open_session(h.clone(), tx.clone(), 0).unwrap_err(),
        "invalid auth token"
    );

    h.auth_token = Some("s3cret".to_string());
    let uid = broker.open_session(h, tx, 0).unwrap();
    let session = broker.session(uid).unwrap();
    assert_eq!(session.auth.as_ref().unwrap().description, "backend");
    assert_eq!(session.max_workers, 4);
}

#[test]
fn test_heartbeat_ping_then_expiry() {
    let mut broker = broker();
    let (uid, mut rx) = connect(&mut broker, "quiet", 1, 0);

    assert!(broker.heartbeat_tick(13_000).is_empty());
    assert!(frames(&mut rx).is_empty());
    assert!(broker.heartbeat_tick(14_000).is_empty());
    assert_eq!(frames(&mut rx), vec![ServerFrame::Heartbeat {}]);

    broker.touch(uid, 20_000);
    assert!(broker.heartbeat_tick(40_000).is_empty());
    assert_eq!(broker.heartbeat_tick(50_001), vec![uid]);
    assert!(broker.session(uid).is_none());

    let mut closed = false;
    while let Ok(item) = rx.try_recv() {
        closed |= item == Outbound::Close;
    }
    assert!(closed);
}

// ----- engine: expiry and storage ------------------------------------------

#[test]
fn test_garbage_collection_removes_expired() {
    let mut broker = broker();
    let mut short = msg("short", "t", 0, 0);
    short.options.expiration_ms = 1_000;
    broker.add_message(short, true, 0).unwrap();
    broker.add_message(msg("forever", "t", 0, 0), true, 0).unwrap();

    let report = broker.collect_garbage(500);
    assert_eq!(report.deleted, 0);
    let report = broker.collect_garbage(1_000);
    assert_eq!(report.deleted, 1);
    assert!(!report.capped);
    assert_eq!(broker.topic_len("t"), 1);
    assert!(broker.message("short").is_none());
}

#[test]
fn test_garbage_collection_caps_batch() {
    let settings = BrokerSettings {
        gc_batch: 2,
        ..Default::default()
    };
    let mut broker = Broker::in_memory(settings);
    for n in 0..3 {
        let mut m = msg(&format!("m{n}"), "t", 0, 0);
        m.options.expiration_ms = 1;
        broker.add_message(m, true, 0).unwrap();
    }
    let report = broker.collect_garbage(10);
    assert_eq!(report.deleted, 2);
    assert!(report.capped);
    assert_eq!(broker.collect_garbage(10).deleted, 1);
}

#[test]
fn test_restore_from_sled() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    {
        let store = SledStore::open(&path).unwrap();
        let mut broker = Broker::new(BrokerSettings::default(), Box::new(store));
        broker.add_message(msg("keep", "t", 2, 0), true, 0).unwrap();
        broker.add_message(msg("first", "t", 1, 0), true, 0).unwrap();
        let mut gone = msg("gone", "t", 0, 0);
        gone.options.expiration_ms = 100;
        broker.add_message(gone, true, 0).unwrap();
        broker.close().unwrap();
    }

    let store = SledStore::open(&path).unwrap();
    let mut broker = Broker::new(BrokerSettings::default(), Box::new(store));
    assert_eq!(broker.restore(5_000).unwrap(), 2);
    let ids: Vec<&str> = broker.topic_messages("t").iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec!["first", "keep"]);
    assert!(broker.message("keep").unwrap().source_unique_id.is_none());
    broker.close().unwrap();
    drop(broker);

    // the expired record was deleted from storage as well
    let store = SledStore::open(&path).unwrap();
    let mut broker = Broker::new(BrokerSettings::default(), Box::new(store));
    assert_eq!(broker.restore(5_000).unwrap(), 2);
}

#[test]
fn test_import_resources_installs_rules_and_auth() {
    let mut broker = broker();
    let docs = vec![
        ResourceDocument::router(&rule("orders audit", "orders", &["audit"], &[])).unwrap(),
        ResourceDocument::auth(&AuthRecord {
            description: "svc".to_string(),
            token: "tok".to_string(),
            ..Default::default()
        })
        .unwrap(),
    ];
    assert_eq!(broker.import_resources(&docs).unwrap(), 2);
    assert_eq!(broker.routing().rules().len(), 1);

    broker.add_message(msg("o", "orders", 0, 0), true, 0).unwrap();
    assert_eq!(broker.topic_len("audit"), 1);

    let summaries = broker.topic_summaries(0);
    let topics: Vec<&str> = summaries.iter().map(|s| s.topic.as_str()).collect();
    assert_eq!(topics, vec!["audit", "orders"]);
}

#[test]
fn test_long_id_survives_routing_copies() {
    let mut broker = broker();
    broker.install_rules(vec![rule("fan", "x", &["y"], &[])]).unwrap();
    let long = "a".repeat(MAX_MESSAGE_ID_LEN);
    let id = broker.add_message(msg(&long, "x", 0, 0), true, 0).unwrap();
    assert_eq!(id, long);
    assert_eq!(broker.topic_len("x"), 1);
    assert_eq!(broker.topic_len("y"), 1);
    assert!(broker.topic_messages("y")[0].id().ends_with("-1"));
}

/// Memory storage whose writes can be switched to fail.
struct FlakyStore {
    inner: MemoryStore,
    fail: Arc<AtomicBool>,
}

impl Storage for FlakyStore {
    fn load_all(&mut self, progress: &mut dyn FnMut(LoadProgress)) -> Result<Vec<Message>> {
        self.inner.load_all(progress)
    }

    fn upsert(&mut self, id: &str, message: &Message) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.upsert(id, message)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.inner.delete(id)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl ResourceStore for FlakyStore {
    fn list_resources(&self, kind: &str) -> Result<Vec<(String, String)>> {
        self.inner.list_resources(kind)
    }

    fn upsert_resource(&mut self, kind: &str, id: &str, json: &str) -> Result<()> {
        self.inner.upsert_resource(kind, id, json)
    }

    fn delete_resource(&mut self, kind: &str, id: &str) -> Result<()> {
        self.inner.delete_resource(kind, id)
    }
}

#[test]
fn test_failed_write_keeps_previous_record() {
    let fail = Arc::new(AtomicBool::new(false));
    let store = FlakyStore {
        inner: MemoryStore::new(),
        fail: fail.clone(),
    };
    let mut broker = Broker::new(BrokerSettings::default(), Box::new(store));
    broker.add_message(msg("m", "t", 0, 0), true, 0).unwrap();

    fail.store(true, Ordering::SeqCst);
    let err = broker.add_message(msg("m", "t", 5, 10), true, 10).unwrap_err();
    assert!(matches!(err, BrokerError::Io(_)));
    assert_eq!(broker.topic_len("t"), 1);
    assert_eq!(broker.message("m").unwrap().priority(), 0);
}

// ----- scheduler -----------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_capped_sweep_switches_to_boost_interval() {
    let settings = BrokerSettings {
        gc_batch: 1,
        ..Default::default()
    };
    let mut inner = Broker::in_memory(settings);
    for n in 0..3 {
        let mut m = msg(&format!("m{n}"), "t", 0, 0);
        m.options.expiration_ms = 1;
        inner.add_message(m, true, 0).unwrap();
    }
    let broker = Arc::new(Mutex::new(inner));
    tokio::spawn(run_garbage_loop(
        broker.clone(),
        Duration::from_secs(60),
        Duration::from_secs(1),
    ));

    tokio::time::sleep(Duration::from_millis(59_500)).await;
    assert_eq!(lock(&broker).message_count(), 3);

    // first sweep at 60s is capped
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(lock(&broker).message_count(), 2);

    // the next one follows at the boost interval, not a minute later
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(lock(&broker).message_count(), 1);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(lock(&broker).message_count(), 0);

    // an empty sweep is not capped: back to the normal interval
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let mut m = msg("late", "t", 0, 0);
    m.options.expiration_ms = 1;
    lock(&broker).add_message(m, true, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(30_000)).await;
    assert_eq!(lock(&broker).message_count(), 1);
    tokio::time::sleep(Duration::from_millis(30_000)).await;
    assert_eq!(lock(&broker).message_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loop_pings_and_drops_sessions() {
    let mut inner = broker();
    let now = now_millis();
    let (stale, mut stale_rx) = connect(&mut inner, "stale", 1, now - 60_000);
    let (fresh, mut fresh_rx) = connect(&mut inner, "fresh", 1, now - 20_000);
    let broker = Arc::new(Mutex::new(inner));
    tokio::spawn(run_heartbeat_loop(broker.clone(), Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    {
        let broker = lock(&broker);
        assert!(broker.session(stale).is_none());
        assert!(broker.session(fresh).is_some());
    }
    assert!(matches!(stale_rx.try_recv(), Ok(Outbound::Close)));
    assert_eq!(frames(&mut fresh_rx), vec![ServerFrame::Heartbeat {}]);
}
