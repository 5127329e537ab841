//! Integration tests for event routing and dispatch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use subwire_proto::{ClientId, EventName, SubscriptionEvent};
use subwire_router::{
    ChannelDispatchQueue, DispatchError, DispatchItem, DispatchQueue, DrainPolicy, EventRouter,
    EventSink, RouterError,
};

// ==================== Helper Types ====================

/// Queue that records every item it is handed.
#[derive(Debug, Default)]
struct RecordingQueue {
    items: Mutex<Vec<DispatchItem>>,
    closed: Mutex<bool>,
}

impl RecordingQueue {
    fn targets(&self) -> Vec<ClientId> {
        self.items.lock().iter().map(|item| item.client_id).collect()
    }
}

impl DispatchQueue for RecordingQueue {
    fn enqueue(&self, item: DispatchItem) -> Result<(), DispatchError> {
        if *self.closed.lock() {
            return Err(DispatchError::Closed);
        }
        self.items.lock().push(item);
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }

    fn stop_accepting(&self) {
        *self.closed.lock() = true;
    }

    fn dispose(&self) -> usize {
        0
    }
}

#[derive(Debug, Default)]
struct CollectingSink {
    delivered: Mutex<Vec<(ClientId, EventName)>>,
}

impl EventSink for CollectingSink {
    fn deliver(&self, item: DispatchItem) {
        self.delivered.lock().push((item.client_id, item.event.name.clone()));
    }
}

// ==================== Helper Functions ====================

fn make_router() -> (EventRouter, Arc<RecordingQueue>) {
    let queue = Arc::new(RecordingQueue::default());
    (EventRouter::new(queue.clone()), queue)
}

fn name(route: &str) -> EventName {
    EventName::new("widgets", route)
}

fn event(route: &str) -> SubscriptionEvent {
    SubscriptionEvent::new(name(route), json!({ "route": route }))
}

// ==================== Publish Tests ====================

#[test]
fn test_publish_with_no_subscribers_is_noop() {
    let (router, queue) = make_router();

    assert_eq!(router.publish(event("onWidgetChanged")), Ok(0));
    assert!(queue.targets().is_empty());
}

#[test]
fn test_publish_reaches_only_subscribers() {
    let (router, queue) = make_router();
    let a = ClientId::new();
    let b = ClientId::new();
    router.subscribe(a, name("onWidgetChanged"));
    router.subscribe(b, name("onWidgetDeleted"));

    assert_eq!(router.publish(event("onWidgetChanged")), Ok(1));

    assert_eq!(queue.targets(), vec![a]);
}

#[test]
fn test_publish_matches_case_insensitively() {
    let (router, queue) = make_router();
    let client = ClientId::new();
    router.subscribe(client, EventName::new("Widgets", "onWidgetChanged"));

    let published = SubscriptionEvent::new(EventName::new("widgets", "ONWIDGETCHANGED"), json!(1));
    assert_eq!(router.publish(published), Ok(1));
    assert_eq!(queue.targets(), vec![client]);
}

#[test]
fn test_publish_shares_one_event_allocation() {
    let (router, queue) = make_router();
    for _ in 0..3 {
        router.subscribe(ClientId::new(), name("e"));
    }

    router.publish(event("e")).unwrap();

    let items = queue.items.lock();
    assert_eq!(items.len(), 3);
    assert!(Arc::ptr_eq(&items[0].event, &items[1].event));
    assert!(Arc::ptr_eq(&items[1].event, &items[2].event));
}

#[test]
fn test_publish_counts_only_accepted_items() {
    let (router, queue) = make_router();
    router.subscribe(ClientId::new(), name("e"));
    queue.stop_accepting();

    assert_eq!(router.publish(event("e")), Ok(0));
}

// ==================== Unsubscribe Tests ====================

#[test]
fn test_unsubscribe_all_clears_every_bucket() {
    let (router, _) = make_router();
    let client = ClientId::new();
    let other = ClientId::new();
    router.subscribe(client, name("a"));
    router.subscribe(client, name("b"));
    router.subscribe(other, name("b"));

    assert_eq!(router.unsubscribe_all(client), 2);

    assert!(!router.has_bucket(&name("a")));
    assert_eq!(router.subscriber_count(&name("b")), 1);
    assert_eq!(router.event_names(), vec![name("b")]);
}

#[test]
fn test_unsubscribe_all_unknown_client_is_noop() {
    let (router, _) = make_router();
    router.subscribe(ClientId::new(), name("a"));

    assert_eq!(router.unsubscribe_all(ClientId::new()), 0);
    assert!(router.has_bucket(&name("a")));
}

#[test]
fn test_unsubscribed_client_stops_receiving() {
    let (router, queue) = make_router();
    let client = ClientId::new();
    router.subscribe(client, name("a"));
    router.unsubscribe(client, &name("a"));

    assert_eq!(router.publish(event("a")), Ok(0));
    assert!(queue.targets().is_empty());
}

// ==================== Concurrency Tests ====================

#[test]
fn test_concurrent_subscribe_and_publish() {
    let (router, queue) = make_router();
    let router = Arc::new(router);
    let clients: Vec<_> = (0..16).map(|_| ClientId::new()).collect();

    let subscribers: Vec<_> = clients
        .iter()
        .map(|client| {
            let router = Arc::clone(&router);
            let client = *client;
            std::thread::spawn(move || {
                router.subscribe(client, name("e"));
            })
        })
        .collect();
    let publishers: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&router);
            std::thread::spawn(move || router.publish(event("e")).unwrap())
        })
        .collect();

    for t in subscribers {
        t.join().unwrap();
    }
    let published: usize = publishers.into_iter().map(|t| t.join().unwrap()).sum();

    assert_eq!(router.subscriber_count(&name("e")), 16);
    assert_eq!(queue.targets().len(), published);
}

// ==================== Shutdown Tests ====================

#[tokio::test]
async fn test_shutdown_delivers_queued_events_then_rejects() {
    let sink = Arc::new(CollectingSink::default());
    let queue = Arc::new(ChannelDispatchQueue::spawn(sink.clone()));
    let router = EventRouter::new(queue.clone());
    let a = ClientId::new();
    let b = ClientId::new();
    router.subscribe(a, name("e"));
    router.subscribe(b, name("e"));

    assert_eq!(router.publish(event("e")), Ok(2));
    let report = router
        .shutdown(DrainPolicy::new(Duration::from_millis(5), Duration::from_secs(2)))
        .await;

    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(sink.delivered.lock().len(), 2);
    assert_eq!(router.publish(event("e")), Err(RouterError::ShutDown));
    assert!(!queue.is_accepting());
}

// ==================== Property Tests ====================

#[derive(Debug, Clone)]
enum Op {
    Subscribe(usize, usize),
    Unsubscribe(usize, usize),
    UnsubscribeAll(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4, 0usize..4).prop_map(|(c, e)| Op::Subscribe(c, e)),
        (0usize..4, 0usize..4).prop_map(|(c, e)| Op::Unsubscribe(c, e)),
        (0usize..4).prop_map(Op::UnsubscribeAll),
    ]
}

proptest! {
    #[test]
    fn prop_no_empty_bucket_survives(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let (router, _) = make_router();
        let clients: Vec<_> = (0..4).map(|_| ClientId::new()).collect();
        let names: Vec<_> = (0..4).map(|i| name(&format!("event{i}"))).collect();

        for op in ops {
            match op {
                Op::Subscribe(c, e) => {
                    router.subscribe(clients[c], names[e].clone());
                }
                Op::Unsubscribe(c, e) => {
                    router.unsubscribe(clients[c], &names[e]);
                }
                Op::UnsubscribeAll(c) => {
                    router.unsubscribe_all(clients[c]);
                }
            }

            for existing in router.event_names() {
                prop_assert!(router.subscriber_count(&existing) > 0);
            }
        }
    }

    #[test]
    fn prop_publish_targets_exactly_the_bucket(subscribed in prop::collection::vec(any::<bool>(), 1..10)) {
        let (router, queue) = make_router();
        let mut expected = Vec::new();
        for wants in &subscribed {
            let client = ClientId::new();
            if *wants {
                router.subscribe(client, name("e"));
                expected.push(client);
            } else {
                router.subscribe(client, name("other"));
            }
        }

        let count = router.publish(event("e")).unwrap();

        let mut targets = queue.targets();
        targets.sort();
        expected.sort();
        prop_assert_eq!(count, expected.len());
        prop_assert_eq!(targets, expected);
    }
}
