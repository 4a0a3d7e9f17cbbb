//! Delivery behaviour of a single-member container

use ferry_queue::prelude::*;
use ferry_queue::RestartConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

fn standalone() -> (InMemoryGrid, Arc<dyn DataGrid>) {
    let grid = InMemoryGrid::standalone(16).unwrap();
    let member: Arc<dyn DataGrid> = Arc::new(grid.member("local").unwrap());
    (grid, member)
}

async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn wait_for_empty(member: &Arc<dyn DataGrid>, destination: &str) -> bool {
    let store = member.store(destination).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if store.len().await.unwrap() == 0 {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_record_delivered_once_and_removed() {
    init_tracing();
    let (_grid, member) = standalone();

    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let seen = seen.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        consumer_fn(move |record: Record| {
            let seen = seen.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                *seen.lock().unwrap().entry(record.correlation_id).or_default() += 1;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    assert!(container
        .register(Registration::new("orders", consumer).parallelism(4).exclusive(true))
        .await
        .unwrap());
    container.start().await.unwrap();
    assert_eq!(container.status("orders"), Some(DestinationStatus::Running));

    let publisher = Publisher::new(member.clone());
    for i in 0..100 {
        publisher
            .offer(Record::text("orders", format!("m{i}")).with_correlation_id(format!("c{i}")))
            .await
            .unwrap();
    }

    assert!(eventually(Duration::from_secs(10), || seen.lock().unwrap().len() == 100).await);
    assert!(wait_for_empty(&member, "orders").await);

    let seen = seen.lock().unwrap().clone();
    assert!(seen.values().all(|count| *count == 1), "duplicates: {seen:?}");
    assert!(peak.load(Ordering::SeqCst) <= 4);

    let stats = container.stats("orders").unwrap();
    assert_eq!(stats.delivered, 100);
    assert_eq!(stats.committed, 100);
    assert_eq!(stats.failed, 0);

    assert!(container.stop(Duration::from_secs(5)).await);
    assert_eq!(container.status("orders"), Some(DestinationStatus::Registered));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_then_drop() {
    init_tracing();
    let (_grid, member) = standalone();

    let attempts: Arc<Mutex<Vec<u16>>> = Arc::default();
    let consumer = {
        let attempts = attempts.clone();
        consumer_fn(move |record: Record| {
            let attempts = attempts.clone();
            async move {
                attempts.lock().unwrap().push(record.redelivery_count);
                Err(ConsumeError::processing("always fails"))
            }
        })
    };

    let decisions = Arc::new(AtomicUsize::new(0));
    let policy = {
        let decisions = decisions.clone();
        policy_fn(move |_, _| decisions.fetch_add(1, Ordering::SeqCst) < 2)
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).dead_letter(policy))
        .await
        .unwrap();
    container.start().await.unwrap();

    let publisher = Publisher::new(member.clone());
    publisher.offer(Record::text("orders", "poison")).await.unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(decisions.load(Ordering::SeqCst), 3);

    let stats = container.stats("orders").unwrap();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.dropped, 1);

    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_redeliveries_with_backoff() {
    init_tracing();
    let (_grid, member) = standalone();

    let attempts = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let attempts = attempts.clone();
        consumer_fn(move |record: Record| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if record.redelivered {
                    Ok(())
                } else {
                    Err(ConsumeError::processing("first attempt fails"))
                }
            }
        })
    };

    let config = ContainerConfig::builder()
        .retry_backoff(RetryBackoff::fixed(Duration::from_millis(50)))
        .build()
        .unwrap();
    let container = QueueContainer::new(member.clone(), config)
        .unwrap()
        .with_dead_letter(MaxRedeliveries::new(3));
    container
        .register(Registration::new("orders", consumer).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    let started = Instant::now();
    Publisher::new(member.clone())
        .offer(Record::text("orders", "x"))
        .await
        .unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_policy_drops_failed_record() {
    init_tracing();
    let (_grid, member) = standalone();

    let attempts = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let attempts = attempts.clone();
        consumer_fn(move |_record: Record| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ConsumeError::processing("nope"))
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).remove_immediate(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    Publisher::new(member.clone())
        .offer(Record::text("orders", "x"))
        .await
        .unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(container.stats("orders").unwrap().dropped, 1);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registration_is_idempotent() {
    init_tracing();
    let (_grid, member) = standalone();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counting = |deliveries: Arc<AtomicUsize>| {
        consumer_fn(move |_record: Record| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    assert!(container
        .register(Registration::new("orders", counting(deliveries.clone())))
        .await
        .unwrap());
    assert!(!container
        .register(Registration::new("orders", counting(deliveries.clone())).parallelism(8))
        .await
        .unwrap());
    container.start().await.unwrap();
    container.start().await.unwrap();

    let publisher = Publisher::new(member.clone());
    for i in 0..20 {
        publisher.offer(Record::text("orders", format!("{i}"))).await.unwrap();
    }

    assert!(wait_for_empty(&member, "orders").await);
    sleep(Duration::from_millis(50)).await;
    // a second supervisor would double every delivery
    assert_eq!(deliveries.load(Ordering::SeqCst), 20);
    assert!(!container
        .register(Registration::new("orders", counting(deliveries.clone())))
        .await
        .unwrap());
    assert_eq!(container.destinations(), vec!["orders".to_string()]);

    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_register_after_start_launches_immediately() {
    init_tracing();
    let (_grid, member) = standalone();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let deliveries = deliveries.clone();
        consumer_fn(move |_record: Record| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container.start().await.unwrap();
    assert!(container.is_running());
    assert!(container
        .register(Registration::new("late", consumer))
        .await
        .unwrap());
    assert_eq!(container.status("late"), Some(DestinationStatus::Running));

    Publisher::new(member.clone())
        .offer(Record::text("late", "x"))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || deliveries.load(Ordering::SeqCst) == 1).await);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backlog_replayed_on_start() {
    init_tracing();
    let (_grid, member) = standalone();

    let publisher = Publisher::new(member.clone());
    for i in 0..10 {
        publisher.offer(Record::text("orders", format!("{i}"))).await.unwrap();
    }

    let deliveries = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let deliveries = deliveries.clone();
        consumer_fn(move |_record: Record| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).parallelism(2).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    assert_eq!(deliveries.load(Ordering::SeqCst), 10);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_consumer_restarts_worker() {
    init_tracing();
    let (_grid, member) = standalone();

    let delivered: Arc<Mutex<Vec<String>>> = Arc::default();
    let consumer = {
        let delivered = delivered.clone();
        consumer_fn(move |record: Record| {
            let delivered = delivered.clone();
            async move {
                let text = record.payload.as_text().unwrap_or_default().to_string();
                if text == "boom" {
                    panic!("consumer bug");
                }
                delivered.lock().unwrap().push(text);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    let publisher = Publisher::new(member.clone());
    publisher.offer(Record::text("orders", "before")).await.unwrap();
    publisher.offer(Record::text("orders", "boom")).await.unwrap();
    publisher.offer(Record::text("orders", "after")).await.unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    assert!(eventually(Duration::from_secs(5), || delivered.lock().unwrap().len() == 2).await);

    let stats = container.stats("orders").unwrap();
    assert_eq!(stats.worker_restarts, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(container.status("orders"), Some(DestinationStatus::Running));
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_record_is_not_delivered() {
    init_tracing();
    let (_grid, member) = standalone();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let deliveries = deliveries.clone();
        consumer_fn(move |_record: Record| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    let mut stale = Record::text("orders", "stale").with_expiry(Duration::from_millis(10));
    stale.timestamp -= chrono::Duration::seconds(5);
    let publisher = Publisher::new(member.clone());
    publisher.offer(stale).await.unwrap();
    publisher.offer(Record::text("orders", "fresh")).await.unwrap();

    assert!(wait_for_empty(&member, "orders").await);
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(container.stats("orders").unwrap().expired, 1);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_reports_forced_shutdown_and_restart_redelivers() {
    init_tracing();
    let (_grid, member) = standalone();

    let started = Arc::new(AtomicBool::new(false));
    let block = Arc::new(AtomicBool::new(true));
    let finished = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let started = started.clone();
        let block = block.clone();
        let finished = finished.clone();
        consumer_fn(move |_record: Record| {
            let started = started.clone();
            let block = block.clone();
            let finished = finished.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                if block.load(Ordering::SeqCst) {
                    sleep(Duration::from_secs(30)).await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    Publisher::new(member.clone())
        .offer(Record::text("orders", "slow"))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst)).await);

    assert!(!container.stop(Duration::from_millis(100)).await);
    assert!(!container.is_running());
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // the aborted claim was released, so a restart delivers the record again
    block.store(false, Ordering::SeqCst);
    container.start().await.unwrap();
    assert!(wait_for_empty(&member, "orders").await);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_stop_without_start() {
    let (_grid, member) = standalone();
    let container = QueueContainer::new(member, ContainerConfig::default()).unwrap();
    assert!(container.stop(Duration::from_millis(10)).await);
    assert!(container.stop_default().await);
}

#[tokio::test]
async fn test_start_fails_when_grid_is_down() {
    let (grid, member) = standalone();
    let container = QueueContainer::new(member, ContainerConfig::default()).unwrap();
    container
        .register(Registration::new(
            "orders",
            consumer_fn(|_record: Record| async { Ok(()) }),
        ))
        .await
        .unwrap();

    grid.shutdown();
    let err = container.start().await.unwrap_err();
    assert!(err.is_store_unavailable());
    assert!(!container.is_running());
    assert_eq!(container.status("orders"), Some(DestinationStatus::Registered));
}

struct FailingInit;

#[async_trait::async_trait]
impl Consumer for FailingInit {
    async fn init(&self) -> Result<()> {
        Err(Error::Other("missing credentials".into()))
    }

    async fn on_message(&self, _record: &Record) -> std::result::Result<(), ConsumeError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_start_fails_when_consumer_init_fails() {
    let (_grid, member) = standalone();
    let container = QueueContainer::new(member, ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", FailingInit))
        .await
        .unwrap();

    let err = container.start().await.unwrap_err();
    assert!(matches!(err, Error::Other(ref m) if m == "missing credentials"));
    assert!(!container.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_loss_stops_destination_until_reregistered() {
    init_tracing();
    let (grid, member) = standalone();

    let consumer = {
        let grid = grid.clone();
        consumer_fn(move |_record: Record| {
            let grid = grid.clone();
            async move {
                grid.shutdown();
                Err(ConsumeError::Store(Error::StoreUnavailable(
                    "lost connection".into(),
                )))
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default()).unwrap();
    container
        .register(Registration::new("orders", consumer))
        .await
        .unwrap();
    container.start().await.unwrap();

    Publisher::new(member.clone())
        .offer(Record::text("orders", "x"))
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            container.status("orders") == Some(DestinationStatus::Stopped)
        })
        .await
    );
    // the container itself keeps running
    assert!(container.is_running());

    grid.recover();
    let received: Arc<Mutex<Vec<String>>> = Arc::default();
    let healthy = {
        let received = received.clone();
        consumer_fn(move |record: Record| {
            let received = received.clone();
            async move {
                received
                    .lock()
                    .unwrap()
                    .push(record.payload.as_text().unwrap_or_default().to_string());
                Ok(())
            }
        })
    };
    assert!(container
        .register(Registration::new("orders", healthy))
        .await
        .unwrap());
    assert_eq!(container.status("orders"), Some(DestinationStatus::Running));

    Publisher::new(member.clone())
        .offer(Record::text("orders", "after"))
        .await
        .unwrap();
    assert!(wait_for_empty(&member, "orders").await);
    assert!(received.lock().unwrap().contains(&"after".to_string()));
    assert!(container.stop(Duration::from_secs(5)).await);
}

fn tight_restarts(max_restarts: u32) -> ContainerConfig {
    ContainerConfig::builder()
        .exclusive(true)
        .restart(RestartConfig {
            max_restarts,
            within: Duration::from_secs(60),
        })
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_worker_restarts_restart_supervisor() {
    init_tracing();
    let (_grid, member) = standalone();

    let attempts = Arc::new(AtomicUsize::new(0));
    let delivered: Arc<Mutex<Vec<String>>> = Arc::default();
    let consumer = {
        let attempts = attempts.clone();
        let delivered = delivered.clone();
        consumer_fn(move |record: Record| {
            let attempts = attempts.clone();
            let delivered = delivered.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let text = record.payload.as_text().unwrap_or_default().to_string();
                if text.starts_with("boom") {
                    panic!("consumer bug");
                }
                delivered.lock().unwrap().push(text);
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), tight_restarts(1)).unwrap();
    container
        .register(Registration::new("orders", consumer))
        .await
        .unwrap();
    container.start().await.unwrap();

    let publisher = Publisher::new(member.clone());
    publisher.offer(Record::text("orders", "boom-1")).await.unwrap();
    publisher.offer(Record::text("orders", "boom-2")).await.unwrap();
    // the second panic exceeds the worker budget and restarts the supervisor
    assert!(eventually(Duration::from_secs(5), || attempts.load(Ordering::SeqCst) == 2).await);

    publisher.offer(Record::text("orders", "ok")).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || delivered.lock().unwrap().len() == 1).await);
    assert_eq!(*delivered.lock().unwrap(), vec!["ok".to_string()]);
    assert!(wait_for_empty(&member, "orders").await);

    assert_eq!(container.status("orders"), Some(DestinationStatus::Running));
    let stats = container.stats("orders").unwrap();
    assert_eq!(stats.worker_restarts, 1);
    assert_eq!(stats.dropped, 2);

    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_supervisor_restarts_stop_destination() {
    init_tracing();
    let (_grid, member) = standalone();

    let consumer = consumer_fn(|_record: Record| async move {
        if true {
            panic!("consumer bug");
        }
        Ok(())
    });

    let container = QueueContainer::new(member.clone(), tight_restarts(1)).unwrap();
    container
        .register(Registration::new("orders", consumer))
        .await
        .unwrap();
    container.start().await.unwrap();

    let publisher = Publisher::new(member.clone());
    for i in 0..4 {
        publisher.offer(Record::text("orders", format!("{i}"))).await.unwrap();
    }

    assert!(
        eventually(Duration::from_secs(5), || {
            container.status("orders") == Some(DestinationStatus::Stopped)
        })
        .await
    );
    assert!(container.is_running());
    assert!(container.stop(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivery_count_is_stored_with_claimed_record() {
    init_tracing();
    let (_grid, member) = standalone();
    let store = member.store("orders").await.unwrap();

    let stored_counts: Arc<Mutex<Vec<u16>>> = Arc::default();
    let consumer = {
        let store = store.clone();
        let stored_counts = stored_counts.clone();
        consumer_fn(move |record: Record| {
            let store = store.clone();
            let stored_counts = stored_counts.clone();
            async move {
                let key = RecordKey::new(1);
                let stored = match store.get(key).await {
                    Ok(stored) => stored.map(|r| r.redelivery_count),
                    Err(err) => return Err(ConsumeError::Store(err)),
                };
                stored_counts.lock().unwrap().extend(stored);
                if record.redelivery_count < 2 {
                    return Err(ConsumeError::processing("not yet"));
                }
                Ok(())
            }
        })
    };

    let container = QueueContainer::new(member.clone(), ContainerConfig::default())
        .unwrap()
        .with_dead_letter(MaxRedeliveries::new(5));
    container
        .register(Registration::new("orders", consumer).exclusive(true))
        .await
        .unwrap();
    container.start().await.unwrap();

    let key = Publisher::new(member.clone())
        .offer(Record::text("orders", "x"))
        .await
        .unwrap();
    assert_eq!(key, RecordKey::new(1));

    assert!(wait_for_empty(&member, "orders").await);
    assert_eq!(*stored_counts.lock().unwrap(), vec![0, 1, 2]);
    assert!(container.stop(Duration::from_secs(5)).await);
}
