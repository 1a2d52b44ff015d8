mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use tokio::sync::Notify;

use common::{Flaky, Job, eventually, fast_config, is_drained};
use spool_core::{
    BrokerBuilder, EnqueueOptions, Envelope, Handler, HandlerError, InMemoryBroker, Message, QueueName,
    RawEnvelope, RetryPolicy,
};

fn start(memory: &InMemoryBroker, config: spool_core::BrokerConfig, handler: impl Handler<Job> + 'static) -> spool_core::Broker {
    let mut broker = BrokerBuilder::new(config)
        .connector(Arc::new(memory.connector()))
        .register::<Job, _>(handler)
        .unwrap()
        .build()
        .unwrap();
    broker.open().unwrap();
    broker
}

async fn all_drained(memory: &InMemoryBroker) -> bool {
    is_drained(memory, &Job::QUEUE).await && is_drained(memory, &QueueName::DELAY).await
}

#[tokio::test]
async fn succeeds_on_fifth_attempt_within_budget() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::new(4);
    let broker = start(&memory, fast_config(), handler.clone());

    broker
        .enqueue(Job { id: 1 }, EnqueueOptions::default().max_attempts(5))
        .await
        .unwrap();

    eventually("five invocations", || async { handler.count() == 5 }).await;
    eventually("queues drained", || all_drained(&memory)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.attempts(), vec![1, 2, 3, 4, 5]);
    assert!(all_drained(&memory).await);
    broker.close().await;
}

#[tokio::test]
async fn invocations_never_exceed_max_attempts() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::always();
    let broker = start(&memory, fast_config(), handler.clone());

    broker
        .enqueue(Job { id: 1 }, EnqueueOptions::default().max_attempts(3))
        .await
        .unwrap();

    eventually("three invocations", || async { handler.count() == 3 }).await;
    eventually("queues drained", || all_drained(&memory)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.attempts(), vec![1, 2, 3]);
    broker.close().await;
}

#[tokio::test]
async fn unlimited_budget_retries_until_success() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::new(20);
    let broker = start(&memory, fast_config(), handler.clone());

    broker.enqueue(Job { id: 7 }, EnqueueOptions::default()).await.unwrap();

    eventually("success after 20 failures", || async { handler.count() == 21 }).await;
    eventually("queues drained", || all_drained(&memory)).await;

    assert_eq!(handler.attempts(), (1..=21).collect::<Vec<u32>>());
    broker.close().await;
}

#[tokio::test]
async fn no_invocation_after_max_time() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::always();
    let mut config = fast_config();
    // attempt 2 => +200ms, attempt 3 => +400ms (past the 300ms horizon)
    config.retry = RetryPolicy::new(2.0, Duration::from_millis(50), Duration::from_secs(5));
    let broker = start(&memory, config, handler.clone());

    let max_time = Duration::from_millis(300);
    broker
        .enqueue(Job { id: 1 }, EnqueueOptions::default().max_time(max_time))
        .await
        .unwrap();

    eventually("first invocation", || async { handler.count() >= 1 }).await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    eventually("queues drained", || all_drained(&memory)).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 2);
    let deadline = calls[0].at + TimeDelta::from_std(max_time).unwrap();
    assert!(calls.iter().all(|call| call.at <= deadline));
    broker.close().await;
}

#[tokio::test]
async fn pending_retry_keeps_its_schedule_through_the_delay_queue() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::new(1);
    let mut config = fast_config();
    let retry = RetryPolicy::new(2.0, Duration::from_secs(1), Duration::from_secs(60));
    config.retry = retry.clone();
    let broker = start(&memory, config, handler.clone());

    broker.enqueue(Job { id: 3 }, EnqueueOptions::default()).await.unwrap();

    // 1 回目が失敗し、delay scheduler が unacked のまま保持している
    eventually("message held by the delay scheduler", || async {
        memory.unacked_count(&QueueName::DELAY).await == 1
    })
    .await;
    assert_eq!(memory.ready_count(&Job::QUEUE).await, 0);

    broker.close().await;

    // close で requeue された bytes は scheduler を通る前と同じ
    let held = memory.ready_messages(&QueueName::DELAY).await;
    assert_eq!(held.len(), 1);
    let envelope = RawEnvelope::from_slice(&held[0]).unwrap();
    assert_eq!(envelope.attempt(), 2);
    assert_eq!(envelope.next_attempt(), retry.next_attempt(envelope.first_seen(), 2));
    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn permanent_failure_is_dropped_without_retry() {
    struct Reject(Arc<Mutex<u32>>);

    #[async_trait]
    impl Handler<Job> for Reject {
        async fn handle(&self, _envelope: &Envelope<Job>) -> Result<(), HandlerError> {
            *self.0.lock().unwrap() += 1;
            Err(HandlerError::permanent("not recoverable"))
        }
    }

    let memory = InMemoryBroker::new();
    let calls = Arc::new(Mutex::new(0));
    let broker = start(&memory, fast_config(), Reject(Arc::clone(&calls)));

    broker
        .enqueue(Job { id: 1 }, EnqueueOptions::default().max_attempts(5))
        .await
        .unwrap();

    eventually("one invocation", || async { *calls.lock().unwrap() == 1 }).await;
    eventually("queues drained", || all_drained(&memory)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*calls.lock().unwrap(), 1);
    broker.close().await;
}

/// Blocks the first invocation until released, records completions.
struct Gated {
    blocked: AtomicBool,
    started: Arc<Notify>,
    release: Arc<Notify>,
    completed: Arc<Mutex<HashMap<u32, u32>>>,
}

#[async_trait]
impl Handler<Job> for Gated {
    async fn handle(&self, envelope: &Envelope<Job>) -> Result<(), HandlerError> {
        if !self.blocked.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        *self.completed.lock().unwrap().entry(envelope.message().id).or_default() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn in_flight_delivery_is_redone_after_connection_drop() {
    let memory = InMemoryBroker::new();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let completed = Arc::new(Mutex::new(HashMap::new()));
    let handler = Gated {
        blocked: AtomicBool::new(false),
        started: Arc::clone(&started),
        release: Arc::clone(&release),
        completed: Arc::clone(&completed),
    };

    let mut config = fast_config();
    config.run_delay_queue = false;
    config.consumer_prefetch = 3;
    let broker = start(&memory, config, handler);
    for id in 0..3 {
        broker.enqueue(Job { id }, EnqueueOptions::default()).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .unwrap();
    memory.drop_connections().await;
    release.notify_one();

    eventually("every message completed after reconnect", || async {
        let completed = completed.lock().unwrap();
        (0..3).all(|id| completed.contains_key(&id)) && completed.values().sum::<u32>() >= 4
    })
    .await;
    eventually("queue drained", || async { is_drained(&memory, &Job::QUEUE).await }).await;

    let completed = completed.lock().unwrap().clone();
    // 最初の 1 件は ack 前に接続が落ちたので、もう一度処理される
    let redone: Vec<u32> = completed.iter().filter(|(_, n)| **n == 2).map(|(id, _)| *id).collect();
    assert_eq!(redone.len(), 1);
    assert!(memory.connections_opened().await >= 3);
    broker.close().await;
}

#[tokio::test]
async fn connection_drop_redelivers_every_held_delivery() {
    let memory = InMemoryBroker::new();
    // ids 0..3 の attempt 1 だけが失敗する
    let handler = Flaky::new(3);
    let mut config = fast_config();
    // attempt 2 => FirstSeen + 1s
    config.retry = RetryPolicy::new(2.0, Duration::from_millis(250), Duration::from_secs(60));
    let broker = start(&memory, config, handler.clone());

    for id in 0..3 {
        broker.enqueue(Job { id }, EnqueueOptions::default()).await.unwrap();
    }

    eventually("three retries held unacked", || async {
        memory.unacked_count(&QueueName::DELAY).await == 3
    })
    .await;
    assert_eq!(handler.count(), 3);
    assert_eq!(memory.ready_count(&Job::QUEUE).await, 0);

    memory.drop_connections().await;

    eventually("every job retried once", || async { handler.count() == 6 }).await;
    eventually("queues drained", || all_drained(&memory)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut attempts: HashMap<u32, Vec<u32>> = HashMap::new();
    for call in handler.calls() {
        attempts.entry(call.id).or_default().push(call.attempt);
    }
    assert_eq!(attempts.len(), 3);
    assert!(attempts.values().all(|seen| seen == &vec![1, 2]));
    assert!(memory.connections_opened().await >= 4);
    broker.close().await;
}

#[tokio::test]
async fn concurrent_producers_all_delivered() {
    let memory = InMemoryBroker::new();
    let handler = Flaky::new(0);
    let broker = start(&memory, fast_config(), handler.clone());

    let mut joins = Vec::new();
    for side in 0..2u32 {
        let producer = broker.producer().clone();
        joins.push(tokio::spawn(async move {
            for i in 0..50 {
                producer
                    .enqueue(Job { id: side * 1000 + i }, EnqueueOptions::default())
                    .await
                    .unwrap();
            }
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    eventually("100 deliveries", || async { handler.count() == 100 }).await;
    let mut ids: Vec<u32> = handler.calls().iter().map(|c| c.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 100);
    broker.close().await;
}
