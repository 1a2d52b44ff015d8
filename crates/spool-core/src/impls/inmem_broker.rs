//! InMemoryBroker - 開発・テスト用の broker
//!
//! Behaves like a single RabbitMQ node for the parts the substrate relies on:
//! - named queues, FIFO within a queue
//! - manual ack, prefetch accounting per channel
//! - closing a channel or a connection puts its unacked deliveries back at the
//!   head of their queue, flagged `redelivered`
//! - `drop_connections()` simulates a broker-initiated close
//! - `fail_next_dials(n)` makes the next `n` dials fail
//!
//! # 使用例
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let built = BrokerBuilder::new(config)
//!     .connector(Arc::new(broker.connector()))
//!     .register::<Hello, _>(HelloHandler)?
//!     .build()?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify, watch};

use crate::domain::QueueName;
use crate::error::QueueError;
use crate::ports::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    connection: u64,
    channel: u64,
    inflight: Arc<AtomicUsize>,
    message: StoredMessage,
}

#[derive(Default)]
struct QueueState {
    declared: bool,
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> unacked message (tag order == delivery order)
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    /// open connections -> close notification
    connections: HashMap<u64, watch::Sender<bool>>,
    next_connection_id: u64,
    next_channel_id: u64,
    next_tag: u64,
}

impl BrokerState {
    fn is_open(&self, connection: u64) -> bool {
        self.connections.contains_key(&connection)
    }

    /// Move matching unacked deliveries back to the head of their queue,
    /// keeping their original order.
    fn requeue_where(&mut self, matches: impl Fn(&Unacked) -> bool) {
        for queue in self.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| matches(unacked))
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    unacked.inflight.fetch_sub(1, Ordering::SeqCst);
                    queue.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
            }
        }
    }

    fn close_connection(&mut self, connection: u64) -> bool {
        let Some(closed_tx) = self.connections.remove(&connection) else {
            return false;
        };
        let _ = closed_tx.send(true);
        self.requeue_where(|unacked| unacked.connection == connection);
        true
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    /// publish / ack / close 時の通知用
    notify: Notify,
    failing_dials: AtomicU32,
    dial_attempts: AtomicU32,
}

/// In-process broker. Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                failing_dials: AtomicU32::new(0),
                dial_attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_dials(&self, n: u32) {
        self.shared.failing_dials.store(n, Ordering::SeqCst);
    }

    /// Dial attempts so far, failed ones included.
    pub fn dial_attempts(&self) -> u32 {
        self.shared.dial_attempts.load(Ordering::SeqCst)
    }

    pub async fn connections_opened(&self) -> u64 {
        self.shared.state.lock().await.next_connection_id
    }

    pub async fn open_connections(&self) -> usize {
        self.shared.state.lock().await.connections.len()
    }

    /// Close every open connection from the broker side.
    pub async fn drop_connections(&self) {
        let mut state = self.shared.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Put raw bytes on a queue, bypassing the envelope codec.
    pub async fn publish_raw(&self, queue: &QueueName, body: impl Into<Vec<u8>>) {
        let mut state = self.shared.state.lock().await;
        let queue = state.queues.entry(queue.clone()).or_default();
        queue.declared = true;
        queue.ready.push_back(StoredMessage {
            body: body.into(),
            redelivered: false,
        });
        drop(state);
        self.shared.notify.notify_waiters();
    }

    pub async fn ready_count(&self, queue: &QueueName) -> usize {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub async fn unacked_count(&self, queue: &QueueName) -> usize {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Bodies waiting in `queue`, head first.
    pub async fn ready_messages(&self, queue: &QueueName) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn is_declared(&self, queue: &QueueName) -> bool {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).is_some_and(|q| q.declared)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct InMemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, _connection_name: &str) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.shared.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .shared
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Connection("simulated dial failure".to_string()));
        }

        let mut state = self.shared.state.lock().await;
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.connections.insert(id, closed_tx);

        Ok(Arc::new(InMemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            closed_rx,
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let mut state = self.shared.state.lock().await;
        if !state.is_open(self.id) {
            return Err(QueueError::Channel("connection is closed".to_string()));
        }
        state.next_channel_id += 1;

        Ok(Box::new(InMemoryChannel {
            id: state.next_channel_id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
            closed_rx: self.closed_rx.clone(),
            open: Arc::new(AtomicBool::new(true)),
            prefetch: Arc::new(AtomicU16::new(0)),
            inflight: Arc::new(AtomicUsize::new(0)),
        }))
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), QueueError> {
        let closed = self.shared.state.lock().await.close_connection(self.id);
        if closed {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

struct InMemoryChannel {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
    open: Arc<AtomicBool>,
    prefetch: Arc<AtomicU16>,
    inflight: Arc<AtomicUsize>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if *self.closed_rx.borrow() || !self.open.load(Ordering::SeqCst) {
            return Err(QueueError::Channel(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn set_prefetch(&self, prefetch: u16) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        self.ensure_open().map_err(|e| QueueError::declare(queue, e))?;
        let mut state = self.shared.state.lock().await;
        state.queues.entry(queue.clone()).or_default().declared = true;
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, body: &[u8]) -> Result<(), QueueError> {
        self.ensure_open().map_err(|e| QueueError::publish(queue, e))?;
        let mut state = self.shared.state.lock().await;
        if !state.is_open(self.connection) {
            return Err(QueueError::publish(queue, "connection is closed"));
        }
        state
            .queues
            .entry(queue.clone())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueName,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        self.ensure_open().map_err(|e| QueueError::consume(queue, e))?;
        let declared = {
            let state = self.shared.state.lock().await;
            state.queues.get(queue).is_some_and(|q| q.declared)
        };
        if !declared {
            return Err(QueueError::consume(queue, "NOT_FOUND - no queue"));
        }

        let cursor = Cursor {
            queue: queue.clone(),
            connection: self.connection,
            channel: self.id,
            shared: Arc::clone(&self.shared),
            closed_rx: self.closed_rx.clone(),
            open: Arc::clone(&self.open),
            prefetch: Arc::clone(&self.prefetch),
            inflight: Arc::clone(&self.inflight),
        };

        let stream = futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let channel = self.id;
            self.shared
                .state
                .lock()
                .await
                .requeue_where(|unacked| unacked.channel == channel);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

/// Consumer side of one channel.
struct Cursor {
    queue: QueueName,
    connection: u64,
    channel: u64,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
    open: Arc<AtomicBool>,
    prefetch: Arc<AtomicU16>,
    inflight: Arc<AtomicUsize>,
}

impl Cursor {
    async fn next(&self) -> Option<Box<dyn Delivery>> {
        let mut closed_rx = self.closed_rx.clone();
        loop {
            // 先に notified を登録してから状態を見る（通知の取りこぼし防止）
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *closed_rx.borrow() || !self.open.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(delivery) = self.try_take().await {
                return Some(delivery);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = closed_rx.wait_for(|closed| *closed) => return None,
            }
        }
    }

    async fn try_take(&self) -> Option<Box<dyn Delivery>> {
        let prefetch = usize::from(self.prefetch.load(Ordering::SeqCst));
        if prefetch > 0 && self.inflight.load(Ordering::SeqCst) >= prefetch {
            return None;
        }

        let mut state = self.shared.state.lock().await;
        if !state.is_open(self.connection) {
            return None;
        }
        let tag = state.next_tag + 1;
        let queue = state.queues.get_mut(&self.queue)?;
        let message = queue.ready.pop_front()?;
        queue.unacked.insert(
            tag,
            Unacked {
                connection: self.connection,
                channel: self.channel,
                inflight: Arc::clone(&self.inflight),
                message: message.clone(),
            },
        );
        state.next_tag = tag;
        self.inflight.fetch_add(1, Ordering::SeqCst);

        Some(Box::new(InMemoryDelivery {
            tag,
            queue: self.queue.clone(),
            message,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct InMemoryDelivery {
    tag: u64,
    queue: QueueName,
    message: StoredMessage,
    shared: Arc<Shared>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let acked = {
            let mut state = self.shared.state.lock().await;
            state
                .queues
                .get_mut(&self.queue)
                .and_then(|q| q.unacked.remove(&self.tag))
        };
        match acked {
            Some(unacked) => {
                unacked.inflight.fetch_sub(1, Ordering::SeqCst);
                self.shared.notify.notify_waiters();
                Ok(())
            }
            None => Err(QueueError::Ack(format!(
                "unknown delivery tag {} on queue={} (channel closed?)",
                self.tag, self.queue
            ))),
        }
    }
}
