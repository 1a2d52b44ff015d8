//! Broker - 接続・producer・handler registry・受信 task をまとめて持つ
//!
//! グローバル状態は持たない。`open()` で queue ごとの consumer と delay
//! scheduler を起動し、`close()` で全 task の終了を待ってから接続を閉じる。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::connection::ConnectionManager;
use super::consumer::ConsumerLoop;
use super::delay::DelayScheduler;
use super::producer::{EnqueueOptions, Producer};
use super::session::Supervisor;
use crate::config::BrokerConfig;
use crate::domain::QueueName;
use crate::error::QueueError;
use crate::ports::Connector;
use crate::typed::{HandlerRegistry, Message};

pub struct Broker {
    config: BrokerConfig,
    connections: Arc<ConnectionManager>,
    producer: Producer,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    opened: bool,
    joins: Vec<JoinHandle<()>>,
}

impl Broker {
    pub(crate) fn new(config: BrokerConfig, connector: Arc<dyn Connector>, registry: HandlerRegistry) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connections = Arc::new(ConnectionManager::new(
            connector,
            config.connection_name.clone(),
            config.dial_backoff.clone(),
            shutdown_rx,
        ));
        Self {
            producer: Producer::new(Arc::clone(&connections)),
            config,
            connections,
            registry: Arc::new(registry),
            shutdown_tx,
            opened: false,
            joins: Vec::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub async fn enqueue<T: Message>(&self, message: T, options: EnqueueOptions) -> Result<(), QueueError> {
        self.producer.enqueue(message, options).await
    }

    /// Start one consumer task per registered queue, plus the delay scheduler
    /// when `run_delay_queue` is set. Must be called inside a Tokio runtime.
    pub fn open(&mut self) -> Result<(), QueueError> {
        if self.is_open() {
            return Err(QueueError::AlreadyOpen);
        }
        if *self.shutdown_tx.borrow() {
            return Err(QueueError::Shutdown);
        }

        for queue in self.registry.queues() {
            let Some(handler) = self.registry.get(&queue) else {
                continue;
            };
            let consumer = ConsumerLoop::new(
                queue.clone(),
                handler,
                self.producer.clone(),
                self.config.retry.clone(),
            );
            let supervisor = self.supervisor(queue, self.config.consumer_prefetch);
            self.joins.push(tokio::spawn(supervisor.run(consumer)));
        }

        if self.config.run_delay_queue {
            let scheduler = DelayScheduler::new(self.producer.clone(), self.config.delay_max_hold());
            let supervisor = self.supervisor(QueueName::DELAY, self.config.delay_prefetch);
            self.joins.push(tokio::spawn(supervisor.run(scheduler)));
        }
        self.opened = true;

        info!(
            queues = self.registry.len(),
            delay_queue = self.config.run_delay_queue,
            "broker opened"
        );
        Ok(())
    }

    fn supervisor(&self, queue: QueueName, prefetch: u16) -> Supervisor {
        Supervisor {
            queue,
            prefetch,
            connections: Arc::clone(&self.connections),
            backoff: self.config.dial_backoff.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Stop every task, wait for them and close both connections.
    ///
    /// A handler that is running finishes first; nothing new is taken.
    pub async fn close(self) {
        // receiver が全部 drop 済みでも構わない
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            let _ = join.await;
        }
        self.connections.close_all().await;
        info!("broker closed");
    }
}
