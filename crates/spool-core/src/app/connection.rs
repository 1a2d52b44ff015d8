//! ConnectionManager - role ごとに共有される broker 接続
//!
//! # 方針
//! - role（producer / consumer）ごとに接続は 1 本だけ
//! - 初回 `get()` で dial。失敗しても諦めない（shutdown だけが dial loop を止める）
//! - 接続ごとに watcher task を立て、broker 側 close を検知したら slot を空にする
//! - 次の `get()` で張り直す

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::session::shutdown_requested;
use crate::error::QueueError;
use crate::ports::{BrokerConnection, Connector};

type Slot = Arc<Mutex<Option<Arc<dyn BrokerConnection>>>>;
type WeakSlot = Weak<Mutex<Option<Arc<dyn BrokerConnection>>>>;

/// Which side of the broker a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff between dial attempts and between consume sessions.
///
/// `delay(n) = initial * multiplier^n`, capped at `max`, plus up to
/// `jitter * delay` of random spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for DialBackoff {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl DialBackoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(i32::MAX as u32) as i32;
        let max = self.max_ms as f64;
        let mut ms = (self.initial_ms as f64 * self.multiplier.powi(exponent)).min(max);
        if !ms.is_finite() || ms < 0.0 {
            ms = max;
        }
        // NaN stays NaN through clamp and fails the comparison
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            ms += ms * rand::thread_rng().gen_range(0.0..=jitter);
        }
        Duration::from_millis(ms.min(max) as u64)
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connection_name: String,
    backoff: DialBackoff,
    producer: Slot,
    consumer: Slot,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        connection_name: impl Into<String>,
        backoff: DialBackoff,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            connection_name: connection_name.into(),
            backoff,
            producer: Slot::default(),
            consumer: Slot::default(),
            shutdown,
        }
    }

    fn slot(&self, role: Role) -> &Slot {
        match role {
            Role::Producer => &self.producer,
            Role::Consumer => &self.consumer,
        }
    }

    /// Shared connection for `role`, dialing it first if needed.
    ///
    /// Concurrent callers for the same role wait on one dial and get the same
    /// connection. Returns [`QueueError::Shutdown`] once shutdown is requested.
    pub async fn get(&self, role: Role) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let slot = self.slot(role);
        // dial 中もロックを保持する（同時に 2 本張らないため）
        let mut current = slot.lock().await;
        if let Some(connection) = current.as_ref()
            && !connection.is_closed()
        {
            return Ok(Arc::clone(connection));
        }
        *current = None;

        let connection = self.dial(role).await?;
        self.spawn_watcher(role, Arc::downgrade(slot), Arc::clone(&connection));
        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn dial(&self, role: Role) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let name = format!("{}-{}", self.connection_name, role);
        let mut shutdown = self.shutdown.clone();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Err(QueueError::Shutdown);
            }

            match self.connector.connect(&name).await {
                Ok(connection) => {
                    info!(role = %role, connection = %name, attempts = failures + 1, "broker connection established");
                    return Ok(connection);
                }
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        role = %role,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker dial failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Err(QueueError::Shutdown);
                            }
                        }
                    }
                }
            }
        }
    }

    fn spawn_watcher(&self, role: Role, slot: WeakSlot, connection: Arc<dyn BrokerConnection>) {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection.closed() => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }

            if *shutdown.borrow() {
                info!(role = %role, "broker connection closed");
            } else {
                warn!(role = %role, "broker connection lost");
            }

            let Some(slot) = slot.upgrade() else {
                return;
            };
            let mut current = slot.lock().await;
            // 既に張り直されていたら触らない
            if current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &connection))
            {
                *current = None;
            }
        });
    }

    /// Close both role connections. Used at shutdown, after every task has exited.
    pub async fn close_all(&self) {
        for role in [Role::Producer, Role::Consumer] {
            let connection = self.slot(role).lock().await.take();
            if let Some(connection) = connection {
                if let Err(e) = connection.close().await {
                    debug!(role = %role, error = %e, "closing broker connection");
                }
            }
        }
    }
}
