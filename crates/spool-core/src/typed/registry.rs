//! HandlerRegistry - queue -> handler の登録と管理
//!
//! Built during initialization (mutable), shared read-only behind `Arc`
//! once consumers start. No locks needed at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::message::Message;
use crate::domain::QueueName;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<QueueName, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for queue '{0}' is already registered")]
    AlreadyRegistered(QueueName),

    #[error("queue '{0}' is reserved for the delay scheduler")]
    ReservedQueue(QueueName),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a typed handler on `T::QUEUE`.
    pub fn register<T: Message, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_on::<T, H>(T::QUEUE, handler)
    }

    /// Register a typed handler on an explicit queue.
    pub fn register_on<T, H>(&mut self, queue: QueueName, handler: H) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        self.register_raw(queue, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register a handler that works on the undecoded envelope.
    pub fn register_raw(
        &mut self,
        queue: QueueName,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), RegistryError> {
        if queue.is_delay() {
            return Err(RegistryError::ReservedQueue(queue));
        }
        if self.handlers.contains_key(&queue) {
            return Err(RegistryError::AlreadyRegistered(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    pub fn get(&self, queue: &QueueName) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Registered queues, sorted.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
