//! Handler trait - queue ごとの処理の定義
//!
//! - `Handler<T>`: 型付き。`T` の envelope しか受け取れない
//! - `DynHandler`: object-safe。registry に `Arc<dyn DynHandler>` で格納
//! - `TypedHandler<T, H>`: raw envelope を `T` に decode してから `H` に渡す

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::domain::{Envelope, HandlerError, RawEnvelope};

/// Processes one message.
///
/// Return `Ok(())` to ack, [`HandlerError::retry`] to go through the delay
/// queue, [`HandlerError::permanent`] to drop. Delivery is at-least-once, so
/// handlers must be idempotent.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, envelope: &Envelope<T>) -> Result<(), HandlerError>;
}

/// Object-safe handler over the undecoded envelope.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, envelope: &RawEnvelope) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedHandler<T, H>
where
    T: DeserializeOwned + Send + Sync + 'static,
    H: Handler<T>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> DynHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + Sync + 'static,
    H: Handler<T>,
{
    async fn handle_dyn(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        // payload が型に合わないなら何度やっても失敗する
        let typed: Envelope<T> = envelope
            .decode()
            .map_err(|e| HandlerError::permanent(format!("payload decode: {e}")))?;
        self.handler.handle(&typed).await
    }
}
