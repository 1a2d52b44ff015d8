//! BrokerBuilder - Broker の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 同じ queue への二重登録は `register` の時点でエラー
//! - `expect_queues()` で期待する queue を宣言しておくと、
//!   `build()` 時に「期待集合 ⊆ 登録済み集合」をチェックする

use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::broker::Broker;
use crate::config::BrokerConfig;
use crate::domain::QueueName;
use crate::impls::AmqpConnector;
use crate::ports::Connector;
use crate::typed::{DynHandler, Handler, HandlerRegistry, Message, RegistryError};

/// # 使用例
/// ```ignore
/// let broker = BrokerBuilder::new(BrokerConfig::from_env()?)
///     .register::<AppRefresh, _>(AppRefreshHandler)?
///     .expect_queues(&[QueueName::APP_REFRESH])
///     .build()?;
/// ```
pub struct BrokerBuilder {
    config: BrokerConfig,
    connector: Option<Arc<dyn Connector>>,
    registry: HandlerRegistry,
    expected_queues: Option<Vec<QueueName>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing queues: {0:?}. These queues were expected but have no handler.")]
    MissingQueues(Vec<QueueName>),
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            connector: None,
            registry: HandlerRegistry::new(),
            expected_queues: None,
        }
    }

    /// Use a custom connector. Defaults to RabbitMQ at `config.url`.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn register<T: Message, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Register a typed handler on a queue other than `T::QUEUE`.
    pub fn register_on<T, H>(mut self, queue: QueueName, handler: H) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        self.registry.register_on::<T, H>(queue, handler)?;
        Ok(self)
    }

    pub fn register_raw(mut self, queue: QueueName, handler: impl DynHandler + 'static) -> Result<Self, RegistryError> {
        self.registry.register_raw(queue, Arc::new(handler))?;
        Ok(self)
    }

    pub fn expect_queues(mut self, queues: &[QueueName]) -> Self {
        self.expected_queues = Some(queues.to_vec());
        self
    }

    pub fn build(self) -> Result<Broker, BuildError> {
        if let Some(expected) = &self.expected_queues {
            let registered = self.registry.queues();
            let missing: Vec<QueueName> = expected
                .iter()
                .filter(|queue| !registered.contains(queue))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingQueues(missing));
            }
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(AmqpConnector::new(self.config.url.clone())));
        Ok(Broker::new(self.config, connector, self.registry))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::domain::{Envelope, HandlerError, RawEnvelope};

    #[derive(Debug, Serialize, Deserialize)]
    struct AppRefresh {
        app_id: u32,
    }

    impl Message for AppRefresh {
        const QUEUE: QueueName = QueueName::APP_REFRESH;
    }

    struct AppRefreshHandler;

    #[async_trait]
    impl Handler<AppRefresh> for AppRefreshHandler {
        async fn handle(&self, _envelope: &Envelope<AppRefresh>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct RawHandler;

    #[async_trait]
    impl DynHandler for RawHandler {
        async fn handle_dyn(&self, _envelope: &RawEnvelope) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn build_success() {
        let broker = BrokerBuilder::new(BrokerConfig::default())
            .register::<AppRefresh, _>(AppRefreshHandler)
            .unwrap()
            .expect_queues(&[QueueName::APP_REFRESH])
            .build();
        assert!(broker.is_ok());
    }

    #[test]
    fn build_missing_queues() {
        let broker = BrokerBuilder::new(BrokerConfig::default())
            .register::<AppRefresh, _>(AppRefreshHandler)
            .unwrap()
            .expect_queues(&[QueueName::APP_REFRESH, QueueName::PLAYER_REFRESH])
            .build();
        assert!(matches!(
            broker,
            Err(BuildError::MissingQueues(missing)) if missing == vec![QueueName::PLAYER_REFRESH]
        ));
    }

    #[test]
    fn build_without_expectations() {
        let broker = BrokerBuilder::new(BrokerConfig::default())
            .register_raw(QueueName::BUNDLE_REFRESH, RawHandler)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(broker.registry().queues(), vec![QueueName::BUNDLE_REFRESH]);
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let result = BrokerBuilder::new(BrokerConfig::default())
            .register::<AppRefresh, _>(AppRefreshHandler)
            .unwrap()
            .register_raw(QueueName::APP_REFRESH, RawHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }
}
