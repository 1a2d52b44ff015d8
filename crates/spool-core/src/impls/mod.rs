//! Impls - broker port の実装
//!
//! # 含まれる実装
//! - **AmqpConnector**: RabbitMQ (lapin)。本番用
//! - **InMemoryBroker**: プロセス内 broker。テスト・デモ用

pub mod amqp;
pub mod inmem_broker;

pub use self::amqp::AmqpConnector;
pub use self::inmem_broker::{InMemoryBroker, InMemoryConnector};
