//! spool-core
//!
//! Message-queue substrate over an AMQP 0.9.1 broker: typed handlers per
//! queue, retry budgets carried in the message envelope, and timed redelivery
//! through a shared delay queue.
//!
//! # モジュール構成
//! - **domain**: queue 名, envelope, verdict, handler エラー
//! - **queue**: retry policy, queue declaration, consumer state
//! - **ports**: broker 抽象（Connector, BrokerConnection, BrokerChannel, Delivery）
//! - **impls**: RabbitMQ (lapin) と in-memory broker
//! - **typed**: Message trait, Handler trait, HandlerRegistry
//! - **app**: Broker, BrokerBuilder, 接続管理, producer, consumer, delay scheduler
//! - **config** / **logging** / **error**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod typed;

pub use self::app::{Broker, BrokerBuilder, BuildError, EnqueueOptions, Producer};
pub use self::config::BrokerConfig;
pub use self::domain::{Envelope, ErrorKind, HandlerError, QueueName, RawEnvelope, Verdict};
pub use self::error::QueueError;
pub use self::impls::{AmqpConnector, InMemoryBroker};
pub use self::queue::RetryPolicy;
pub use self::typed::{DynHandler, Handler, Message, RegistryError};
