//! Ports - 抽象化レイヤー
//!
//! Broker access goes through these traits so the consumer, producer and
//! delay scheduler run unchanged against RabbitMQ or the in-memory broker.

pub mod broker;

pub use self::broker::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
