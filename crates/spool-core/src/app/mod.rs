//! App - アプリケーション層
//!
//! ports を組み合わせて broker substrate を組み立てる。
//!
//! # 主要コンポーネント
//! - **BrokerBuilder**: handler 登録と起動時検証
//! - **Broker**: open / close / enqueue
//! - **ConnectionManager**: role ごとの共有接続と再接続
//! - **Producer**: envelope の publish
//! - **ConsumerLoop**: queue ごとの受信・handler 呼び出し・retry 判定
//! - **DelayScheduler**: delay queue の保持と再投入

pub mod broker;
pub mod builder;
pub mod connection;
pub mod consumer;
pub mod delay;
pub mod producer;
mod session;

pub use self::broker::Broker;
pub use self::builder::{BrokerBuilder, BuildError};
pub use self::connection::{ConnectionManager, DialBackoff, Role};
pub use self::consumer::ConsumerLoop;
pub use self::delay::DelayScheduler;
pub use self::producer::{EnqueueOptions, Producer};
