//! Typed - 型付き Message / Handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `Message` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod handler;
pub mod message;
pub mod registry;

pub use self::handler::{DynHandler, Handler, TypedHandler};
pub use self::message::Message;
pub use self::registry::{HandlerRegistry, RegistryError};
