//! Queue module: retry policy, queue declaration and the consumer state machine.

mod declare;
mod retry;
mod state;

pub use declare::declare;
pub use retry::RetryPolicy;
pub use state::{ConsumerState, SessionEnd};
