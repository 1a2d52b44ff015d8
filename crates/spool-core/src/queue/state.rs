//! Consumer state machine.

use std::fmt;

/// Where a consumer loop currently is.
///
/// State transitions:
/// - Connecting -> Declaring -> Consuming
/// - Consuming -> Connecting (broker closed the connection, or the session aborted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Waiting for the shared consumer-role connection.
    Connecting,

    /// Opening a channel, setting prefetch and declaring the queue.
    Declaring,

    /// Reading deliveries.
    Consuming,
}

impl ConsumerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumerState::Connecting => "connecting",
            ConsumerState::Declaring => "declaring",
            ConsumerState::Consuming => "consuming",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a consume session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested. The loop exits.
    Shutdown,

    /// The connection or the delivery stream went away. The loop reconnects.
    ConnectionLost,
}
