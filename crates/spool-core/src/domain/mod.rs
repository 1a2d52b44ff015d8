//! Domain model: queue names, the retry envelope, verdicts and handler errors.

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod queue_name;

pub use self::decision::Verdict;
pub use self::envelope::{Envelope, RawEnvelope};
pub use self::errors::{ErrorKind, HandlerError};
pub use self::queue_name::QueueName;
