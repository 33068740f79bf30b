pub mod envelope;
pub mod errors;
pub mod ids;

pub use envelope::{Envelope, MediaKind, MessageKind};
pub use errors::{EnvelopeError, RelayError};
pub use ids::{history_key, ConnectionId, GroupId, UserId};
