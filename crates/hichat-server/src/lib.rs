pub mod dispatcher;
pub mod handlers;
pub mod relay;
pub mod response;
pub mod server;
pub mod session;

pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, MembershipLookup};
pub use relay::{Relay, RelayConfig, RelayMode, RelaySender, MAX_UDP_PAYLOAD};
pub use server::{build_router, start, AppState, ServerConfig, ServerError, ServerHandle};
pub use session::{PushOutcome, Session, SessionRegistry};
