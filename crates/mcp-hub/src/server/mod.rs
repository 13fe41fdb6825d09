//! Client-facing streaming transport (C5): session bookkeeping
//! ([`session`]), per-request stream routing ([`stream`]), the periodic
//! sweeper ([`sweeper`]), and the `axum` router itself ([`transport`]).

pub mod session;
pub mod stream;
pub mod sweeper;
pub mod transport;

pub use session::SessionManager;
pub use stream::StreamRegistry;
pub use transport::{create_router, HubState};
