//! Services - message routing and process lifecycle
//!
//! - `router` - Maps switch status publishes onto the registry
//! - `lifecycle` - Ordered startup and deadline-bounded shutdown

pub mod lifecycle;
pub mod router;

pub use lifecycle::{Coordinator, Listener};
pub use router::TopicRouter;
