pub mod broadcast;
pub mod conversation;
pub mod messages;

pub use broadcast::{browser_handler, publisher_handler};
pub use conversation::conversation_handler;

/// Liveness probe for load balancers and the host bridge.
pub async fn health_check() -> &'static str {
    "ok"
}
