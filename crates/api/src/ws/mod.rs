//! WebSocket infrastructure for live job and system events.
//!
//! Provides connection management, heartbeat monitoring, and the HTTP
//! upgrade handlers used by Axum routes.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::{job_ws_handler, monitor_ws_handler};
pub use heartbeat::start_heartbeat;
pub use manager::{Delivery, WsManager};
