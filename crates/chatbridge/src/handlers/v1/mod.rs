//! V1 API handlers.

mod bridge;

pub use bridge::{get_status, start_bridge, stop_bridge};
