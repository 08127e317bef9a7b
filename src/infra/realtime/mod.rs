//! Realtime transport adapters.
//!
//! `PhoenixTransport` speaks the backend's websocket channel protocol and owns
//! reconnection. `MemoryRealtime` keeps channels in process so tests and
//! demos can push changes and status transitions by hand.

mod memory;
mod phoenix;

pub use memory::MemoryRealtime;
pub use phoenix::{PhoenixOptions, PhoenixTransport, realtime_url};
