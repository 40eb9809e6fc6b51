//! Pure synchronous LiteConn protocol layer.
//!
//! This crate holds everything about LiteConn that does not touch a socket,
//! a clock-driven thread, or a lock: the wire header, the flag set, serial
//! number arithmetic for the transport index, conversation framing and the
//! timeout knobs. It only depends on `bytes`.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  liteconn-core              │
//! │                             │
//! │  protocol ← header & flags  │
//! │  config   ← TimeoutSetting  │
//! │  error    ← 3 variants      │
//! └─────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{TimeoutSetting, MAX_TIMEOUT};
pub use error::{CoreError, CoreResult};
pub use protocol::*;
