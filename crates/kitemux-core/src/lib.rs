//! kitemux Core Library
//!
//! Shared functionality for kitemux components:
//! - Chunk wire protocol (parser, formatters, rejection payloads)
//! - Kite (published route) table
//! - Manager configuration and environment overrides
//! - Process-wide status and counters
//! - Common error types

pub mod config;
pub mod error;
pub mod kite;
pub mod proto;
pub mod sign;
pub mod state;
pub mod tracing_init;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use kite::{Kite, KiteTable};
pub use state::{SharedState, Status};
