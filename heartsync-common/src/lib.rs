//! # HeartSync Common Library
//!
//! Shared code for the HeartSync services including:
//! - Error type
//! - Bootstrap configuration loading and root folder resolution
//! - Session event types (SessionEvent enum) and the EventBus
//! - Server-Sent Events helpers
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use events::{EventBus, SessionEvent};
