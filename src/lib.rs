pub mod config;
pub mod core;
pub mod service;

// Re-export main components for easy access
pub use config::Config;
pub use crate::core::*;
pub use service::{AccessError, AccessLayer, BackgroundTasks, LayerStats, ReadOp, WriteRequest};
