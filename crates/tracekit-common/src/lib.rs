//! # TraceKit Common
//!
//! Logging configuration shared by the TraceKit service worker crates.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
