//! Vibration-based machine monitor.
//!
//! Raw accelerometer samples flow through a per-machine [`signal::SignalInterpreter`]
//! and [`detector::StateDetector`] into the shared [`store::SessionStore`];
//! [`analytics`] derives usage statistics from the closed sessions.

pub mod analytics;
pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod health;
pub mod ingest;
pub mod monitor;
pub mod pipeline;
pub mod replay;
pub mod signal;
pub mod simulator;
pub mod smoothing;
pub mod store;
pub mod types;

pub use config::{ForecastMode, MonitorConfig};
pub use error::{MonitorError, MonitorResult};
pub use monitor::Monitor;
