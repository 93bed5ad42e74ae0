//! ddm-bridge - Host-side monitor for Android devices and debuggable processes
//!
//! This library tracks devices through the bridge daemon, opens a session to
//! every debuggable process, and speaks the DDM chunk protocol over those
//! sessions for heap, allocation, profiling and view telemetry.
//!
//! Start with [`Engine`]; decoded telemetry arrives through the sinks in
//! [`core::Listeners`].

pub mod adb;
pub mod chunk;
pub mod client;
pub mod codec;
pub mod config;
pub mod core;
pub mod devices;
pub mod engine;
pub mod error;
pub mod tracking;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
