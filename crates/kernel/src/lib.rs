//! Ayame Kernel Library
//!
//! The plugin runtime and orchestration core of the Ayame media server:
//! hosting for untrusted JavaScript extensions, the permission gate that
//! mediates every capability they touch, and the schedulers, stores, and
//! managers that coordinate asynchronous work around a single-threaded
//! script engine.
//!
//! The main entry point for running the host daemon is the `ayame` binary.

pub mod config;
pub mod cron;
pub mod db;
pub mod download;
pub mod error;
pub mod extension;
pub mod hook;
pub mod host;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod store;

pub use config::Config;
pub use error::{HostError, HostResult};
pub use state::AppContext;
