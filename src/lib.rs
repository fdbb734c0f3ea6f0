//! Local-first persistence and multi-device sync for media viewing progress.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fast;
pub mod keys;
pub mod models;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod tombstones;
pub mod transfer;

pub use config::Config;
pub use engine::Engine;
pub use error::{AppError, Result};
