//! Rideshare tracker core
//!
//! Offline-first shift and ride tracking. Every action is stored locally
//! first and reaches the server directly or later through the outbox.

pub mod api;
pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod services;

pub use app::App;
pub use error::{AppError, Result};
