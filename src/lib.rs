//! PageLens Core Library
//!
//! Background service for the PageLens browser extension: a persisted task
//! queue, the handlers that derive page statistics and preferences from it,
//! the SQLite-backed stores and the native messaging host the browser talks
//! to.

pub mod analysis;
pub mod bridge;
pub mod config;
mod dirs_compat;
pub mod enrichment;
pub mod handlers;
pub mod history;
pub mod persistence;
pub mod queue;
pub mod service;
pub mod telemetry;
pub mod util;
