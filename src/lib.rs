//! Courier Gateway - multi-tenant messaging orchestration
//!
//! This library provides the core functionality for the Courier gateway:
//! - Chat-protocol session lifecycle (pairing, reconnect, credentials)
//! - Prioritized job pipeline with rate limits and dead-lettering
//! - Forgotten-customer temperature scoring and recovery scans
//! - Tenant-scoped event fan-out over WebSocket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  HTTP API / WebSocket                │
//! │   instances  │  forgotten  │  dlq  │  events  │ ... │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Courier Gateway                      │
//! │  Sessions │ Job Pipeline │ Recovery │ Event Hub     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │           Protocol Bridge (sidecar)                  │
//! │   connect  │  pairing  │  send  │  webhooks         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod ai;
pub mod api;
pub mod broker;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod pipeline;
pub mod recovery;
pub mod scoring;
pub mod session;
pub mod workers;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
