//! rankguard-server: Permission service and runtime wiring
//!
//! This crate connects the domain and storage layers into the service a host
//! embeds:
//! - `PermissionService` with the synchronous hot-path check and admin operations
//! - Consistency manager for invalidation and change notification
//! - Bounded storage I/O with retry and degraded mode
//! - Expiry sweeper for timed memberships
//! - Configuration and logging setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              rankguard-server               │
//! ├─────────────────────────────────────────────┤
//! │  service.rs       - PermissionService       │
//! │  consistency.rs   - Invalidation & hooks    │
//! │  adapters.rs      - Storage -> domain       │
//! │  singleflight.rs  - Per-player dedup        │
//! │  io_pool.rs       - Bounded storage calls   │
//! │  retry.rs         - Backoff & degraded mode │
//! │  expiry.rs        - Timed membership sweep  │
//! │  config.rs        - Configuration           │
//! │  observability.rs - Logging & metrics       │
//! └─────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod config;
pub mod consistency;
mod expiry;
pub mod io_pool;
pub mod observability;
pub mod retry;
pub mod service;
pub mod singleflight;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServiceConfig};
pub use consistency::{ChangeReason, PermissionChange};
pub use observability::{init_logging, register_metrics, LogFormat, LoggingConfig};
pub use retry::RetryPolicy;
pub use service::{connect_store, PermissionService};
