//! Permission resolver.
//!
//! Turns a player's memberships and overrides into an immutable
//! [`ResolvedPermissionSet`].
//!
//! # Architecture Decisions
//!
//! - **Topological merge**: the closure of the player's active direct groups is
//!   walked parents before children. A group's value for a node replaces the
//!   values of its ancestors, so the group nearer to the player wins.
//!
//! - **Deterministic conflicts**: values from groups that are not ancestor-related
//!   are settled by [`ConflictPolicy`], never by iteration order.
//!
//! - **Layered lookup**: overrides are kept as their own layer and always consulted
//!   first. Within each layer the exact node is tried before the wildcard chain
//!   (`a.b.c`, `a.b.*`, `a.*`, `*`).
//!
//! - **Default group**: a player without active memberships resolves through the
//!   registry's default group, if one is configured.

mod config;
mod merge;
mod permission_resolver;
mod traits;
mod types;

#[cfg(test)]
mod tests;

pub use config::ResolverConfig;
pub use permission_resolver::{CacheMetrics, CacheMetricsSnapshot, PermissionResolver};
pub use traits::ProfileReader;
pub use types::{ConflictPolicy, DefaultPolicy, ResolvedPermissionSet};
