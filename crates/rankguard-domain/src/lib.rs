//! rankguard-domain: Core permission domain logic
//!
//! This crate contains the core permission logic including:
//! - Permission nodes, groups and player profiles
//! - The group registry with cycle detection and a reverse index
//! - The permission resolver and its inheritance-aware merge
//! - Resolved set caching with invalidation epochs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              rankguard-domain               │
//! ├─────────────────────────────────────────────┤
//! │  model/     - Nodes, groups, profiles       │
//! │  registry/  - Group graph & reverse index   │
//! │  resolver/  - Permission resolution         │
//! │  cache/     - Resolved set caching          │
//! │  clock      - Time source                   │
//! └─────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod clock;
pub mod error;
pub mod model;
pub mod registry;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use cache::{PermissionCache, PermissionCacheConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use model::{Group, Membership, PermissionNode, PlayerProfile};
pub use registry::{GroupChange, GroupRegistry};
pub use resolver::{
    ConflictPolicy, DefaultPolicy, PermissionResolver, ProfileReader, ResolvedPermissionSet,
    ResolverConfig,
};
