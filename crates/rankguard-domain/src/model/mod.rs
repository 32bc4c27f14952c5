//! Permission model types.
//!
//! This module contains:
//! - Permission nodes and wildcard lookup chains
//! - Groups, memberships and player profiles
//! - Administrator duration input parsing

mod duration;
mod node;
#[cfg(test)]
mod node_proptest;
mod types;

pub use duration::parse_duration_input;
pub use node::{PermissionNode, MAX_NODE_LENGTH, WILDCARD};
pub use types::*;
