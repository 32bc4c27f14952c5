//! Tests for the permission resolver module.
//!
//! Organized by functionality:
//! - Inheritance and nearest-group precedence
//! - Overrides
//! - Wildcards and the default policy
//! - Conflicts between unrelated groups
//! - Expiry and the default group
//! - Caching, generations and the reverse index

mod mocks;
