//! Traits for storage operations needed by the resolver.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DomainResult;
use crate::model::PlayerProfile;

/// Trait for reading player profiles.
#[async_trait]
pub trait ProfileReader: Send + Sync {
    /// Loads a player's memberships and overrides.
    ///
    /// A player with nothing stored yields an empty profile rather than an error.
    async fn load_profile(&self, player: Uuid) -> DomainResult<PlayerProfile>;
}
