//! Request/response collaborators the tracking subsystem consumes but does not own.

use async_trait::async_trait;

use crate::{OrderId, ParticipantId, location::RestaurantLocation, prelude::*};

#[async_trait]
pub trait OrderLookup: Send + Sync {
    /// Where the restaurant fulfilling `order` is, `None` if it has not registered one
    async fn restaurant_location(&self, order: &OrderId) -> Result<Option<RestaurantLocation>>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Human readable label for a participant
    async fn display_name(&self, participant: &ParticipantId) -> Result<Option<String>>;
}

/// Supplies the bearer credential used when opening the tracking connection
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String>;
}

/// A token that was issued ahead of time
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
