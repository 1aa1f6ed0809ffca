mod aggregator;
mod channel;
mod events;
mod geo;
mod location;
mod registry;
mod retry;
mod services;
mod settings;
mod tracker;
mod transport;

pub use aggregator::{AggregatorState, PeerPresence, PresenceAggregator};
pub use channel::{ChannelEvent, ConnectionState, Feed, TrackingChannel};
pub use events::{ClientEvent, OrderRestaurant, ParticipantRole, ProfileRecord, ServerEvent};
pub use geo::{Coordinate, DistanceResult, EARTH_RADIUS_KM, distance_km, format_distance};
pub use location::{
    LocationSample, LocationSource, PollingLocationSource, PositionProvider, RestaurantLocation,
    SampleSink, SourceEvent, SourceOptions,
};
pub use registry::TrackerRegistry;
pub use retry::{Backoff, NoRetry, RetryStrategy};
pub use services::{OrderLookup, ProfileDirectory, StaticToken, TokenProvider};
pub use settings::TrackingSettings;
pub use tracker::{
    PreconditionError, SingleOrderTracker, TrackerEffect, TrackerInput, TrackerPhase,
    TrackerSnapshot, TrackerState,
};
pub use transport::{Connector, ServerEndpoint, Transport, TransportMessage};

/// Opaque identifier of an order, one tracking room exists per order
pub type OrderId = String;
/// Identifier of a participant (customer or restaurant account)
pub type ParticipantId = String;
/// Identifier of a restaurant, scopes the multi-order feed
pub type RestaurantId = String;

/// Convenience alias for UTC DT
pub type UtcDT = chrono::DateTime<chrono::Utc>;

pub trait StateUpdateSender: Send + Sync {
    fn send_update(&self);
}

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
