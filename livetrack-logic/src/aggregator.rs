use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    OrderId, ParticipantId, RestaurantId, StateUpdateSender,
    channel::{ChannelEvent, ConnectionState, Feed, TrackingChannel},
    geo::DistanceResult,
    location::{LocationSample, RestaurantLocation},
    services::ProfileDirectory,
    transport::Connector,
};

/// A customer currently sharing their location for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, specta::Type)]
pub struct PeerPresence {
    pub order_id: OrderId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub last_sample: Option<LocationSample>,
    pub distance: Option<DistanceResult>,
}

impl PeerPresence {
    fn new(order_id: OrderId, participant_id: ParticipantId, display_name: Option<String>) -> Self {
        Self {
            display_name: display_name.unwrap_or_else(|| participant_id.clone()),
            order_id,
            participant_id,
            last_sample: None,
            distance: None,
        }
    }

    fn has_resolved_name(&self) -> bool {
        self.display_name != self.participant_id
    }
}

/// Fan-in state of every order a restaurant is watching
#[derive(Debug, Clone)]
pub struct AggregatorState {
    connection: ConnectionState,
    sharers: HashMap<OrderId, PeerPresence>,
    restaurants: HashMap<OrderId, RestaurantLocation>,
}

impl Default for AggregatorState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            sharers: HashMap::new(),
            restaurants: HashMap::new(),
        }
    }
}

impl AggregatorState {
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn sharers(&self) -> &HashMap<OrderId, PeerPresence> {
        &self.sharers
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&PeerPresence> {
        self.sharers.get(order_id)
    }

    fn distance_for(
        &self,
        order_id: &OrderId,
        sample: &LocationSample,
        precomputed: Option<DistanceResult>,
    ) -> Option<DistanceResult> {
        precomputed.or_else(|| {
            self.restaurants
                .get(order_id)
                .map(|restaurant| DistanceResult::between(sample, restaurant))
        })
    }

    /// Fold one channel event into the map. Returns the sharer whose display name still
    /// needs to be looked up, if any.
    pub fn apply(&mut self, event: ChannelEvent) -> Option<(OrderId, ParticipantId)> {
        match event {
            ChannelEvent::ConnectionChanged(connection) => {
                self.connection = connection;
                if connection == ConnectionState::Disconnected {
                    self.sharers.clear();
                }
                None
            }
            ChannelEvent::RestaurantLocation { order_id, location } => {
                if let Some(entry) = self.sharers.get_mut(&order_id) {
                    if entry.distance.is_none() {
                        entry.distance = entry
                            .last_sample
                            .as_ref()
                            .map(|sample| DistanceResult::between(sample, &location));
                    }
                }
                self.restaurants.insert(order_id, location);
                None
            }
            ChannelEvent::SharingStarted {
                order_id,
                participant_id,
                display_name,
            } => {
                let entry =
                    PeerPresence::new(order_id.clone(), participant_id.clone(), display_name);
                let resolved = entry.has_resolved_name();
                self.sharers.insert(order_id.clone(), entry);
                (!resolved).then_some((order_id, participant_id))
            }
            ChannelEvent::LocationUpdate {
                order_id,
                participant_id,
                sample,
                distance,
            } => {
                let distance = self.distance_for(&order_id, &sample, distance);
                let mut late_join = false;
                let entry = self
                    .sharers
                    .entry(order_id.clone())
                    .and_modify(|entry| {
                        if entry.participant_id != participant_id {
                            // Someone else took over the order
                            *entry = PeerPresence::new(
                                order_id.clone(),
                                participant_id.clone(),
                                None,
                            );
                            late_join = true;
                        }
                    })
                    .or_insert_with(|| {
                        late_join = true;
                        PeerPresence::new(order_id.clone(), participant_id.clone(), None)
                    });
                entry.last_sample = Some(sample);
                entry.distance = distance;
                late_join.then_some((order_id, participant_id))
            }
            ChannelEvent::SharingStopped {
                order_id,
                participant_id,
            }
            | ChannelEvent::ParticipantLeft {
                order_id,
                participant_id,
            } => {
                let theirs = self
                    .sharers
                    .get(&order_id)
                    .is_some_and(|entry| entry.participant_id == participant_id);
                if theirs {
                    self.sharers.remove(&order_id);
                }
                None
            }
            // Dashboards never share
            ChannelEvent::SharingRejected { .. } => None,
            ChannelEvent::Error(why) => {
                debug!("Tracking error while aggregating: {why}");
                None
            }
        }
    }

    /// Attach a looked up name, ignored if the sharer is gone or was replaced
    pub fn set_display_name(
        &mut self,
        order_id: &OrderId,
        participant_id: &ParticipantId,
        name: String,
    ) -> bool {
        match self.sharers.get_mut(order_id) {
            Some(entry) if entry.participant_id == *participant_id => {
                entry.display_name = name;
                true
            }
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.sharers.clear();
    }
}

/// Watches every order of one restaurant over the shared tracking connection and keeps a
/// map of who is currently sharing.
pub struct PresenceAggregator<C: Connector, S: StateUpdateSender> {
    restaurant_id: RestaurantId,
    channel: Arc<TrackingChannel<C>>,
    profiles: Option<Arc<dyn ProfileDirectory>>,
    state: RwLock<AggregatorState>,
    state_update_sender: S,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl<C: Connector, S: StateUpdateSender + 'static> PresenceAggregator<C, S> {
    pub fn new(
        restaurant_id: RestaurantId,
        channel: Arc<TrackingChannel<C>>,
        profiles: Option<Arc<dyn ProfileDirectory>>,
        state_update_sender: S,
    ) -> Self {
        Self {
            restaurant_id,
            channel,
            profiles,
            state: RwLock::new(AggregatorState::default()),
            state_update_sender,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn restaurant_id(&self) -> &RestaurantId {
        &self.restaurant_id
    }

    /// Snapshot of every active sharer keyed by order
    pub async fn active_sharers(&self) -> HashMap<OrderId, PeerPresence> {
        self.state.read().await.sharers.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Join the restaurant feed and start folding events, does nothing if already started
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }

        let events = self
            .channel
            .subscribe(Feed::Restaurant(self.restaurant_id.clone()))
            .await;
        self.channel.join_restaurant(self.restaurant_id.clone()).await;
        self.channel.connect().await;

        tokio::spawn({
            let aggregator = self.clone();
            async move {
                aggregator.event_loop(events).await;
            }
        });
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break;
                }

                event = events.recv() => event,
            };

            let Some(event) = event else {
                self.state.write().await.clear();
                self.state_update_sender.send_update();
                break;
            };

            let lookup = self.state.write().await.apply(event);
            self.state_update_sender.send_update();

            if let Some((order_id, participant_id)) = lookup {
                self.spawn_name_lookup(order_id, participant_id);
            }
        }
    }

    fn spawn_name_lookup(self: &Arc<Self>, order_id: OrderId, participant_id: ParticipantId) {
        let Some(profiles) = self.profiles.clone() else {
            return;
        };
        let aggregator = self.clone();
        tokio::spawn(async move {
            match profiles.display_name(&participant_id).await {
                Ok(Some(name)) => {
                    let changed = aggregator
                        .state
                        .write()
                        .await
                        .set_display_name(&order_id, &participant_id, name);
                    if changed {
                        aggregator.state_update_sender.send_update();
                    }
                }
                Ok(None) => {}
                Err(why) => {
                    warn!("Failed to look up display name for {participant_id}: {why:?}");
                }
            }
        });
    }

    /// Leave the restaurant feed and forget every sharer. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.channel.leave_restaurant(&self.restaurant_id).await;
        self.state.write().await.clear();
        self.state_update_sender.send_update();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        ParticipantRole, ServerEvent,
        prelude::*,
        tests::{CountingSender, MockConnector, MockServer, sample, settle},
    };

    fn started(order: &str, user: &str, name: Option<&str>) -> ChannelEvent {
        ChannelEvent::SharingStarted {
            order_id: order.into(),
            participant_id: user.into(),
            display_name: name.map(String::from),
        }
    }

    fn update(order: &str, user: &str, lat: f64, lng: f64) -> ChannelEvent {
        ChannelEvent::LocationUpdate {
            order_id: order.into(),
            participant_id: user.into(),
            sample: sample(lat, lng, 10.0),
            distance: None,
        }
    }

    #[test]
    fn test_started_update_stopped() {
        let mut state = AggregatorState::default();
        state.apply(started("A", "U1", Some("Sam")));
        state.apply(update("A", "U1", 36.80, 10.18));

        let entry = state.get(&"A".into()).expect("No entry for A");
        assert_eq!(entry.display_name, "Sam");
        assert_eq!(entry.last_sample.as_ref().map(|s| s.lat), Some(36.80));

        state.apply(ChannelEvent::SharingStopped {
            order_id: "A".into(),
            participant_id: "U1".into(),
        });
        assert!(state.get(&"A".into()).is_none());
    }

    #[test]
    fn test_late_join_creates_entry() {
        let mut state = AggregatorState::default();
        let lookup = state.apply(update("B", "U2", 36.80, 10.18));
        assert_eq!(lookup, Some(("B".into(), "U2".into())));
        let entry = state.get(&"B".into()).expect("Late update was dropped");
        assert_eq!(entry.display_name, "U2");
    }

    #[test]
    fn test_named_sharer_needs_no_lookup() {
        let mut state = AggregatorState::default();
        assert!(state.apply(started("A", "U1", Some("Sam"))).is_none());
        assert!(state.apply(update("A", "U1", 1.0, 1.0)).is_none());
        assert_eq!(
            state.apply(started("C", "U3", None)),
            Some(("C".into(), "U3".into()))
        );
    }

    #[test]
    fn test_distance_from_restaurant_location() {
        let mut state = AggregatorState::default();
        state.apply(ChannelEvent::RestaurantLocation {
            order_id: "A".into(),
            location: RestaurantLocation {
                lat: 36.81,
                lng: 10.19,
                name: None,
                address: None,
            },
        });
        state.apply(update("A", "U1", 36.80, 10.18));
        let distance = state
            .get(&"A".into())
            .and_then(|e| e.distance.clone())
            .expect("No distance");
        assert_eq!(distance.formatted, "1.4 km");

        // Without a restaurant there is no distance, not a zero one
        state.apply(update("B", "U2", 36.80, 10.18));
        assert!(state.get(&"B".into()).is_some_and(|e| e.distance.is_none()));
    }

    #[test]
    fn test_stop_from_other_participant_ignored() {
        let mut state = AggregatorState::default();
        state.apply(started("A", "U1", None));
        state.apply(ChannelEvent::ParticipantLeft {
            order_id: "A".into(),
            participant_id: "U9".into(),
        });
        assert!(state.get(&"A".into()).is_some());
        state.apply(ChannelEvent::ParticipantLeft {
            order_id: "A".into(),
            participant_id: "U1".into(),
        });
        assert!(state.get(&"A".into()).is_none());
    }

    #[test]
    fn test_transient_states_keep_map() {
        let mut state = AggregatorState::default();
        state.apply(started("A", "U1", None));
        state.apply(ChannelEvent::Error("blip".into()));
        state.apply(ChannelEvent::ConnectionChanged(ConnectionState::Connecting));
        assert_eq!(state.sharers().len(), 1);

        state.apply(ChannelEvent::ConnectionChanged(ConnectionState::Disconnected));
        assert!(state.sharers().is_empty());
        assert_eq!(state.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stale_name_lookup_ignored() {
        let mut state = AggregatorState::default();
        state.apply(started("A", "U1", None));
        state.apply(started("A", "U2", None));
        assert!(!state.set_display_name(&"A".into(), &"U1".into(), "Old".into()));
        assert!(state.set_display_name(&"A".into(), &"U2".into(), "New".into()));
        assert_eq!(state.get(&"A".into()).map(|e| e.display_name.as_str()), Some("New"));
    }

    struct Names(HashMap<ParticipantId, String>);

    #[async_trait]
    impl ProfileDirectory for Names {
        async fn display_name(&self, participant: &ParticipantId) -> Result<Option<String>> {
            Ok(self.0.get(participant).cloned())
        }
    }

    fn live_aggregator(
        profiles: Option<Arc<dyn ProfileDirectory>>,
    ) -> (
        Arc<MockServer>,
        Arc<PresenceAggregator<MockConnector, CountingSender>>,
        CountingSender,
    ) {
        let (server, channel) = MockServer::channel();
        let updates = CountingSender::default();
        let aggregator = Arc::new(PresenceAggregator::new(
            "R1".into(),
            channel,
            profiles,
            updates.clone(),
        ));
        (server, aggregator, updates)
    }

    #[tokio::test]
    async fn test_live_fan_in() {
        let (server, aggregator, updates) = live_aggregator(None);
        aggregator.start().await;
        settle().await;

        assert_eq!(aggregator.connection_state().await, ConnectionState::Connected);
        assert!(server.sent().contains(&crate::ClientEvent::JoinRestaurant {
            restaurant_id: "R1".into()
        }));

        server.push(ServerEvent::SharingStarted {
            order_id: "A".into(),
            participant_id: "U1".into(),
            display_name: Some("Sam".into()),
        });
        server.push(ServerEvent::LocationUpdate {
            order_id: "A".into(),
            participant_id: "U1".into(),
            lat: 36.80,
            lng: 10.18,
            accuracy: None,
            distance_km: Some(1.42),
            distance_formatted: Some("1.4 km".into()),
        });
        server.push(ServerEvent::SharingStarted {
            order_id: "B".into(),
            participant_id: "U2".into(),
            display_name: Some("Alex".into()),
        });
        settle().await;

        let sharers = aggregator.active_sharers().await;
        assert_eq!(sharers.len(), 2);
        assert_eq!(
            sharers["A"].distance.as_ref().map(|d| d.formatted.as_str()),
            Some("1.4 km")
        );
        assert!(updates.count() > 0);

        server.push(ServerEvent::SharingStopped {
            order_id: "A".into(),
            participant_id: "U1".into(),
        });
        settle().await;
        let sharers = aggregator.active_sharers().await;
        assert!(!sharers.contains_key("A"));
        assert!(sharers.contains_key("B"));
    }

    #[tokio::test]
    async fn test_live_display_name_lookup() {
        let names = Names(HashMap::from([("U1".to_string(), "Sam".to_string())]));
        let (server, aggregator, _updates) = live_aggregator(Some(Arc::new(names)));
        aggregator.start().await;
        settle().await;

        server.push(ServerEvent::SharingStarted {
            order_id: "A".into(),
            participant_id: "U1".into(),
            display_name: None,
        });
        settle().await;

        assert_eq!(
            aggregator
                .active_sharers()
                .await
                .get("A")
                .map(|e| e.display_name.clone()),
            Some("Sam".to_string())
        );
    }

    #[tokio::test]
    async fn test_live_disconnect_clears_map() {
        let (server, aggregator, _updates) = live_aggregator(None);
        aggregator.start().await;
        settle().await;
        server.push(ServerEvent::SharingStarted {
            order_id: "A".into(),
            participant_id: "U1".into(),
            display_name: None,
        });
        settle().await;
        assert_eq!(aggregator.active_sharers().await.len(), 1);

        aggregator.disconnect().await;
        aggregator.disconnect().await;
        settle().await;

        assert!(aggregator.active_sharers().await.is_empty());
        assert_eq!(
            aggregator.connection_state().await,
            ConnectionState::Disconnected
        );
        assert!(server.transport_closed());
    }

    #[tokio::test]
    async fn test_live_shares_connection_with_order_rooms() {
        let (server, channel) = MockServer::channel();
        channel.join_room("O1".into(), ParticipantRole::Watcher).await;
        let aggregator = Arc::new(PresenceAggregator::new(
            "R1".into(),
            channel.clone(),
            None,
            CountingSender::default(),
        ));
        aggregator.start().await;
        settle().await;

        aggregator.disconnect().await;
        settle().await;

        assert_eq!(server.connect_count(), 1);
        assert!(channel.is_connected().await, "Order room lost its connection");
    }
}
