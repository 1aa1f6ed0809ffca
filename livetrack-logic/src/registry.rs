use std::{collections::HashMap, sync::Arc};

use log::{info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::{
    OrderId, ParticipantId, RestaurantId, StateUpdateSender,
    aggregator::PresenceAggregator,
    channel::TrackingChannel,
    events::ParticipantRole,
    location::LocationSource,
    services::{OrderLookup, ProfileDirectory},
    settings::TrackingSettings,
    tracker::{SingleOrderTracker, TrackerPhase},
    transport::Connector,
};

type Tracker<C, L, S> = SingleOrderTracker<C, L, S>;

/// Every live tracking session of this client keyed by order, all sharing one connection
pub struct TrackerRegistry<C: Connector, L: LocationSource, S: StateUpdateSender + Clone> {
    channel: Arc<TrackingChannel<C>>,
    settings: TrackingSettings,
    orders: Option<Arc<dyn OrderLookup>>,
    profiles: Option<Arc<dyn ProfileDirectory>>,
    trackers: RwLock<HashMap<OrderId, Arc<Tracker<C, L, S>>>>,
    aggregator: Mutex<Option<Arc<PresenceAggregator<C, S>>>>,
    state_update_sender: S,
}

impl<C, L, S> TrackerRegistry<C, L, S>
where
    C: Connector,
    L: LocationSource + 'static,
    S: StateUpdateSender + Clone + 'static,
{
    pub fn new(
        channel: Arc<TrackingChannel<C>>,
        settings: TrackingSettings,
        state_update_sender: S,
    ) -> Self {
        Self {
            channel,
            settings,
            orders: None,
            profiles: None,
            trackers: RwLock::new(HashMap::new()),
            aggregator: Mutex::new(None),
            state_update_sender,
        }
    }

    /// Seed restaurant locations from `orders` when a tracker opens
    pub fn with_order_lookup(mut self, orders: Arc<dyn OrderLookup>) -> Self {
        self.orders = Some(orders);
        self
    }

    /// Resolve sharer names for the aggregator through `profiles`
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileDirectory>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn channel(&self) -> &Arc<TrackingChannel<C>> {
        &self.channel
    }

    /// Get the tracker for `order_id`, creating and connecting one if there isn't a live one.
    pub async fn open(
        &self,
        order_id: OrderId,
        participant_id: ParticipantId,
        role: ParticipantRole,
        display_name: Option<String>,
        source: L,
    ) -> Arc<Tracker<C, L, S>> {
        let mut trackers = self.trackers.write().await;
        if let Some(existing) = trackers.get(&order_id) {
            if existing.phase().await != TrackerPhase::Closed {
                return existing.clone();
            }
        }

        info!("Opening tracker for order {order_id}");
        let tracker = Arc::new(SingleOrderTracker::new(
            self.channel.clone(),
            source,
            &self.settings,
            self.state_update_sender.clone(),
        ));
        trackers.insert(order_id.clone(), tracker.clone());
        drop(trackers);

        tracker
            .connect_to_order(order_id.clone(), participant_id, role, display_name)
            .await;

        if let Some(orders) = self.orders.clone() {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                match orders.restaurant_location(&order_id).await {
                    Ok(Some(location)) => tracker.seed_restaurant(location).await,
                    Ok(None) => {}
                    Err(why) => {
                        warn!("Failed to look up restaurant for order {order_id}: {why:?}");
                    }
                }
            });
        }

        tracker
    }

    pub async fn get(&self, order_id: &OrderId) -> Option<Arc<Tracker<C, L, S>>> {
        self.trackers.read().await.get(order_id).cloned()
    }

    pub async fn open_orders(&self) -> Vec<OrderId> {
        self.trackers.read().await.keys().cloned().collect()
    }

    /// Disconnect and forget the tracker for `order_id`
    pub async fn close(&self, order_id: &OrderId) {
        let tracker = self.trackers.write().await.remove(order_id);
        if let Some(tracker) = tracker {
            tracker.disconnect().await;
        }
    }

    /// Tear down every tracker and the aggregator
    pub async fn close_all(&self) {
        let trackers = self
            .trackers
            .write()
            .await
            .drain()
            .map(|(_, t)| t)
            .collect::<Vec<_>>();
        for tracker in trackers {
            tracker.disconnect().await;
        }
        if let Some(aggregator) = self.aggregator.lock().await.take() {
            aggregator.disconnect().await;
        }
        self.channel.disconnect().await;
    }

    /// The shared aggregator for `restaurant_id`, started on first use. Asking for a
    /// different restaurant replaces the previous aggregator.
    pub async fn aggregator(&self, restaurant_id: RestaurantId) -> Arc<PresenceAggregator<C, S>> {
        let mut slot = self.aggregator.lock().await;
        if let Some(existing) = slot.as_ref() {
            if *existing.restaurant_id() == restaurant_id {
                return existing.clone();
            }
        }
        if let Some(previous) = slot.take() {
            previous.disconnect().await;
        }

        let aggregator = Arc::new(PresenceAggregator::new(
            restaurant_id,
            self.channel.clone(),
            self.profiles.clone(),
            self.state_update_sender.clone(),
        ));
        aggregator.start().await;
        *slot = Some(aggregator.clone());
        aggregator
    }
}
