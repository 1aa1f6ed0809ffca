use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    OrderId, ParticipantId, RestaurantId,
    events::{ClientEvent, ParticipantRole, ServerEvent},
    geo::{DistanceResult, format_distance},
    location::{LocationSample, RestaurantLocation},
    retry::{NoRetry, RetryStrategy},
    services::TokenProvider,
    transport::{Connector, ServerEndpoint, Transport, TransportMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, specta::Type)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a subscriber wants to hear about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feed {
    /// Events for a single order room
    Order(OrderId),
    /// Events for the orders of one restaurant, for restaurant dashboards
    Restaurant(RestaurantId),
}

/// Inbound events delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ConnectionChanged(ConnectionState),
    RestaurantLocation {
        order_id: OrderId,
        location: RestaurantLocation,
    },
    LocationUpdate {
        order_id: OrderId,
        participant_id: ParticipantId,
        sample: LocationSample,
        /// Distance to the restaurant if the server computed one
        distance: Option<DistanceResult>,
    },
    SharingStarted {
        order_id: OrderId,
        participant_id: ParticipantId,
        display_name: Option<String>,
    },
    SharingStopped {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    /// The server refused our `start_sharing`, the declaration is already forgotten
    SharingRejected {
        order_id: OrderId,
        participant_id: ParticipantId,
        reason: String,
    },
    Error(String),
}

impl ChannelEvent {
    fn from_server(event: ServerEvent) -> Option<(Option<OrderId>, Self)> {
        let converted = match event {
            ServerEvent::RestaurantLocation {
                order_id,
                lat,
                lon,
                name,
                address,
                ..
            } => {
                let location = RestaurantLocation {
                    lat,
                    lng: lon,
                    name,
                    address,
                };
                if !LocationSample::new(lat, lon, None).is_valid() {
                    warn!("Dropping restaurant location for {order_id} with bad coordinates");
                    return None;
                }
                (
                    Some(order_id.clone()),
                    Self::RestaurantLocation { order_id, location },
                )
            }
            ServerEvent::LocationUpdate {
                order_id,
                participant_id,
                lat,
                lng,
                accuracy,
                distance_km,
                distance_formatted,
            } => {
                let sample = LocationSample::new(lat, lng, accuracy);
                if !sample.is_valid() {
                    warn!("Dropping location update from {participant_id} with bad coordinates");
                    return None;
                }
                let distance = distance_km
                    .filter(|km| km.is_finite() && *km >= 0.0)
                    .map(|km| DistanceResult {
                        km,
                        formatted: distance_formatted.unwrap_or_else(|| format_distance(km)),
                    });
                (
                    Some(order_id.clone()),
                    Self::LocationUpdate {
                        order_id,
                        participant_id,
                        sample,
                        distance,
                    },
                )
            }
            ServerEvent::SharingStarted {
                order_id,
                participant_id,
                display_name,
            } => (
                Some(order_id.clone()),
                Self::SharingStarted {
                    order_id,
                    participant_id,
                    display_name,
                },
            ),
            ServerEvent::SharingStopped {
                order_id,
                participant_id,
            } => (
                Some(order_id.clone()),
                Self::SharingStopped {
                    order_id,
                    participant_id,
                },
            ),
            ServerEvent::ParticipantLeft {
                order_id,
                participant_id,
            } => (
                Some(order_id.clone()),
                Self::ParticipantLeft {
                    order_id,
                    participant_id,
                },
            ),
            ServerEvent::SharingRejected {
                order_id,
                participant_id,
                reason,
            } => (
                Some(order_id.clone()),
                Self::SharingRejected {
                    order_id,
                    participant_id,
                    reason,
                },
            ),
            ServerEvent::Error { order_id, message } => (order_id, Self::Error(message)),
        };
        Some(converted)
    }
}

type Subscriber = mpsc::UnboundedSender<ChannelEvent>;

struct ChannelState<T: Transport> {
    connection: ConnectionState,
    transport: Option<Arc<T>>,
    /// Cancels the connect/read loop of the current connection generation
    link_cancel: Option<CancellationToken>,
    rooms: HashMap<OrderId, ParticipantRole>,
    restaurants: HashSet<RestaurantId>,
    sharing: HashSet<(OrderId, ParticipantId)>,
    /// Restaurant serving each order, learned from `restaurant_location` pushes
    order_restaurants: HashMap<OrderId, RestaurantId>,
    subscribers: HashMap<Feed, Vec<Subscriber>>,
}

impl<T: Transport> Default for ChannelState<T> {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            transport: None,
            link_cancel: None,
            rooms: HashMap::new(),
            restaurants: HashSet::new(),
            sharing: HashSet::new(),
            order_restaurants: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

impl<T: Transport> ChannelState<T> {
    fn is_idle(&self) -> bool {
        self.rooms.is_empty() && self.restaurants.is_empty()
    }

    /// Send a frame if we're connected, frames are serialized by the channel lock
    async fn send(&self, event: ClientEvent) -> bool {
        match (&self.transport, self.connection) {
            (Some(transport), ConnectionState::Connected) => {
                transport.send_event(event).await;
                true
            }
            _ => false,
        }
    }

    fn broadcast_all(&mut self, event: ChannelEvent) {
        for subs in self.subscribers.values_mut() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            self.connection = connection;
            self.broadcast_all(ChannelEvent::ConnectionChanged(connection));
        }
    }

    /// Whether a restaurant feed should see events of `order_id`. Orders of an unknown
    /// restaurant only reach feeds if they didn't come in through one of our own rooms.
    fn feed_wants(&self, restaurant_id: &RestaurantId, order_id: &OrderId) -> bool {
        match self.order_restaurants.get(order_id) {
            Some(owner) => owner == restaurant_id,
            None => !self.rooms.contains_key(order_id),
        }
    }

    /// Deliver to the order's room subscribers and the feed of its restaurant
    fn route(&mut self, order_id: Option<&OrderId>, event: ChannelEvent) {
        let Some(order_id) = order_id else {
            self.broadcast_all(event);
            return;
        };

        let feeds = self
            .subscribers
            .keys()
            .filter(|feed| match feed {
                Feed::Order(id) => id == order_id,
                Feed::Restaurant(restaurant_id) => self.feed_wants(restaurant_id, order_id),
            })
            .cloned()
            .collect::<Vec<_>>();

        for feed in feeds {
            if let Some(subs) = self.subscribers.get_mut(&feed) {
                subs.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
    }

    /// Bookkeeping for a server event before it's routed
    fn observe(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::RestaurantLocation {
                order_id,
                restaurant_id: Some(restaurant_id),
                ..
            } => {
                self.order_restaurants
                    .insert(order_id.clone(), restaurant_id.clone());
            }
            ServerEvent::SharingRejected {
                order_id,
                participant_id,
                reason,
            } => {
                warn!("Server refused {participant_id} sharing for {order_id}: {reason}");
                self.sharing
                    .remove(&(order_id.clone(), participant_id.clone()));
            }
            _ => {}
        }
    }

    /// Frames that bring the server from `announced` memberships to the current ones
    fn membership_changes(
        &self,
        rooms: &HashMap<OrderId, ParticipantRole>,
        restaurants: &HashSet<RestaurantId>,
    ) -> Vec<ClientEvent> {
        let joins = self
            .rooms
            .iter()
            .filter(|(order_id, role)| rooms.get(*order_id) != Some(*role))
            .map(|(order_id, role)| ClientEvent::JoinOrder {
                order_id: order_id.clone(),
                role: *role,
            });
        let leaves = rooms
            .keys()
            .filter(|order_id| !self.rooms.contains_key(*order_id))
            .map(|order_id| ClientEvent::LeaveOrder {
                order_id: order_id.clone(),
            });
        let feed_joins = self
            .restaurants
            .difference(restaurants)
            .map(|restaurant_id| ClientEvent::JoinRestaurant {
                restaurant_id: restaurant_id.clone(),
            });
        let feed_leaves = restaurants
            .difference(&self.restaurants)
            .map(|restaurant_id| ClientEvent::LeaveRestaurant {
                restaurant_id: restaurant_id.clone(),
            });
        joins
            .chain(leaves)
            .chain(feed_joins)
            .chain(feed_leaves)
            .collect()
    }
}

fn membership_frames(
    rooms: &HashMap<OrderId, ParticipantRole>,
    restaurants: &HashSet<RestaurantId>,
) -> Vec<ClientEvent> {
    let joins = rooms.iter().map(|(order_id, role)| ClientEvent::JoinOrder {
        order_id: order_id.clone(),
        role: *role,
    });
    let feeds = restaurants
        .iter()
        .map(|restaurant_id| ClientEvent::JoinRestaurant {
            restaurant_id: restaurant_id.clone(),
        });
    joins.chain(feeds).collect()
}

enum ReadOutcome {
    Cancelled,
    Closed,
    Lost(String),
}

/// Owns the single tracking connection for an endpoint + credential, and multiplexes
/// order rooms and restaurant feeds over it.
pub struct TrackingChannel<C: Connector> {
    connector: C,
    endpoint: ServerEndpoint,
    token: Box<dyn TokenProvider>,
    retry: Box<dyn RetryStrategy>,
    state: Mutex<ChannelState<C::Transport>>,
}

impl<C: Connector> TrackingChannel<C> {
    pub fn new(connector: C, endpoint: ServerEndpoint, token: impl TokenProvider + 'static) -> Self {
        Self {
            connector,
            endpoint,
            token: Box::new(token),
            retry: Box::new(NoRetry),
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Reconnect on failure according to `retry` instead of giving up immediately
    pub fn with_retry(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Box::new(retry);
        self
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub async fn is_sharing(&self, order_id: &OrderId, participant_id: &ParticipantId) -> bool {
        self.state
            .lock()
            .await
            .sharing
            .contains(&(order_id.clone(), participant_id.clone()))
    }

    /// Start receiving events for `feed`. If the channel is already connected the first
    /// event received will be [ConnectionState::Connected].
    pub async fn subscribe(&self, feed: Feed) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        if state.connection == ConnectionState::Connected {
            tx.send(ChannelEvent::ConnectionChanged(ConnectionState::Connected))
                .ok();
        }
        state.subscribers.entry(feed).or_default().push(tx);
        rx
    }

    /// Open the connection, does nothing if already connected or connecting. Completion is
    /// reported with [ChannelEvent::ConnectionChanged].
    pub async fn connect(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Disconnected {
            return;
        }

        let cancel = CancellationToken::new();
        state.link_cancel = Some(cancel.clone());
        state.set_connection(ConnectionState::Connecting);
        drop(state);

        tokio::spawn({
            let channel = self.clone();
            async move {
                channel.link_loop(cancel).await;
            }
        });
    }

    async fn link_loop(&self, cancel: CancellationToken) {
        let mut failures = 0;

        loop {
            let attempt = async {
                let token = self.token.bearer_token()?;
                self.connector.connect(&self.endpoint, &token).await
            };

            let res = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return;
                }

                res = attempt => res,
            };

            match res {
                Ok(transport) => {
                    let mut state = self.state.lock().await;
                    if cancel.is_cancelled() {
                        drop(state);
                        transport.disconnect().await;
                        return;
                    }
                    info!("Connected to tracking server at {}", self.endpoint.socket_url());
                    failures = 0;
                    state.transport = Some(transport.clone());
                    let rooms = state.rooms.clone();
                    let restaurants = state.restaurants.clone();
                    drop(state);

                    let rejoin = self.rejoin(&transport, &cancel, rooms, restaurants);
                    let read = self.read_loop(&transport, &cancel);
                    tokio::pin!(rejoin, read);
                    let mut rejoined = false;
                    let outcome = loop {
                        tokio::select! {
                            outcome = &mut read => break outcome,
                            _ = &mut rejoin, if !rejoined => rejoined = true,
                        }
                    };

                    let mut state = self.state.lock().await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    state.transport = None;
                    state.sharing.clear();
                    match outcome {
                        ReadOutcome::Cancelled => return,
                        ReadOutcome::Closed => info!("Tracking server closed the connection"),
                        ReadOutcome::Lost(why) => {
                            warn!("Tracking connection lost: {why}");
                            state.route(None, ChannelEvent::Error(why));
                        }
                    }
                    failures += 1;
                }
                Err(why) => {
                    warn!("Failed to connect to tracking server: {why:?}");
                    let mut state = self.state.lock().await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    state.route(
                        None,
                        ChannelEvent::Error(format!("Failed to connect: {why:#}")),
                    );
                    failures += 1;
                }
            }

            let delay = self.retry.delay_for(failures);
            let mut state = self.state.lock().await;
            match delay {
                Some(delay) => {
                    debug!("Reconnecting in {delay:?} (attempt {failures})");
                    state.set_connection(ConnectionState::Connecting);
                    drop(state);
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            return;
                        }

                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    state.link_cancel = None;
                    state.set_connection(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Re-announce memberships on a fresh connection while replies are already being read,
    /// then catch up on anything joined or left meanwhile and report the connection as up
    async fn rejoin(
        &self,
        transport: &C::Transport,
        cancel: &CancellationToken,
        rooms: HashMap<OrderId, ParticipantRole>,
        restaurants: HashSet<RestaurantId>,
    ) {
        for frame in membership_frames(&rooms, &restaurants) {
            transport.send_event(frame).await;
        }

        let mut state = self.state.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        for frame in state.membership_changes(&rooms, &restaurants) {
            transport.send_event(frame).await;
        }
        state.set_connection(ConnectionState::Connected);
    }

    async fn read_loop(&self, transport: &C::Transport, cancel: &CancellationToken) -> ReadOutcome {
        loop {
            let messages = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return ReadOutcome::Cancelled;
                }

                messages = transport.receive_messages() => messages,
            };

            if messages.is_empty() {
                return ReadOutcome::Closed;
            }

            let mut state = self.state.lock().await;
            for msg in messages {
                match msg {
                    TransportMessage::Event(event) => {
                        state.observe(&event);
                        if let Some((order_id, event)) = ChannelEvent::from_server(*event) {
                            state.route(order_id.as_ref(), event);
                        }
                    }
                    TransportMessage::Disconnected => return ReadOutcome::Closed,
                    TransportMessage::Error(why) => return ReadOutcome::Lost(why),
                }
            }
        }
    }

    /// Join an order's room, sent now if connected and again after every reconnect
    pub async fn join_room(&self, order_id: OrderId, role: ParticipantRole) {
        let mut state = self.state.lock().await;
        if state.rooms.insert(order_id.clone(), role) == Some(role) {
            return;
        }
        state.send(ClientEvent::JoinOrder { order_id, role }).await;
    }

    /// Leave an order's room, closing the connection if nothing else is using it
    pub async fn leave_room(&self, order_id: &OrderId) {
        let mut state = self.state.lock().await;
        if state.rooms.remove(order_id).is_none() {
            return;
        }

        let shares = state
            .sharing
            .iter()
            .filter(|(order, _)| order == order_id)
            .cloned()
            .collect::<Vec<_>>();
        for share in shares {
            state.sharing.remove(&share);
            let (order_id, participant_id) = share;
            state
                .send(ClientEvent::StopSharing {
                    order_id,
                    participant_id,
                })
                .await;
        }

        state
            .send(ClientEvent::LeaveOrder {
                order_id: order_id.clone(),
            })
            .await;
        state.subscribers.remove(&Feed::Order(order_id.clone()));

        if state.is_idle() {
            drop(state);
            self.disconnect().await;
        }
    }

    pub async fn join_restaurant(&self, restaurant_id: RestaurantId) {
        let mut state = self.state.lock().await;
        if state.restaurants.insert(restaurant_id.clone()) {
            state.send(ClientEvent::JoinRestaurant { restaurant_id }).await;
        }
    }

    pub async fn leave_restaurant(&self, restaurant_id: &RestaurantId) {
        let mut state = self.state.lock().await;
        if !state.restaurants.remove(restaurant_id) {
            return;
        }
        state
            .send(ClientEvent::LeaveRestaurant {
                restaurant_id: restaurant_id.clone(),
            })
            .await;
        state
            .subscribers
            .remove(&Feed::Restaurant(restaurant_id.clone()));

        if state.is_idle() {
            drop(state);
            self.disconnect().await;
        }
    }

    /// Declare that `participant_id` is sharing for `order_id`. Returns whether a
    /// `start_sharing` frame was sent, repeat calls while sharing send nothing.
    pub async fn start_sharing(
        &self,
        order_id: OrderId,
        participant_id: ParticipantId,
        display_name: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Connected {
            return false;
        }
        if !state
            .sharing
            .insert((order_id.clone(), participant_id.clone()))
        {
            return false;
        }
        state
            .send(ClientEvent::StartSharing {
                order_id,
                participant_id,
                display_name,
            })
            .await
    }

    /// Retract a sharing declaration, returns whether a `stop_sharing` frame was sent
    pub async fn stop_sharing(&self, order_id: OrderId, participant_id: ParticipantId) -> bool {
        let mut state = self.state.lock().await;
        if !state
            .sharing
            .remove(&(order_id.clone(), participant_id.clone()))
        {
            return false;
        }
        state
            .send(ClientEvent::StopSharing {
                order_id,
                participant_id,
            })
            .await
    }

    /// Fire-and-forget publish, dropped unless connected and sharing for this order
    pub async fn publish_location(
        &self,
        order_id: OrderId,
        participant_id: ParticipantId,
        sample: &LocationSample,
    ) {
        let state = self.state.lock().await;
        if !state
            .sharing
            .contains(&(order_id.clone(), participant_id.clone()))
        {
            debug!("Dropping sample for {order_id}, {participant_id} is not sharing");
            return;
        }
        state
            .send(ClientEvent::location_update(order_id, participant_id, sample))
            .await;
    }

    /// Close the connection and forget every room, feed, and subscriber. Safe to call at any
    /// time, including while a connect is in flight.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;

        if let Some(cancel) = state.link_cancel.take() {
            cancel.cancel();
        }

        let shares = state.sharing.drain().collect::<Vec<_>>();
        for (order_id, participant_id) in shares {
            state
                .send(ClientEvent::StopSharing {
                    order_id,
                    participant_id,
                })
                .await;
        }

        let transport = state.transport.take();
        state.rooms.clear();
        state.restaurants.clear();
        state.order_restaurants.clear();
        state.set_connection(ConnectionState::Disconnected);
        state.subscribers.clear();
        drop(state);

        if let Some(transport) = transport {
            transport.disconnect().await;
        }
    }
}
