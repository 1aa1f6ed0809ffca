use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    OrderId, ParticipantId, StateUpdateSender,
    channel::{ChannelEvent, ConnectionState, Feed, TrackingChannel},
    events::ParticipantRole,
    geo::DistanceResult,
    location::{LocationSample, LocationSource, RestaurantLocation, SourceEvent, SourceOptions},
    settings::TrackingSettings,
    transport::Connector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, specta::Type)]
pub enum TrackerPhase {
    /// Not connected to a room
    Idle,
    /// Waiting for the channel to connect
    Connecting,
    /// In the room, not sharing our location
    Connected,
    /// In the room and publishing our location
    Sharing,
    /// Torn down, the tracker can't be used again
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, specta::Type)]
pub enum PreconditionError {
    MissingIdentifier(String),
    /// The tracker is already bound to a different order
    OrderMismatch(OrderId),
    NotConnected,
    NotASharer,
    AlreadySharing,
    PermissionDenied,
    LocationDisabled,
    SessionClosed,
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdentifier(what) => write!(f, "Missing {what}"),
            Self::OrderMismatch(order) => write!(f, "Tracker is bound to order {order}"),
            Self::NotConnected => write!(f, "Not connected to the order"),
            Self::NotASharer => write!(f, "Only the customer can share their location"),
            Self::AlreadySharing => write!(f, "Already sharing location"),
            Self::PermissionDenied => write!(f, "Location permission not granted"),
            Self::LocationDisabled => write!(f, "Location services are disabled"),
            Self::SessionClosed => write!(f, "Tracking session is closed"),
        }
    }
}

/// Everything that can move a [TrackerState]
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerInput {
    Connect {
        order_id: OrderId,
        participant_id: ParticipantId,
        role: ParticipantRole,
        display_name: Option<String>,
    },
    /// Request to start sharing, along with the result of the pre-flight checks
    StartSharing {
        has_permission: bool,
        location_enabled: bool,
    },
    StopSharing,
    Disconnect,
    SeedRestaurant(RestaurantLocation),
    /// The location source could not be started
    SourceFailed(String),
    /// The channel lost the connection before our `start_sharing` went out
    AnnounceFailed,
    Channel(ChannelEvent),
    Source(SourceEvent),
}

/// Side effects the driver must perform after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEffect {
    OpenChannel {
        order_id: OrderId,
        role: ParticipantRole,
    },
    AnnounceSharing {
        order_id: OrderId,
        participant_id: ParticipantId,
        display_name: Option<String>,
    },
    StartSource,
    StopSource,
    RetractSharing {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    Publish {
        order_id: OrderId,
        participant_id: ParticipantId,
        sample: LocationSample,
    },
    LeaveRoom(OrderId),
    NotifyUi,
}

#[derive(Debug, Clone, Serialize, Deserialize, specta::Type)]
/// What the UI gets to see of a tracker
pub struct TrackerSnapshot {
    pub phase: TrackerPhase,
    pub order_id: Option<OrderId>,
    pub role: ParticipantRole,
    pub is_connected: bool,
    pub is_sharing: bool,
    /// Our own latest accepted sample (sharers)
    pub self_location: Option<LocationSample>,
    /// The other side's latest sample (watchers)
    pub peer_location: Option<LocationSample>,
    /// Whether a peer has announced they're sharing
    pub peer_sharing: bool,
    pub restaurant: Option<RestaurantLocation>,
    pub distance: Option<DistanceResult>,
    pub last_error: Option<String>,
}

/// The tracker state machine. Pure, every transition goes through [TrackerState::handle].
#[derive(Debug, Clone)]
pub struct TrackerState {
    phase: TrackerPhase,
    role: ParticipantRole,
    order_id: Option<OrderId>,
    participant_id: Option<ParticipantId>,
    display_name: Option<String>,
    restaurant: Option<RestaurantLocation>,
    self_location: Option<LocationSample>,
    peer_id: Option<ParticipantId>,
    peer_location: Option<LocationSample>,
    /// Distance the server computed for the last peer sample
    peer_distance: Option<DistanceResult>,
    peer_sharing: bool,
    distance: Option<DistanceResult>,
    last_error: Option<String>,
    accuracy_threshold_meters: f64,
}

impl TrackerState {
    pub fn new(settings: &TrackingSettings) -> Self {
        Self {
            phase: TrackerPhase::Idle,
            role: ParticipantRole::Watcher,
            order_id: None,
            participant_id: None,
            display_name: None,
            restaurant: None,
            self_location: None,
            peer_id: None,
            peer_location: None,
            peer_distance: None,
            peer_sharing: false,
            distance: None,
            last_error: None,
            accuracy_threshold_meters: settings.accuracy_threshold_meters,
        }
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn distance(&self) -> Option<&DistanceResult> {
        self.distance.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_sharing(&self) -> bool {
        self.phase == TrackerPhase::Sharing
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            phase: self.phase,
            order_id: self.order_id.clone(),
            role: self.role,
            is_connected: matches!(self.phase, TrackerPhase::Connected | TrackerPhase::Sharing),
            is_sharing: self.is_sharing(),
            self_location: self.self_location.clone(),
            peer_location: self.peer_location.clone(),
            peer_sharing: self.peer_sharing,
            restaurant: self.restaurant.clone(),
            distance: self.distance.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn ids(&self) -> Option<(OrderId, ParticipantId)> {
        Some((self.order_id.clone()?, self.participant_id.clone()?))
    }

    fn reject(&mut self, why: PreconditionError) -> Vec<TrackerEffect> {
        debug!("Rejecting tracker request: {why}");
        self.last_error = Some(why.to_string());
        vec![TrackerEffect::NotifyUi]
    }

    fn recompute_distance(&mut self) {
        let Some(restaurant) = &self.restaurant else {
            self.distance = None;
            return;
        };
        self.distance = match self.role {
            ParticipantRole::Sharer => self
                .self_location
                .as_ref()
                .map(|loc| DistanceResult::between(loc, restaurant)),
            ParticipantRole::Watcher => self.peer_location.as_ref().map(|loc| {
                self.peer_distance
                    .clone()
                    .unwrap_or_else(|| DistanceResult::between(loc, restaurant))
            }),
        };
    }

    /// Stop sharing effects, if we are sharing
    fn wind_down_sharing(&mut self) -> Vec<TrackerEffect> {
        if self.phase != TrackerPhase::Sharing {
            return Vec::new();
        }
        let mut effects = vec![TrackerEffect::StopSource];
        if let Some((order_id, participant_id)) = self.ids() {
            effects.push(TrackerEffect::RetractSharing {
                order_id,
                participant_id,
            });
        }
        effects
    }

    fn clear_peer(&mut self) {
        self.peer_location = None;
        self.peer_distance = None;
        self.peer_sharing = false;
        self.recompute_distance();
    }

    pub fn handle(&mut self, input: TrackerInput) -> Vec<TrackerEffect> {
        if self.phase == TrackerPhase::Closed {
            return match input {
                TrackerInput::Connect { .. } | TrackerInput::StartSharing { .. } => {
                    self.reject(PreconditionError::SessionClosed)
                }
                _ => Vec::new(),
            };
        }

        match input {
            TrackerInput::Connect {
                order_id,
                participant_id,
                role,
                display_name,
            } => self.handle_connect(order_id, participant_id, role, display_name),
            TrackerInput::StartSharing {
                has_permission,
                location_enabled,
            } => self.handle_start_sharing(has_permission, location_enabled),
            TrackerInput::StopSharing => {
                let mut effects = self.wind_down_sharing();
                if !effects.is_empty() {
                    self.phase = TrackerPhase::Connected;
                    effects.push(TrackerEffect::NotifyUi);
                }
                effects
            }
            TrackerInput::Disconnect => {
                let mut effects = self.wind_down_sharing();
                if let Some(order_id) = self.order_id.take() {
                    effects.push(TrackerEffect::LeaveRoom(order_id));
                }
                *self = Self {
                    phase: TrackerPhase::Closed,
                    role: self.role,
                    accuracy_threshold_meters: self.accuracy_threshold_meters,
                    ..Self::new(&TrackingSettings::default())
                };
                effects.push(TrackerEffect::NotifyUi);
                effects
            }
            TrackerInput::SeedRestaurant(location) => {
                if self.restaurant.is_some() {
                    return Vec::new();
                }
                self.restaurant = Some(location);
                self.recompute_distance();
                vec![TrackerEffect::NotifyUi]
            }
            TrackerInput::SourceFailed(why) => {
                let mut effects = self.wind_down_sharing();
                // Source never started, no need to stop it
                effects.retain(|e| *e != TrackerEffect::StopSource);
                if self.phase == TrackerPhase::Sharing {
                    self.phase = TrackerPhase::Connected;
                }
                self.last_error = Some(why);
                effects.push(TrackerEffect::NotifyUi);
                effects
            }
            TrackerInput::AnnounceFailed => {
                if self.phase != TrackerPhase::Sharing {
                    return Vec::new();
                }
                self.abandon_sharing(PreconditionError::NotConnected.to_string())
            }
            TrackerInput::Channel(event) => self.handle_channel(event),
            TrackerInput::Source(event) => self.handle_source(event),
        }
    }

    /// Back to connected when the server never took our declaration, nothing to retract
    fn abandon_sharing(&mut self, why: String) -> Vec<TrackerEffect> {
        let mut effects = self.wind_down_sharing();
        effects.retain(|e| matches!(e, TrackerEffect::StopSource));
        self.phase = TrackerPhase::Connected;
        self.last_error = Some(why);
        effects.push(TrackerEffect::NotifyUi);
        effects
    }

    /// Whether a `Connect` for `order_id` would bind this tracker to it
    fn can_bind(&self, order_id: &OrderId) -> bool {
        self.phase != TrackerPhase::Closed
            && !order_id.trim().is_empty()
            && self.order_id.as_ref().is_none_or(|bound| bound == order_id)
    }

    fn handle_connect(
        &mut self,
        order_id: OrderId,
        participant_id: ParticipantId,
        role: ParticipantRole,
        display_name: Option<String>,
    ) -> Vec<TrackerEffect> {
        if order_id.trim().is_empty() {
            return self.reject(PreconditionError::MissingIdentifier("order id".into()));
        }
        if participant_id.trim().is_empty() {
            return self.reject(PreconditionError::MissingIdentifier(
                "participant id".into(),
            ));
        }
        if let Some(bound) = &self.order_id {
            if *bound != order_id {
                return self.reject(PreconditionError::OrderMismatch(bound.clone()));
            }
        }
        if self.phase != TrackerPhase::Idle {
            // Already connecting or connected to this order
            return Vec::new();
        }

        self.order_id = Some(order_id.clone());
        self.participant_id = Some(participant_id);
        self.role = role;
        self.display_name = display_name;
        self.last_error = None;
        self.phase = TrackerPhase::Connecting;

        vec![
            TrackerEffect::OpenChannel { order_id, role },
            TrackerEffect::NotifyUi,
        ]
    }

    fn handle_start_sharing(
        &mut self,
        has_permission: bool,
        location_enabled: bool,
    ) -> Vec<TrackerEffect> {
        if self.role != ParticipantRole::Sharer {
            return self.reject(PreconditionError::NotASharer);
        }
        if self.phase == TrackerPhase::Sharing {
            return self.reject(PreconditionError::AlreadySharing);
        }
        if self.phase != TrackerPhase::Connected {
            return self.reject(PreconditionError::NotConnected);
        }
        if !has_permission {
            return self.reject(PreconditionError::PermissionDenied);
        }
        if !location_enabled {
            return self.reject(PreconditionError::LocationDisabled);
        }
        let Some((order_id, participant_id)) = self.ids() else {
            return self.reject(PreconditionError::MissingIdentifier("order id".into()));
        };

        self.phase = TrackerPhase::Sharing;
        self.last_error = None;

        vec![
            TrackerEffect::AnnounceSharing {
                order_id,
                participant_id,
                display_name: self.display_name.clone(),
            },
            TrackerEffect::StartSource,
            TrackerEffect::NotifyUi,
        ]
    }

    fn handle_channel(&mut self, event: ChannelEvent) -> Vec<TrackerEffect> {
        match event {
            ChannelEvent::ConnectionChanged(ConnectionState::Connected) => {
                if self.phase != TrackerPhase::Connecting {
                    return Vec::new();
                }
                self.phase = TrackerPhase::Connected;
                self.last_error = None;
                vec![TrackerEffect::NotifyUi]
            }
            ChannelEvent::ConnectionChanged(ConnectionState::Connecting) => {
                if !matches!(self.phase, TrackerPhase::Connected | TrackerPhase::Sharing) {
                    return Vec::new();
                }
                // The channel has already forgotten our sharing declaration
                let mut effects = self.wind_down_sharing();
                effects.retain(|e| matches!(e, TrackerEffect::StopSource));
                self.phase = TrackerPhase::Connecting;
                effects.push(TrackerEffect::NotifyUi);
                effects
            }
            ChannelEvent::ConnectionChanged(ConnectionState::Disconnected) => {
                if self.phase == TrackerPhase::Idle {
                    return Vec::new();
                }
                let mut effects = self.wind_down_sharing();
                effects.retain(|e| matches!(e, TrackerEffect::StopSource));
                self.phase = TrackerPhase::Idle;
                self.last_error
                    .get_or_insert_with(|| "Connection to tracking server lost".into());
                effects.push(TrackerEffect::NotifyUi);
                effects
            }
            ChannelEvent::RestaurantLocation { location, .. } => {
                self.restaurant = Some(location);
                self.recompute_distance();
                vec![TrackerEffect::NotifyUi]
            }
            ChannelEvent::LocationUpdate {
                participant_id,
                sample,
                distance,
                ..
            } => {
                if Some(&participant_id) == self.participant_id.as_ref() {
                    return Vec::new();
                }
                self.peer_id = Some(participant_id);
                self.peer_location = Some(sample);
                self.peer_distance = distance;
                self.recompute_distance();
                vec![TrackerEffect::NotifyUi]
            }
            ChannelEvent::SharingStarted { participant_id, .. } => {
                if Some(&participant_id) == self.participant_id.as_ref() {
                    return Vec::new();
                }
                self.peer_id = Some(participant_id);
                self.peer_sharing = true;
                vec![TrackerEffect::NotifyUi]
            }
            ChannelEvent::SharingStopped { participant_id, .. }
            | ChannelEvent::ParticipantLeft { participant_id, .. } => {
                if self.peer_id.as_ref() != Some(&participant_id) {
                    return Vec::new();
                }
                self.clear_peer();
                vec![TrackerEffect::NotifyUi]
            }
            ChannelEvent::SharingRejected {
                participant_id,
                reason,
                ..
            } => {
                if self.phase != TrackerPhase::Sharing
                    || self.participant_id.as_ref() != Some(&participant_id)
                {
                    return Vec::new();
                }
                self.abandon_sharing(format!("Sharing rejected: {reason}"))
            }
            ChannelEvent::Error(why) => {
                self.last_error = Some(why);
                vec![TrackerEffect::NotifyUi]
            }
        }
    }

    fn handle_source(&mut self, event: SourceEvent) -> Vec<TrackerEffect> {
        match event {
            SourceEvent::Sample(sample) => {
                if self.phase != TrackerPhase::Sharing || !sample.is_valid() {
                    return Vec::new();
                }
                let inaccurate = sample
                    .accuracy_meters
                    .is_some_and(|acc| acc > self.accuracy_threshold_meters);
                if inaccurate && self.self_location.is_some() {
                    debug!(
                        "Discarding sample with accuracy {:?}m",
                        sample.accuracy_meters
                    );
                    return Vec::new();
                }
                let Some((order_id, participant_id)) = self.ids() else {
                    return Vec::new();
                };
                self.self_location = Some(sample.clone());
                self.recompute_distance();
                vec![
                    TrackerEffect::Publish {
                        order_id,
                        participant_id,
                        sample,
                    },
                    TrackerEffect::NotifyUi,
                ]
            }
            SourceEvent::Error(why) => {
                self.last_error = Some(why);
                vec![TrackerEffect::NotifyUi]
            }
        }
    }
}

/// Live tracking for exactly one order, as either the customer sharing their location or a
/// watcher following it. Drives a [TrackerState] from channel and location source events.
pub struct SingleOrderTracker<C: Connector, L: LocationSource, S: StateUpdateSender> {
    state: Mutex<TrackerState>,
    channel: Arc<TrackingChannel<C>>,
    source: L,
    options: SourceOptions,
    state_update_sender: S,
    samples_tx: mpsc::UnboundedSender<SourceEvent>,
    samples_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
    loop_started: AtomicBool,
    cancel: CancellationToken,
}

impl<C: Connector, L: LocationSource + 'static, S: StateUpdateSender + 'static>
    SingleOrderTracker<C, L, S>
{
    pub fn new(
        channel: Arc<TrackingChannel<C>>,
        source: L,
        settings: &TrackingSettings,
        state_update_sender: S,
    ) -> Self {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(TrackerState::new(settings)),
            channel,
            source,
            options: settings.into(),
            state_update_sender,
            samples_tx,
            samples_rx: Mutex::new(Some(samples_rx)),
            loop_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn snapshot(&self) -> TrackerSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn phase(&self) -> TrackerPhase {
        self.state.lock().await.phase()
    }

    /// Join the room for `order_id`, connecting the channel if needed
    pub async fn connect_to_order(
        self: &Arc<Self>,
        order_id: OrderId,
        participant_id: ParticipantId,
        role: ParticipantRole,
        display_name: Option<String>,
    ) {
        // Subscribed before joining, the server answers the join right away
        let receivers = self.claim_event_loop(&order_id).await;

        self.dispatch(TrackerInput::Connect {
            order_id: order_id.clone(),
            participant_id,
            role,
            display_name,
        })
        .await;

        let Some((events, samples)) = receivers else {
            return;
        };
        let bound = self.state.lock().await.order_id.as_ref() == Some(&order_id);
        if !bound {
            drop(events);
            *self.samples_rx.lock().await = Some(samples);
            self.loop_started.store(false, Ordering::SeqCst);
            return;
        }
        tokio::spawn({
            let tracker = self.clone();
            async move {
                tracker.event_loop(events, samples).await;
            }
        });
    }

    /// Start publishing our location. Failed preconditions are recorded in
    /// [TrackerSnapshot::last_error] and leave the tracker as it was.
    pub async fn start_sharing_location(self: &Arc<Self>) {
        let input = TrackerInput::StartSharing {
            has_permission: self.source.has_permission(),
            location_enabled: self.source.is_enabled(),
        };
        self.dispatch(input).await;
    }

    pub async fn stop_sharing_location(self: &Arc<Self>) {
        self.dispatch(TrackerInput::StopSharing).await;
    }

    /// Use a restaurant location from another source until the server pushes one
    pub async fn seed_restaurant(self: &Arc<Self>, location: RestaurantLocation) {
        self.dispatch(TrackerInput::SeedRestaurant(location)).await;
    }

    /// Tear down the session, always succeeds. The tracker can't be reused after this.
    pub async fn disconnect(self: &Arc<Self>) {
        self.dispatch(TrackerInput::Disconnect).await;
        self.cancel.cancel();
    }

    async fn dispatch(self: &Arc<Self>, input: TrackerInput) {
        let mut state = self.state.lock().await;
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for effect in state.handle(input) {
                if let Some(follow_up) = self.execute(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(self: &Arc<Self>, effect: TrackerEffect) -> Option<TrackerInput> {
        match effect {
            TrackerEffect::OpenChannel { order_id, role } => {
                self.channel.join_room(order_id, role).await;
                self.channel.connect().await;
            }
            TrackerEffect::AnnounceSharing {
                order_id,
                participant_id,
                display_name,
            } => {
                let sent = self
                    .channel
                    .start_sharing(order_id.clone(), participant_id.clone(), display_name)
                    .await;
                if !sent && !self.channel.is_sharing(&order_id, &participant_id).await {
                    warn!("Channel dropped the sharing request for {order_id}");
                    return Some(TrackerInput::AnnounceFailed);
                }
            }
            TrackerEffect::StartSource => {
                if let Err(why) = self.source.start(self.options, self.samples_tx.clone()) {
                    warn!("Failed to start location source: {why:?}");
                    return Some(TrackerInput::SourceFailed(format!("{why:#}")));
                }
            }
            TrackerEffect::StopSource => self.source.stop(),
            TrackerEffect::RetractSharing {
                order_id,
                participant_id,
            } => {
                self.channel.stop_sharing(order_id, participant_id).await;
            }
            TrackerEffect::Publish {
                order_id,
                participant_id,
                sample,
            } => {
                self.channel
                    .publish_location(order_id, participant_id, &sample)
                    .await;
            }
            TrackerEffect::LeaveRoom(order_id) => {
                self.channel.leave_room(&order_id).await;
            }
            TrackerEffect::NotifyUi => self.state_update_sender.send_update(),
        }
        None
    }

    /// Receivers for a new event loop, `None` if one is already running or `order_id`
    /// can't be bound
    async fn claim_event_loop(
        &self,
        order_id: &OrderId,
    ) -> Option<(
        mpsc::UnboundedReceiver<ChannelEvent>,
        mpsc::UnboundedReceiver<SourceEvent>,
    )> {
        if !self.state.lock().await.can_bind(order_id) {
            return None;
        }
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let Some(samples) = self.samples_rx.lock().await.take() else {
            self.loop_started.store(false, Ordering::SeqCst);
            return None;
        };
        let events = self.channel.subscribe(Feed::Order(order_id.clone())).await;
        Some((events, samples))
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut samples: mpsc::UnboundedReceiver<SourceEvent>,
    ) {
        loop {
            let input = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break;
                }

                event = events.recv() => event.map(TrackerInput::Channel),

                event = samples.recv() => match event {
                    Some(event) => Some(TrackerInput::Source(event)),
                    None => break,
                },
            };

            let Some(input) = input else {
                // Channel dropped every subscriber, a later connect re-subscribes
                *self.samples_rx.lock().await = Some(samples);
                self.loop_started.store(false, Ordering::SeqCst);
                self.dispatch(TrackerInput::Channel(ChannelEvent::ConnectionChanged(
                    ConnectionState::Disconnected,
                )))
                .await;
                break;
            };

            self.dispatch(input).await;
        }
    }
}
