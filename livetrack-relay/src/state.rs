use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use livetrack_logic::{
    ClientEvent, DistanceResult, LocationSample, OrderId, OrderRestaurant, ParticipantId,
    ParticipantRole, RestaurantId, ServerEvent,
};
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub type ConnId = Uuid;
pub type Sender = UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sharer {
    conn: ConnId,
    participant_id: ParticipantId,
    display_name: Option<String>,
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<ConnId, ParticipantRole>,
    sharer: Option<Sharer>,
}

#[derive(Debug)]
struct Client {
    sender: Sender,
    orders: HashSet<OrderId>,
    feeds: HashSet<RestaurantId>,
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<OrderId, Room>,
    feeds: HashMap<RestaurantId, HashSet<ConnId>>,
    restaurants: HashMap<OrderId, OrderRestaurant>,
    profiles: HashMap<ParticipantId, String>,
}

impl Inner {
    fn send(&self, conn: ConnId, event: ServerEvent) {
        if let Some(client) = self.clients.get(&conn) {
            if client.sender.send(event).is_err() {
                debug!("Connection {conn} is closing, dropping event");
            }
        }
    }

    fn send_error(&self, conn: ConnId, order_id: Option<OrderId>, message: impl Into<String>) {
        self.send(
            conn,
            ServerEvent::Error {
                order_id,
                message: message.into(),
            },
        );
    }

    /// Everyone that should hear about `order_id`: its room and its restaurant's feed
    fn audience(&self, order_id: &OrderId, except: Option<ConnId>) -> HashSet<ConnId> {
        let room = self
            .rooms
            .get(order_id)
            .into_iter()
            .flat_map(|room| room.members.keys().copied());
        let feed = self
            .restaurants
            .get(order_id)
            .and_then(|r| self.feeds.get(&r.restaurant_id))
            .into_iter()
            .flat_map(|conns| conns.iter().copied());
        room.chain(feed).filter(|c| Some(*c) != except).collect()
    }

    fn fan_out(&self, order_id: &OrderId, except: Option<ConnId>, event: ServerEvent) {
        for conn in self.audience(order_id, except) {
            self.send(conn, event.clone());
        }
    }

    fn sharing_started(&self, order_id: &OrderId, sharer: &Sharer) -> ServerEvent {
        ServerEvent::SharingStarted {
            order_id: order_id.clone(),
            participant_id: sharer.participant_id.clone(),
            display_name: sharer
                .display_name
                .clone()
                .or_else(|| self.profiles.get(&sharer.participant_id).cloned()),
        }
    }

    /// Clear the sharer of `order_id` if it's `conn`, returning who it was
    fn take_sharer(&mut self, order_id: &OrderId, conn: ConnId) -> Option<Sharer> {
        let room = self.rooms.get_mut(order_id)?;
        if room.sharer.as_ref().is_some_and(|s| s.conn == conn) {
            room.sharer.take()
        } else {
            None
        }
    }

    /// End `conn`'s share of `order_id`, `gone` if the connection itself went away
    fn end_sharing(&mut self, conn: ConnId, order_id: &OrderId, gone: bool) {
        let Some(sharer) = self.take_sharer(order_id, conn) else {
            return;
        };
        let order_id = order_id.clone();
        let participant_id = sharer.participant_id;
        let event = if gone {
            ServerEvent::ParticipantLeft {
                order_id: order_id.clone(),
                participant_id,
            }
        } else {
            ServerEvent::SharingStopped {
                order_id: order_id.clone(),
                participant_id,
            }
        };
        self.fan_out(&order_id, Some(conn), event);
    }

    fn leave_order(&mut self, conn: ConnId, order_id: &OrderId, gone: bool) {
        self.end_sharing(conn, order_id, gone);

        if let Some(room) = self.rooms.get_mut(order_id) {
            room.members.remove(&conn);
            if room.members.is_empty() {
                self.rooms.remove(order_id);
            }
        }
        if let Some(client) = self.clients.get_mut(&conn) {
            client.orders.remove(order_id);
        }
    }

    fn leave_feed(&mut self, conn: ConnId, restaurant_id: &RestaurantId) {
        if let Some(conns) = self.feeds.get_mut(restaurant_id) {
            conns.remove(&conn);
            if conns.is_empty() {
                self.feeds.remove(restaurant_id);
            }
        }
        if let Some(client) = self.clients.get_mut(&conn) {
            client.feeds.remove(restaurant_id);
        }
    }

    fn join_order(&mut self, conn: ConnId, order_id: OrderId, role: ParticipantRole) {
        let Some(client) = self.clients.get_mut(&conn) else {
            return;
        };
        client.orders.insert(order_id.clone());
        let room = self.rooms.entry(order_id.clone()).or_default();
        room.members.insert(conn, role);

        let sharer = room.sharer.clone().filter(|s| s.conn != conn);

        if let Some(restaurant) = self.restaurants.get(&order_id) {
            self.send(conn, restaurant.event(order_id.clone()));
        }
        if let Some(sharer) = sharer {
            self.send(conn, self.sharing_started(&order_id, &sharer));
        }
    }

    fn join_restaurant(&mut self, conn: ConnId, restaurant_id: RestaurantId) {
        let Some(client) = self.clients.get_mut(&conn) else {
            return;
        };
        client.feeds.insert(restaurant_id.clone());
        self.feeds
            .entry(restaurant_id.clone())
            .or_default()
            .insert(conn);

        let orders = self
            .restaurants
            .iter()
            .filter(|(_, r)| r.restaurant_id == restaurant_id)
            .map(|(order_id, r)| (order_id.clone(), r.event(order_id.clone())))
            .collect::<Vec<_>>();

        for (order_id, event) in orders {
            self.send(conn, event);
            let sharer = self
                .rooms
                .get(&order_id)
                .and_then(|room| room.sharer.clone())
                .filter(|s| s.conn != conn);
            if let Some(sharer) = sharer {
                self.send(conn, self.sharing_started(&order_id, &sharer));
            }
        }
    }

    fn start_sharing(
        &mut self,
        conn: ConnId,
        order_id: OrderId,
        participant_id: ParticipantId,
        display_name: Option<String>,
    ) {
        let Some(room) = self.rooms.get_mut(&order_id).filter(|r| r.members.contains_key(&conn))
        else {
            self.send(
                conn,
                ServerEvent::SharingRejected {
                    order_id,
                    participant_id,
                    reason: "Join the order before sharing".into(),
                },
            );
            return;
        };

        match &room.sharer {
            Some(current) if current.conn == conn && current.participant_id == participant_id => {
                return;
            }
            Some(current) => {
                info!(
                    "Rejecting {participant_id} as sharer of {order_id}, {} is already sharing",
                    current.participant_id
                );
                self.send(
                    conn,
                    ServerEvent::SharingRejected {
                        order_id,
                        participant_id,
                        reason: "Order already has an active sharer".into(),
                    },
                );
                return;
            }
            None => {}
        }

        let sharer = Sharer {
            conn,
            participant_id,
            display_name,
        };
        room.sharer = Some(sharer.clone());
        let event = self.sharing_started(&order_id, &sharer);
        self.fan_out(&order_id, Some(conn), event);
    }

    fn location_update(
        &self,
        conn: ConnId,
        order_id: OrderId,
        participant_id: ParticipantId,
        sample: LocationSample,
    ) {
        let is_sharer = self
            .rooms
            .get(&order_id)
            .and_then(|room| room.sharer.as_ref())
            .is_some_and(|s| s.conn == conn && s.participant_id == participant_id);
        if !is_sharer {
            debug!("Dropping location for {order_id} from {participant_id}, not the sharer");
            return;
        }
        if !sample.is_valid() {
            warn!("Dropping location for {order_id} with bad coordinates");
            return;
        }

        let distance = self
            .restaurants
            .get(&order_id)
            .map(|r| DistanceResult::between(&sample, &r.location()));

        let event = ServerEvent::LocationUpdate {
            order_id: order_id.clone(),
            participant_id,
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy_meters,
            distance_km: distance.as_ref().map(|d| d.km),
            distance_formatted: distance.map(|d| d.formatted),
        };
        self.fan_out(&order_id, Some(conn), event);
    }
}

/// Everything the relay knows, shared between every connection and the REST routes
#[derive(Debug, Default, Clone)]
pub struct RelayState {
    inner: Arc<Mutex<Inner>>,
}

impl RelayState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_client(&self, conn: ConnId, sender: Sender) {
        self.lock().clients.insert(
            conn,
            Client {
                sender,
                orders: HashSet::new(),
                feeds: HashSet::new(),
            },
        );
    }

    /// Forget a connection, telling rooms it was sharing in that it left
    pub fn remove_client(&self, conn: ConnId) {
        let mut inner = self.lock();
        let Some(client) = inner.clients.get(&conn) else {
            warn!("Trying to remove connection {conn}, which doesn't exist?");
            return;
        };
        let orders = client.orders.iter().cloned().collect::<Vec<_>>();
        let feeds = client.feeds.iter().cloned().collect::<Vec<_>>();
        for order_id in orders {
            inner.leave_order(conn, &order_id, true);
        }
        for restaurant_id in feeds {
            inner.leave_feed(conn, &restaurant_id);
        }
        inner.clients.remove(&conn);
    }

    pub fn send_error(&self, conn: ConnId, message: impl Into<String>) {
        self.lock().send_error(conn, None, message);
    }

    pub fn handle(&self, conn: ConnId, event: ClientEvent) {
        let mut inner = self.lock();
        match event {
            ClientEvent::JoinOrder { order_id, role } => inner.join_order(conn, order_id, role),
            ClientEvent::LeaveOrder { order_id } => inner.leave_order(conn, &order_id, false),
            ClientEvent::JoinRestaurant { restaurant_id } => {
                inner.join_restaurant(conn, restaurant_id)
            }
            ClientEvent::LeaveRestaurant { restaurant_id } => {
                inner.leave_feed(conn, &restaurant_id)
            }
            ClientEvent::StartSharing {
                order_id,
                participant_id,
                display_name,
            } => inner.start_sharing(conn, order_id, participant_id, display_name),
            ClientEvent::StopSharing {
                order_id,
                participant_id,
            } => {
                let is_theirs = inner
                    .rooms
                    .get(&order_id)
                    .and_then(|r| r.sharer.as_ref())
                    .is_some_and(|s| s.participant_id == participant_id);
                if is_theirs {
                    inner.end_sharing(conn, &order_id, false);
                }
            }
            ClientEvent::LocationUpdate {
                order_id,
                participant_id,
                lat,
                lng,
                accuracy,
            } => inner.location_update(
                conn,
                order_id,
                participant_id,
                LocationSample::new(lat, lng, accuracy),
            ),
        }
    }

    /// Register where an order's restaurant is, pushing it to anyone already watching
    pub fn set_restaurant(&self, order_id: OrderId, restaurant: OrderRestaurant) {
        let mut inner = self.lock();
        inner.restaurants.insert(order_id.clone(), restaurant.clone());
        let event = restaurant.event(order_id.clone());
        inner.fan_out(&order_id, None, event);
    }

    pub fn restaurant(&self, order_id: &OrderId) -> Option<OrderRestaurant> {
        self.lock().restaurants.get(order_id).cloned()
    }

    pub fn set_profile(&self, participant_id: ParticipantId, display_name: String) {
        self.lock().profiles.insert(participant_id, display_name);
    }

    pub fn profile(&self, participant_id: &ParticipantId) -> Option<String> {
        self.lock().profiles.get(participant_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    const fn conn(p: u16) -> ConnId {
        Uuid::from_u128(p as u128)
    }

    fn client(state: &RelayState, p: u16) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.add_client(conn(p), tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn join(state: &RelayState, p: u16, order: &str, role: ParticipantRole) {
        state.handle(
            conn(p),
            ClientEvent::JoinOrder {
                order_id: order.into(),
                role,
            },
        );
    }

    fn share(state: &RelayState, p: u16, order: &str, user: &str) {
        state.handle(
            conn(p),
            ClientEvent::StartSharing {
                order_id: order.into(),
                participant_id: user.into(),
                display_name: None,
            },
        );
    }

    fn publish(state: &RelayState, p: u16, order: &str, user: &str, lat: f64, lng: f64) {
        state.handle(
            conn(p),
            ClientEvent::LocationUpdate {
                order_id: order.into(),
                participant_id: user.into(),
                lat,
                lng,
                accuracy: None,
            },
        );
    }

    fn restaurant(id: &str) -> OrderRestaurant {
        OrderRestaurant {
            restaurant_id: id.into(),
            lat: 36.81,
            lon: 10.19,
            name: None,
            address: None,
        }
    }

    #[test]
    fn test_join_pushes_restaurant_location() {
        let state = RelayState::default();
        state.set_restaurant("O1".into(), restaurant("R1"));
        let mut rx = client(&state, 1);

        join(&state, 1, "O1", ParticipantRole::Watcher);

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::RestaurantLocation {
                order_id: "O1".into(),
                restaurant_id: Some("R1".into()),
                lat: 36.81,
                lon: 10.19,
                name: None,
                address: None,
            }]
        );
    }

    #[test]
    fn test_join_unknown_order_sends_nothing() {
        let state = RelayState::default();
        let mut rx = client(&state, 1);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_location_fan_out_with_distance() {
        let state = RelayState::default();
        state.set_restaurant("O1".into(), restaurant("R1"));
        let mut watcher = client(&state, 1);
        let mut sharer = client(&state, 2);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        share(&state, 2, "O1", "U1");
        drain(&mut watcher);
        drain(&mut sharer);

        publish(&state, 2, "O1", "U1", 36.80, 10.18);

        let events = drain(&mut watcher);
        match events.as_slice() {
            [
                ServerEvent::LocationUpdate {
                    distance_formatted,
                    distance_km,
                    ..
                },
            ] => {
                assert_eq!(distance_formatted.as_deref(), Some("1.4 km"));
                assert!(distance_km.is_some_and(|km| (km - 1.42).abs() < 0.05));
            }
            other => panic!("Unexpected events {other:?}"),
        }
        assert!(drain(&mut sharer).is_empty(), "Sharer got its own update");
    }

    #[test]
    fn test_second_sharer_rejected() {
        let state = RelayState::default();
        let mut watcher = client(&state, 1);
        let _first = client(&state, 2);
        let mut second = client(&state, 3);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        join(&state, 3, "O1", ParticipantRole::Sharer);

        share(&state, 2, "O1", "U1");
        share(&state, 3, "O1", "U2");

        assert_eq!(
            drain(&mut second).last(),
            Some(&ServerEvent::SharingRejected {
                order_id: "O1".into(),
                participant_id: "U2".into(),
                reason: "Order already has an active sharer".into(),
            })
        );
        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::SharingStarted {
                order_id: "O1".into(),
                participant_id: "U1".into(),
                display_name: None,
            }]
        );

        // Updates from the rejected sharer go nowhere
        publish(&state, 3, "O1", "U2", 36.8, 10.18);
        assert!(drain(&mut watcher).is_empty());
    }

    #[test]
    fn test_repeat_start_not_refanned() {
        let state = RelayState::default();
        let mut watcher = client(&state, 1);
        let _sharer = client(&state, 2);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        share(&state, 2, "O1", "U1");
        share(&state, 2, "O1", "U1");
        assert_eq!(drain(&mut watcher).len(), 1);
    }

    #[test]
    fn test_share_requires_membership() {
        let state = RelayState::default();
        let mut rx = client(&state, 1);
        share(&state, 1, "O1", "U1");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::SharingRejected { .. }]
        ));
    }

    #[test]
    fn test_late_watcher_learns_of_sharer() {
        let state = RelayState::default();
        let _sharer = client(&state, 2);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        state.set_profile("U1".into(), "Sam".into());
        share(&state, 2, "O1", "U1");

        let mut watcher = client(&state, 1);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::SharingStarted {
                order_id: "O1".into(),
                participant_id: "U1".into(),
                display_name: Some("Sam".into()),
            }]
        );
    }

    #[test]
    fn test_restaurant_feed_sees_every_order() {
        let state = RelayState::default();
        state.set_restaurant("A".into(), restaurant("R1"));
        state.set_restaurant("B".into(), restaurant("R1"));
        state.set_restaurant("C".into(), restaurant("R2"));
        let mut dash = client(&state, 1);
        state.handle(
            conn(1),
            ClientEvent::JoinRestaurant {
                restaurant_id: "R1".into(),
            },
        );
        assert_eq!(drain(&mut dash).len(), 2, "Expected locations of A and B");

        for (p, order) in [(2, "A"), (3, "B"), (4, "C")] {
            client(&state, p);
            join(&state, p, order, ParticipantRole::Sharer);
            share(&state, p, order, &format!("U{p}"));
        }

        let orders = drain(&mut dash)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::SharingStarted { order_id, .. } => Some(order_id),
                _ => None,
            })
            .collect::<HashSet<_>>();
        assert_eq!(orders, HashSet::from(["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn test_stop_sharing_fans_out() {
        let state = RelayState::default();
        let mut watcher = client(&state, 1);
        let _sharer = client(&state, 2);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        share(&state, 2, "O1", "U1");
        drain(&mut watcher);

        state.handle(
            conn(2),
            ClientEvent::StopSharing {
                order_id: "O1".into(),
                participant_id: "U1".into(),
            },
        );
        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::SharingStopped {
                order_id: "O1".into(),
                participant_id: "U1".into(),
            }]
        );

        // A new sharer may take over now
        share(&state, 2, "O1", "U1");
        assert_eq!(drain(&mut watcher).len(), 1);
    }

    #[test]
    fn test_disconnect_announces_participant_left() {
        let state = RelayState::default();
        let mut watcher = client(&state, 1);
        let _sharer = client(&state, 2);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        join(&state, 2, "O1", ParticipantRole::Sharer);
        share(&state, 2, "O1", "U1");
        drain(&mut watcher);

        state.remove_client(conn(2));

        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::ParticipantLeft {
                order_id: "O1".into(),
                participant_id: "U1".into(),
            }]
        );
    }

    #[test]
    fn test_empty_rooms_removed() {
        let state = RelayState::default();
        let _rx = client(&state, 1);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        state.remove_client(conn(1));
        let inner = state.lock();
        assert!(inner.rooms.is_empty());
        assert!(inner.clients.is_empty());
    }

    #[test]
    fn test_late_restaurant_registration_is_pushed() {
        let state = RelayState::default();
        let mut watcher = client(&state, 1);
        join(&state, 1, "O1", ParticipantRole::Watcher);
        state.set_restaurant("O1".into(), restaurant("R1"));
        assert!(matches!(
            drain(&mut watcher).as_slice(),
            [ServerEvent::RestaurantLocation { .. }]
        ));
        assert_eq!(
            state.restaurant(&"O1".into()).map(|r| r.restaurant_id),
            Some("R1".to_string())
        );
    }
}
