use serde::{Deserialize, Serialize};

use crate::{
    OrderId, ParticipantId, RestaurantId,
    location::{LocationSample, RestaurantLocation},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, specta::Type)]
pub enum ParticipantRole {
    /// The customer, publishes their own location
    #[serde(rename = "customer", alias = "sharer")]
    Sharer,
    /// The restaurant, consumes locations without publishing
    #[serde(rename = "restaurant", alias = "watcher")]
    Watcher,
}

/// Frames sent from a client to the tracking server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinOrder {
        order_id: OrderId,
        role: ParticipantRole,
    },
    LeaveOrder {
        order_id: OrderId,
    },
    /// Subscribe to events for every order of a restaurant over this connection
    JoinRestaurant {
        restaurant_id: RestaurantId,
    },
    LeaveRestaurant {
        restaurant_id: RestaurantId,
    },
    StartSharing {
        order_id: OrderId,
        participant_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    StopSharing {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    LocationUpdate {
        order_id: OrderId,
        participant_id: ParticipantId,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
    },
}

impl ClientEvent {
    pub fn location_update(
        order_id: OrderId,
        participant_id: ParticipantId,
        sample: &LocationSample,
    ) -> Self {
        Self::LocationUpdate {
            order_id,
            participant_id,
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy_meters,
        }
    }
}

/// Frames pushed from the tracking server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RestaurantLocation {
        order_id: OrderId,
        /// Which restaurant serves the order, scopes restaurant feeds on the client
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restaurant_id: Option<RestaurantId>,
        lat: f64,
        lon: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    LocationUpdate {
        order_id: OrderId,
        participant_id: ParticipantId,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_km: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_formatted: Option<String>,
    },
    SharingStarted {
        order_id: OrderId,
        participant_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    SharingStopped {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    /// A participant's connection went away without an explicit stop
    ParticipantLeft {
        order_id: OrderId,
        participant_id: ParticipantId,
    },
    /// Only sent to the connection whose `start_sharing` was refused
    SharingRejected {
        order_id: OrderId,
        participant_id: ParticipantId,
        reason: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
        message: String,
    },
}

impl ServerEvent {
    pub fn restaurant_location(order_id: OrderId, location: &RestaurantLocation) -> Self {
        Self::RestaurantLocation {
            order_id,
            restaurant_id: None,
            lat: location.lat,
            lon: location.lng,
            name: location.name.clone(),
            address: location.address.clone(),
        }
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            Self::RestaurantLocation { order_id, .. }
            | Self::LocationUpdate { order_id, .. }
            | Self::SharingStarted { order_id, .. }
            | Self::SharingStopped { order_id, .. }
            | Self::ParticipantLeft { order_id, .. }
            | Self::SharingRejected { order_id, .. } => Some(order_id),
            Self::Error { order_id, .. } => order_id.as_ref(),
        }
    }
}

/// Restaurant registered for an order, body of `GET|PUT /orders/{id}/restaurant`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRestaurant {
    pub restaurant_id: RestaurantId,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl OrderRestaurant {
    pub fn location(&self) -> RestaurantLocation {
        RestaurantLocation {
            lat: self.lat,
            lng: self.lon,
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }

    /// The `restaurant_location` push for `order_id`
    pub fn event(&self, order_id: OrderId) -> ServerEvent {
        ServerEvent::RestaurantLocation {
            order_id,
            restaurant_id: Some(self.restaurant_id.clone()),
            lat: self.lat,
            lon: self.lon,
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }
}

/// Body of `GET|PUT /profiles/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_join_order_wire_shape() {
        let ev = ClientEvent::JoinOrder {
            order_id: "O1".into(),
            role: ParticipantRole::Watcher,
        };
        let value = serde_json::to_value(&ev).expect("Failed to serialize");
        assert_eq!(
            value,
            json!({"event": "join_order", "orderId": "O1", "role": "restaurant"})
        );
    }

    #[test]
    fn test_location_update_omits_missing_accuracy() {
        let sample = LocationSample::new(36.8, 10.18, None);
        let ev = ClientEvent::location_update("O1".into(), "U1".into(), &sample);
        let value = serde_json::to_value(&ev).expect("Failed to serialize");
        assert_eq!(
            value,
            json!({
                "event": "location_update",
                "orderId": "O1",
                "participantId": "U1",
                "lat": 36.8,
                "lng": 10.18,
            })
        );
    }

    #[test]
    fn test_decode_fan_out_location_update() {
        let raw = r#"{"event":"location_update","orderId":"O1","participantId":"U1",
            "lat":36.8,"lng":10.18,"distanceKm":1.42,"distanceFormatted":"1.4 km"}"#;
        let ev: ServerEvent = serde_json::from_str(raw).expect("Failed to parse");
        match ev {
            ServerEvent::LocationUpdate {
                distance_km,
                distance_formatted,
                accuracy,
                ..
            } => {
                assert_eq!(distance_km, Some(1.42));
                assert_eq!(distance_formatted.as_deref(), Some("1.4 km"));
                assert_eq!(accuracy, None);
            }
            other => panic!("Decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_restaurant_location_uses_lon() {
        let raw = r#"{"event":"restaurant_location","orderId":"O1","lat":36.81,"lon":10.19}"#;
        let ev: ServerEvent = serde_json::from_str(raw).expect("Failed to parse");
        assert_eq!(
            ev,
            ServerEvent::RestaurantLocation {
                order_id: "O1".into(),
                restaurant_id: None,
                lat: 36.81,
                lon: 10.19,
                name: None,
                address: None,
            }
        );
        assert_eq!(ev.order_id().map(String::as_str), Some("O1"));
    }

    #[test]
    fn test_restaurant_push_carries_restaurant_id() {
        let body = OrderRestaurant {
            restaurant_id: "R1".into(),
            lat: 36.81,
            lon: 10.19,
            name: None,
            address: None,
        };
        let value = serde_json::to_value(body.event("O1".into())).expect("Failed to serialize");
        assert_eq!(
            value,
            json!({
                "event": "restaurant_location",
                "orderId": "O1",
                "restaurantId": "R1",
                "lat": 36.81,
                "lon": 10.19,
            })
        );
    }

    #[test]
    fn test_decode_sharing_rejected() {
        let raw = r#"{"event":"sharing_rejected","orderId":"O1","participantId":"U2",
            "reason":"Order already has an active sharer"}"#;
        let ev: ServerEvent = serde_json::from_str(raw).expect("Failed to parse");
        assert_eq!(
            ev,
            ServerEvent::SharingRejected {
                order_id: "O1".into(),
                participant_id: "U2".into(),
                reason: "Order already has an active sharer".into(),
            }
        );
    }

    #[test]
    fn test_role_accepts_aliases() {
        let role: ParticipantRole = serde_json::from_str(r#""sharer""#).expect("Failed to parse");
        assert_eq!(role, ParticipantRole::Sharer);
    }

    #[test]
    fn test_order_restaurant_body() {
        let raw = r#"{"restaurantId":"R1","lat":36.81,"lon":10.19,"name":"Chez Ali"}"#;
        let body: OrderRestaurant = serde_json::from_str(raw).expect("Failed to parse");
        let loc = body.location();
        assert_eq!((loc.lat, loc.lng), (36.81, 10.19));
        assert_eq!(loc.name.as_deref(), Some("Chez Ali"));
        assert!(loc.address.is_none());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let res = serde_json::from_str::<ServerEvent>(r#"{"event":"teleport","orderId":"O1"}"#);
        assert!(res.is_err());
    }
}
