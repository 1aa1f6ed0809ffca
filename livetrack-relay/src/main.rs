mod socket;
mod state;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use livetrack_logic::{LocationSample, OrderRestaurant, ProfileRecord};
use log::{debug, info};
use tokio::net::TcpListener;
use uuid::Uuid;

use anyhow::Context;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    result::Result as StdResult,
};

use state::RelayState;

type Result<T = (), E = anyhow::Error> = StdResult<T, E>;

#[tokio::main]
async fn main() -> Result {
    colog::init();

    let args = std::env::args().collect::<Vec<_>>();
    let socket_addr = args
        .get(1)
        .map(|raw_binding| raw_binding.parse::<SocketAddr>())
        .transpose()
        .context("Invalid socket addr passed")?
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3540));

    let app = router(RelayState::default());

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind {socket_addr}"))?;

    info!(
        "Starting livetrack relay {} on {socket_addr}",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, app)
        .await
        .context("Error while running server")
}

fn router(state: RelayState) -> Router {
    Router::new()
        .route("/tracking", get(tracking_socket))
        .route(
            "/orders/{id}/restaurant",
            get(get_restaurant).put(put_restaurant),
        )
        .route("/profiles/{id}", get(get_profile).put(put_profile))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn tracking_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<RelayState>,
) -> Response {
    if bearer_token(&headers).is_none() {
        debug!("Rejecting tracking connection without a bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let conn = Uuid::new_v4();
    info!("Accepting tracking connection {conn}");
    ws.on_upgrade(move |socket| socket::handle_socket(socket, state, conn))
}

async fn get_restaurant(
    Path(order_id): Path<String>,
    State(state): State<RelayState>,
) -> StdResult<Json<OrderRestaurant>, StatusCode> {
    state
        .restaurant(&order_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn put_restaurant(
    Path(order_id): Path<String>,
    State(state): State<RelayState>,
    Json(body): Json<OrderRestaurant>,
) -> StatusCode {
    if !LocationSample::new(body.lat, body.lon, None).is_valid() {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    info!(
        "Order {order_id} is served by restaurant {}",
        body.restaurant_id
    );
    state.set_restaurant(order_id, body);
    StatusCode::NO_CONTENT
}

async fn get_profile(
    Path(participant_id): Path<String>,
    State(state): State<RelayState>,
) -> StdResult<Json<ProfileRecord>, StatusCode> {
    state
        .profile(&participant_id)
        .map(|display_name| Json(ProfileRecord { display_name }))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn put_profile(
    Path(participant_id): Path<String>,
    State(state): State<RelayState>,
    Json(body): Json<ProfileRecord>,
) -> StatusCode {
    state.set_profile(participant_id, body.display_name);
    StatusCode::NO_CONTENT
}
