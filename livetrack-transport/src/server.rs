use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use livetrack_logic::{
    OrderId, OrderLookup, OrderRestaurant, ParticipantId, ProfileDirectory, ProfileRecord,
    RestaurantLocation, ServerEndpoint, TokenProvider, prelude::*,
};

const fn server_host() -> &'static str {
    if let Some(host) = option_env!("TRACKING_SERVER_HOST") {
        host
    } else {
        "localhost"
    }
}

const fn server_port() -> u16 {
    if let Some(port) = option_env!("TRACKING_SERVER_PORT") {
        const_str::parse!(port, u16)
    } else {
        3540
    }
}

const fn server_secure() -> bool {
    if let Some(secure) = option_env!("TRACKING_SERVER_SECURE") {
        const_str::eq_ignore_ascii_case!(secure, "true") || const_str::equal!(secure, "1")
    } else {
        false
    }
}

const fn server_path() -> &'static str {
    if let Some(path) = option_env!("TRACKING_SERVER_PATH") {
        path
    } else {
        "/tracking"
    }
}

const fn server_ws_proto() -> &'static str {
    if server_secure() { "wss" } else { "ws" }
}

const fn server_http_proto() -> &'static str {
    if server_secure() { "https" } else { "http" }
}

const SERVER_HOST: &str = server_host();
const SERVER_PORT: u16 = server_port();
const SERVER_PATH: &str = server_path();
const SERVER_WS_PROTO: &str = server_ws_proto();
const SERVER_HTTP_PROTO: &str = server_http_proto();

const SERVER_SOCKET: &str = const_str::concat!(SERVER_HOST, ":", SERVER_PORT);

const SERVER_WEBSOCKET_URL: &str = const_str::concat!(SERVER_WS_PROTO, "://", SERVER_SOCKET);
pub const SERVER_HTTP_URL: &str = const_str::concat!(SERVER_HTTP_PROTO, "://", SERVER_SOCKET);

/// The tracking endpoint this build was configured for
pub fn default_endpoint() -> ServerEndpoint {
    ServerEndpoint::new(SERVER_WEBSOCKET_URL, SERVER_PATH)
}

fn order_url(base_url: &str, order_id: &OrderId) -> String {
    format!("{}/orders/{order_id}/restaurant", base_url.trim_end_matches('/'))
}

fn profile_url(base_url: &str, participant_id: &ParticipantId) -> String {
    format!("{}/profiles/{participant_id}", base_url.trim_end_matches('/'))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: String,
    token: &dyn TokenProvider,
) -> Result<Option<T>> {
    let resp = client
        .get(url)
        .bearer_auth(token.bearer_token()?)
        .send()
        .await
        .context("Could not send request")?;

    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }

    resp.error_for_status()
        .context("Server returned error")?
        .json::<T>()
        .await
        .map(Some)
        .context("Failed to parse response")
}

async fn put_json<T: serde::Serialize>(
    base_url: &str,
    url: String,
    body: &T,
    token: &dyn TokenProvider,
) -> Result {
    let client = reqwest::Client::builder().build()?;
    client
        .put(url)
        .bearer_auth(token.bearer_token()?)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Could not reach {base_url}"))?
        .error_for_status()
        .context("Server returned error")?;
    Ok(())
}

/// Order lookup over `GET /orders/{id}/restaurant`
pub struct HttpOrderLookup {
    client: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpOrderLookup {
    pub fn new(base_url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl OrderLookup for HttpOrderLookup {
    async fn restaurant_location(&self, order: &OrderId) -> Result<Option<RestaurantLocation>> {
        let url = order_url(&self.base_url, order);
        let body = get_json::<OrderRestaurant>(&self.client, url, self.token.as_ref())
            .await
            .with_context(|| format!("While looking up the restaurant of order {order}"))?;
        Ok(body.map(|b| b.location()))
    }
}

/// Display names over `GET /profiles/{id}`
pub struct HttpProfileDirectory {
    client: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpProfileDirectory {
    pub fn new(base_url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl ProfileDirectory for HttpProfileDirectory {
    async fn display_name(&self, participant: &ParticipantId) -> Result<Option<String>> {
        let url = profile_url(&self.base_url, participant);
        let body = get_json::<ProfileRecord>(&self.client, url, self.token.as_ref())
            .await
            .with_context(|| format!("While looking up profile {participant}"))?;
        Ok(body.map(|p| p.display_name))
    }
}

/// Tell the server where the restaurant of `order_id` is
pub async fn register_order_restaurant(
    base_url: &str,
    order_id: &OrderId,
    body: &OrderRestaurant,
    token: &dyn TokenProvider,
) -> Result {
    put_json(base_url, order_url(base_url, order_id), body, token).await
}

pub async fn register_profile(
    base_url: &str,
    participant_id: &ParticipantId,
    display_name: &str,
    token: &dyn TokenProvider,
) -> Result {
    let body = ProfileRecord {
        display_name: display_name.to_string(),
    };
    put_json(base_url, profile_url(base_url, participant_id), &body, token).await
}
