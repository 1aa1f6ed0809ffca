mod codec;
mod server;
mod ws;

pub use server::{
    HttpOrderLookup, HttpProfileDirectory, SERVER_HTTP_URL, default_endpoint,
    register_order_restaurant, register_profile,
};
pub use ws::{WsConnector, WsTransport};
