use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    events::{ClientEvent, ServerEvent},
    prelude::*,
};

#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// A decoded frame from the server
    Event(Box<ServerEvent>),
    /// The connection closed cleanly, either by us or by the server
    Disconnected,
    /// The connection failed and is gone
    Error(String),
}

impl From<ServerEvent> for TransportMessage {
    fn from(v: ServerEvent) -> Self {
        Self::Event(Box::new(v))
    }
}

/// Where the tracking server lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// e.g. `wss://tracking.example.com`
    pub base_url: String,
    /// e.g. `/tracking`
    pub path: String,
}

impl ServerEndpoint {
    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
        }
    }

    pub fn socket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

/// One live duplex connection to the tracking server.
pub trait Transport: Send + Sync + 'static {
    /// Receive whatever has arrived, waiting for at least one message. An empty batch means
    /// the transport is gone.
    fn receive_messages(&self) -> impl Future<Output = Vec<TransportMessage>> + Send;
    /// Queue a frame to be sent, frames are written in the order they're queued
    fn send_event(&self, event: ClientEvent) -> impl Future<Output = ()> + Send;
    /// Close the connection
    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Opens [Transport]s, the transport loop is expected to be spawned by the connector and run
/// until [Transport::disconnect] or an error.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        endpoint: &ServerEndpoint,
        token: &str,
    ) -> impl Future<Output = Result<Arc<Self::Transport>>> + Send;
}
