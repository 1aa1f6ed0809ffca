use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;

use livetrack_logic::{
    ClientEvent, Connector, ServerEndpoint, Transport, TransportMessage, prelude::*,
};

use crate::codec;

type QueuePair<T> = (mpsc::Sender<T>, Mutex<mpsc::Receiver<T>>);
type UnboundedQueuePair<T> = (mpsc::UnboundedSender<T>, Mutex<mpsc::UnboundedReceiver<T>>);
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUEUE_SIZE: usize = 30;
const MAX_MSG_RECV: usize = 60;

/// Tracking connection over a websocket, one JSON event per text frame.
///
/// Inbound frames are never held back, the socket loop must keep writing even while the
/// reader is busy sending frames of its own.
pub struct WsTransport {
    incoming: UnboundedQueuePair<TransportMessage>,
    outgoing: QueuePair<ClientEvent>,
    cancel_token: CancellationToken,
}

impl WsTransport {
    pub async fn new(endpoint: &ServerEndpoint, token: &str) -> Result<Arc<Self>> {
        let url = endpoint.socket_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .context("Invalid tracking server URL")?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Token can't be sent as a header")?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;

        info!("Opened websocket to {url}");

        let (itx, irx) = mpsc::unbounded_channel();
        let (otx, orx) = mpsc::channel(QUEUE_SIZE);

        let transport = Arc::new(Self {
            incoming: (itx, Mutex::new(irx)),
            outgoing: (otx, Mutex::new(orx)),
            cancel_token: CancellationToken::new(),
        });

        tokio::spawn({
            let transport = transport.clone();
            async move {
                transport.main_loop(socket).await;
            }
        });

        Ok(transport)
    }

    fn push_incoming(&self, msg: TransportMessage) {
        if self.incoming.0.send(msg).is_err() {
            debug!("Transport reader is gone, dropping inbound message");
        }
    }

    async fn main_loop(&self, socket: Socket) {
        let (mut sink, mut stream) = socket.split();

        let mut outgoing_rx = self.outgoing.1.lock().await;
        let mut message_buffer = Vec::with_capacity(QUEUE_SIZE);

        let end = loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    if let Err(why) = sink.send(Message::Close(None)).await {
                        debug!("Error sending close frame: {why}");
                    }
                    break TransportMessage::Disconnected;
                }

                frame = stream.next() => match frame {
                    Some(Ok(msg)) => {
                        if let Some(end) = self.handle_recv(msg) {
                            break end;
                        }
                    }
                    Some(Err(why)) => {
                        break TransportMessage::Error(format!("Connection to server lost: {why}"));
                    }
                    None => break TransportMessage::Disconnected,
                },

                n = outgoing_rx.recv_many(&mut message_buffer, QUEUE_SIZE) => {
                    if n == 0 {
                        break TransportMessage::Disconnected;
                    }
                    if let Err(why) = Self::handle_send(&mut sink, &mut message_buffer).await {
                        break TransportMessage::Error(format!("Failed to send to server: {why}"));
                    }
                }
            }
        };

        self.push_incoming(end);
    }

    async fn handle_send(
        sink: &mut (impl Sink<Message, Error = WsError> + Unpin),
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), WsError> {
        for event in events.drain(..) {
            match codec::encode(&event) {
                Ok(frame) => sink.feed(Message::text(frame)).await?,
                Err(why) => error!("Error encoding event: {why:?}"),
            }
        }
        sink.flush().await
    }

    /// Returns the end-of-connection message if this frame closed the socket
    fn handle_recv(&self, msg: Message) -> Option<TransportMessage> {
        match msg {
            Message::Text(text) => {
                if let Some(event) = codec::decode(text.as_str()) {
                    self.push_incoming(event.into());
                }
                None
            }
            Message::Binary(_) => {
                warn!("Ignoring binary frame from tracking server");
                None
            }
            Message::Close(frame) => {
                info!("Tracking server closed the socket: {frame:?}");
                Some(TransportMessage::Disconnected)
            }
            // Pings are answered by tungstenite
            _ => None,
        }
    }

    pub async fn send_client_event(&self, event: ClientEvent) {
        if self.outgoing.0.send(event).await.is_err() {
            debug!("Socket loop is gone, dropping outbound event");
        }
    }

    pub async fn recv_transport_messages(&self) -> Vec<TransportMessage> {
        let mut incoming_rx = self.incoming.1.lock().await;
        let mut buffer = Vec::with_capacity(MAX_MSG_RECV);
        incoming_rx.recv_many(&mut buffer, MAX_MSG_RECV).await;
        buffer
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl Transport for WsTransport {
    async fn receive_messages(&self) -> Vec<TransportMessage> {
        self.recv_transport_messages().await
    }

    async fn send_event(&self, event: ClientEvent) {
        self.send_client_event(event).await;
    }

    async fn disconnect(&self) {
        self.cancel();
    }
}

/// Opens a [WsTransport] per connection attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &ServerEndpoint, token: &str) -> Result<Arc<WsTransport>> {
        WsTransport::new(endpoint, token).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use livetrack_logic::{ParticipantRole, ServerEvent};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    /// Answers every frame with two events, like a server replaying room state on join
    async fn chatty_server() -> ServerEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("No local address");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("Failed to accept");
            let mut socket = accept_async(stream).await.expect("Handshake failed");
            while let Some(Ok(msg)) = socket.next().await {
                if !msg.is_text() {
                    continue;
                }
                for i in 0..2 {
                    let event = ServerEvent::Error {
                        order_id: None,
                        message: format!("reply {i}"),
                    };
                    let frame = serde_json::to_string(&event).expect("Failed to encode");
                    if socket.send(Message::text(frame)).await.is_err() {
                        return;
                    }
                }
            }
        });

        ServerEndpoint::new(format!("ws://{addr}"), "/tracking")
    }

    #[tokio::test]
    async fn test_sending_while_nobody_reads() {
        let endpoint = chatty_server().await;
        let transport = WsTransport::new(&endpoint, "token")
            .await
            .expect("Failed to connect");

        let sent = tokio::time::timeout(Duration::from_secs(5), async {
            for i in 0..100 {
                transport
                    .send_event(ClientEvent::JoinOrder {
                        order_id: format!("O{i}"),
                        role: ParticipantRole::Watcher,
                    })
                    .await;
            }
        })
        .await;
        assert!(sent.is_ok(), "Sends stalled behind unread replies");

        let mut received = 0;
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while received < 200 {
                let batch = transport.receive_messages().await;
                assert!(!batch.is_empty(), "Transport closed early");
                received += batch
                    .iter()
                    .filter(|m| matches!(m, TransportMessage::Event(_)))
                    .count();
            }
        })
        .await;
        assert!(drained.is_ok(), "Only got {received} replies");

        transport.disconnect().await;
    }
}
