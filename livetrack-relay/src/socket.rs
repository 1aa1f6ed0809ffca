use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use livetrack_logic::ClientEvent;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::state::{ConnId, RelayState};

/// Run one tracking connection until either side closes it
pub async fn handle_socket(socket: WebSocket, state: RelayState, conn: ConnId) {
    let (tx, mut outbound) = mpsc::unbounded_channel();
    state.add_client(conn, tx);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    break;
                };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(why) => {
                        error!("Failed to encode event for {conn}: {why:?}");
                        continue;
                    }
                };
                if let Err(why) = sink.send(Message::Text(frame.into())).await {
                    warn!("Failed to send to {conn}: {why:?}. Disconnecting...");
                    break;
                }
            }

            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(event) => state.handle(conn, event),
                        Err(why) => {
                            // Recoverable, the rest of the stream is still good
                            error!("Error parsing frame from {conn}: {why}");
                            state.send_error(conn, format!("Malformed frame: {why}"));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Connection {conn} closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(why)) => {
                    warn!("Connection {conn} encountered Axum error: {why:?}. Disconnecting...");
                    break;
                }
            },
        }
    }

    state.remove_client(conn);
}
