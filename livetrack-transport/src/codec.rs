use log::error;

use livetrack_logic::{ClientEvent, ServerEvent, prelude::*};

pub fn encode(event: &ClientEvent) -> Result<String> {
    serde_json::to_string(event).context("Failed to encode client event")
}

/// Decode one text frame, malformed frames are logged and dropped
pub fn decode(frame: &str) -> Option<ServerEvent> {
    match serde_json::from_str(frame) {
        Ok(event) => Some(event),
        Err(why) => {
            error!("Dropping malformed frame from tracking server: {why}");
            None
        }
    }
}
