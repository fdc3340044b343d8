use serde::{Deserialize, Serialize};

/// Messages the `packet_forge serve` binary broadcasts to its clients.
///
/// Each broadcast is the bare JSON object with no trailing delimiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping,
    Notice { text: String },
}

impl ServerMessage {
    /// Interprets one operator input line; `/ping` sends a ping.
    pub fn from_console_line(line: &str) -> Option<Self> {
        let text = line.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return None;
        }
        if text.trim().eq_ignore_ascii_case("/ping") {
            return Some(ServerMessage::Ping);
        }
        Some(ServerMessage::Notice {
            text: text.to_string(),
        })
    }
}
