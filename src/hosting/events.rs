use crate::matchroom::{Color, EngineLevel, MatchError, MatchId, TimeControl};
use serde::{Deserialize, Serialize};

// Inbound event tags.
pub const EVENT_JOIN_MATCH: &str = "join_match";
pub const EVENT_NEW_ENGINE_MATCH: &str = "new_engine_match";
pub const EVENT_MAKE_MOVE: &str = "make_move";

// Outbound event tags.
pub const EVENT_ASSIGNED_MATCH: &str = "assigned_match";
pub const EVENT_MATCH_STARTED: &str = "match_started";
pub const EVENT_PROPAGATE_POSITION: &str = "propagate_position";
pub const EVENT_CLOCK_UPDATE: &str = "clock_update";
pub const EVENT_MATCH_OVER: &str = "match_over";
pub const EVENT_MATCH_ERROR: &str = "match_error";

/// Tagged JSON envelope carried in both directions on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|err| {
            log::error!("failed to encode {} payload: {}", kind, err);
            serde_json::Value::Null
        });
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn empty(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn error(err: &MatchError) -> Self {
        Self::new(EVENT_MATCH_ERROR, ErrorEvent { error: err.to_string() })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinMatch {
    pub time_control: TimeControl,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewEngineMatch {
    pub elo: EngineLevel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MakeMove {
    #[serde(rename = "move")]
    pub san: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PropagatePosition {
    pub player: Color,
    pub fen: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClockUpdate {
    pub clock_owner: Color,
    pub time_remaining: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
}

/// Assignment published to a matchmade client; kept on the client afterwards
/// so later events can find its match.
#[derive(Debug, Clone, Serialize)]
pub struct MatchTicket {
    pub match_id: MatchId,
    pub time_control: TimeControl,
    pub pieces: Color,
}

/// Assignment published to an engine-match client.
#[derive(Debug, Clone, Serialize)]
pub struct EngineTicket {
    pub match_id: MatchId,
    pub elo: EngineLevel,
    pub pieces: Color,
}
