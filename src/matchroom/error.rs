use thiserror::Error;

/// Recoverable protocol and gameplay errors. Every variant is reported to the
/// originating client as a `match_error` envelope with the connection left
/// open; transport failures are handled at the pump level instead.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("there is no such event type: {0:?}")]
    UnknownEventType(String),
    #[error("bad payload in request: {0}")]
    BadPayload(String),
    #[error("unsupported time control")]
    UnsupportedTimeControl,
    #[error("unsupported engine elo")]
    UnsupportedLevel,
    #[error("no match")]
    NoMatch,
    #[error("no opponent present")]
    NoOpponent,
    #[error("mismatched player pieces")]
    PlayerMismatch,
    #[error("not players turn")]
    NotYourTurn,
    #[error("invalid move: {0}")]
    InvalidMove(String),
    #[error("engine failure: {0}")]
    EngineFailure(String),
    #[error("missing player clock")]
    MissingClock,
}
