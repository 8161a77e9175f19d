use crate::matchroom::EngineLevel;
use std::time::Duration;

/// Capability for opening strength-limited engine sessions.
/// The production backend launches a UCI subprocess per session; tests swap
/// in a scripted one.
#[async_trait::async_trait]
pub trait EngineBackend: Send + Sync {
    async fn open(&self, level: EngineLevel) -> anyhow::Result<Box<dyn EngineSession>>;
}

/// One live engine bound to a single game.
#[async_trait::async_trait]
pub trait EngineSession: Send {
    /// Best move for the position, in UCI coordinate notation.
    async fn bestmove(&mut self, fen: &str, budget: Duration) -> anyhow::Result<String>;

    /// Releases the engine; the session is unusable afterwards.
    async fn close(&mut self);
}

#[cfg(test)]
pub use scripted::*;

#[cfg(test)]
mod scripted {
    use super::*;
    use shakmaty::fen::Fen;
    use shakmaty::{CastlingMode, Chess, Position};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Test backend whose sessions always play the first legal move.
    pub struct ScriptedBackend {
        refuse_to_open: bool,
        fail_on_move: bool,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self {
                refuse_to_open: false,
                fail_on_move: false,
            }
        }

        pub fn refusing() -> Self {
            Self {
                refuse_to_open: true,
                fail_on_move: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                refuse_to_open: false,
                fail_on_move: true,
            }
        }
    }

    #[async_trait::async_trait]
    impl EngineBackend for ScriptedBackend {
        async fn open(&self, level: EngineLevel) -> anyhow::Result<Box<dyn EngineSession>> {
            anyhow::ensure!(!self.refuse_to_open, "scripted backend refused level {}", level);
            Ok(Box::new(ScriptedSession {
                fail_on_move: self.fail_on_move,
                closed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    pub struct ScriptedSession {
        fail_on_move: bool,
        pub closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl EngineSession for ScriptedSession {
        async fn bestmove(&mut self, fen: &str, _budget: Duration) -> anyhow::Result<String> {
            anyhow::ensure!(!self.fail_on_move, "scripted engine fell over");
            let setup = Fen::from_ascii(fen.as_bytes())?;
            let pos: Chess = setup.into_position(CastlingMode::Standard)?;
            let m = pos
                .legal_moves()
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no legal moves in {}", fen))?;
            Ok(m.to_uci(CastlingMode::Standard).to_string())
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
