use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::watch;

/// Where a match is in its life. Transitions are monotone:
/// `Waiting → Started → Over`, and `Over` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Waiting,
    Started,
    Over,
}

impl From<u8> for MatchState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Started,
            _ => Self::Over,
        }
    }
}

/// Lock-free lifecycle cell shared by a match and its background tasks.
///
/// The state scalar is read unsynchronized by the watchers; the transition to
/// `Over` latches and fires the over-signal so tasks parked on it exit
/// promptly. The cleanup latch admits exactly one outcome per match no matter
/// which terminator wins the race.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    finished: AtomicBool,
    over: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(initial: MatchState) -> Self {
        let (over, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(initial as u8),
            finished: AtomicBool::new(false),
            over,
        }
    }

    pub fn state(&self) -> MatchState {
        MatchState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_started(&self) {
        let _ = self.state.compare_exchange(
            MatchState::Waiting as u8,
            MatchState::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Latches the terminal state. True only for the caller that won the
    /// transition.
    pub fn set_over(&self) -> bool {
        let previous = self.state.swap(MatchState::Over as u8, Ordering::AcqRel);
        if previous != MatchState::Over as u8 {
            let _ = self.over.send(true);
            return true;
        }
        false
    }

    /// Claims the right to enqueue the cleanup outcome.
    pub fn try_finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn on_over(&self) -> watch::Receiver<bool> {
        self.over.subscribe()
    }
}
