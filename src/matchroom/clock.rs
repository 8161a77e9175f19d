use super::TimeControl;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const CLOCK_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockState {
    Running,
    Paused,
    Expired,
}

#[derive(Debug)]
struct ClockInner {
    lifetime: Duration,
    started: Instant,
    elapsed: Duration,
    state: ClockState,
}

impl ClockInner {
    fn remaining(&self) -> Duration {
        let spent = match self.state {
            ClockState::Running => self.elapsed + self.started.elapsed(),
            ClockState::Paused | ClockState::Expired => self.elapsed,
        };
        self.lifetime.saturating_sub(spent)
    }
}

/// Single-shot pausable countdown.
///
/// Starts running on creation; a background ticker recomputes the remaining
/// time and, once it hits zero, latches `Expired` and fires the done-signal
/// exactly once. `Expired` is terminal, so pause and start are idempotent
/// under races with expiry. The done-signal is a watch channel, observable by
/// any number of readers with no receiver required before the fire.
///
/// The ticker holds only a weak handle to the clock state; dropping the last
/// `Clock` unwinds it.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
    done: watch::Receiver<bool>,
}

impl Clock {
    pub fn new(budget: TimeControl) -> Self {
        Self::with_lifetime(budget.duration())
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        let inner = Arc::new(Mutex::new(ClockInner {
            lifetime,
            started: Instant::now(),
            elapsed: Duration::ZERO,
            state: ClockState::Running,
        }));
        let (tx, done) = watch::channel(false);
        tokio::spawn(Self::countdown(Arc::downgrade(&inner), tx));
        Self { inner, done }
    }

    async fn countdown(inner: Weak<Mutex<ClockInner>>, done: watch::Sender<bool>) {
        let mut ticker = tokio::time::interval(CLOCK_TICK);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { return };
            let mut clock = inner.lock().expect("clock state poisoned");
            if clock.remaining() == Duration::ZERO {
                clock.elapsed = clock.lifetime;
                clock.state = ClockState::Expired;
                let _ = done.send(true);
                return;
            }
        }
    }

    /// Freezes the countdown. No-op unless running.
    pub fn pause(&self) {
        let mut clock = self.inner.lock().expect("clock state poisoned");
        if clock.state != ClockState::Running {
            return;
        }
        let elapsed = clock.started.elapsed();
        clock.elapsed += elapsed;
        clock.state = ClockState::Paused;
    }

    /// Resumes the countdown. No-op unless paused.
    pub fn start(&self) {
        let mut clock = self.inner.lock().expect("clock state poisoned");
        if clock.state != ClockState::Paused {
            return;
        }
        clock.started = Instant::now();
        clock.state = ClockState::Running;
    }

    pub fn time_remaining(&self) -> Duration {
        self.inner.lock().expect("clock state poisoned").remaining()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.lock().expect("clock state poisoned").state == ClockState::Expired
    }

    /// Resolves once the countdown has expired.
    pub async fn done(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_within_one_tick_of_its_lifetime() {
        let begun = Instant::now();
        let clock = Clock::with_lifetime(Duration::from_secs(2));
        clock.done().await;
        assert!(clock.is_expired());
        assert_eq!(clock.time_remaining(), Duration::ZERO);
        assert!(begun.elapsed() <= Duration::from_secs(2) + CLOCK_TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_the_countdown() {
        let clock = Clock::with_lifetime(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(10)).await;
        clock.pause();
        let at_pause = clock.time_remaining();
        assert_eq!(at_pause, Duration::from_secs(50));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.time_remaining(), at_pause);
        assert!(!clock.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn start_resumes_where_pause_left_off() {
        let clock = Clock::with_lifetime(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(5)).await;
        clock.pause();
        clock.start();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.time_remaining(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_start_are_idempotent() {
        let clock = Clock::with_lifetime(Duration::from_secs(60));
        clock.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.pause();
        clock.pause();
        let frozen = clock.time_remaining();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(clock.time_remaining(), frozen);
        clock.start();
        clock.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(clock.time_remaining(), frozen - Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_terminal() {
        let clock = Clock::with_lifetime(Duration::from_secs(1));
        clock.done().await;
        clock.start();
        clock.pause();
        assert!(clock.is_expired());
        assert_eq!(clock.time_remaining(), Duration::ZERO);
        // late observers still see the fire
        clock.done().await;
    }
}
