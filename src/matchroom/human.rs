use super::state::Lifecycle;
use super::{Clock, Color, MatchError, MatchId, MatchOutcome, MatchState, Player, TimeControl};
use crate::hosting::{Client, ClockUpdate, Envelope, MatchTicket, PropagatePosition};
use crate::hosting::{EVENT_CLOCK_UPDATE, EVENT_MATCH_STARTED, EVENT_PROPAGATE_POSITION};
use crate::matchroom::wire_duration;
use crate::rules::{GameBoard, Verdict};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub(crate) const WATCH_TICK: Duration = Duration::from_millis(500);
pub(crate) const BROADCAST_TICK: Duration = Duration::from_secs(1);
pub(crate) const STALE_WAITING: Duration = Duration::from_secs(20);
// max wait time covers both players' clocks with a buffer on top
pub(crate) const STALE_GRACE: Duration = Duration::from_secs(30);

type MatchClient = Arc<Client<MatchTicket>>;

struct Seats {
    light: Option<Player<MatchTicket>>,
    dark: Option<Player<MatchTicket>>,
    board: GameBoard,
    turn: Color,
}

impl Seats {
    fn player(&self, pieces: Color) -> Option<&Player<MatchTicket>> {
        match pieces {
            Color::Light => self.light.as_ref(),
            Color::Dark => self.dark.as_ref(),
            Color::NoColor => None,
        }
    }

    fn swap_running_clock(&self, pieces: Color) -> Result<(), MatchError> {
        let light = self.light.as_ref().and_then(|p| p.clock.as_ref());
        let dark = self.dark.as_ref().and_then(|p| p.clock.as_ref());
        let (Some(light), Some(dark)) = (light, dark) else {
            return Err(MatchError::MissingClock);
        };
        match pieces {
            Color::Light => {
                light.pause();
                dark.start();
            }
            Color::Dark => {
                dark.pause();
                light.start();
            }
            Color::NoColor => {}
        }
        Ok(())
    }
}

/// A clocked game between two connected players.
///
/// Created `Waiting` with the first joiner on light; pairing fills the dark
/// seat and starts the match. Once started, three background tasks cooperate
/// with the move handler: the terminal watcher (rules-engine outcome, clock
/// expiry, external abandonment), the stale watcher (never-joined and
/// overlong matches), and the clock-tick broadcaster. Whichever terminator
/// fires first latches `Over` and enqueues the single cleanup outcome; the
/// owning manager removes the match on its next sweep.
pub struct Match {
    id: MatchId,
    time_control: TimeControl,
    lifecycle: Lifecycle,
    cleanup: mpsc::Sender<MatchOutcome<TimeControl>>,
    seats: Mutex<Seats>,
}

impl Match {
    /// Creates a `Waiting` match and spawns its stale watcher.
    pub fn new(
        id: MatchId,
        time_control: TimeControl,
        cleanup: mpsc::Sender<MatchOutcome<TimeControl>>,
    ) -> Arc<Self> {
        let m = Arc::new(Self {
            id,
            time_control,
            lifecycle: Lifecycle::new(MatchState::Waiting),
            cleanup,
            seats: Mutex::new(Seats {
                light: None,
                dark: None,
                board: GameBoard::new(),
                turn: Color::Light,
            }),
        });
        tokio::spawn(Arc::clone(&m).watch_stale());
        m
    }

    pub fn id(&self) -> MatchId {
        self.id
    }

    pub fn time_control(&self) -> TimeControl {
        self.time_control
    }

    pub fn state(&self) -> MatchState {
        self.lifecycle.state()
    }

    pub async fn seat_light(&self, client: &MatchClient) {
        self.seats.lock().await.light = Some(Player::new(Arc::clone(client)));
    }

    /// Fills the dark seat if the match is still open for pairing.
    pub async fn try_seat_dark(&self, client: &MatchClient) -> bool {
        if self.state() != MatchState::Waiting {
            return false;
        }
        let mut seats = self.seats.lock().await;
        if seats.dark.is_some() {
            return false;
        }
        seats.dark = Some(Player::new(Arc::clone(client)));
        true
    }

    /// Color of the seat this connection occupies, by identity.
    pub async fn client_color(&self, client: &MatchClient) -> Color {
        let seats = self.seats.lock().await;
        if seats.light.as_ref().is_some_and(|p| Arc::ptr_eq(&p.client, client)) {
            return Color::Light;
        }
        if seats.dark.as_ref().is_some_and(|p| Arc::ptr_eq(&p.client, client)) {
            return Color::Dark;
        }
        Color::NoColor
    }

    pub async fn opponent_present(&self, pieces: Color) -> bool {
        let seats = self.seats.lock().await;
        seats.player(pieces.opponent()).is_some()
    }

    pub async fn participants(&self) -> Vec<MatchClient> {
        let seats = self.seats.lock().await;
        [seats.light.as_ref(), seats.dark.as_ref()]
            .into_iter()
            .flatten()
            .map(|p| Arc::clone(&p.client))
            .collect()
    }

    /// Starts a fully seated match: both clocks created, dark's paused, both
    /// players notified, terminal watcher and broadcaster spawned.
    pub async fn start(self: &Arc<Self>) -> Result<(), MatchError> {
        let mut seats = self.seats.lock().await;
        if seats.light.is_none() || seats.dark.is_none() {
            drop(seats);
            self.finish(MatchOutcome::unstarted(self.id, self.time_control)).await;
            return Err(MatchError::NoOpponent);
        }
        let light_clock = Clock::new(self.time_control);
        let dark_clock = Clock::new(self.time_control);
        dark_clock.pause();
        if let Some(light) = seats.light.as_mut() {
            light.clock = Some(light_clock.clone());
        }
        if let Some(dark) = seats.dark.as_mut() {
            dark.clock = Some(dark_clock.clone());
        }
        self.lifecycle.set_started();
        drop(seats);

        self.message_players(Envelope::empty(EVENT_MATCH_STARTED), &[Color::Light, Color::Dark])
            .await;
        tokio::spawn(Arc::clone(self).watch_terminal(light_clock, dark_clock));
        tokio::spawn(Arc::clone(self).broadcast_clocks());
        log::info!("match {} started", self.id);
        Ok(())
    }

    /// Applies `pieces`' move. On success the mover's clock pauses, the
    /// opponent's starts, and the turn flips; returns the resulting position.
    pub async fn make_move(&self, pieces: Color, move_text: &str) -> Result<String, MatchError> {
        if self.state() != MatchState::Started {
            return Err(MatchError::NoMatch);
        }
        let mut seats = self.seats.lock().await;
        if seats.turn != pieces {
            return Err(MatchError::NotYourTurn);
        }
        seats
            .board
            .play_san(move_text)
            .map_err(|err| MatchError::InvalidMove(err.to_string()))?;
        seats.swap_running_clock(pieces)?;
        seats.turn = pieces.opponent();
        Ok(seats.board.fen())
    }

    /// Fans an envelope out to the named seats, skipping absent players.
    pub async fn message_players(&self, envelope: Envelope, colors: &[Color]) {
        let seats = self.seats.lock().await;
        let targets: Vec<MatchClient> = colors
            .iter()
            .filter_map(|color| seats.player(*color).map(|p| Arc::clone(&p.client)))
            .collect();
        drop(seats);
        for client in targets {
            client.send(envelope.clone()).await;
        }
    }

    /// Publishes the position after a move by `pieces` to both players.
    pub async fn propagate_position(&self, pieces: Color, fen: String) {
        let envelope = Envelope::new(
            EVENT_PROPAGATE_POSITION,
            PropagatePosition { player: pieces, fen },
        );
        self.message_players(envelope, &[Color::Light, Color::Dark]).await;
    }

    /// Latches `Over` and enqueues the cleanup outcome, exactly once.
    async fn finish(&self, outcome: MatchOutcome<TimeControl>) {
        self.lifecycle.set_over();
        if self.lifecycle.try_finish() {
            log::info!(
                "match {} over: {} {}",
                self.id,
                outcome.outcome,
                outcome.method
            );
            let _ = self.cleanup.send(outcome).await;
        }
    }

    /// Multiway wait for any completion condition: a terminal position, a
    /// flagged clock on either side, or the state having been yanked out from
    /// under a running game.
    async fn watch_terminal(self: Arc<Self>, light_clock: Clock, dark_clock: Clock) {
        let mut ticker = tokio::time::interval(WATCH_TICK);
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let seats = self.seats.lock().await;
                    if let Some(verdict) = seats.board.verdict() {
                        let method = seats.board.method().unwrap_or_default();
                        break MatchOutcome::decided(self.id, self.time_control, verdict, method);
                    }
                    drop(seats);
                    if self.state() != MatchState::Started {
                        break MatchOutcome::abandoned(self.id, self.time_control);
                    }
                }
                _ = light_clock.done() => {
                    break MatchOutcome::flagged(self.id, self.time_control, Verdict::DarkWon);
                }
                _ = dark_clock.done() => {
                    break MatchOutcome::flagged(self.id, self.time_control, Verdict::LightWon);
                }
            }
        };
        self.finish(outcome).await;
    }

    /// Kills matches nobody ever joined and caps total match lifetime.
    async fn watch_stale(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(WATCH_TICK);
        let mut over = self.lifecycle.on_over();
        let begun = Instant::now();
        let lifetime_cap = self.time_control.duration() * 2 + STALE_GRACE;
        loop {
            tokio::select! {
                _ = over.changed() => return,
                _ = ticker.tick() => {}
            }
            let waited = begun.elapsed();
            if waited >= STALE_WAITING && self.state() == MatchState::Waiting {
                break;
            }
            if waited >= lifetime_cap && self.state() != MatchState::Over {
                break;
            }
        }
        self.finish(MatchOutcome::abandoned(self.id, self.time_control)).await;
    }

    /// Streams the active side's remaining time to both players once per
    /// second. Values are advisory; frames are dropped when a writer is
    /// backed up. The snapshot is taken under the same lock the move handler
    /// mutates, so owner and remaining time are always consistent.
    async fn broadcast_clocks(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(BROADCAST_TICK);
        let mut over = self.lifecycle.on_over();
        loop {
            tokio::select! {
                _ = over.changed() => return,
                _ = ticker.tick() => {}
            }
            if self.state() == MatchState::Over {
                return;
            }
            let seats = self.seats.lock().await;
            let Some(remaining) = seats
                .player(seats.turn)
                .and_then(|p| p.clock.as_ref())
                .map(Clock::time_remaining)
            else {
                return;
            };
            let update = Envelope::new(
                EVENT_CLOCK_UPDATE,
                ClockUpdate {
                    clock_owner: seats.turn,
                    time_remaining: wire_duration(remaining),
                },
            );
            let targets: Vec<MatchClient> = [seats.light.as_ref(), seats.dark.as_ref()]
                .into_iter()
                .flatten()
                .map(|p| Arc::clone(&p.client))
                .collect();
            drop(seats);
            for client in targets {
                client.send_lossy(update.clone());
            }
        }
    }
}
