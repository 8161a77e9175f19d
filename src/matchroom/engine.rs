use super::human::{BROADCAST_TICK, STALE_GRACE, WATCH_TICK};
use super::state::Lifecycle;
use super::{
    wire_duration, Clock, Color, EngineLevel, MatchError, MatchId, MatchOutcome, MatchState,
    Player, ENGINE_MATCH_TIME_CONTROL,
};
use crate::hosting::{Client, ClockUpdate, Envelope, EngineTicket, PropagatePosition};
use crate::hosting::{EVENT_CLOCK_UPDATE, EVENT_MATCH_STARTED, EVENT_PROPAGATE_POSITION};
use crate::rules::GameBoard;
use crate::uci::EngineSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::Instant;

const ENGINE_THINK_BUDGET: Duration = Duration::from_secs(1);

type EngineClient = Arc<Client<EngineTicket>>;

struct EngineSeats {
    player: Player<EngineTicket>,
    board: GameBoard,
    turn: Color,
}

/// A clocked game between one connected player and a UCI engine.
///
/// The engine side plays without a clock; the human side gets a fixed budget.
/// The session lives in its own lock so a thinking engine never stalls the
/// broadcaster or the terminal watcher, and the subprocess is torn down with
/// the match. An engine failure is terminal: the match is abandoned rather
/// than left in a half-played state.
pub struct EngineMatch {
    id: MatchId,
    level: EngineLevel,
    pieces: Color,
    lifecycle: Lifecycle,
    cleanup: mpsc::Sender<MatchOutcome<EngineLevel>>,
    session: Mutex<Option<Box<dyn EngineSession>>>,
    seats: Mutex<EngineSeats>,
}

impl EngineMatch {
    /// Creates the match with the player seated, their clock running, and the
    /// engine session attached, then spawns the stale watcher.
    pub fn new(
        id: MatchId,
        level: EngineLevel,
        session: Box<dyn EngineSession>,
        client: &EngineClient,
        pieces: Color,
        cleanup: mpsc::Sender<MatchOutcome<EngineLevel>>,
    ) -> Arc<Self> {
        let mut player = Player::new(Arc::clone(client));
        player.clock = Some(Clock::new(ENGINE_MATCH_TIME_CONTROL));
        let m = Arc::new(Self {
            id,
            level,
            pieces,
            lifecycle: Lifecycle::new(MatchState::Waiting),
            cleanup,
            session: Mutex::new(Some(session)),
            seats: Mutex::new(EngineSeats {
                player,
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

    pub fn level(&self) -> EngineLevel {
        self.level
    }

    /// Which pieces the human plays; fixed at creation by coin flip.
    pub fn player_pieces(&self) -> Color {
        self.pieces
    }

    pub fn state(&self) -> MatchState {
        self.lifecycle.state()
    }

    pub async fn owns(&self, client: &EngineClient) -> bool {
        let seats = self.seats.lock().await;
        Arc::ptr_eq(&seats.player.client, client)
    }

    pub async fn participant(&self) -> EngineClient {
        Arc::clone(&self.seats.lock().await.player.client)
    }

    /// Engine matches start immediately: the human clock is already running,
    /// the watchers and broadcaster come up here.
    pub async fn start(self: &Arc<Self>) {
        self.lifecycle.set_started();
        self.message_player(Envelope::empty(EVENT_MATCH_STARTED)).await;
        let clock = self.seats.lock().await.player.clock.clone();
        if let Some(clock) = clock {
            clock.start();
            tokio::spawn(Arc::clone(self).watch_terminal(clock));
        }
        tokio::spawn(Arc::clone(self).broadcast_clock());
        log::info!("engine match {} started at elo {}", self.id, self.level);
    }

    /// Applies the player's move and hands the turn to the engine. Returns
    /// whether the game reached a terminal position, so the caller knows not
    /// to ask the engine for a reply.
    pub async fn make_move(&self, pieces: Color, move_text: &str) -> Result<bool, MatchError> {
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
        seats.turn = self.pieces.opponent();
        let over = seats.board.verdict().is_some();
        let position = Envelope::new(
            EVENT_PROPAGATE_POSITION,
            PropagatePosition {
                player: self.pieces,
                fen: seats.board.fen(),
            },
        );
        let client = Arc::clone(&seats.player.client);
        drop(seats);
        client.send(position).await;
        Ok(over)
    }

    /// Asks the engine for its move with a fixed thinking budget and applies
    /// it. The turn comes back to the player afterwards.
    pub async fn engine_move(&self) -> Result<(), MatchError> {
        let fen = self.seats.lock().await.board.fen();
        let mut session = self.session.lock().await;
        let engine = session
            .as_mut()
            .ok_or_else(|| MatchError::EngineFailure("engine session closed".to_string()))?;
        let best = engine
            .bestmove(&fen, ENGINE_THINK_BUDGET)
            .await
            .map_err(|err| MatchError::EngineFailure(err.to_string()))?;
        drop(session);

        let mut seats = self.seats.lock().await;
        seats
            .board
            .play_uci(&best)
            .map_err(|err| MatchError::EngineFailure(err.to_string()))?;
        seats.turn = self.pieces;
        let position = Envelope::new(
            EVENT_PROPAGATE_POSITION,
            PropagatePosition {
                player: self.pieces.opponent(),
                fen: seats.board.fen(),
            },
        );
        let client = Arc::clone(&seats.player.client);
        drop(seats);
        client.send(position).await;
        Ok(())
    }

    pub async fn pause_clock(&self) {
        if let Some(clock) = self.seats.lock().await.player.clock.as_ref() {
            clock.pause();
        }
    }

    pub async fn start_clock(&self) {
        if let Some(clock) = self.seats.lock().await.player.clock.as_ref() {
            clock.start();
        }
    }

    pub async fn message_player(&self, envelope: Envelope) {
        let client = self.participant().await;
        client.send(envelope).await;
    }

    /// Tears the match down after an unrecoverable engine failure.
    pub async fn abort(&self) {
        self.close_session().await;
        self.finish(MatchOutcome::abandoned(self.id, self.level)).await;
    }

    /// Quits the engine subprocess. Safe to call repeatedly.
    pub async fn close_session(&self) {
        if let Some(mut engine) = self.session.lock().await.take() {
            engine.close().await;
        }
    }

    async fn finish(&self, outcome: MatchOutcome<EngineLevel>) {
        self.lifecycle.set_over();
        if self.lifecycle.try_finish() {
            log::info!(
                "engine match {} over: {} {}",
                self.id,
                outcome.outcome,
                outcome.method
            );
            let _ = self.cleanup.send(outcome).await;
        }
    }

    async fn watch_terminal(self: Arc<Self>, clock: Clock) {
        let mut ticker = tokio::time::interval(WATCH_TICK);
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let seats = self.seats.lock().await;
                    if let Some(verdict) = seats.board.verdict() {
                        let method = seats.board.method().unwrap_or_default();
                        break MatchOutcome::decided(self.id, self.level, verdict, method);
                    }
                    drop(seats);
                    if self.state() != MatchState::Started {
                        break MatchOutcome::abandoned(self.id, self.level);
                    }
                }
                _ = clock.done() => {
                    break match self.pieces.opponent().wins() {
                        Some(verdict) => MatchOutcome::flagged(self.id, self.level, verdict),
                        None => MatchOutcome::abandoned(self.id, self.level),
                    };
                }
            }
        };
        self.close_session().await;
        self.finish(outcome).await;
    }

    /// Engine matches have no overall waiting phase, only the lifetime cap.
    async fn watch_stale(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(WATCH_TICK);
        let mut over = self.lifecycle.on_over();
        let begun = Instant::now();
        let lifetime_cap = ENGINE_MATCH_TIME_CONTROL.duration() * 2 + STALE_GRACE;
        loop {
            tokio::select! {
                _ = over.changed() => return,
                _ = ticker.tick() => {}
            }
            if begun.elapsed() >= lifetime_cap && self.state() != MatchState::Over {
                break;
            }
        }
        self.close_session().await;
        self.finish(MatchOutcome::abandoned(self.id, self.level)).await;
    }

    /// Reports the human clock, and only while it is the human's turn.
    async fn broadcast_clock(self: Arc<Self>) {
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
            if seats.turn != self.pieces {
                continue;
            }
            let Some(remaining) = seats.player.clock.as_ref().map(Clock::time_remaining) else {
                return;
            };
            let update = Envelope::new(
                EVENT_CLOCK_UPDATE,
                ClockUpdate {
                    clock_owner: self.pieces,
                    time_remaining: wire_duration(remaining),
                },
            );
            let client = Arc::clone(&seats.player.client);
            drop(seats);
            client.send_lossy(update);
        }
    }

    #[cfg(test)]
    pub(crate) async fn load_board(&self, board: GameBoard) {
        let mut seats = self.seats.lock().await;
        seats.turn = self.pieces;
        seats.board = board;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uci::ScriptedBackend;
    use crate::uci::EngineBackend;

    async fn fixture(
        pieces: Color,
        backend: ScriptedBackend,
    ) -> (
        Arc<EngineMatch>,
        mpsc::Receiver<MatchOutcome<EngineLevel>>,
        EngineClient,
        mpsc::Receiver<Envelope>,
    ) {
        let (cleanup, outcomes) = mpsc::channel(8);
        let (client, rx) = Client::channel();
        let session = backend.open(EngineLevel(1400)).await.unwrap();
        let m = EngineMatch::new(
            MatchId::new_v4(),
            EngineLevel(1400),
            session,
            &client,
            pieces,
            cleanup,
        );
        (m, outcomes, client, rx)
    }

    async fn next_of_kind(rx: &mut mpsc::Receiver<Envelope>, kind: &str) -> Envelope {
        loop {
            let envelope = rx.recv().await.expect("expected another envelope");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn engine_opens_when_the_player_takes_dark() {
        let (m, _outcomes, _client, mut rx) = fixture(Color::Dark, ScriptedBackend::new()).await;
        m.start().await;
        m.engine_move().await.unwrap();

        next_of_kind(&mut rx, EVENT_MATCH_STARTED).await;
        let position = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let position: PropagatePosition = serde_json::from_value(position.payload).unwrap();
        assert_eq!(position.player, Color::Light);
        assert!(position.fen.contains(" b "));
        assert_eq!(m.seats.lock().await.turn, Color::Dark);
    }

    #[tokio::test(start_paused = true)]
    async fn player_move_flows_into_an_engine_reply() {
        let (m, _outcomes, _client, mut rx) = fixture(Color::Light, ScriptedBackend::new()).await;
        m.start().await;

        let over = m.make_move(Color::Light, "e4").await.unwrap();
        assert!(!over);
        m.engine_move().await.unwrap();

        let first = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let first: PropagatePosition = serde_json::from_value(first.payload).unwrap();
        assert_eq!(first.player, Color::Light);
        let reply = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let reply: PropagatePosition = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(reply.player, Color::Dark);
        assert!(reply.fen.contains(" w "));
        assert_eq!(m.seats.lock().await.turn, Color::Light);
    }

    #[tokio::test(start_paused = true)]
    async fn moves_out_of_turn_are_rejected() {
        let (m, _outcomes, _client, _rx) = fixture(Color::Dark, ScriptedBackend::new()).await;
        m.start().await;
        assert!(matches!(
            m.make_move(Color::Dark, "e5").await,
            Err(MatchError::NotYourTurn)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failure_abandons_the_match() {
        let (m, mut outcomes, _client, _rx) = fixture(Color::Light, ScriptedBackend::failing()).await;
        m.start().await;

        m.make_move(Color::Light, "e4").await.unwrap();
        let err = m.engine_move().await.unwrap_err();
        assert!(matches!(err, MatchError::EngineFailure(_)));
        m.abort().await;

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.outcome, "abandoned");
        assert_eq!(m.state(), MatchState::Over);
        assert!(m.session.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_mating_move_ends_the_match_without_the_engine() {
        let (m, mut outcomes, _client, _rx) = fixture(Color::Dark, ScriptedBackend::new()).await;
        m.start().await;

        let mut board = GameBoard::new();
        for mv in ["f3", "e5", "g4"] {
            board.play_san(mv).unwrap();
        }
        m.load_board(board).await;

        let over = m.make_move(Color::Dark, "Qh4#").await.unwrap();
        assert!(over);

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.outcome, "0-1");
        assert_eq!(outcome.method, "checkmate");
        assert!(m.session.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn flagging_hands_the_win_to_the_engine() {
        let (m, mut outcomes, _client, _rx) = fixture(Color::Light, ScriptedBackend::new()).await;
        m.start().await;

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.outcome, "0-1");
        assert_eq!(outcome.method, "flagged");
        assert!(m.session.lock().await.is_none());
    }
}
