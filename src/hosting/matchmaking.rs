use super::{Client, Envelope, JoinMatch, MakeMove, Manager, MatchTicket};
use super::{EVENT_ASSIGNED_MATCH, EVENT_JOIN_MATCH, EVENT_MAKE_MOVE, EVENT_MATCH_OVER};
use crate::matchroom::{
    Color, Match, MatchError, MatchId, MatchOutcome, TimeControl, SUPPORTED_TIME_CONTROLS,
};
use super::ClientId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

pub(crate) const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const CENSUS_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const CLEANUP_BUFFER: usize = 64;

type MatchmakingClient = Arc<Client<MatchTicket>>;
type Buckets = HashMap<TimeControl, HashMap<MatchId, Arc<Match>>>;

/// Pairs waiting clients by time control and owns the live match registry.
///
/// The registry is a two-level map with one inner map pre-allocated per
/// supported time control; a bucket existing is equivalent to its key being
/// supported. Matches leave the registry only through the cleanup sweep,
/// which batches outcome records and amortizes the write lock.
pub struct Matchmaker {
    clients: StdRwLock<HashMap<ClientId, MatchmakingClient>>,
    matches: RwLock<Buckets>,
    cleanup: mpsc::Sender<MatchOutcome<TimeControl>>,
}

impl Matchmaker {
    pub fn new() -> Arc<Self> {
        let (cleanup, outcomes) = mpsc::channel(CLEANUP_BUFFER);
        let buckets = SUPPORTED_TIME_CONTROLS
            .iter()
            .map(|tc| (*tc, HashMap::new()))
            .collect();
        let manager = Arc::new(Self {
            clients: StdRwLock::new(HashMap::new()),
            matches: RwLock::new(buckets),
            cleanup,
        });
        tokio::spawn(Self::cleanup_matches(Arc::downgrade(&manager), outcomes));
        tokio::spawn(Self::census(Arc::downgrade(&manager)));
        manager
    }

    /// Pairs the client into the first open seat in its bucket, or opens a
    /// fresh match with the client on light.
    async fn join_match(
        &self,
        payload: serde_json::Value,
        client: &MatchmakingClient,
    ) -> Result<(), MatchError> {
        let join: JoinMatch =
            serde_json::from_value(payload).map_err(|err| MatchError::BadPayload(err.to_string()))?;
        if !join.time_control.is_supported() {
            return Err(MatchError::UnsupportedTimeControl);
        }
        log::info!(
            "client {} joining a {} match",
            client.id(),
            join.time_control
        );

        let mut buckets = self.matches.write().await;
        let bucket = buckets
            .get_mut(&join.time_control)
            .ok_or(MatchError::UnsupportedTimeControl)?;

        let mut paired = None;
        for m in bucket.values() {
            // no created match is ever missing its light player
            if m.try_seat_dark(client).await {
                paired = Some(Arc::clone(m));
                break;
            }
        }
        if let Some(m) = paired {
            drop(buckets);
            let ticket = MatchTicket {
                match_id: m.id(),
                time_control: join.time_control,
                pieces: Color::Dark,
            };
            client.assign(ticket.clone());
            client.send(Envelope::new(EVENT_ASSIGNED_MATCH, &ticket)).await;
            // both players are now present, the game can begin
            return m.start().await;
        }

        let mut id = MatchId::new_v4();
        while bucket.contains_key(&id) {
            log::error!("uuid collision on match id {}", id);
            id = MatchId::new_v4();
        }
        let m = Match::new(id, join.time_control, self.cleanup.clone());
        m.seat_light(client).await;
        bucket.insert(id, m);
        drop(buckets);

        let ticket = MatchTicket {
            match_id: id,
            time_control: join.time_control,
            pieces: Color::Light,
        };
        client.assign(ticket.clone());
        client.send(Envelope::new(EVENT_ASSIGNED_MATCH, &ticket)).await;
        Ok(())
    }

    async fn make_move(
        &self,
        payload: serde_json::Value,
        client: &MatchmakingClient,
    ) -> Result<(), MatchError> {
        let event: MakeMove =
            serde_json::from_value(payload).map_err(|err| MatchError::BadPayload(err.to_string()))?;
        let ticket = client.ticket().ok_or(MatchError::NoMatch)?;

        let m = {
            let buckets = self.matches.read().await;
            buckets
                .get(&ticket.time_control)
                .and_then(|bucket| bucket.get(&ticket.match_id))
                .cloned()
                .ok_or(MatchError::NoMatch)?
        };

        let pieces = m.client_color(client).await;
        if pieces == Color::NoColor || pieces != ticket.pieces {
            return Err(MatchError::PlayerMismatch);
        }
        if !m.opponent_present(pieces).await {
            return Err(MatchError::NoOpponent);
        }

        let fen = m.make_move(pieces, &event.san).await?;
        m.propagate_position(pieces, fen).await;
        Ok(())
    }

    /// Buffers outcome records and, on a fixed interval, removes the finished
    /// matches under one write lock, notifying and disconnecting their
    /// participants.
    async fn cleanup_matches(
        manager: Weak<Self>,
        mut outcomes: mpsc::Receiver<MatchOutcome<TimeControl>>,
    ) {
        let mut sweep = tokio::time::interval(CLEANUP_INTERVAL);
        let mut finished = Vec::new();
        loop {
            tokio::select! {
                maybe = outcomes.recv() => match maybe {
                    Some(outcome) => finished.push(outcome),
                    None => return,
                },
                _ = sweep.tick() => {
                    let Some(manager) = manager.upgrade() else { return };
                    manager.sweep(&mut finished).await;
                }
            }
        }
    }

    async fn sweep(&self, finished: &mut Vec<MatchOutcome<TimeControl>>) {
        if finished.is_empty() {
            return;
        }
        let mut buckets = self.matches.write().await;
        for outcome in finished.drain(..) {
            log::debug!(
                "removing match {}: {} {}",
                outcome.id,
                outcome.outcome,
                outcome.method
            );
            let Some(m) = buckets
                .get_mut(&outcome.bucket)
                .and_then(|bucket| bucket.remove(&outcome.id))
            else {
                continue;
            };
            m.message_players(Envelope::empty(EVENT_MATCH_OVER), &[Color::Light, Color::Dark])
                .await;
            for client in m.participants().await {
                self.remove_client(&client);
            }
        }
    }

    async fn census(manager: Weak<Self>) {
        let mut ticker = tokio::time::interval(CENSUS_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else { return };
            let clients = manager.clients.read().expect("clients lock").len();
            let matches: usize = manager.matches.read().await.values().map(HashMap::len).sum();
            log::debug!("matchmaking census: {} clients, {} matches", clients, matches);
        }
    }

    #[cfg(test)]
    pub(crate) async fn match_count(&self) -> usize {
        self.matches.read().await.values().map(HashMap::len).sum()
    }
}

#[async_trait::async_trait]
impl Manager for Matchmaker {
    type Ticket = MatchTicket;

    fn add_client(&self, client: &MatchmakingClient) {
        log::debug!("new client {}", client.id());
        self.clients
            .write()
            .expect("clients lock")
            .insert(client.id(), Arc::clone(client));
    }

    fn remove_client(&self, client: &MatchmakingClient) {
        if self
            .clients
            .write()
            .expect("clients lock")
            .remove(&client.id())
            .is_some()
        {
            log::debug!("removed client {}", client.id());
            client.close();
        }
    }

    async fn route_event(
        &self,
        envelope: Envelope,
        client: &MatchmakingClient,
    ) -> Result<(), MatchError> {
        match envelope.kind.as_str() {
            EVENT_JOIN_MATCH => self.join_match(envelope.payload, client).await,
            EVENT_MAKE_MOVE => self.make_move(envelope.payload, client).await,
            _ => Err(MatchError::UnknownEventType(envelope.kind.clone())),
        }
    }
}
