use super::{Client, ClientId, Envelope, EngineTicket, MakeMove, Manager, NewEngineMatch};
use super::{EVENT_ASSIGNED_MATCH, EVENT_MAKE_MOVE, EVENT_MATCH_OVER, EVENT_NEW_ENGINE_MATCH};
use crate::hosting::matchmaking::{CENSUS_INTERVAL, CLEANUP_BUFFER, CLEANUP_INTERVAL};
use crate::matchroom::{
    Color, EngineLevel, EngineMatch, MatchError, MatchId, MatchOutcome, SUPPORTED_ENGINE_LEVELS,
};
use crate::uci::EngineBackend;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use tokio::sync::{mpsc, RwLock};

type EngineClient = Arc<Client<EngineTicket>>;
type Buckets = HashMap<EngineLevel, HashMap<MatchId, Arc<EngineMatch>>>;

/// Owns the engine-match registry, keyed by playing strength.
///
/// Same shape as the matchmaking manager, but there is nobody to pair with:
/// every request allocates a fresh engine session and the match starts
/// immediately. The cleanup sweep additionally quits each match's engine
/// subprocess, whose lifetime is tied to the match.
pub struct EngineManager {
    clients: StdRwLock<HashMap<ClientId, EngineClient>>,
    matches: RwLock<Buckets>,
    cleanup: mpsc::Sender<MatchOutcome<EngineLevel>>,
    backend: Arc<dyn EngineBackend>,
}

impl EngineManager {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Arc<Self> {
        let (cleanup, outcomes) = mpsc::channel(CLEANUP_BUFFER);
        let buckets = SUPPORTED_ENGINE_LEVELS
            .iter()
            .map(|level| (*level, HashMap::new()))
            .collect();
        let manager = Arc::new(Self {
            clients: StdRwLock::new(HashMap::new()),
            matches: RwLock::new(buckets),
            cleanup,
            backend,
        });
        tokio::spawn(Self::cleanup_matches(Arc::downgrade(&manager), outcomes));
        tokio::spawn(Self::census(Arc::downgrade(&manager)));
        manager
    }

    /// Opens an engine session at the requested strength, assigns the client
    /// its pieces by coin flip, and starts the match. When the engine holds
    /// light it plays its first move before this returns.
    async fn new_engine_match(
        &self,
        payload: serde_json::Value,
        client: &EngineClient,
    ) -> Result<(), MatchError> {
        let request: NewEngineMatch =
            serde_json::from_value(payload).map_err(|err| MatchError::BadPayload(err.to_string()))?;
        if !request.elo.is_supported() {
            return Err(MatchError::UnsupportedLevel);
        }
        log::info!(
            "client {} requesting an engine match at elo {}",
            client.id(),
            request.elo
        );

        let session = self
            .backend
            .open(request.elo)
            .await
            .map_err(|err| MatchError::EngineFailure(err.to_string()))?;
        let pieces = assign_player_pieces();

        let m = {
            let mut buckets = self.matches.write().await;
            let bucket = buckets
                .get_mut(&request.elo)
                .ok_or(MatchError::UnsupportedLevel)?;
            let mut id = MatchId::new_v4();
            while bucket.contains_key(&id) {
                log::error!("uuid collision on match id {}", id);
                id = MatchId::new_v4();
            }
            let m = EngineMatch::new(id, request.elo, session, client, pieces, self.cleanup.clone());
            bucket.insert(id, Arc::clone(&m));
            m
        };

        let ticket = EngineTicket {
            match_id: m.id(),
            elo: request.elo,
            pieces,
        };
        client.assign(ticket.clone());
        client.send(Envelope::new(EVENT_ASSIGNED_MATCH, &ticket)).await;
        m.start().await;

        if pieces == Color::Dark {
            if let Err(err) = m.engine_move().await {
                log::error!("engine opening move failed for match {}: {}", m.id(), err);
                m.abort().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Applies the human move, then asks the engine for its reply with the
    /// human clock paused. The clock restarts no matter how the engine fared;
    /// an engine failure abandons the match.
    async fn make_move(
        &self,
        payload: serde_json::Value,
        client: &EngineClient,
    ) -> Result<(), MatchError> {
        let event: MakeMove =
            serde_json::from_value(payload).map_err(|err| MatchError::BadPayload(err.to_string()))?;
        let ticket = client.ticket().ok_or(MatchError::NoMatch)?;

        let m = {
            let buckets = self.matches.read().await;
            buckets
                .get(&ticket.elo)
                .and_then(|bucket| bucket.get(&ticket.match_id))
                .cloned()
                .ok_or(MatchError::NoMatch)?
        };

        if !m.owns(client).await || ticket.pieces != m.player_pieces() {
            return Err(MatchError::PlayerMismatch);
        }

        let over = m.make_move(ticket.pieces, &event.san).await?;
        if over {
            return Ok(());
        }

        m.pause_clock().await;
        let reply = m.engine_move().await;
        m.start_clock().await;
        if let Err(err) = reply {
            log::error!("engine reply failed for match {}: {}", m.id(), err);
            m.abort().await;
            return Err(err);
        }
        Ok(())
    }

    async fn cleanup_matches(
        manager: Weak<Self>,
        mut outcomes: mpsc::Receiver<MatchOutcome<EngineLevel>>,
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

    async fn sweep(&self, finished: &mut Vec<MatchOutcome<EngineLevel>>) {
        if finished.is_empty() {
            return;
        }
        let mut buckets = self.matches.write().await;
        for outcome in finished.drain(..) {
            log::debug!(
                "removing engine match {}: {} {}",
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
            m.close_session().await;
            m.message_player(Envelope::empty(EVENT_MATCH_OVER)).await;
            let client = m.participant().await;
            self.remove_client(&client);
        }
    }

    async fn census(manager: Weak<Self>) {
        let mut ticker = tokio::time::interval(CENSUS_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else { return };
            let clients = manager.clients.read().expect("clients lock").len();
            let matches: usize = manager.matches.read().await.values().map(HashMap::len).sum();
            log::debug!("engine census: {} clients, {} matches", clients, matches);
        }
    }

    #[cfg(test)]
    pub(crate) async fn match_count(&self) -> usize {
        self.matches.read().await.values().map(HashMap::len).sum()
    }
}

fn assign_player_pieces() -> Color {
    if rand::random_range(0..2) == 1 {
        Color::Dark
    } else {
        Color::Light
    }
}

#[async_trait::async_trait]
impl Manager for EngineManager {
    type Ticket = EngineTicket;

    fn add_client(&self, client: &EngineClient) {
        log::debug!("new client {}", client.id());
        self.clients
            .write()
            .expect("clients lock")
            .insert(client.id(), Arc::clone(client));
    }

    fn remove_client(&self, client: &EngineClient) {
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
        client: &EngineClient,
    ) -> Result<(), MatchError> {
        match envelope.kind.as_str() {
            EVENT_NEW_ENGINE_MATCH => self.new_engine_match(envelope.payload, client).await,
            EVENT_MAKE_MOVE => self.make_move(envelope.payload, client).await,
            _ => Err(MatchError::UnknownEventType(envelope.kind.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosting::{EVENT_MATCH_STARTED, EVENT_PROPAGATE_POSITION, PropagatePosition};
    use crate::uci::ScriptedBackend;

    fn request(elo: u16) -> Envelope {
        serde_json::from_str(&format!(
            r#"{{"type":"new_engine_match","payload":{{"elo":{}}}}}"#,
            elo
        ))
        .unwrap()
    }

    fn mv(san: &str) -> Envelope {
        serde_json::from_str(&format!(
            r#"{{"type":"make_move","payload":{{"move":"{}"}}}}"#,
            san
        ))
        .unwrap()
    }

    async fn next_of_kind(rx: &mut mpsc::Receiver<Envelope>, kind: &str) -> Envelope {
        loop {
            let envelope = rx.recv().await.expect("expected another envelope");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    /// Keeps opening matches until the coin flip hands the player `wanted`.
    async fn client_with_pieces(
        manager: &Arc<EngineManager>,
        wanted: Color,
    ) -> (EngineClient, mpsc::Receiver<Envelope>) {
        for _ in 0..64 {
            let (client, rx) = Client::channel();
            manager.add_client(&client);
            manager.route_event(request(1400), &client).await.unwrap();
            if client.ticket().unwrap().pieces == wanted {
                return (client, rx);
            }
        }
        panic!("coin flip never came up {wanted}");
    }

    #[tokio::test(start_paused = true)]
    async fn requests_outside_the_supported_levels_are_rejected() {
        let manager = EngineManager::new(Arc::new(ScriptedBackend::new()));
        let (client, _rx) = Client::channel();
        manager.add_client(&client);

        assert!(matches!(
            manager.route_event(request(1337), &client).await,
            Err(MatchError::UnsupportedLevel)
        ));
        assert!(matches!(
            manager.route_event(Envelope::empty("join_match"), &client).await,
            Err(MatchError::UnknownEventType(_))
        ));
        assert_eq!(manager.match_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_backend_that_cannot_open_fails_the_request() {
        let manager = EngineManager::new(Arc::new(ScriptedBackend::refusing()));
        let (client, _rx) = Client::channel();
        manager.add_client(&client);

        assert!(matches!(
            manager.route_event(request(1400), &client).await,
            Err(MatchError::EngineFailure(_))
        ));
        assert_eq!(manager.match_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_engine_opens_when_it_holds_light() {
        let manager = EngineManager::new(Arc::new(ScriptedBackend::new()));
        let (client, mut rx) = client_with_pieces(&manager, Color::Dark).await;

        let assigned = next_of_kind(&mut rx, EVENT_ASSIGNED_MATCH).await;
        assert_eq!(assigned.payload["pieces"], "dark");
        assert_eq!(assigned.payload["elo"], 1400);
        next_of_kind(&mut rx, EVENT_MATCH_STARTED).await;

        let position = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let position: PropagatePosition = serde_json::from_value(position.payload).unwrap();
        assert_eq!(position.player, Color::Light);
        assert!(position.fen.contains(" b "));

        // a legal reply flows back out as two more positions
        manager.route_event(mv("e5"), &client).await.unwrap();
        let own = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let own: PropagatePosition = serde_json::from_value(own.payload).unwrap();
        assert_eq!(own.player, Color::Dark);
        let reply = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let reply: PropagatePosition = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(reply.player, Color::Light);
    }

    #[tokio::test(start_paused = true)]
    async fn the_player_opens_when_holding_light() {
        let manager = EngineManager::new(Arc::new(ScriptedBackend::new()));
        let (client, mut rx) = client_with_pieces(&manager, Color::Light).await;

        next_of_kind(&mut rx, EVENT_MATCH_STARTED).await;
        manager.route_event(mv("e4"), &client).await.unwrap();

        let own = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let own: PropagatePosition = serde_json::from_value(own.payload).unwrap();
        assert_eq!(own.player, Color::Light);
        assert!(own.fen.contains(" b "));
        let reply = next_of_kind(&mut rx, EVENT_PROPAGATE_POSITION).await;
        let reply: PropagatePosition = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(reply.player, Color::Dark);
        assert!(reply.fen.contains(" w "));
    }

    #[tokio::test(start_paused = true)]
    async fn an_engine_that_dies_mid_game_abandons_the_match() {
        let manager = EngineManager::new(Arc::new(ScriptedBackend::failing()));
        // a dark assignment makes the engine open, which already fails;
        // retry until the player lands on light
        let (client, mut rx) = loop {
            let (client, rx) = Client::channel();
            manager.add_client(&client);
            match manager.route_event(request(1400), &client).await {
                Ok(()) => break (client, rx),
                Err(MatchError::EngineFailure(_)) => continue,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert_eq!(client.ticket().unwrap().pieces, Color::Light);

        let err = manager.route_event(mv("e4"), &client).await.unwrap_err();
        assert!(matches!(err, MatchError::EngineFailure(_)));

        next_of_kind(&mut rx, EVENT_MATCH_OVER).await;
        assert_eq!(manager.match_count().await, 0);
        assert!(client.is_closed());
    }
}
