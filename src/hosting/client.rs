use super::Envelope;
use crate::matchroom::MatchError;
use actix_ws::{Message, MessageStream, Session};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type ClientId = u64;

const PONG_WAIT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_millis(9_000); // 90% of PONG_WAIT
const MAX_EVENT_BYTES: usize = 512;
const EGRESS_BUFFER: usize = 16;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Capability surface a connection needs from the manager that owns it.
/// Both manager kinds implement it; the pumps never see a concrete manager.
#[async_trait::async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Assignment record kept on this manager's clients.
    type Ticket: Clone + Send + Sync + 'static;

    fn add_client(&self, client: &Arc<Client<Self::Ticket>>);
    fn remove_client(&self, client: &Arc<Client<Self::Ticket>>);
    async fn route_event(
        &self,
        envelope: Envelope,
        client: &Arc<Client<Self::Ticket>>,
    ) -> Result<(), MatchError>;
}

/// One connected player.
///
/// Holds the sending half of the egress channel (the writer pump owns the
/// receiving half), the close signal both pumps watch, and the client's
/// current match assignment. All transport writes funnel through the egress so
/// the writer pump stays the sole producer of data frames.
pub struct Client<T> {
    id: ClientId,
    egress: mpsc::Sender<Envelope>,
    closed: watch::Sender<bool>,
    current: Mutex<Option<T>>,
}

impl<T: Clone> Client<T> {
    /// Creates a client and hands back the writer-side egress endpoint.
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (egress, outbox) = mpsc::channel(EGRESS_BUFFER);
        let (closed, _) = watch::channel(false);
        let client = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            egress,
            closed,
            current: Mutex::new(None),
        });
        (client, outbox)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Enqueues an envelope, waiting for egress capacity.
    /// False once the writer is gone.
    pub async fn send(&self, envelope: Envelope) -> bool {
        self.egress
            .send(envelope)
            .await
            .inspect_err(|_| log::debug!("egress closed for client {}", self.id))
            .is_ok()
    }

    /// Enqueues an advisory envelope, dropping it if the egress is backed up.
    pub fn send_lossy(&self, envelope: Envelope) -> bool {
        self.egress.try_send(envelope).is_ok()
    }

    pub fn assign(&self, ticket: T) {
        *self.current.lock().expect("ticket lock") = Some(ticket);
    }

    pub fn ticket(&self) -> Option<T> {
        self.current.lock().expect("ticket lock").clone()
    }

    /// Signals both pumps to wind down. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn on_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Registers a fresh connection with its manager and spawns the pump tasks.
///
/// The message stream is not `Send`, so the reader stays on the actix worker
/// thread; the writer and the supervisor are free to roam. The supervisor
/// closes the peer pump as soon as either exits, including on panic, and
/// performs the single `remove_client` once both are down.
pub fn serve<M: Manager>(manager: Arc<M>, session: Session, stream: MessageStream) {
    let (client, outbox) = Client::channel();
    manager.add_client(&client);
    let reader = actix_web::rt::spawn(read_pump(
        Arc::clone(&manager),
        Arc::clone(&client),
        session.clone(),
        stream,
    ));
    let writer = tokio::spawn(write_pump(outbox, session, client.on_close()));
    tokio::spawn(supervise(manager, client, reader, writer));
}

async fn supervise<M: Manager>(
    manager: Arc<M>,
    client: Arc<Client<M::Ticket>>,
    mut reader: JoinHandle<()>,
    mut writer: JoinHandle<()>,
) {
    tokio::select! {
        first = &mut reader => {
            report(first, "reader", client.id());
            client.close();
            report(writer.await, "writer", client.id());
        }
        first = &mut writer => {
            report(first, "writer", client.id());
            client.close();
            report(reader.await, "reader", client.id());
        }
    }
    manager.remove_client(&client);
}

fn report(result: Result<(), tokio::task::JoinError>, pump: &str, id: ClientId) {
    if let Err(err) = result {
        if err.is_panic() {
            log::error!("{} pump for client {} panicked: {}", pump, id, err);
        }
    }
}

/// Decodes inbound frames and feeds them to the manager's event router.
///
/// The peer must answer our pings within `PONG_WAIT` of the previous read
/// deadline or the connection is declared dead. Route errors go back to the
/// client as `match_error` envelopes and leave the connection open; transport
/// and decode errors tear it down.
async fn read_pump<M: Manager>(
    manager: Arc<M>,
    client: Arc<Client<M::Ticket>>,
    mut session: Session,
    mut stream: MessageStream,
) {
    let mut closed = client.on_close();
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        let frame = tokio::select! {
            biased;
            res = closed.changed() => {
                if res.is_err() || *closed.borrow() {
                    return;
                }
                continue;
            }
            frame = tokio::time::timeout_at(deadline, stream.next()) => frame,
        };
        let message = match frame {
            Err(_) => {
                log::debug!("client {} missed its pong deadline", client.id());
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                log::error!("error reading message from client {}: {}", client.id(), err);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            // session writes are serialized internally by actix-ws, so
            // answering here cannot interleave with the writer's frames
            Message::Ping(payload) => {
                if session.pong(&payload).await.is_err() {
                    return;
                }
            }
            Message::Text(text) => {
                if text.len() > MAX_EVENT_BYTES {
                    log::error!("client {} sent an oversized frame, dropping it", client.id());
                    return;
                }
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        log::error!("error decoding event from client {}: {}", client.id(), err);
                        return;
                    }
                };
                log::debug!("received {} event from client {}", envelope.kind, client.id());
                if let Err(err) = manager.route_event(envelope, &client).await {
                    log::error!("error handling message from client {}: {}", client.id(), err);
                    client.send(Envelope::error(&err)).await;
                }
            }
            Message::Close(_) => return,
            Message::Binary(_) => {
                log::debug!("ignoring binary frame from client {}", client.id());
            }
            _ => {}
        }
    }
}

/// Sole consumer of the egress channel, multiplexed with the keepalive pinger.
/// Drains whatever is still queued before sending the close frame.
async fn write_pump(
    mut outbox: mpsc::Receiver<Envelope>,
    mut session: Session,
    mut closed: watch::Receiver<bool>,
) {
    let mut pinger = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            res = closed.changed() => {
                if res.is_err() || *closed.borrow() {
                    while let Ok(envelope) = outbox.try_recv() {
                        if write(&mut session, &envelope).await.is_err() {
                            return;
                        }
                    }
                    let _ = session.close(None).await;
                    return;
                }
            }
            maybe = outbox.recv() => match maybe {
                Some(envelope) => {
                    if write(&mut session, &envelope).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = session.close(None).await;
                    return;
                }
            },
            _ = pinger.tick() => {
                if session.ping(b"").await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write(session: &mut Session, envelope: &Envelope) -> Result<(), ()> {
    match serde_json::to_string(envelope) {
        Ok(json) => session.text(json).await.map_err(|_| ()),
        Err(err) => {
            log::error!("failed to encode outbound envelope: {}", err);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosting::EVENT_CLOCK_UPDATE;

    #[tokio::test]
    async fn egress_preserves_enqueue_order() {
        let (client, mut outbox) = Client::<()>::channel();
        client.send(Envelope::empty("first")).await;
        client.send(Envelope::empty("second")).await;
        assert_eq!(outbox.recv().await.unwrap().kind, "first");
        assert_eq!(outbox.recv().await.unwrap().kind, "second");
    }

    #[tokio::test]
    async fn advisory_frames_drop_when_backed_up() {
        let (client, outbox) = Client::<()>::channel();
        for _ in 0..EGRESS_BUFFER {
            assert!(client.send_lossy(Envelope::empty(EVENT_CLOCK_UPDATE)));
        }
        assert!(!client.send_lossy(Envelope::empty(EVENT_CLOCK_UPDATE)));
        drop(outbox);
        assert!(!client.send(Envelope::empty("anything")).await);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (client, _outbox) = Client::<()>::channel();
        let mut closed = client.on_close();
        assert!(!client.is_closed());
        client.close();
        client.close();
        closed.changed().await.unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn tickets_stick_to_the_client() {
        let (client, _outbox) = Client::<u32>::channel();
        assert_eq!(client.ticket(), None);
        client.assign(7);
        assert_eq!(client.ticket(), Some(7));
    }
}
