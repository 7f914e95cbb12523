//! Session registry and frame router.
//!
//! One producer and N subscribers meet in a session keyed by `processId`.
//! The producer's terminal output fans out to every subscriber in producer
//! order; subscriber input merges into a single queue toward the producer.
//! The producer owns the session lifetime: when it disconnects, the id
//! leaves the registry and every subscriber is cancelled.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::future::join_all;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::Frame;

/// Bound on both per-session queues; gives a slow peer backpressure without
/// letting it hold unbounded memory.
const CHANNEL_CAPACITY: usize = 100;
const CLOSE_DEADLINE: Duration = Duration::from_secs(1);

type SubscriberSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Process,
    Client,
}

impl FromStr for ConnType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(ConnType::Process),
            "client" => Ok(ConnType::Client),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnType::Process => "process",
            ConnType::Client => "client",
        })
    }
}

pub struct Bus {
    token: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Bus {
    pub fn new(token: String) -> Arc<Self> {
        Arc::new(Self {
            token,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Constant-time comparison so the token cannot be probed byte by byte.
    pub fn token_matches(&self, candidate: &str) -> bool {
        candidate.as_bytes().ct_eq(self.token.as_bytes()).into()
    }

    pub fn session(&self, process_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(process_id).cloned()
    }

    /// Cancels every session; producer and subscriber handlers unwind on
    /// their own tokens.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.cancel.cancel();
        }
    }
}

pub struct Session {
    process_id: String,
    subscribers: RwLock<HashMap<Uuid, Arc<Subscriber>>>,
    cancel: CancellationToken,
    /// Merged input queue: every subscriber feeds this, the arbiter drains
    /// it into the producer connection.
    to_producer: mpsc::Sender<Frame>,
    /// Raw outbound blobs destined for every subscriber.
    to_subscribers: mpsc::Sender<Vec<u8>>,
}

impl Session {
    fn new(
        process_id: String,
        to_producer: mpsc::Sender<Frame>,
        to_subscribers: mpsc::Sender<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            process_id,
            subscribers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            to_producer,
            to_subscribers,
        })
    }

    /// Delivers one payload to every attached subscriber and waits for all
    /// writes to land, so subscribers observe payloads in producer order and
    /// in-flight fan-out memory stays bounded.
    async fn fan_out(&self, payload: &[u8]) {
        let subscribers: Vec<Arc<Subscriber>> =
            self.subscribers.read().values().cloned().collect();
        if subscribers.is_empty() {
            return;
        }
        let writes = subscribers
            .into_iter()
            .map(|subscriber| {
                let payload = payload.to_vec();
                tokio::spawn(async move { subscriber.forward(payload).await })
            })
            .collect::<Vec<_>>();
        join_all(writes).await;
    }

    fn cancel_subscribers(&self) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut map = self.subscribers.write();
            map.drain().map(|(_, subscriber)| subscriber).collect()
        };
        for subscriber in subscribers {
            subscriber.cancel.cancel();
        }
    }
}

struct Subscriber {
    id: Uuid,
    sink: tokio::sync::Mutex<SubscriberSink>,
    warmed_up: AtomicBool,
    cancel: CancellationToken,
}

impl Subscriber {
    /// The very first write is preceded by a zero-length frame that forces
    /// intermediate proxies to release the held-back upgrade response.
    async fn forward(&self, payload: Vec<u8>) {
        let mut sink = self.sink.lock().await;
        if !self.warmed_up.swap(true, Ordering::SeqCst) {
            if let Err(err) = sink.send(Message::Binary(Bytes::new())).await {
                debug!(subscriber = %self.id, %err, "warm-up write failed");
            }
        }
        if let Err(err) = sink.send(Message::Binary(payload.into())).await {
            warn!(subscriber = %self.id, %err, "writing to subscriber failed");
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_DEADLINE, sink.send(Message::Close(None))).await;
    }
}

pub async fn handle_socket(
    bus: Arc<Bus>,
    conn_type: ConnType,
    process_id: String,
    socket: WebSocket,
) {
    match conn_type {
        ConnType::Process => run_producer(bus, process_id, socket).await,
        ConnType::Client => run_subscriber(bus, process_id, socket).await,
    }
}

async fn run_producer(bus: Arc<Bus>, process_id: String, socket: WebSocket) {
    let (to_subscribers, mut outbound) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (to_producer, mut inbound) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    let session = Session::new(process_id.clone(), to_producer, to_subscribers);

    let already_claimed = {
        let mut sessions = bus.sessions.write();
        if sessions.contains_key(&process_id) {
            // Lost the race against another producer claiming the same id
            // between routing and upgrade.
            true
        } else {
            sessions.insert(process_id.clone(), session.clone());
            false
        }
    };
    if already_claimed {
        warn!(%process_id, "producer id already claimed");
        close_socket(socket).await;
        return;
    }
    info!(%process_id, "producer attached");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let reader = {
        let session = session.clone();
        let process_id = process_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let payload = match msg {
                    Ok(Message::Binary(data)) => data.to_vec(),
                    // Simple producers may only speak text; coerce to DATA.
                    Ok(Message::Text(text)) => Frame::data(text.as_str().as_bytes()).encode(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(%process_id, %err, "producer read failed");
                        break;
                    }
                };
                if session.to_subscribers.send(payload).await.is_err() {
                    break;
                }
            }
            info!(%process_id, "producer connection closed");
            session.cancel.cancel();
        })
    };

    // Arbiter: the sole writer to the producer connection. Fans producer
    // output out to subscribers one payload at a time and serializes
    // subscriber input into the producer.
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            Some(payload) = outbound.recv() => session.fan_out(&payload).await,
            Some(frame) = inbound.recv() => {
                debug!(%process_id, kind = %frame.kind(), "forwarding subscriber frame to producer");
                if let Err(err) = ws_tx.send(Message::Binary(frame.encode().into())).await {
                    warn!(%process_id, %err, "writing to producer failed");
                }
            }
        }
    }

    // The id must leave the registry before a new producer may claim it;
    // only then are the subscribers cancelled.
    bus.sessions.write().remove(&process_id);
    session.cancel.cancel();
    session.cancel_subscribers();
    reader.abort();
    let _ = tokio::time::timeout(CLOSE_DEADLINE, ws_tx.send(Message::Close(None))).await;
    info!(%process_id, "session removed");
}

async fn run_subscriber(bus: Arc<Bus>, process_id: String, socket: WebSocket) {
    // The session can die between routing and upgrade.
    let Some(session) = bus.session(&process_id) else {
        close_socket(socket).await;
        return;
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let subscriber = Arc::new(Subscriber {
        id: Uuid::new_v4(),
        sink: tokio::sync::Mutex::new(ws_tx),
        warmed_up: AtomicBool::new(false),
        cancel: session.cancel.child_token(),
    });
    session
        .subscribers
        .write()
        .insert(subscriber.id, subscriber.clone());
    info!(%process_id, subscriber = %subscriber.id, "subscriber attached");

    let reader = {
        let to_producer = session.to_producer.clone();
        let cancel = subscriber.cancel.clone();
        let process_id = process_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => frame,
                        Err(err) => {
                            // One bad frame does not tear down the session.
                            warn!(%process_id, %err, "dropping malformed subscriber frame");
                            continue;
                        }
                    },
                    Ok(Message::Text(text)) => Frame::data(text.as_str().as_bytes()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(%process_id, %err, "subscriber read failed");
                        break;
                    }
                };
                if to_producer.send(frame).await.is_err() {
                    break;
                }
            }
            cancel.cancel();
        })
    };

    subscriber.cancel.cancelled().await;
    session.subscribers.write().remove(&subscriber.id);
    reader.abort();
    subscriber.close().await;
    info!(process_id = %session.process_id, subscriber = %subscriber.id, "subscriber detached");
}

async fn close_socket(mut socket: WebSocket) {
    let _ = tokio::time::timeout(CLOSE_DEADLINE, socket.send(Message::Close(None))).await;
}
