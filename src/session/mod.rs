//! SSE session lifecycle (§4.8): `Created -> Replaying -> Live -> Closing
//! -> Closed`. The router's read loop never distinguishes replay from live
//! messages — both arrive on the same channel — so the state enum exists
//! for observability/idempotency, not for dispatch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::BridgeError;
use crate::storage::{SseMessage, Storage, Subscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Replaying,
    Live,
    Closing,
    Closed,
}

/// Current session model: `NewSession`, `Start`, `GetMessages`, `Close`.
pub struct Session {
    storage: Arc<dyn Storage>,
    client_ids: Vec<String>,
    last_event_id: i64,
    tx: mpsc::Sender<SseMessage>,
    rx: Mutex<Option<mpsc::Receiver<SseMessage>>>,
    subscriber_id: Mutex<Option<u64>>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(storage: Arc<dyn Storage>, client_ids: Vec<String>, last_event_id: i64) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            storage,
            client_ids,
            last_event_id,
            tx,
            rx: Mutex::new(Some(rx)),
            subscriber_id: Mutex::new(None),
            state: Mutex::new(SessionState::Created),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Subscribes to storage. Buffered messages begin arriving on the sink
    /// as part of the same subscribe call; there is no separate "replaying
    /// done" signal, so we move straight to `Live` once subscribed.
    pub async fn start(&self) -> Result<(), BridgeError> {
        *self.state.lock().unwrap() = SessionState::Replaying;
        let subscriber = Subscriber::new(self.tx.clone());
        *self.subscriber_id.lock().unwrap() = Some(subscriber.id);
        self.storage.subscribe(&self.client_ids, self.last_event_id, subscriber).await?;
        *self.state.lock().unwrap() = SessionState::Live;
        Ok(())
    }

    /// Takes ownership of the message stream. Callable once.
    pub fn messages(&self) -> mpsc::Receiver<SseMessage> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .expect("Session::messages called more than once")
    }

    /// Idempotent: unsubscribes from storage and marks the session closed.
    /// Safe to call from multiple exit paths (context cancellation, error,
    /// normal stream end).
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closing;
        }
        let taken_id = self.subscriber_id.lock().unwrap().take();
        if let Some(id) = taken_id {
            self.storage.unsubscribe(&self.client_ids, id).await;
        }
        *self.state.lock().unwrap() = SessionState::Closed;
    }
}

/// Shared sink wrapper for [`SessionV1`]: two independent producers (a
/// heartbeat ticker and a one-shot historical drain) push frames through
/// it, and it tears itself down exactly once, after both have reported
/// completion via [`ProducerGate::finish`]. A producer that wins the race
/// to zero is the one that drops the sender; any push attempted afterward
/// by a slow producer silently no-ops rather than racing a second close.
struct ProducerGate {
    sink: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    remaining: AtomicUsize,
}

impl ProducerGate {
    fn new(sink: mpsc::Sender<Vec<u8>>, producers: usize) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            remaining: AtomicUsize::new(producers),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let guard = self.sink.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(frame);
        }
    }

    fn finish(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sink.lock().unwrap().take();
        }
    }
}

fn frame_data(event_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = format!("event: message\nid: {event_id}\ndata: ").into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    out
}

/// Legacy v1 session (§4.8, §9): reconstructed from the described race
/// discipline rather than transliterated. `closer` models request-context
/// cancellation; both producers must observe it (or finish on their own)
/// before the output channel closes.
pub struct SessionV1 {
    storage: Arc<dyn Storage>,
    client_ids: Vec<String>,
    last_event_id: i64,
    heartbeat_interval: Duration,
    enable_queue_done_event: bool,
    started: AtomicBool,
}

impl SessionV1 {
    pub fn new(
        storage: Arc<dyn Storage>,
        client_ids: Vec<String>,
        last_event_id: i64,
        heartbeat_interval: Duration,
        enable_queue_done_event: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            client_ids,
            last_event_id,
            heartbeat_interval,
            enable_queue_done_event,
            started: AtomicBool::new(false),
        })
    }

    /// Spawns both producers and returns the frame stream. `heartbeat_frame`
    /// is supplied by the caller since its wire shape depends on the
    /// request's `heartbeat` query param, not on session state.
    pub fn run(self: &Arc<Self>, heartbeat_frame: Vec<u8>, closer: watch::Receiver<bool>) -> mpsc::Receiver<Vec<u8>> {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("SessionV1::run called more than once");
        }

        let (tx, rx) = mpsc::channel(256);
        let gate = Arc::new(ProducerGate::new(tx, 2));

        spawn_drain_producer(self.clone(), gate.clone(), closer.clone());
        spawn_heartbeat_producer(self.clone(), gate, heartbeat_frame, closer);

        rx
    }
}

fn spawn_drain_producer(session: Arc<SessionV1>, gate: Arc<ProducerGate>, mut closer: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let (sub_tx, mut sub_rx) = mpsc::channel(256);
        let subscriber = Subscriber::new(sub_tx);
        if session
            .storage
            .subscribe(&session.client_ids, session.last_event_id, subscriber)
            .await
            .is_ok()
        {
            // One-shot drain: forward whatever was immediately buffered,
            // then stop — this producer never waits for live traffic.
            while let Ok(msg) = sub_rx.try_recv() {
                if *closer.borrow() {
                    break;
                }
                gate.push(frame_data(msg.event_id, &msg.payload));
            }
        }
        if session.enable_queue_done_event {
            gate.push(b"event: message\r\ndata: queue_done\r\n\r\n".to_vec());
        }
        gate.finish();
    });
}

fn spawn_heartbeat_producer(
    session: Arc<SessionV1>,
    gate: Arc<ProducerGate>,
    heartbeat_frame: Vec<u8>,
    mut closer: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(session.heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                biased;
                changed = closer.changed() => {
                    if changed.is_err() || *closer.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => gate.push(heartbeat_frame.clone()),
            }
        }
        gate.finish();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MarkedSet;
    use crate::storage::memory::MemoryStorage;
    use crate::verify::ConnectVerifyCache;

    fn new_storage() -> Arc<dyn Storage> {
        MemoryStorage::new(
            Arc::new(MarkedSet::expired_cache()),
            Arc::new(ConnectVerifyCache::new(1000, Duration::from_secs(300))),
            None,
        )
    }

    #[tokio::test]
    async fn session_moves_through_states() {
        let session = Session::new(new_storage(), vec!["bob".to_string()], 0);
        assert_eq!(session.state(), SessionState::Created);
        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Live);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = Session::new(new_storage(), vec!["bob".to_string()], 0);
        session.start().await.unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn session_replays_buffered_messages() {
        let storage = new_storage();
        storage
            .publish(crate::storage::test_support::make_message(1, "bob", "hi"), 60)
            .await
            .unwrap();

        let session = Session::new(storage, vec!["bob".to_string()], 0);
        session.start().await.unwrap();
        let mut rx = session.messages();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, 1);
    }

    #[tokio::test]
    async fn v1_session_closes_after_both_producers_finish() {
        let storage = new_storage();
        let session = SessionV1::new(storage, vec!["bob".to_string()], 0, Duration::from_millis(20), true);
        let (closer_tx, closer_rx) = watch::channel(false);
        let mut rx = session.run(b"event: heartbeat\n\n".to_vec(), closer_rx);

        // drain producer's queue_done sentinel should arrive promptly.
        let first = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap();
        assert!(first.is_some());

        closer_tx.send(true).unwrap();
        // after signaling the closer, the channel should eventually close.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(_) => panic!("v1 session never closed"),
            }
        }
    }
}
