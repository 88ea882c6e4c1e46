// =============================================================================
// Subscription Multiplexer — ref-counted chain pub/sub over WebSocket
// =============================================================================
//
// One chain subscription exists per key exactly while `ref_count > 0`. The
// first subscriber opens the WebSocket stream (JSON-RPC `logsSubscribe` /
// `slotSubscribe`); the last unsubscribe tears it down — dropping the socket
// also closes the subscription server-side.
//
// Events are dispatched synchronously on the stream task. One observer
// failing (error or panic) is logged and counted; the remaining observers
// still receive the event.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Delay before reconnecting a dropped stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscription key. Log streams are keyed by (program, commitment); the
/// slot stream has a single literal key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubKey {
    Logs {
        program_id: String,
        commitment: String,
    },
    Slot,
}

impl std::fmt::Display for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logs {
                program_id,
                commitment,
            } => write!(f, "logs:{program_id}@{commitment}"),
            Self::Slot => write!(f, "slot"),
        }
    }
}

/// Observer callback. Receives the notification `result` payload.
pub type Observer = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    ref_count: usize,
    observers: Arc<RwLock<HashMap<u64, Observer>>>,
    alive: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
    /// Server-assigned subscription id, for observability.
    chain_sub_id: Arc<RwLock<Option<u64>>>,
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    key: SubKey,
    observer_id: u64,
}

/// Ref-counted multiplexer over the chain's WebSocket pub/sub interface.
pub struct SubscriptionMultiplexer {
    ws_url: String,
    entries: RwLock<HashMap<SubKey, Entry>>,
    next_observer_id: AtomicU64,
    /// Observer callbacks that returned an error or panicked.
    pub dispatch_failures: AtomicU64,
    /// Back-reference handed to stream tasks for failure accounting.
    weak_self: std::sync::Weak<SubscriptionMultiplexer>,
}

impl SubscriptionMultiplexer {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        let ws_url = ws_url.into();
        Arc::new_cyclic(|weak| Self {
            ws_url,
            entries: RwLock::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
            dispatch_failures: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    /// Register an observer for `key`. Opens the chain subscription when this
    /// is the first reference.
    pub fn subscribe(&self, key: SubKey, observer: Observer) -> SubscriptionHandle {
        let observer_id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();

        match entries.get_mut(&key) {
            Some(entry) => {
                entry.observers.write().insert(observer_id, observer);
                entry.ref_count += 1;
                debug!(key = %key, ref_count = entry.ref_count, "observer added to existing subscription");
            }
            None => {
                let observers = Arc::new(RwLock::new(HashMap::new()));
                observers.write().insert(observer_id, observer);

                let alive = Arc::new(AtomicBool::new(true));
                let chain_sub_id = Arc::new(RwLock::new(None));

                let task = tokio::spawn(run_stream(
                    self.ws_url.clone(),
                    key.clone(),
                    observers.clone(),
                    alive.clone(),
                    chain_sub_id.clone(),
                    self.weak_self.clone(),
                ));

                entries.insert(
                    key.clone(),
                    Entry {
                        ref_count: 1,
                        observers,
                        alive,
                        task,
                        chain_sub_id,
                    },
                );
                info!(key = %key, "chain subscription opened");
            }
        }

        SubscriptionHandle { key, observer_id }
    }

    /// Drop one observer. Closes the chain subscription when the ref count
    /// reaches zero.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut entries = self.entries.write();
        let remove = match entries.get_mut(&handle.key) {
            Some(entry) => {
                entry.observers.write().remove(&handle.observer_id);
                entry.ref_count = entry.ref_count.saturating_sub(1);
                debug!(key = %handle.key, ref_count = entry.ref_count, "observer removed");
                entry.ref_count == 0
            }
            None => false,
        };

        if remove {
            if let Some(entry) = entries.remove(&handle.key) {
                entry.alive.store(false, Ordering::Relaxed);
                entry.task.abort();
                info!(key = %handle.key, chain_sub_id = ?*entry.chain_sub_id.read(), "chain subscription closed");
            }
        }
    }

    /// Tear down every stream. Used during shutdown.
    pub fn unsubscribe_all(&self) {
        let mut entries = self.entries.write();
        for (key, entry) in entries.drain() {
            entry.alive.store(false, Ordering::Relaxed);
            entry.task.abort();
            info!(key = %key, "chain subscription closed (shutdown)");
        }
    }

    /// Number of live chain subscriptions.
    pub fn active_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Current ref count for a key (0 when absent).
    pub fn ref_count(&self, key: &SubKey) -> usize {
        self.entries.read().get(key).map(|e| e.ref_count).unwrap_or(0)
    }
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("ws_url", &self.ws_url)
            .field("active", &self.entries.read().len())
            .finish()
    }
}

// =============================================================================
// Stream task
// =============================================================================

fn subscribe_request(key: &SubKey, id: u64) -> String {
    let body = match key {
        SubKey::Logs {
            program_id,
            commitment,
        } => json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "logsSubscribe",
            "params": [{"mentions": [program_id]}, {"commitment": commitment}],
        }),
        SubKey::Slot => json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "slotSubscribe",
            "params": [],
        }),
    };
    body.to_string()
}

/// Connect, subscribe, and pump notifications until the entry dies.
/// Reconnects with a fixed delay while references remain.
async fn run_stream(
    ws_url: String,
    key: SubKey,
    observers: Arc<RwLock<HashMap<u64, Observer>>>,
    alive: Arc<AtomicBool>,
    chain_sub_id: Arc<RwLock<Option<u64>>>,
    mux: std::sync::Weak<SubscriptionMultiplexer>,
) {
    while alive.load(Ordering::Relaxed) {
        match connect_async(ws_url.as_str()).await {
            Ok((mut ws, _)) => {
                let request = subscribe_request(&key, 1);
                if let Err(e) = ws.send(Message::Text(request)).await {
                    error!(key = %key, error = %e, "failed to send subscribe request");
                } else {
                    debug!(key = %key, "subscribe request sent");

                    while let Some(frame) = ws.next().await {
                        if !alive.load(Ordering::Relaxed) {
                            return;
                        }
                        let text = match frame {
                            Ok(Message::Text(t)) => t,
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => continue,
                        };

                        let msg: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(key = %key, error = %e, "undecodable stream frame");
                                continue;
                            }
                        };

                        // Subscription confirmation carries the server id.
                        if msg.get("id").is_some() {
                            if let Some(sub_id) = msg["result"].as_u64() {
                                *chain_sub_id.write() = Some(sub_id);
                                debug!(key = %key, chain_sub_id = sub_id, "subscription confirmed");
                            }
                            continue;
                        }

                        if let Some(result) = msg.pointer("/params/result") {
                            dispatch(&key, result, &observers, &mux);
                        }
                    }
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "stream connection failed");
            }
        }

        if !alive.load(Ordering::Relaxed) {
            return;
        }
        warn!(key = %key, delay_secs = RECONNECT_DELAY.as_secs(), "stream dropped — reconnecting");
        *chain_sub_id.write() = None;
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Deliver one event to every observer. Observer failures are isolated.
fn dispatch(
    key: &SubKey,
    event: &Value,
    observers: &Arc<RwLock<HashMap<u64, Observer>>>,
    mux: &std::sync::Weak<SubscriptionMultiplexer>,
) {
    let snapshot: Vec<(u64, Observer)> = observers
        .read()
        .iter()
        .map(|(id, cb)| (*id, cb.clone()))
        .collect();

    for (id, callback) in snapshot {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!(key = %key, observer = id, error = %e, "observer returned error");
                true
            }
            Err(_) => {
                error!(key = %key, observer = id, "observer panicked during dispatch");
                true
            }
        };
        if failed {
            if let Some(mux) = mux.upgrade() {
                mux.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn noop_observer() -> Observer {
        Arc::new(|_| Ok(()))
    }

    #[tokio::test]
    async fn ref_count_tracks_subscribers() {
        let mux = SubscriptionMultiplexer::new("ws://127.0.0.1:1");
        let key = SubKey::Logs {
            program_id: "Prog111".to_string(),
            commitment: "processed".to_string(),
        };

        let h1 = mux.subscribe(key.clone(), noop_observer());
        let h2 = mux.subscribe(key.clone(), noop_observer());
        assert_eq!(mux.ref_count(&key), 2);
        assert_eq!(mux.active_count(), 1, "one chain subscription per key");

        mux.unsubscribe(&h1);
        assert_eq!(mux.ref_count(&key), 1);
        assert_eq!(mux.active_count(), 1);

        mux.unsubscribe(&h2);
        assert_eq!(mux.ref_count(&key), 0);
        assert_eq!(mux.active_count(), 0, "last unsubscribe closes the stream");
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_streams() {
        let mux = SubscriptionMultiplexer::new("ws://127.0.0.1:1");
        let logs = SubKey::Logs {
            program_id: "Prog111".to_string(),
            commitment: "processed".to_string(),
        };
        let _h1 = mux.subscribe(logs, noop_observer());
        let _h2 = mux.subscribe(SubKey::Slot, noop_observer());
        assert_eq!(mux.active_count(), 2);
        mux.unsubscribe_all();
        assert_eq!(mux.active_count(), 0);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let mux = SubscriptionMultiplexer::new("ws://127.0.0.1:1");
        let observers: Arc<RwLock<HashMap<u64, Observer>>> = Arc::new(RwLock::new(HashMap::new()));

        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();

        observers
            .write()
            .insert(1, Arc::new(|_| anyhow::bail!("observer down")));
        observers.write().insert(
            2,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );

        dispatch(
            &SubKey::Slot,
            &json!({"slot": 42}),
            &observers,
            &Arc::downgrade(&mux),
        );

        assert_eq!(hits.load(Ordering::Relaxed), 1, "healthy observer still ran");
        assert_eq!(mux.dispatch_failures.load(Ordering::Relaxed), 1);
    }
}
