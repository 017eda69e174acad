// Sync document registry: DocKey -> replicated document + room membership.
//
// Documents are created lazily on first `ensure` and live until `disconnect`
// or `shutdown`. Each document has one update observer that
// - forwards every non-remote update to the room, so suppressed local echoes
//   still reach peers
// - fans the post-commit state out to connected subscribers, tagged with the
//   `ChangeOrigin` seen from this instance.
//
// Subscribers get their own delivery task that applies the key's debounce
// interval. Dropping the `DocSubscription` handle stops it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yrs::Subscription;

use deskspace_common::crdt::flatmap::{
    diff_flat, flatten, join_path, escape_segment, prune_parent_keys, unflatten, FlatMap,
};
use deskspace_common::crdt::origin::{OriginKind, OriginTag};

use super::debounce::Coalescer;
use super::policy::{ChangeOrigin, DocKey, LocalOrigin, UpdatePolicy};
use super::transport::{RoomConnection, RoomFrame, RoomMessage, RoomTransport};
use super::ydoc::YDoc;

const EVENT_CAPACITY: usize = 256;

/// How `update` applies a partial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Leaf-level merge. A `null` leaf deletes that path; arrays replace the
    /// existing array wholesale.
    #[default]
    Merge,
    /// Delete every path present in the partial value (and everything below it).
    Remove,
}

/// A decoded change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange<T> {
    pub value: T,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone)]
struct DocEvent {
    origin: ChangeOrigin,
    state: Arc<FlatMap>,
}

impl DocEvent {
    /// Coalesce `newer` over `pending`. The newest state wins, but a batch
    /// that contains any peer change stays `Remote` so echo filtering never
    /// hides it.
    fn absorb(pending: DocEvent, newer: DocEvent) -> DocEvent {
        match pending.origin {
            ChangeOrigin::Remote => DocEvent { origin: ChangeOrigin::Remote, state: newer.state },
            _ => newer,
        }
    }
}

struct DocEntry {
    doc: Arc<YDoc>,
    events: broadcast::Sender<DocEvent>,
    leave: CancellationToken,
    _observer: Subscription,
}

/// Handle for one `connect` call. Delivery stops when it is dropped or cancelled.
#[derive(Debug)]
pub struct DocSubscription {
    key: DocKey,
    token: CancellationToken,
    flush: Arc<Notify>,
}

impl DocSubscription {
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Deliver any pending coalesced change now instead of waiting out the window.
    pub fn flush(&self) {
        self.flush.notify_one();
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for DocSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Registry of live replicated documents, shared by `Arc` from the application root.
pub struct SyncRegistry {
    transport: Arc<dyn RoomTransport>,
    origin: LocalOrigin,
    policy: UpdatePolicy,
    docs: Mutex<HashMap<DocKey, DocEntry>>,
    shutdown: CancellationToken,
}

impl SyncRegistry {
    pub fn new(transport: Arc<dyn RoomTransport>, origin: LocalOrigin, policy: UpdatePolicy) -> Self {
        Self {
            transport,
            origin,
            policy,
            docs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn origin(&self) -> LocalOrigin {
        self.origin
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.docs.lock().map(|docs| docs.contains_key(key)).unwrap_or(false)
    }

    /// Return the document for `key`, creating it and joining its room on first use.
    pub fn ensure(&self, key: &DocKey) -> Result<Arc<YDoc>> {
        let mut docs = self.docs.lock().map_err(|_| anyhow!("document table lock poisoned"))?;
        if let Some(entry) = docs.get(key) {
            return Ok(Arc::clone(&entry.doc));
        }
        if self.shutdown.is_cancelled() {
            return Err(anyhow!("sync registry is shut down"));
        }

        let doc = Arc::new(YDoc::new());
        let connection = self
            .transport
            .join(key.room(), self.origin.instance_id())
            .with_context(|| format!("failed to join room {key}"))?;
        let RoomConnection { outbound, inbound, leave: room_leave, .. } = connection;

        let leave = self.shutdown.child_token();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let observer = register_observer(&doc, self.origin, outbound.clone(), events.clone())?;

        let sync_request = RoomFrame::SyncRequest { state_vector: doc.encode_state_vector() };
        tokio::spawn(run_room(
            key.clone(),
            Arc::clone(&doc),
            self.origin,
            inbound,
            outbound.clone(),
            leave.clone(),
            room_leave,
        ));
        if outbound.send(sync_request).is_err() {
            warn!(key = %key, "room closed before initial sync request");
        }

        info!(key = %key, kind = key.kind().as_str(), "sync document created");
        docs.insert(
            key.clone(),
            DocEntry { doc: Arc::clone(&doc), events, leave, _observer: observer },
        );
        Ok(doc)
    }

    /// Subscribe to decoded changes of `key`.
    ///
    /// The current state, if any, is delivered once synchronously as
    /// `ChangeOrigin::Snapshot`. Later changes go through the key's debounce.
    pub fn connect<T, F>(&self, key: &DocKey, on_update: F) -> Result<DocSubscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(DocChange<T>) + Send + 'static,
    {
        let doc = self.ensure(key)?;
        let (mut events, entry_leave) = {
            let docs = self.docs.lock().map_err(|_| anyhow!("document table lock poisoned"))?;
            let entry = docs.get(key).ok_or_else(|| anyhow!("document {key} vanished during connect"))?;
            (entry.events.subscribe(), entry.leave.clone())
        };

        let initial = doc.read_flat();
        if !initial.is_empty() {
            if let Some(value) = decode_state::<T>(key, &initial) {
                on_update(DocChange { value, origin: ChangeOrigin::Snapshot });
            }
        }

        let token = entry_leave.child_token();
        let flush = Arc::new(Notify::new());
        let interval = self.policy.debounce_for(key);
        let task_token = token.clone();
        let task_flush = Arc::clone(&flush);
        let task_key = key.clone();

        tokio::spawn(async move {
            let mut coalescer: Coalescer<DocEvent> = Coalescer::new(interval);
            loop {
                let deadline = coalescer.deadline();
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = task_flush.notified() => {
                        if let Some(event) = coalescer.flush() {
                            deliver(&task_key, &on_update, event);
                        }
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        if let Some(event) = coalescer.take_ready() {
                            deliver(&task_key, &on_update, event);
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Some(event) = coalescer.push_with(event, DocEvent::absorb) {
                                deliver(&task_key, &on_update, event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(key = %task_key, skipped, "subscriber lagged, intermediate states dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            if let Some(event) = coalescer.flush() {
                                deliver(&task_key, &on_update, event);
                            }
                            break;
                        }
                    }
                }
            }
            debug!(key = %task_key, "subscription closed");
        });

        Ok(DocSubscription { key: key.clone(), token, flush })
    }

    /// Apply a partial value to `key`, tagged with this instance's session origin.
    pub fn update<V: Serialize + ?Sized>(&self, key: &DocKey, partial: &V, mode: UpdateMode) -> Result<()> {
        let value = serde_json::to_value(partial).context("failed to serialize update")?;
        let doc = self.ensure(key)?;
        let tag = self.origin.session_tag();
        match mode {
            UpdateMode::Merge => {
                let (clear, leaves) = merge_plan(&value);
                debug!(key = %key, leaves = leaves.len(), cleared = clear.len(), "merge update");
                doc.overwrite_subtrees(&tag, &clear, &leaves);
            }
            UpdateMode::Remove => {
                let prefixes: Vec<String> = flatten(&value).into_keys().collect();
                let removed = doc.remove_prefixes(&tag, &prefixes);
                debug!(key = %key, removed, "remove update");
            }
        }
        Ok(())
    }

    /// Replace the whole content of `key` with `value`, removing absent keys.
    pub fn replace<V: Serialize + ?Sized>(&self, key: &DocKey, value: &V, origin: &OriginTag) -> Result<()> {
        let value = serde_json::to_value(value).context("failed to serialize replacement")?;
        let doc = self.ensure(key)?;
        let current = doc.read_flat();
        let diff = diff_flat(&current, &flatten(&value));
        debug!(key = %key, set = diff.set.len(), removed = diff.remove.len(), "replace");
        doc.apply_flat_diff(origin, &diff);
        Ok(())
    }

    /// Decode the current content of `key`. `None` if the document does not
    /// exist, is empty, or does not decode into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &DocKey) -> Option<T> {
        let doc = {
            let docs = self.docs.lock().ok()?;
            Arc::clone(&docs.get(key)?.doc)
        };
        let flat = doc.read_flat();
        if flat.is_empty() {
            return None;
        }
        decode_state(key, &flat)
    }

    /// Leave the room and drop the document. No-op for unknown keys.
    pub fn disconnect(&self, key: &DocKey) {
        let removed = match self.docs.lock() {
            Ok(mut docs) => docs.remove(key),
            Err(_) => None,
        };
        if let Some(entry) = removed {
            entry.leave.cancel();
            info!(key = %key, "sync document disconnected");
        }
    }

    /// Tear down every document and subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<DocKey> = match self.docs.lock() {
            Ok(mut docs) => docs.drain().map(|(key, _)| key).collect(),
            Err(_) => Vec::new(),
        };
        info!(documents = drained.len(), "sync registry shut down");
    }
}

impl Drop for SyncRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn register_observer(
    doc: &YDoc,
    local: LocalOrigin,
    outbound: mpsc::UnboundedSender<RoomFrame>,
    events: broadcast::Sender<DocEvent>,
) -> Result<Subscription> {
    doc.observe_updates(move |txn, update, flat| {
        let origin_bytes = txn.origin().map(|value| value.as_ref().to_vec());
        let tag = origin_bytes.as_deref().and_then(|bytes| OriginTag::from_bytes(bytes).ok());
        let from_peer = matches!(tag, Some(OriginTag { kind: OriginKind::Remote, .. }));

        if !from_peer && outbound.send(RoomFrame::Update { payload: update.to_vec() }).is_err() {
            debug!("room closed, local update not forwarded");
        }

        let origin = local.classify(origin_bytes.as_deref());
        // Err only means nobody is subscribed.
        let _ = events.send(DocEvent { origin, state: Arc::new(flat) });
    })
}

async fn run_room(
    key: DocKey,
    doc: Arc<YDoc>,
    local: LocalOrigin,
    mut inbound: mpsc::UnboundedReceiver<RoomMessage>,
    outbound: mpsc::UnboundedSender<RoomFrame>,
    leave: CancellationToken,
    room_leave: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = leave.cancelled() => break,
            message = inbound.recv() => {
                let Some(message) = message else { break };
                match message.frame {
                    RoomFrame::SyncRequest { state_vector } => match doc.encode_diff(&state_vector) {
                        Ok(payload) => {
                            let _ = outbound.send(RoomFrame::Update { payload });
                        }
                        Err(error) => warn!(key = %key, peer = %message.sender, "bad sync request: {error:#}"),
                    },
                    RoomFrame::Update { payload } => {
                        if let Err(error) = doc.apply_update(&payload, &local.remote_tag()) {
                            warn!(key = %key, peer = %message.sender, "dropping undecodable update: {error:#}");
                        }
                    }
                }
            }
        }
    }
    room_leave.cancel();
    debug!(key = %key, "room task stopped");
}

/// Split a merge partial into prefixes to clear and leaves to write.
///
/// `null` leaves become clears. Arrays are positional, so their whole
/// subtree is cleared before the new elements are written.
fn merge_plan(value: &Value) -> (Vec<String>, FlatMap) {
    let mut clear = Vec::new();
    collect_array_paths("", value, &mut clear);
    let mut leaves = FlatMap::new();
    for (path, leaf) in flatten(value) {
        if leaf.is_null() {
            clear.push(path);
        } else {
            leaves.insert(path, leaf);
        }
    }
    (clear, leaves)
}

fn collect_array_paths(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(_) => out.push(prefix.to_string()),
        Value::Object(map) => {
            for (key, child) in map {
                collect_array_paths(&join_path(prefix, &escape_segment(key)), child, out);
            }
        }
        _ => {}
    }
}

fn deliver<T, F>(key: &DocKey, on_update: &F, event: DocEvent)
where
    T: DeserializeOwned,
    F: Fn(DocChange<T>),
{
    if let Some(value) = decode_state::<T>(key, &event.state) {
        on_update(DocChange { value, origin: event.origin });
    }
}

fn decode_state<T: DeserializeOwned>(key: &DocKey, flat: &FlatMap) -> Option<T> {
    let value = unflatten(&prune_parent_keys(flat));
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            warn!(key = %key, "skipping state that does not decode: {error}");
            None
        }
    }
}
