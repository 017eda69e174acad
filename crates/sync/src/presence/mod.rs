// Presence tracker: per-session cursor and identity in `presence-<spaceId>`.
//
// Entries are keyed by session id. While the session is active a heartbeat
// refreshes `lastActive`; after `idle_timeout` without input heartbeats and
// cursor broadcasts stop until the next activity. Readers drop entries whose
// `lastActive` is older than `stale_after`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deskspace_common::types::{PresenceEntry, SessionIdentity};

use crate::config::PresenceConfig;
use crate::engine::policy::DocKey;
use crate::engine::registry::{DocChange, DocSubscription, SyncRegistry, UpdateMode};
use crate::store::markers::{SessionMarker, SessionMarkers};

const PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2", "#d19a66", "#be5046",
];

/// Deterministic cursor color for a user.
pub fn color_for(user_id: &str) -> &'static str {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PALETTE[hash as usize % PALETTE.len()]
}

/// Decode a raw presence document into live entries, most recent first.
/// Malformed and stale entries are skipped.
pub fn process_presence_data(
    raw: &Map<String, Value>,
    now_millis: i64,
    stale_after_millis: i64,
) -> Vec<PresenceEntry> {
    let mut entries: Vec<PresenceEntry> = raw
        .iter()
        .filter_map(|(session_id, value)| match serde_json::from_value::<PresenceEntry>(value.clone()) {
            Ok(entry) => Some(entry),
            Err(error) => {
                debug!(session_id = %session_id, "skipping malformed presence entry: {error}");
                None
            }
        })
        .filter(|entry| !entry.is_stale(now_millis, stale_after_millis))
        .collect();
    entries.sort_by(|a, b| b.last_active.cmp(&a.last_active).then_with(|| a.session_id.cmp(&b.session_id)));
    entries
}

#[derive(Debug)]
struct SessionState {
    space_id: Option<String>,
    cursor: Option<(f64, f64)>,
    last_input: Instant,
    active: bool,
    stop: Option<CancellationToken>,
    subscription: Option<DocSubscription>,
}

struct Inner {
    registry: Arc<SyncRegistry>,
    identity: SessionIdentity,
    config: PresenceConfig,
    markers: SessionMarkers,
    state: Mutex<SessionState>,
    presence: watch::Sender<Vec<PresenceEntry>>,
    heartbeats: AtomicU64,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<SyncRegistry>,
        identity: SessionIdentity,
        config: PresenceConfig,
        markers: SessionMarkers,
    ) -> Self {
        let (presence, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                registry,
                identity,
                config,
                markers,
                state: Mutex::new(SessionState {
                    space_id: None,
                    cursor: None,
                    last_input: Instant::now(),
                    active: true,
                    stop: None,
                    subscription: None,
                }),
                presence,
                heartbeats: AtomicU64::new(0),
            }),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    /// Live entries of the joined space, own session included.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.inner.presence.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().map(|state| state.active).unwrap_or(false)
    }

    /// Heartbeats written since creation.
    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeats.load(Ordering::Relaxed)
    }

    /// Write (`Some`) or delete (`None`) one session's entry. Other sessions'
    /// entries are never touched.
    pub fn update_presence(&self, space_id: &str, session_id: &str, entry: Option<&PresenceEntry>) -> Result<()> {
        let value = match entry {
            Some(entry) => serde_json::to_value(entry)?,
            None => Value::Null,
        };
        self.inner
            .registry
            .update(&DocKey::presence(space_id), &json!({ session_id: value }), UpdateMode::Merge)
    }

    /// Register this session in `space_id` and start heartbeats.
    pub async fn join(&self, space_id: &str) -> Result<()> {
        self.teardown().await?;
        let identity = &self.inner.identity;
        let markers = &self.inner.markers;

        for stale in markers.abandoned(space_id, &identity.session_id)? {
            info!(space_id, session_id = %stale.session_id, "removing presence of abandoned session");
            self.update_presence(space_id, &stale.session_id, None)?;
            markers.remove(space_id, &stale.session_id)?;
        }
        markers.write(&SessionMarker::new(space_id, &identity.session_id, &identity.user_id))?;

        let stop = CancellationToken::new();
        {
            let mut state = self.lock_state()?;
            state.space_id = Some(space_id.to_string());
            state.last_input = Instant::now();
            state.active = true;
            state.stop = Some(stop.clone());
        }
        self.write_own_entry(space_id)?;

        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.registry.connect(
            &DocKey::presence(space_id),
            move |change: DocChange<Map<String, Value>>| {
                let Some(inner) = weak.upgrade() else { return };
                PresenceTracker { inner }.publish_entries(&change.value);
            },
        )?;
        self.lock_state()?.subscription = Some(subscription);

        tokio::spawn(run_heartbeat(Arc::downgrade(&self.inner), space_id.to_string(), stop));
        info!(space_id, session_id = %identity.session_id, "joined presence");
        Ok(())
    }

    /// Note user input. Resumes heartbeats after an idle period.
    pub fn record_activity(&self) -> Result<()> {
        let resumed = {
            let mut state = self.lock_state()?;
            state.last_input = Instant::now();
            let resumed = !state.active;
            state.active = true;
            resumed.then(|| state.space_id.clone()).flatten()
        };
        if let Some(space_id) = resumed {
            debug!(space_id = %space_id, "presence active again");
            self.write_own_entry(&space_id)?;
        }
        Ok(())
    }

    /// Broadcast a cursor position. Returns `false` when nothing was sent
    /// because the position is unchanged or no space is joined.
    pub fn move_cursor(&self, x: f64, y: f64) -> Result<bool> {
        let space_id = {
            let mut state = self.lock_state()?;
            state.last_input = Instant::now();
            state.active = true;
            let Some(space_id) = state.space_id.clone() else {
                return Ok(false);
            };
            if state.cursor == Some((x, y)) {
                return Ok(false);
            }
            state.cursor = Some((x, y));
            space_id
        };
        self.write_own_entry(&space_id)?;
        Ok(true)
    }

    /// Leave the joined space: remove this session's entry and marker, and
    /// drop the presence document when no other local session uses it.
    pub async fn teardown(&self) -> Result<()> {
        let (space_id, stop, subscription) = {
            let mut state = self.lock_state()?;
            let Some(space_id) = state.space_id.take() else {
                return Ok(());
            };
            state.cursor = None;
            (space_id, state.stop.take(), state.subscription.take())
        };
        if let Some(stop) = stop {
            stop.cancel();
        }
        drop(subscription);

        let markers = &self.inner.markers;
        let own = &self.inner.identity.session_id;
        let session_id = match markers.mark_closing(&space_id, own) {
            Ok(Some(marker)) => marker.session_id,
            Ok(None) => own.clone(),
            Err(error) => {
                warn!(space_id = %space_id, "failed to mark session closing: {error:#}");
                own.clone()
            }
        };
        self.update_presence(&space_id, &session_id, None)?;
        let last = markers.is_last_session(&space_id, own).unwrap_or(true);
        markers.remove(&space_id, own)?;
        if last {
            self.inner.registry.disconnect(&DocKey::presence(&space_id));
        }
        self.inner.presence.send_replace(Vec::new());
        info!(space_id = %space_id, session_id = %session_id, last, "left presence");
        Ok(())
    }

    /// Re-run the staleness filter over the current presence document, so
    /// entries of crashed sessions expire even when nobody writes.
    pub fn refresh(&self, space_id: &str) {
        let raw: Map<String, Value> = self.inner.registry.get(&DocKey::presence(space_id)).unwrap_or_default();
        self.publish_entries(&raw);
    }

    fn publish_entries(&self, raw: &Map<String, Value>) {
        let stale_after = self.inner.config.stale_after_ms as i64;
        let entries = process_presence_data(raw, Utc::now().timestamp_millis(), stale_after);
        self.inner.presence.send_if_modified(|current| {
            if *current == entries {
                return false;
            }
            *current = entries;
            true
        });
    }

    fn own_entry(&self, cursor: Option<(f64, f64)>) -> PresenceEntry {
        let identity = &self.inner.identity;
        let (x, y) = cursor.unwrap_or_default();
        PresenceEntry {
            session_id: identity.session_id.clone(),
            user_id: identity.user_id.clone(),
            x,
            y,
            color: color_for(&identity.user_id).to_string(),
            display_name: identity.display_name.clone(),
            last_active: Utc::now().timestamp_millis(),
        }
    }

    fn write_own_entry(&self, space_id: &str) -> Result<()> {
        let cursor = self.lock_state()?.cursor;
        let entry = self.own_entry(cursor);
        self.update_presence(space_id, &entry.session_id, Some(&entry))
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, SessionState>> {
        self.inner.state.lock().map_err(|_| anyhow!("presence state lock poisoned"))
    }
}

async fn run_heartbeat(inner: Weak<Inner>, space_id: String, stop: CancellationToken) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.heartbeat_interval(),
        None => return,
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let tracker = PresenceTracker { inner };
                tracker.refresh(&space_id);
                if !tracker.heartbeat_due() {
                    continue;
                }
                match tracker.write_own_entry(&space_id) {
                    Ok(()) => {
                        tracker.inner.heartbeats.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => warn!(space_id = %space_id, "presence heartbeat failed: {error:#}"),
                }
            }
        }
    }
    debug!(space_id = %space_id, "heartbeat stopped");
}

impl PresenceTracker {
    /// False once the session has been idle past the timeout; flips it inactive.
    fn heartbeat_due(&self) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        if state.last_input.elapsed() > self.inner.config.idle_timeout() {
            if state.active {
                debug!("presence idle, suspending heartbeats");
            }
            state.active = false;
        }
        state.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::policy::{LocalOrigin, UpdatePolicy};
    use crate::engine::transport::LocalHub;
    use std::time::Duration;
    use tempfile::TempDir;

    fn identity(session: &str, user: &str, name: &str) -> SessionIdentity {
        SessionIdentity {
            session_id: session.into(),
            user_id: user.into(),
            display_name: name.into(),
            avatar_url: None,
        }
    }

    fn tracker(hub: &LocalHub, dir: &TempDir, identity: SessionIdentity) -> PresenceTracker {
        tracker_with(hub, dir, identity, PresenceConfig::default())
    }

    fn tracker_with(hub: &LocalHub, dir: &TempDir, identity: SessionIdentity, config: PresenceConfig) -> PresenceTracker {
        let registry = Arc::new(SyncRegistry::new(
            Arc::new(hub.clone()),
            LocalOrigin::new(),
            UpdatePolicy::default(),
        ));
        PresenceTracker::new(registry, identity, config, SessionMarkers::new(dir.path()))
    }

    fn entry(session: &str, last_active: i64) -> Value {
        json!({
            "sessionId": session,
            "userId": "u1",
            "x": 1.0,
            "y": 2.0,
            "color": "#e06c75",
            "displayName": "Alice",
            "lastActive": last_active,
        })
    }

    #[test]
    fn stale_and_malformed_entries_are_dropped() {
        let now = 1_700_000_000_000;
        let raw = json!({
            "fresh": entry("fresh", now - 29_000),
            "stale": entry("stale", now - 31_000),
            "broken": { "sessionId": "broken" },
        });
        let entries = process_presence_data(raw.as_object().unwrap(), now, 30_000);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "fresh");
    }

    #[test]
    fn colors_are_stable_per_user() {
        assert_eq!(color_for("alice"), color_for("alice"));
        assert!(PALETTE.contains(&color_for("bob")));
    }

    #[tokio::test]
    async fn peers_see_each_other_and_teardown_removes_entry() {
        let hub = LocalHub::new();
        let dir = TempDir::new().unwrap();
        let alice = tracker(&hub, &dir, identity("tab-a", "u1", "Alice"));
        let bob = tracker(&hub, &dir, identity("tab-b", "u2", "Bob"));

        alice.join("s1").await.unwrap();
        bob.join("s1").await.unwrap();

        let mut seen_by_bob = bob.subscribe();
        tokio::time::timeout(Duration::from_secs(2), seen_by_bob.wait_for(|list| list.len() == 2))
            .await
            .expect("bob should see both sessions")
            .unwrap();

        assert!(alice.move_cursor(10.0, 20.0).unwrap());
        assert!(!alice.move_cursor(10.0, 20.0).unwrap());
        tokio::time::timeout(
            Duration::from_secs(2),
            seen_by_bob.wait_for(|list| list.iter().any(|e| e.session_id == "tab-a" && e.x == 10.0)),
        )
        .await
        .expect("cursor should propagate")
        .unwrap();

        alice.teardown().await.unwrap();
        let remaining = tokio::time::timeout(Duration::from_secs(2), seen_by_bob.wait_for(|list| list.len() == 1))
            .await
            .expect("alice's entry should be removed")
            .unwrap()
            .clone();
        assert_eq!(remaining[0].session_id, "tab-b");
        assert!(!dir.path().join("sessions/s1/tab-a.json").exists());
    }

    #[tokio::test]
    async fn join_cleans_up_abandoned_sessions() {
        let hub = LocalHub::new();
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        let alice = tracker(&hub, &dir, identity("tab-a", "u1", "Alice"));

        let crashed = now_entry("tab-crashed");
        alice.update_presence("s1", "tab-crashed", Some(&crashed)).unwrap();
        markers.write(&SessionMarker::new("s1", "tab-crashed", "u9")).unwrap();
        markers.mark_closing("s1", "tab-crashed").unwrap();

        alice.join("s1").await.unwrap();
        let raw: Map<String, Value> = alice.inner.registry.get(&DocKey::presence("s1")).unwrap();
        assert!(!raw.contains_key("tab-crashed"));
        assert!(raw.contains_key("tab-a"));
        assert!(markers.read("s1", "tab-crashed").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_pause_when_idle_and_resume_on_activity() {
        let hub = LocalHub::new();
        let dir = TempDir::new().unwrap();
        let alice = tracker(&hub, &dir, identity("tab-a", "u1", "Alice"));
        alice.join("s1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30_001)).await;
        assert_eq!(alice.heartbeat_count(), 6);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(!alice.is_active());
        assert_eq!(alice.heartbeat_count(), 12);

        alice.record_activity().unwrap();
        assert!(alice.is_active());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(alice.heartbeat_count(), 13);
    }

    #[tokio::test]
    async fn crashed_entry_expires_without_further_writes() {
        let hub = LocalHub::new();
        let dir = TempDir::new().unwrap();
        let config = PresenceConfig { heartbeat_interval_ms: 50, idle_timeout_ms: 100, stale_after_ms: 500 };
        let bob = tracker_with(&hub, &dir, identity("tab-b", "u2", "Bob"), config);
        bob.update_presence("s1", "tab-crashed", Some(&now_entry("tab-crashed"))).unwrap();
        bob.join("s1").await.unwrap();

        let mut seen = bob.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            seen.wait_for(|list| list.iter().any(|e| e.session_id == "tab-crashed")),
        )
        .await
        .expect("crashed entry should be listed while fresh")
        .unwrap();

        // Bob goes idle after 100 ms, so the document stops changing.
        tokio::time::timeout(
            Duration::from_secs(2),
            seen.wait_for(|list| list.iter().all(|e| e.session_id != "tab-crashed")),
        )
        .await
        .expect("crashed entry should expire")
        .unwrap();
        assert!(!bob.is_active());
    }

    #[tokio::test]
    async fn cursor_without_space_is_not_sent() {
        let hub = LocalHub::new();
        let dir = TempDir::new().unwrap();
        let alice = tracker(&hub, &dir, identity("tab-a", "u1", "Alice"));
        assert!(!alice.move_cursor(1.0, 1.0).unwrap());
        alice.teardown().await.unwrap();
    }

    fn now_entry(session: &str) -> PresenceEntry {
        PresenceEntry {
            session_id: session.into(),
            user_id: "u9".into(),
            x: 0.0,
            y: 0.0,
            color: color_for("u9").into(),
            display_name: "Ghost".into(),
            last_active: Utc::now().timestamp_millis(),
        }
    }
}
