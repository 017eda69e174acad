// Workspace state store: the authoritative in-memory state of the active space.
//
// Lifecycle:
//   Idle -> Initializing -> Initialized -> Idle (cleanup)
//                        \-> Error (fallback: create a new space)
//
// Local mutations apply optimistically, then publish to the replicated space
// document. Changes that arrive from peers are applied with
// `UpdateSource::Remote` and never re-published. Drag positions take the
// fast path plus the zero-debounce `window-position:<spaceId>` document; the
// final position lands in the space document on `finalize_window_drag`.

pub mod markers;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use deskspace_common::merge::{deep_merge_maps, merge_settings, merge_space_states};
use deskspace_common::types::{
    filter_ghost_windows, windows_to_value, Position, Size, SpaceSettings, SpaceSnapshot, Window, WindowMap,
};

use crate::backend::{BackendError, SpaceBackend};
use crate::engine::fast_path::DragBus;
use crate::engine::policy::{ChangeOrigin, DocKey};
use crate::engine::registry::{DocChange, DocSubscription, SyncRegistry, UpdateMode};
use crate::reconciler::{BackendReconciler, SaveTrigger};

// ── Types ───────────────────────────────────────────────────────────

/// Where a mutation came from. Only `Local` mutations are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Local,
    Remote,
    /// Init-time merge write-back.
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DragPhase {
    #[default]
    Idle,
    Dragging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    CreateNewSpace,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreStatus {
    #[default]
    Idle,
    Initializing,
    Initialized,
    Error { message: String, fallback: Fallback },
}

/// Snapshot of the store handed to UI subscribers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkspaceView {
    pub status: StoreStatus,
    pub space_id: Option<String>,
    pub name: String,
    pub windows: WindowMap,
    /// Window ids back to front.
    pub z_order: Vec<String>,
    /// Local only; never replicated.
    pub selected: Option<String>,
    pub settings: SpaceSettings,
}

impl WorkspaceView {
    pub fn snapshot(&self) -> SpaceSnapshot {
        SpaceSnapshot { windows: self.windows.clone(), settings: self.settings.clone() }
    }
}

/// Partial window update. Unset fields are left alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tab_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_state: Option<Map<String, Value>>,
}

impl WindowPatch {
    pub fn position(position: Position) -> Self {
        Self { position: Some(position), ..Default::default() }
    }

    fn apply_to(&self, window: &mut Window) {
        if let Some(position) = self.position {
            window.position = position;
        }
        if let Some(size) = self.size {
            window.size = size;
        }
        if let Some(title) = &self.title {
            window.title = Some(title.clone());
        }
        if let Some(tabs) = &self.tabs {
            window.tabs = Some(tabs.clone());
        }
        if let Some(active_tab_id) = &self.active_tab_id {
            window.active_tab_id = Some(active_tab_id.clone());
        }
        if let Some(patch) = &self.application_state {
            deep_merge_maps(window.application_state.get_or_insert_with(Map::new), patch);
        }
    }

    fn without_position(&self) -> Self {
        Self { position: None, ..self.clone() }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Content of the `space:<id>` replicated document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub windows: Map<String, Value>,
    #[serde(default)]
    pub settings: SpaceSettings,
    #[serde(default)]
    pub z_order: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no space is initialized")]
    NotInitialized,
    #[error("unknown window `{0}`")]
    UnknownWindow(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("replication error: {0:#}")]
    Sync(#[from] anyhow::Error),
}

// ── Init gate ───────────────────────────────────────────────────────

/// Process-wide initialization lock. One `initialize` runs at a time; a
/// caller that waits longer than the timeout proceeds without the lock.
#[derive(Debug, Clone)]
pub struct InitGate {
    lock: Arc<AsyncMutex<()>>,
    timeout: Duration,
}

impl InitGate {
    pub fn new(timeout: Duration) -> Self {
        Self { lock: Arc::new(AsyncMutex::new(())), timeout }
    }

    pub async fn enter(&self) -> Option<OwnedMutexGuard<()>> {
        match tokio::time::timeout(self.timeout, Arc::clone(&self.lock).lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(timeout = ?self.timeout, "initialization lock timed out, proceeding without it");
                None
            }
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────

struct StoreInner<B: SpaceBackend> {
    registry: Arc<SyncRegistry>,
    reconciler: BackendReconciler<B>,
    drag_bus: Arc<DragBus>,
    gate: InitGate,
    view: watch::Sender<WorkspaceView>,
    dragging: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<DocSubscription>>,
}

pub struct WorkspaceStore<B: SpaceBackend> {
    inner: Arc<StoreInner<B>>,
}

impl<B: SpaceBackend> Clone for WorkspaceStore<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: SpaceBackend> WorkspaceStore<B> {
    pub fn new(
        registry: Arc<SyncRegistry>,
        reconciler: BackendReconciler<B>,
        drag_bus: Arc<DragBus>,
        gate: InitGate,
    ) -> Self {
        let (view, _) = watch::channel(WorkspaceView::default());
        Self {
            inner: Arc::new(StoreInner {
                registry,
                reconciler,
                drag_bus,
                gate,
                view,
                dragging: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkspaceView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> WorkspaceView {
        self.inner.view.borrow().clone()
    }

    pub fn status(&self) -> StoreStatus {
        self.inner.view.borrow().status.clone()
    }

    pub fn window(&self, window_id: &str) -> Option<Window> {
        self.inner.view.borrow().windows.get(window_id).cloned()
    }

    // ── Initialization ──────────────────────────────────────────────

    /// Load `space_id`: merge live replicated state with the durable
    /// snapshot, write the merge back, subscribe, and persist it.
    pub async fn initialize(&self, space_id: &str) -> Result<(), StoreError> {
        let _guard = self.inner.gate.enter().await;
        let previous = self.inner.view.borrow().space_id.clone();
        match previous {
            Some(previous) if previous == space_id => self.drop_subscriptions(),
            Some(_) => self.cleanup().await,
            None => {}
        }
        self.inner.view.send_modify(|view| {
            *view = WorkspaceView {
                status: StoreStatus::Initializing,
                space_id: Some(space_id.to_string()),
                ..Default::default()
            };
        });
        info!(space_id, "initializing space");

        match self.load_and_merge(space_id).await {
            Ok(()) => {
                self.inner.view.send_modify(|view| view.status = StoreStatus::Initialized);
                info!(space_id, windows = self.inner.view.borrow().windows.len(), "space initialized");
                Ok(())
            }
            Err(error) => {
                warn!(space_id, error = %error, "space initialization failed");
                self.inner.view.send_modify(|view| {
                    view.status = StoreStatus::Error {
                        message: error.to_string(),
                        fallback: Fallback::CreateNewSpace,
                    };
                });
                Err(error)
            }
        }
    }

    async fn load_and_merge(&self, space_id: &str) -> Result<(), StoreError> {
        let inner = &self.inner;
        let space_key = DocKey::space(space_id);
        inner.registry.ensure(&space_key)?;
        let live: SpaceDocument = inner.registry.get(&space_key).unwrap_or_default();
        let live_windows = filter_ghost_windows(&live.windows);

        let durable = match inner.reconciler.backend().get_space(space_id).await {
            Ok(record) => Some(record.into_space()),
            Err(error) if error.is_retryable() && !live_windows.is_empty() => {
                warn!(space_id, error = %error, "backend unavailable, continuing with live state");
                None
            }
            Err(error) => return Err(error.into()),
        };

        let (name, windows, settings) = match &durable {
            Some(space) => (
                live.name.clone().unwrap_or_else(|| space.name.clone()),
                merge_space_states(&space.windows, &live_windows),
                merge_settings(&space.settings, &live.settings),
            ),
            None => (live.name.clone().unwrap_or_default(), live_windows, live.settings.clone()),
        };
        let z_order = normalize_z_order(&live.z_order, &windows);
        debug!(
            space_id,
            durable = durable.as_ref().map(|space| space.windows.len()).unwrap_or(0),
            live = live.windows.len(),
            merged = windows.len(),
            "merged space state"
        );

        let merged = SpaceDocument {
            name: Some(name.clone()),
            windows: windows_value(&windows),
            settings: settings.clone(),
            z_order: z_order.clone(),
        };
        self.apply_document(UpdateSource::Reconcile, merged.clone());
        inner.registry.replace(&space_key, &merged, &inner.registry.origin().reconciler_tag())?;
        inner.view.send_modify(|view| view.name = name);

        self.connect(space_id)?;

        let snapshot = inner.view.borrow().snapshot();
        if let Err(error) = inner.reconciler.save_now(space_id, &snapshot).await {
            warn!(space_id, error = %error, "failed to persist merged state");
        }
        Ok(())
    }

    fn connect(&self, space_id: &str) -> Result<(), StoreError> {
        let weak = Arc::downgrade(&self.inner);
        let space_sub = self.inner.registry.connect(&DocKey::space(space_id), move |change: DocChange<SpaceDocument>| {
            let Some(store) = upgrade(&weak) else { return };
            match change.origin {
                ChangeOrigin::Local => debug!("own space update echoed, ignoring"),
                ChangeOrigin::Snapshot => {}
                ChangeOrigin::Remote => store.apply_remote(change.value),
            }
        })?;

        let weak = Arc::downgrade(&self.inner);
        let position_sub = self.inner.registry.connect(
            &DocKey::window_position(space_id),
            move |change: DocChange<Map<String, Value>>| {
                let Some(store) = upgrade(&weak) else { return };
                if change.origin == ChangeOrigin::Remote {
                    store.apply_remote_positions(&change.value);
                }
            },
        )?;

        if let Ok(mut subscriptions) = self.inner.subscriptions.lock() {
            subscriptions.push(space_sub);
            subscriptions.push(position_sub);
        }
        Ok(())
    }

    // ── Mutations ───────────────────────────────────────────────────

    pub async fn add_window(&self, window: Window, source: UpdateSource) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        let window_id = window.id.clone();
        let mut z_order = Vec::new();
        self.inner.view.send_modify(|view| {
            view.windows.insert(window_id.clone(), window.clone());
            view.z_order.retain(|id| id != &window_id);
            view.z_order.push(window_id.clone());
            z_order = view.z_order.clone();
        });
        debug!(space_id = %space_id, window_id = %window_id, ?source, "window added");

        match source {
            UpdateSource::Local => {
                self.publish(&space_id, &json!({
                    "windows": { window_id.as_str(): window.to_value() },
                    "zOrder": z_order,
                }))?;
                self.save(&space_id, SaveTrigger::Structural).await
            }
            UpdateSource::Remote => {
                self.save(&space_id, SaveTrigger::Drag).await
            }
            UpdateSource::Reconcile => Ok(()),
        }
    }

    pub async fn remove_window(&self, window_id: &str, source: UpdateSource) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        let mut removed = false;
        let mut z_order = Vec::new();
        self.inner.view.send_modify(|view| {
            removed = view.windows.remove(window_id).is_some();
            view.z_order.retain(|id| id != window_id);
            if view.selected.as_deref() == Some(window_id) {
                view.selected = None;
            }
            z_order = view.z_order.clone();
        });
        if !removed {
            return Err(StoreError::UnknownWindow(window_id.to_string()));
        }
        self.forget_drag(window_id);

        match source {
            UpdateSource::Local => {
                self.publish(&space_id, &json!({
                    "windows": { window_id: Value::Null },
                    "zOrder": z_order,
                }))?;
                self.inner
                    .registry
                    .update(&DocKey::window_position(&space_id), &json!({ window_id: Value::Null }), UpdateMode::Merge)?;
                self.save(&space_id, SaveTrigger::Structural).await
            }
            UpdateSource::Remote => self.save(&space_id, SaveTrigger::Drag).await,
            UpdateSource::Reconcile => Ok(()),
        }
    }

    /// Apply a partial window update. While `phase` is `Dragging`, the
    /// position goes through the fast path and the window-position document;
    /// the space document only sees it on `finalize_window_drag`.
    pub async fn update_window(
        &self,
        window_id: &str,
        patch: WindowPatch,
        source: UpdateSource,
        phase: DragPhase,
    ) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        let mut found = false;
        self.inner.view.send_if_modified(|view| match view.windows.get_mut(window_id) {
            Some(window) => {
                found = true;
                patch.apply_to(window);
                true
            }
            None => false,
        });
        if !found {
            return Err(StoreError::UnknownWindow(window_id.to_string()));
        }

        match source {
            UpdateSource::Local => {}
            UpdateSource::Remote => return self.save(&space_id, SaveTrigger::Drag).await,
            UpdateSource::Reconcile => return Ok(()),
        }

        let space_patch = match (phase, patch.position) {
            (DragPhase::Dragging, Some(position)) => {
                if let Ok(mut dragging) = self.inner.dragging.lock() {
                    dragging.insert(window_id.to_string());
                }
                self.inner.drag_bus.publish(&space_id, window_id, position);
                self.inner.registry.update(
                    &DocKey::window_position(&space_id),
                    &json!({ window_id: { "x": position.x, "y": position.y } }),
                    UpdateMode::Merge,
                )?;
                patch.without_position()
            }
            _ => patch,
        };

        if !space_patch.is_empty() {
            self.publish(&space_id, &json!({ "windows": { window_id: space_patch } }))?;
        }
        let trigger = match phase {
            DragPhase::Dragging => SaveTrigger::Drag,
            DragPhase::Idle => SaveTrigger::Structural,
        };
        self.save(&space_id, trigger).await
    }

    /// End a drag: write the final position to the space document, drop the
    /// window's live entry from the window-position document, flush pending
    /// debounced deliveries, and save to the backend immediately.
    pub async fn finalize_window_drag(&self, window_id: &str) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        let position = self
            .window(window_id)
            .map(|window| window.position)
            .ok_or_else(|| StoreError::UnknownWindow(window_id.to_string()))?;

        self.forget_drag(window_id);
        self.publish(&space_id, &json!({ "windows": { window_id: { "position": position } } }))?;
        self.inner
            .registry
            .update(&DocKey::window_position(&space_id), &json!({ window_id: Value::Null }), UpdateMode::Merge)?;
        if let Ok(subscriptions) = self.inner.subscriptions.lock() {
            for subscription in subscriptions.iter() {
                subscription.flush();
            }
        }
        info!(space_id = %space_id, window_id, x = position.x, y = position.y, "drag finalized");
        self.save(&space_id, SaveTrigger::Structural).await
    }

    pub fn bring_to_front(&self, window_id: &str) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        let mut z_order = None;
        self.inner.view.send_if_modified(|view| {
            if !view.windows.contains_key(window_id) || view.z_order.last().map(String::as_str) == Some(window_id) {
                return false;
            }
            view.z_order.retain(|id| id != window_id);
            view.z_order.push(window_id.to_string());
            z_order = Some(view.z_order.clone());
            true
        });
        match z_order {
            Some(z_order) => Ok(self.publish(&space_id, &json!({ "zOrder": z_order }))?),
            None if self.window(window_id).is_some() => Ok(()),
            None => Err(StoreError::UnknownWindow(window_id.to_string())),
        }
    }

    /// Selection is per session and never replicated.
    pub fn select_window(&self, window_id: Option<&str>) -> Result<(), StoreError> {
        if let Some(id) = window_id {
            if self.window(id).is_none() {
                return Err(StoreError::UnknownWindow(id.to_string()));
            }
        }
        self.inner.view.send_if_modified(|view| {
            let next = window_id.map(str::to_string);
            if view.selected == next {
                return false;
            }
            view.selected = next;
            true
        });
        Ok(())
    }

    pub async fn update_settings(&self, patch: SpaceSettings, source: UpdateSource) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        self.inner.view.send_modify(|view| deep_merge_maps(&mut view.settings, &patch));
        match source {
            UpdateSource::Local => {
                self.publish(&space_id, &json!({ "settings": patch }))?;
                self.save(&space_id, SaveTrigger::Drag).await
            }
            UpdateSource::Remote => self.save(&space_id, SaveTrigger::Drag).await,
            UpdateSource::Reconcile => Ok(()),
        }
    }

    /// Rename the space on the backend, then locally and for peers.
    pub async fn rename(&self, name: &str) -> Result<(), StoreError> {
        let space_id = self.space_id()?;
        self.inner.reconciler.backend().rename_space(&space_id, name).await?;
        self.inner.view.send_modify(|view| view.name = name.to_string());
        self.publish(&space_id, &json!({ "name": name }))?;
        self.save(&space_id, SaveTrigger::Structural).await
    }

    /// Reconcile with the desktop shell's window-entity list: unknown valid
    /// windows are added, ghosts are dropped. Returns the number added.
    pub async fn sync_window_entities(&self, entities: &[Value]) -> Result<usize, StoreError> {
        let mut added = 0;
        for entity in entities {
            let Some(window) = Window::from_value(entity) else {
                debug!("dropping ghost window entity");
                continue;
            };
            if self.window(&window.id).is_some() {
                continue;
            }
            self.add_window(window, UpdateSource::Local).await?;
            added += 1;
        }
        Ok(added)
    }

    /// Leave the space: stop subscriptions, flush pending saves, release documents.
    pub async fn cleanup(&self) {
        let Some(space_id) = self.inner.view.borrow().space_id.clone() else {
            return;
        };
        self.drop_subscriptions();
        if let Err(error) = self.inner.reconciler.release(&space_id).await {
            warn!(space_id = %space_id, error = %error, "final save failed during cleanup");
        }
        self.inner.registry.disconnect(&DocKey::space(&space_id));
        self.inner.registry.disconnect(&DocKey::window_position(&space_id));
        if let Ok(mut dragging) = self.inner.dragging.lock() {
            dragging.clear();
        }
        self.inner.view.send_modify(|view| *view = WorkspaceView::default());
        info!(space_id = %space_id, "space cleaned up");
    }

    // ── Remote application ──────────────────────────────────────────

    fn apply_remote(&self, document: SpaceDocument) {
        self.apply_document(UpdateSource::Remote, document);
        if let Ok(space_id) = self.space_id() {
            let snapshot = self.inner.view.borrow().snapshot();
            self.inner.reconciler.queue_save(&space_id, snapshot);
        }
    }

    /// Replace windows, settings and z-order with a decoded space document.
    /// Windows being dragged locally keep their local position. On remote
    /// deliveries, windows with a live window-position entry (a peer's drag
    /// in progress) take that position, since the space document only sees
    /// it on finalize.
    fn apply_document(&self, source: UpdateSource, document: SpaceDocument) {
        let mut windows = filter_ghost_windows(&document.windows);
        let dragging = self.inner.dragging.lock().map(|set| set.clone()).unwrap_or_default();
        if source == UpdateSource::Remote {
            self.overlay_live_positions(&mut windows, &dragging);
        }
        let z_order = normalize_z_order(&document.z_order, &windows);
        self.inner.view.send_modify(|view| {
            for window_id in &dragging {
                if let (Some(local), Some(incoming)) = (view.windows.get(window_id), windows.get_mut(window_id)) {
                    incoming.position = local.position;
                }
            }
            if let Some(name) = &document.name {
                view.name = name.clone();
            }
            if view.selected.as_ref().is_some_and(|id| !windows.contains_key(id)) {
                view.selected = None;
            }
            view.windows = std::mem::take(&mut windows);
            view.settings = document.settings.clone();
            view.z_order = z_order;
        });
        debug!(?source, "space document applied");
    }

    fn overlay_live_positions(&self, windows: &mut WindowMap, dragging: &HashSet<String>) {
        let Ok(space_id) = self.space_id() else { return };
        let live: Map<String, Value> =
            self.inner.registry.get(&DocKey::window_position(&space_id)).unwrap_or_default();
        for (window_id, raw) in live {
            if dragging.contains(&window_id) {
                continue;
            }
            let (Some(window), Ok(position)) = (windows.get_mut(&window_id), serde_json::from_value::<Position>(raw))
            else {
                continue;
            };
            window.position = position;
        }
    }

    fn apply_remote_positions(&self, positions: &Map<String, Value>) {
        let mut changed = false;
        self.inner.view.send_if_modified(|view| {
            for (window_id, raw) in positions {
                let Ok(position) = serde_json::from_value::<Position>(raw.clone()) else {
                    continue;
                };
                if let Some(window) = view.windows.get_mut(window_id) {
                    if window.position != position {
                        window.position = position;
                        changed = true;
                    }
                }
            }
            changed
        });
        if changed {
            if let Ok(space_id) = self.space_id() {
                let snapshot = self.inner.view.borrow().snapshot();
                self.inner.reconciler.queue_save(&space_id, snapshot);
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn space_id(&self) -> Result<String, StoreError> {
        let view = self.inner.view.borrow();
        match (&view.status, &view.space_id) {
            (StoreStatus::Initializing | StoreStatus::Initialized, Some(space_id)) => Ok(space_id.clone()),
            _ => Err(StoreError::NotInitialized),
        }
    }

    fn publish(&self, space_id: &str, partial: &Value) -> Result<(), StoreError> {
        Ok(self.inner.registry.update(&DocKey::space(space_id), partial, UpdateMode::Merge)?)
    }

    async fn save(&self, space_id: &str, trigger: SaveTrigger) -> Result<(), StoreError> {
        let snapshot = self.inner.view.borrow().snapshot();
        Ok(self.inner.reconciler.schedule(space_id, snapshot, trigger).await?)
    }

    fn drop_subscriptions(&self) {
        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .map(|mut subscriptions| std::mem::take(&mut *subscriptions))
            .unwrap_or_default();
        drop(subscriptions);
    }

    fn forget_drag(&self, window_id: &str) {
        self.inner.drag_bus.forget(window_id);
        if let Ok(mut dragging) = self.inner.dragging.lock() {
            dragging.remove(window_id);
        }
    }
}

fn upgrade<B: SpaceBackend>(weak: &Weak<StoreInner<B>>) -> Option<WorkspaceStore<B>> {
    weak.upgrade().map(|inner| WorkspaceStore { inner })
}

fn windows_value(windows: &WindowMap) -> Map<String, Value> {
    match windows_to_value(windows) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Keep known windows in their recorded order, then append the rest by id.
fn normalize_z_order(recorded: &[String], windows: &WindowMap) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order: Vec<String> = recorded
        .iter()
        .filter(|id| windows.contains_key(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect();
    let missing: BTreeMap<&str, ()> = windows
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .map(|id| (id.as_str(), ()))
        .collect();
    order.extend(missing.into_keys().map(str::to_string));
    order
}
