// One desktop-shell session: registry, store, presence and persistence wired
// together from a `SyncConfig`. Sessions in the same process share a
// transport and the initialization gate.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use deskspace_common::types::SessionIdentity;

use crate::backend::SpaceBackend;
use crate::config::SyncConfig;
use crate::engine::fast_path::DragBus;
use crate::engine::policy::LocalOrigin;
use crate::engine::registry::SyncRegistry;
use crate::engine::transport::RoomTransport;
use crate::presence::PresenceTracker;
use crate::reconciler::BackendReconciler;
use crate::store::markers::SessionMarkers;
use crate::store::{InitGate, WorkspaceStore};

pub struct Session<B: SpaceBackend> {
    pub registry: Arc<SyncRegistry>,
    pub store: WorkspaceStore<B>,
    pub presence: PresenceTracker,
    pub drag_bus: Arc<DragBus>,
    reconciler: BackendReconciler<B>,
}

impl<B: SpaceBackend> Session<B> {
    pub fn start(
        config: &SyncConfig,
        transport: Arc<dyn RoomTransport>,
        backend: Arc<B>,
        identity: SessionIdentity,
        gate: InitGate,
    ) -> Self {
        let registry = Arc::new(SyncRegistry::new(transport, LocalOrigin::new(), config.policy.clone()));
        let reconciler = BackendReconciler::new(backend, config.persistence);
        let drag_bus = Arc::new(DragBus::new(config.fast_path));
        let store = WorkspaceStore::new(Arc::clone(&registry), reconciler.clone(), Arc::clone(&drag_bus), gate);
        let presence = PresenceTracker::new(
            Arc::clone(&registry),
            identity,
            config.presence,
            SessionMarkers::new(&config.state_dir()),
        );
        Self { registry, store, presence, drag_bus, reconciler }
    }

    /// Load `space_id` into the store and announce this session in it.
    pub async fn open(&self, space_id: &str) -> Result<()> {
        self.store
            .initialize(space_id)
            .await
            .with_context(|| format!("failed to initialize space `{space_id}`"))?;
        self.presence.join(space_id).await.context("failed to join presence")?;
        info!(space_id, session_id = %self.presence.identity().session_id, "session opened");
        Ok(())
    }

    /// Leave presence, flush pending saves and drop every document.
    pub async fn close(&self) {
        if let Err(error) = self.presence.teardown().await {
            warn!("presence teardown failed: {error:#}");
        }
        self.store.cleanup().await;
        self.reconciler.shutdown().await;
        self.registry.shutdown();
        info!(session_id = %self.presence.identity().session_id, "session closed");
    }
}
