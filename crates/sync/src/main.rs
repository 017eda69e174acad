// deskspace-sim: two sessions on an in-process hub drag a window and report
// the converged state.
//
// Uses the HTTP backend when `[backend] url` is configured, otherwise an
// in-memory backend seeded with a demo space.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map};
use tracing::info;

use deskspace_common::types::{Position, SessionIdentity, Size, SpaceRecord, Window};
use deskspace_sync::backend::{HttpBackend, MemoryBackend, SpaceBackend};
use deskspace_sync::config::SyncConfig;
use deskspace_sync::engine::transport::LocalHub;
use deskspace_sync::session::Session;
use deskspace_sync::store::{DragPhase, InitGate, UpdateSource, WindowPatch};

const WINDOW_ID: &str = "w1";
const DRAG_STEPS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SyncConfig::load();
    let space_id = std::env::var("DESKSPACE_SIM_SPACE").unwrap_or_else(|_| "demo".to_string());

    match HttpBackend::from_config(&config.backend) {
        Some(backend) => {
            let backend = backend.context("invalid backend configuration")?;
            info!(space_id = %space_id, "simulating against http backend");
            simulate(&config, Arc::new(backend), &space_id).await
        }
        None => {
            let backend = MemoryBackend::new();
            backend
                .insert(SpaceRecord {
                    id: space_id.clone(),
                    name: "Demo space".into(),
                    windows: Map::new(),
                    settings: Map::new(),
                    acl: Default::default(),
                })
                .await;
            info!(space_id = %space_id, "simulating against in-memory backend");
            simulate(&config, Arc::new(backend), &space_id).await
        }
    }
}

async fn simulate<B: SpaceBackend>(config: &SyncConfig, backend: Arc<B>, space_id: &str) -> Result<()> {
    let hub = Arc::new(LocalHub::new());
    let gate = InitGate::new(config.persistence.init_lock_timeout());
    let alice = Session::start(config, hub.clone(), Arc::clone(&backend), identity("alice"), gate.clone());
    let bob = Session::start(config, hub, Arc::clone(&backend), identity("bob"), gate);

    alice.open(space_id).await?;
    if alice.store.window(WINDOW_ID).is_none() {
        let window = Window::new(WINDOW_ID, "window", Position::new(0.0, 0.0), Size::new(480.0, 320.0))
            .with_app_type("notes")
            .with_title("Notes");
        alice.store.add_window(window, UpdateSource::Local).await?;
    }
    bob.open(space_id).await?;

    let start = alice.store.window(WINDOW_ID).map(|w| w.position).unwrap_or_default();
    let target = Position::new(start.x + 100.0, start.y + 50.0);
    for step in 1..=DRAG_STEPS {
        let t = f64::from(step) / f64::from(DRAG_STEPS);
        let position = if step == DRAG_STEPS {
            target
        } else {
            Position::new(start.x + (target.x - start.x) * t, start.y + (target.y - start.y) * t)
        };
        alice
            .store
            .update_window(WINDOW_ID, WindowPatch::position(position), UpdateSource::Local, DragPhase::Dragging)
            .await?;
        alice.presence.move_cursor(position.x, position.y)?;
        tokio::time::sleep(Duration::from_millis(16)).await;
    }
    alice.store.finalize_window_drag(WINDOW_ID).await?;

    let mut bob_view = bob.store.subscribe();
    let converged = tokio::time::timeout(
        Duration::from_secs(5),
        bob_view.wait_for(|view| view.windows.get(WINDOW_ID).map(|w| w.position) == Some(target)),
    )
    .await
    .is_ok_and(|seen| seen.is_ok());
    if !converged {
        bail!("bob did not converge on the dragged position");
    }

    let saved = backend.get_space(space_id).await?.into_space();
    let peers: Vec<String> =
        bob.presence.subscribe().borrow().iter().map(|entry| entry.display_name.clone()).collect();
    let report = json!({
        "space": space_id,
        "alice": alice.store.window(WINDOW_ID).map(|w| w.position),
        "bob": bob.store.window(WINDOW_ID).map(|w| w.position),
        "backend": saved.windows.get(WINDOW_ID).map(|w| w.position),
        "presence": peers,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    bob.close().await;
    alice.close().await;
    Ok(())
}

fn identity(name: &str) -> SessionIdentity {
    SessionIdentity {
        session_id: format!("{name}-{}", uuid::Uuid::new_v4()),
        user_id: name.to_string(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}
