// In-process space store for offline mode, the simulator and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use deskspace_common::types::{SpaceMember, SpaceRecord, SpaceSnapshot};

use super::{BackendError, SpaceBackend};

#[derive(Debug, Default)]
struct MemoryState {
    spaces: HashMap<String, SpaceRecord>,
    /// Failures returned by the next `put_space` calls, in order.
    put_failures: VecDeque<BackendError>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    puts: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: SpaceRecord) {
        self.state.write().await.spaces.insert(record.id.clone(), record);
    }

    pub async fn space(&self, space_id: &str) -> Option<SpaceRecord> {
        self.state.read().await.spaces.get(space_id).cloned()
    }

    /// Queue an error for the next `put_space` call.
    pub async fn fail_next_put(&self, error: BackendError) {
        self.state.write().await.put_failures.push_back(error);
    }

    /// Number of `put_space` calls received, failed ones included.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl SpaceBackend for MemoryBackend {
    async fn get_space(&self, space_id: &str) -> Result<SpaceRecord, BackendError> {
        self.state
            .read()
            .await
            .spaces
            .get(space_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(space_id.to_string()))
    }

    async fn put_space(&self, space_id: &str, snapshot: &SpaceSnapshot) -> Result<(), BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if let Some(error) = state.put_failures.pop_front() {
            return Err(error);
        }
        let record = state.spaces.get_mut(space_id).ok_or_else(|| BackendError::NotFound(space_id.to_string()))?;
        record.windows = snapshot
            .windows
            .iter()
            .map(|(id, window)| (id.clone(), window.to_value()))
            .collect();
        record.settings = snapshot.settings.clone();
        Ok(())
    }

    async fn rename_space(&self, space_id: &str, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let record = state.spaces.get_mut(space_id).ok_or_else(|| BackendError::NotFound(space_id.to_string()))?;
        record.name = name.to_string();
        Ok(())
    }

    async fn grant_permission(&self, space_id: &str, member: &SpaceMember) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let record = state.spaces.get_mut(space_id).ok_or_else(|| BackendError::NotFound(space_id.to_string()))?;
        record.acl.members.retain(|existing| existing.user_id != member.user_id);
        record.acl.members.push(member.clone());
        Ok(())
    }

    async fn revoke_permission(&self, space_id: &str, user_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let record = state.spaces.get_mut(space_id).ok_or_else(|| BackendError::NotFound(space_id.to_string()))?;
        record.acl.members.retain(|existing| existing.user_id != user_id);
        Ok(())
    }
}
