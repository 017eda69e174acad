// Local session markers: one JSON file per open session of a space.
//
//   <state_dir>/sessions/<spaceId>/<sessionId>.json
//
// They outlive the in-memory store, so teardown can still name the session
// to remove from presence, and a later session can clean up after one that
// crashed while closing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMarker {
    pub space_id: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub closing: bool,
    pub updated_at: DateTime<Utc>,
}

impl SessionMarker {
    pub fn new(space_id: &str, session_id: &str, user_id: &str) -> Self {
        Self {
            space_id: space_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            closing: false,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMarkers {
    root: PathBuf,
}

impl SessionMarkers {
    pub fn new(state_dir: &Path) -> Self {
        Self { root: state_dir.join("sessions") }
    }

    pub fn marker_path(&self, space_id: &str, session_id: &str) -> PathBuf {
        self.space_dir(space_id).join(format!("{}.json", file_safe(session_id)))
    }

    fn space_dir(&self, space_id: &str) -> PathBuf {
        self.root.join(file_safe(space_id))
    }

    pub fn write(&self, marker: &SessionMarker) -> Result<()> {
        let path = self.marker_path(&marker.space_id, &marker.session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create marker dir `{}`", parent.display()))?;
        }
        let contents = serde_json::to_vec_pretty(marker).context("failed to encode session marker")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write marker `{}`", path.display()))
    }

    pub fn read(&self, space_id: &str, session_id: &str) -> Result<Option<SessionMarker>> {
        let path = self.marker_path(space_id, session_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read(&path)
            .with_context(|| format!("failed to read marker `{}`", path.display()))?;
        let marker = serde_json::from_slice(&contents)
            .with_context(|| format!("failed to decode marker `{}`", path.display()))?;
        Ok(Some(marker))
    }

    /// Flag a session as closing. Returns the updated marker, or `None` if
    /// the session never registered.
    pub fn mark_closing(&self, space_id: &str, session_id: &str) -> Result<Option<SessionMarker>> {
        let Some(mut marker) = self.read(space_id, session_id)? else {
            return Ok(None);
        };
        marker.closing = true;
        marker.updated_at = Utc::now();
        self.write(&marker)?;
        Ok(Some(marker))
    }

    pub fn remove(&self, space_id: &str, session_id: &str) -> Result<()> {
        let path = self.marker_path(space_id, session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).with_context(|| format!("failed to remove marker `{}`", path.display())),
        }
    }

    /// Every readable marker for a space. Malformed files are skipped.
    pub fn list(&self, space_id: &str) -> Result<Vec<SessionMarker>> {
        let dir = self.space_dir(space_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut markers = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("failed to list `{}`", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(anyhow::Error::from).and_then(|bytes| {
                serde_json::from_slice::<SessionMarker>(&bytes).map_err(anyhow::Error::from)
            }) {
                Ok(marker) => markers.push(marker),
                Err(error) => warn!(path = %path.display(), "skipping malformed session marker: {error}"),
            }
        }
        markers.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(markers)
    }

    /// True when no other session of this space is open (ignoring ones that are closing).
    pub fn is_last_session(&self, space_id: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .list(space_id)?
            .iter()
            .all(|marker| marker.session_id == session_id || marker.closing))
    }

    /// Sessions that were closing but never removed their marker.
    pub fn abandoned(&self, space_id: &str, own_session_id: &str) -> Result<Vec<SessionMarker>> {
        Ok(self
            .list(space_id)?
            .into_iter()
            .filter(|marker| marker.closing && marker.session_id != own_session_id)
            .collect())
    }
}

/// Keep ids usable as single path components.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_and_remove() {
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        let marker = SessionMarker::new("s1", "tab-a", "u1");
        markers.write(&marker).unwrap();

        assert!(dir.path().join("sessions/s1/tab-a.json").exists());
        assert_eq!(markers.read("s1", "tab-a").unwrap(), Some(marker));

        markers.remove("s1", "tab-a").unwrap();
        assert_eq!(markers.read("s1", "tab-a").unwrap(), None);
        markers.remove("s1", "tab-a").unwrap();
    }

    #[test]
    fn last_session_ignores_closing_peers() {
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        markers.write(&SessionMarker::new("s1", "tab-a", "u1")).unwrap();
        markers.write(&SessionMarker::new("s1", "tab-b", "u1")).unwrap();

        assert!(!markers.is_last_session("s1", "tab-a").unwrap());
        markers.mark_closing("s1", "tab-b").unwrap();
        assert!(markers.is_last_session("s1", "tab-a").unwrap());
    }

    #[test]
    fn abandoned_lists_closing_sessions_of_others() {
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        markers.write(&SessionMarker::new("s1", "tab-a", "u1")).unwrap();
        markers.write(&SessionMarker::new("s1", "tab-b", "u2")).unwrap();
        markers.mark_closing("s1", "tab-b").unwrap();

        let abandoned = markers.abandoned("s1", "tab-a").unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].session_id, "tab-b");
        assert!(markers.abandoned("s1", "tab-b").unwrap().is_empty());
    }

    #[test]
    fn malformed_markers_are_skipped() {
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        markers.write(&SessionMarker::new("s1", "tab-a", "u1")).unwrap();
        std::fs::write(dir.path().join("sessions/s1/broken.json"), b"{not json").unwrap();
        assert_eq!(markers.list("s1").unwrap().len(), 1);
    }

    #[test]
    fn mark_closing_unknown_session_is_none() {
        let dir = TempDir::new().unwrap();
        let markers = SessionMarkers::new(dir.path());
        assert_eq!(markers.mark_closing("s1", "ghost").unwrap(), None);
        assert!(markers.list("nope").unwrap().is_empty());
    }

    #[test]
    fn ids_are_sanitized_into_one_path_component() {
        let markers = SessionMarkers::new(Path::new("/state"));
        assert_eq!(
            markers.marker_path("../s1", "a/b"),
            PathBuf::from("/state/sessions/___s1/a_b.json")
        );
    }
}
