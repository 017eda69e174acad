// Update-policy router: typed document keys, debounce intervals, origin checks.
//
// Every replicated document key carries a `DocKind` tag chosen when the key is
// built. The kind selects the debounce interval: ephemeral render-critical
// kinds (cursor, presence, window position) are delivered on every change,
// bulk structural kinds are coalesced.
//
// Raw room names are classified with the ordered substring table below so a
// string key and a typed key always agree.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use deskspace_common::crdt::origin::{OriginKind, OriginTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Space,
    Presence,
    WindowPosition,
    Cursor,
    Note,
    Other,
}

/// Ordered substring table used to classify raw keys. First match wins.
const CLASSIFY_TABLE: &[(&str, DocKind)] = &[
    ("cursor", DocKind::Cursor),
    ("presence", DocKind::Presence),
    ("window-position", DocKind::WindowPosition),
    ("position", DocKind::WindowPosition),
    ("space", DocKind::Space),
    ("note", DocKind::Note),
];

impl DocKind {
    /// Classify a raw key by the first matching substring.
    pub fn classify(raw: &str) -> Self {
        CLASSIFY_TABLE
            .iter()
            .find(|(needle, _)| raw.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(Self::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Space => "space",
            Self::Presence => "presence",
            Self::WindowPosition => "window_position",
            Self::Cursor => "cursor",
            Self::Note => "note",
            Self::Other => "other",
        }
    }
}

/// A typed replicated-document key. Displays as the transport room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    kind: DocKind,
    room: String,
}

impl DocKey {
    pub fn space(space_id: &str) -> Self {
        Self { kind: DocKind::Space, room: format!("space:{space_id}") }
    }

    pub fn presence(space_id: &str) -> Self {
        Self { kind: DocKind::Presence, room: format!("presence-{space_id}") }
    }

    pub fn window_position(space_id: &str) -> Self {
        Self { kind: DocKind::WindowPosition, room: format!("window-position:{space_id}") }
    }

    pub fn cursor(space_id: &str) -> Self {
        Self { kind: DocKind::Cursor, room: format!("cursor-{space_id}") }
    }

    pub fn note(note_id: &str) -> Self {
        Self { kind: DocKind::Note, room: format!("note-{note_id}") }
    }

    /// Wrap a raw room name, classifying it with the substring table.
    pub fn parse(raw: &str) -> Self {
        Self { kind: DocKind::classify(raw), room: raw.to_string() }
    }

    pub fn kind(&self) -> DocKind {
        self.kind
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.room)
    }
}

/// Debounce intervals per document kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicy {
    pub space_ms: u64,
    pub note_ms: u64,
    pub default_ms: u64,
    pub ephemeral_ms: u64,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self { space_ms: 300, note_ms: 500, default_ms: 500, ephemeral_ms: 0 }
    }
}

impl UpdatePolicy {
    pub fn interval_for(&self, kind: DocKind) -> Duration {
        let ms = match kind {
            DocKind::Cursor | DocKind::Presence | DocKind::WindowPosition => self.ephemeral_ms,
            DocKind::Space => self.space_ms,
            DocKind::Note => self.note_ms,
            DocKind::Other => self.default_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn debounce_for(&self, key: &DocKey) -> Duration {
        self.interval_for(key.kind())
    }
}

/// Where a delivered change came from, from the receiving instance's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written by this instance; an echo of an optimistic local update.
    Local,
    /// Written by a peer.
    Remote,
    /// Current state delivered once when a subscriber connects.
    Snapshot,
}

/// The local-origin identity of one sync instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalOrigin {
    instance_id: Uuid,
}

impl LocalOrigin {
    pub fn new() -> Self {
        Self { instance_id: Uuid::new_v4() }
    }

    pub fn from_id(instance_id: Uuid) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Tag for a local user mutation.
    pub fn session_tag(&self) -> OriginTag {
        OriginTag::new(OriginKind::Session, self.instance_id)
    }

    /// Tag for the init-time merge write-back.
    pub fn reconciler_tag(&self) -> OriginTag {
        OriginTag::new(OriginKind::Reconciler, self.instance_id)
    }

    /// Tag for a peer update applied through the transport.
    pub fn remote_tag(&self) -> OriginTag {
        OriginTag::new(OriginKind::Remote, self.instance_id)
    }

    /// True when a transaction's origin is this instance: the change already
    /// happened optimistically and must not be re-applied locally. It is
    /// still broadcast to peers.
    pub fn should_suppress(&self, transaction_origin: Option<&[u8]>) -> bool {
        transaction_origin
            .and_then(|bytes| OriginTag::from_bytes(bytes).ok())
            .map(|tag| tag.is_local_to(self.instance_id))
            .unwrap_or(false)
    }

    pub fn classify(&self, transaction_origin: Option<&[u8]>) -> ChangeOrigin {
        if self.should_suppress(transaction_origin) {
            ChangeOrigin::Local
        } else {
            ChangeOrigin::Remote
        }
    }
}

impl Default for LocalOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_first_substring_match() {
        assert_eq!(DocKind::classify("cursor-presence-s1"), DocKind::Cursor);
        assert_eq!(DocKind::classify("presence-s1"), DocKind::Presence);
        assert_eq!(DocKind::classify("window-position:s1"), DocKind::WindowPosition);
        assert_eq!(DocKind::classify("icon-position:s1"), DocKind::WindowPosition);
        assert_eq!(DocKind::classify("space:s1"), DocKind::Space);
        assert_eq!(DocKind::classify("note-n1"), DocKind::Note);
        assert_eq!(DocKind::classify("clipboard"), DocKind::Other);
    }

    #[test]
    fn default_intervals() {
        let policy = UpdatePolicy::default();
        assert_eq!(policy.debounce_for(&DocKey::cursor("s1")), Duration::ZERO);
        assert_eq!(policy.debounce_for(&DocKey::presence("s1")), Duration::ZERO);
        assert_eq!(policy.debounce_for(&DocKey::window_position("s1")), Duration::ZERO);
        assert_eq!(policy.debounce_for(&DocKey::space("s1")), Duration::from_millis(300));
        assert_eq!(policy.debounce_for(&DocKey::parse("misc")), Duration::from_millis(500));
    }

    #[test]
    fn typed_and_parsed_keys_agree() {
        for key in [
            DocKey::space("a"),
            DocKey::presence("a"),
            DocKey::window_position("a"),
            DocKey::cursor("a"),
            DocKey::note("a"),
        ] {
            assert_eq!(DocKey::parse(key.room()), key);
        }
    }

    #[test]
    fn room_names_match_transport_addressing() {
        assert_eq!(DocKey::space("s1").to_string(), "space:s1");
        assert_eq!(DocKey::presence("s1").to_string(), "presence-s1");
        assert_eq!(DocKey::window_position("s1").to_string(), "window-position:s1");
        assert_eq!(DocKey::note("n1").to_string(), "note-n1");
    }

    #[test]
    fn suppresses_only_own_local_origins() {
        let local = LocalOrigin::new();
        let peer = LocalOrigin::new();

        let own_session = local.session_tag().to_bytes();
        let own_reconciler = local.reconciler_tag().to_bytes();
        let own_remote = local.remote_tag().to_bytes();
        let peer_session = peer.session_tag().to_bytes();

        assert!(local.should_suppress(Some(own_session.as_slice())));
        assert!(local.should_suppress(Some(own_reconciler.as_slice())));
        assert!(!local.should_suppress(Some(own_remote.as_slice())));
        assert!(!local.should_suppress(Some(peer_session.as_slice())));
        assert!(!local.should_suppress(Some(&b"file-watcher"[..])));
        assert!(!local.should_suppress(None));
        assert_eq!(local.classify(Some(peer_session.as_slice())), ChangeOrigin::Remote);
    }
}
