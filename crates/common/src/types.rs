// Core domain types shared across the deskspace crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Windows of a space keyed by window id. Ordered so persisted snapshots are stable.
pub type WindowMap = BTreeMap<String, Window>;

/// Free-form per-space settings (wallpaper, grid snapping, ...), carried opaquely.
pub type SpaceSettings = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// True when either axis moved by at least `delta`.
    pub fn moved_at_least(&self, other: &Position, delta: f64) -> bool {
        (self.x - other.x).abs() >= delta || (self.y - other.y).abs() >= delta
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

impl Size {
    pub fn new(w: f64, h: f64) -> Self {
        Self { w, h }
    }
}

/// A positioned, resizable window on the space canvas.
///
/// `id`, `type`, `position` and `size` are required: an entry missing any of
/// them is a ghost (usually a partial or interrupted write) and never
/// deserializes into a `Window`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Position,
    pub size: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_state: Option<Map<String, Value>>,
    /// Fields this layer does not interpret, preserved across round trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Window {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, position: Position, size: Size) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            size,
            app_type: None,
            title: None,
            entity: None,
            tabs: None,
            active_tab_id: None,
            application_state: None,
            extra: Map::new(),
        }
    }

    pub fn with_app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = Some(app_type.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_application_state(mut self, state: Map<String, Value>) -> Self {
        self.application_state = Some(state);
        self
    }

    /// Parse a raw window entry. Returns `None` for ghost windows.
    pub fn from_value(value: &Value) -> Option<Self> {
        let window: Window = serde_json::from_value(value.clone()).ok()?;
        if window.id.is_empty() || window.kind.is_empty() {
            return None;
        }
        Some(window)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Drop ghost windows from a raw window map, keeping entries keyed by window id.
pub fn filter_ghost_windows(raw: &Map<String, Value>) -> WindowMap {
    let mut windows = WindowMap::new();
    for (key, value) in raw {
        match Window::from_value(value) {
            Some(window) => {
                windows.insert(key.clone(), window);
            }
            None => debug!(window_id = %key, "dropping ghost window"),
        }
    }
    windows
}

/// Serialize a window map into the raw JSON object shape used on the wire.
pub fn windows_to_value(windows: &WindowMap) -> Value {
    Value::Object(windows.iter().map(|(id, window)| (id.clone(), window.to_value())).collect())
}

// ── Space ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpaceRole {
    Owner,
    Editor,
    Viewer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceMember {
    pub user_id: String,
    pub role: SpaceRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpaceAcl {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub members: Vec<SpaceMember>,
}

/// A space as returned by `GET /spaces/:id`. Windows are raw so ghosts can be
/// filtered explicitly rather than failing the whole decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub windows: Map<String, Value>,
    #[serde(default)]
    pub settings: SpaceSettings,
    #[serde(default)]
    pub acl: SpaceAcl,
}

impl SpaceRecord {
    pub fn into_space(self) -> Space {
        Space {
            windows: filter_ghost_windows(&self.windows),
            id: self.id,
            name: self.name,
            settings: self.settings,
            acl: self.acl,
        }
    }
}

/// A space with ghost windows removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Space {
    pub id: String,
    pub name: String,
    pub windows: WindowMap,
    pub settings: SpaceSettings,
    pub acl: SpaceAcl,
}

/// Body of `PUT /spaces/:id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SpaceSnapshot {
    pub windows: WindowMap,
    #[serde(default)]
    pub settings: SpaceSettings,
}

// ── Presence ────────────────────────────────────────────────────────

/// One session's ephemeral presence in a space. Keyed by `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: String,
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub display_name: String,
    /// Milliseconds since the Unix epoch.
    pub last_active: i64,
}

impl PresenceEntry {
    pub fn is_stale(&self, now_millis: i64, stale_after_millis: i64) -> bool {
        now_millis - self.last_active > stale_after_millis
    }
}

/// Authenticated identity of the local session, supplied by the login layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}
