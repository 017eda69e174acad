// Init-time merge of the durable backend snapshot with live replicated state.
//
// Conflict policy, per window id:
// - present in one source only: kept as-is
// - present in both: top-level fields come from the live replicated document
//   (it reflects the most recent network writer), while `applicationState` is
//   deep-merged so app sub-state written by either side survives. On a leaf
//   conflict inside `applicationState` the live value wins.
// Settings follow the same rule as `applicationState`.

use serde_json::{Map, Value};

use crate::types::{SpaceSettings, Window, WindowMap};

/// Recursively merge `overlay` into `base`. Objects are merged key by key;
/// any other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            deep_merge_maps(base_map, overlay_map);
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn deep_merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, overlay_value) in overlay {
        match base.get_mut(key) {
            Some(base_value) => deep_merge(base_value, overlay_value),
            None => {
                base.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}

/// Merge one window present in both sources.
pub fn merge_window(durable: &Window, live: &Window) -> Window {
    let mut merged = live.clone();
    merged.application_state = match (&durable.application_state, &live.application_state) {
        (None, None) => None,
        (Some(state), None) | (None, Some(state)) => Some(state.clone()),
        (Some(durable_state), Some(live_state)) => {
            let mut state = durable_state.clone();
            deep_merge_maps(&mut state, live_state);
            Some(state)
        }
    };
    merged
}

/// Union two window maps under the live-wins / app-state-union policy.
pub fn merge_space_states(durable: &WindowMap, live: &WindowMap) -> WindowMap {
    let mut merged = durable.clone();
    for (id, live_window) in live {
        let window = match durable.get(id) {
            Some(durable_window) => merge_window(durable_window, live_window),
            None => live_window.clone(),
        };
        merged.insert(id.clone(), window);
    }
    merged
}

pub fn merge_settings(durable: &SpaceSettings, live: &SpaceSettings) -> SpaceSettings {
    let mut merged = durable.clone();
    deep_merge_maps(&mut merged, live);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, Size};
    use serde_json::json;

    fn window(id: &str, x: f64, title: &str, state: Value) -> Window {
        Window::new(id, "window", Position::new(x, 0.0), Size::new(100.0, 100.0))
            .with_title(title)
            .with_application_state(state.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn live_fields_win_and_application_state_is_unioned() {
        let durable = WindowMap::from([(
            "w1".to_string(),
            window("w1", 10.0, "Old title", json!({ "notes": { "content": "durable", "cursor": 3 } })),
        )]);
        let live = WindowMap::from([(
            "w1".to_string(),
            window("w1", 99.0, "Live title", json!({ "notes": { "content": "live" }, "zoom": 2 })),
        )]);

        let merged = merge_space_states(&durable, &live);
        assert_eq!(merged.len(), 1);
        let w1 = &merged["w1"];
        assert_eq!(w1.position.x, 99.0);
        assert_eq!(w1.title.as_deref(), Some("Live title"));
        let state = Value::Object(w1.application_state.clone().unwrap());
        assert_eq!(state, json!({ "notes": { "content": "live", "cursor": 3 }, "zoom": 2 }));
    }

    #[test]
    fn single_source_windows_are_kept() {
        let durable = WindowMap::from([("a".to_string(), window("a", 1.0, "A", json!({})))]);
        let live = WindowMap::from([("b".to_string(), window("b", 2.0, "B", json!({})))]);
        let merged = merge_space_states(&durable, &live);
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn merge_is_idempotent() {
        let durable = WindowMap::from([(
            "w1".to_string(),
            window("w1", 0.0, "T", json!({ "notes": { "content": "a" } })),
        )]);
        let live = WindowMap::from([(
            "w1".to_string(),
            window("w1", 5.0, "T", json!({ "notes": { "content": "b" } })),
        )]);
        let once = merge_space_states(&durable, &live);
        let twice = merge_space_states(&durable, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_application_state_on_one_side_keeps_the_other() {
        let mut live_window = window("w1", 0.0, "T", json!({}));
        live_window.application_state = None;
        let durable = WindowMap::from([(
            "w1".to_string(),
            window("w1", 0.0, "T", json!({ "pdf": { "page": 4 } })),
        )]);
        let live = WindowMap::from([("w1".to_string(), live_window)]);
        let merged = merge_space_states(&durable, &live);
        assert_eq!(
            merged["w1"].application_state.as_ref().and_then(|s| s.get("pdf")),
            Some(&json!({ "page": 4 }))
        );
    }

    #[test]
    fn settings_merge_prefers_live_leaves() {
        let durable = json!({ "wallpaper": "dunes", "grid": { "snap": true, "size": 8 } });
        let live = json!({ "grid": { "size": 16 } });
        let merged =
            merge_settings(durable.as_object().unwrap(), live.as_object().unwrap());
        assert_eq!(
            Value::Object(merged),
            json!({ "wallpaper": "dunes", "grid": { "snap": true, "size": 16 } })
        );
    }
}
