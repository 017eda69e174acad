// Replicated map adapter: nested JSON values <-> flat dotted-path maps.
//
// A replicated document stores one entry per leaf, keyed by its dotted path
// (`windows.w1.position.x`). Writing a whole sub-object and later one of its
// leaves can leave a parent key and a child key live at the same time;
// `prune_parent_keys` keeps only the most granular writes.
//
// Segment escaping keeps the mapping lossless:
// - `~` -> `~0`, `.` -> `~1`
// - the empty object key -> `~-`
// - an all-digit object key gets a `~3` prefix so it is never read back as an
//   array index

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Flat dotted-path view of a nested value. Ordered so parent/child keys sort together.
pub type FlatMap = BTreeMap<String, Value>;

pub const PATH_SEPARATOR: char = '.';

const EMPTY_SEGMENT: &str = "~-";
const NUMERIC_KEY_PREFIX: &str = "~3";

/// Operations needed to move a replicated map from one flat state to another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatDiff {
    pub set: FlatMap,
    pub remove: Vec<String>,
}

impl FlatDiff {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

// ── Paths ───────────────────────────────────────────────────────────

/// Escape an object key so it can be used as a single path segment.
pub fn escape_segment(key: &str) -> Cow<'_, str> {
    if key.is_empty() {
        return Cow::Borrowed(EMPTY_SEGMENT);
    }
    if key.bytes().all(|b| b.is_ascii_digit()) {
        return Cow::Owned(format!("{NUMERIC_KEY_PREFIX}{key}"));
    }
    if !key.contains(['~', '.']) {
        return Cow::Borrowed(key);
    }

    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        match ch {
            '~' => out.push_str("~0"),
            '.' => out.push_str("~1"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Inverse of [`escape_segment`]. Unknown escapes are kept verbatim.
pub fn unescape_segment(segment: &str) -> String {
    if segment == EMPTY_SEGMENT {
        return String::new();
    }
    if let Some(digits) = segment.strip_prefix(NUMERIC_KEY_PREFIX) {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return digits.to_string();
        }
    }

    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('.'),
            Some(other) => {
                out.push('~');
                out.push(other);
            }
            None => out.push('~'),
        }
    }
    out
}

/// Append an already-escaped segment to a path.
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{segment}")
    }
}

/// Build a path from raw (unescaped) object keys.
pub fn path_of<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    keys.into_iter().fold(String::new(), |path, key| join_path(&path, &escape_segment(key)))
}

/// True when `key` is `prefix` itself or lives underneath it.
pub fn is_under(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key[prefix.len()..].starts_with(PATH_SEPARATOR))
}

// ── Flatten ─────────────────────────────────────────────────────────

/// Flatten a nested value into dotted-path leaves.
///
/// Empty objects and arrays are kept as leaves so they survive a round trip.
/// A scalar at the root is stored under the empty key.
pub fn flatten(value: &Value) -> FlatMap {
    flatten_at("", value)
}

/// Flatten `value` beneath an existing (escaped) path prefix.
pub fn flatten_at(prefix: &str, value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    flatten_into(prefix, value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut FlatMap) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(&join_path(prefix, &escape_segment(key)), child, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(&join_path(prefix, &index.to_string()), child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}

/// Drop every key that is a strict path prefix of another key.
///
/// A parent entry next to a child entry means a whole sub-object was written
/// and then one of its leaves was written again; the child is newer and more
/// granular, so the parent is shadowed.
pub fn prune_parent_keys(flat: &FlatMap) -> FlatMap {
    flat.iter()
        .filter(|(key, _)| !has_children(flat, key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn has_children(flat: &FlatMap, key: &str) -> bool {
    if key.is_empty() {
        return flat.len() > 1;
    }
    let child_prefix = format!("{key}{PATH_SEPARATOR}");
    flat.range(child_prefix.clone()..)
        .next()
        .map(|(candidate, _)| candidate.starts_with(&child_prefix))
        .unwrap_or(false)
}

// ── Unflatten ───────────────────────────────────────────────────────

enum Node {
    Leaf(Value),
    Branch(BTreeMap<String, Node>),
}

/// Rebuild a nested value from dotted-path leaves.
///
/// Expects a pruned map; if a key is both a leaf and a parent, the children
/// win. A branch becomes an array only when its segments are exactly `0..n`.
pub fn unflatten(flat: &FlatMap) -> Value {
    if flat.len() == 1 {
        if let Some(root) = flat.get("") {
            return root.clone();
        }
    }

    let mut root = BTreeMap::new();
    for (path, value) in flat {
        if path.is_empty() {
            continue;
        }
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        insert_path(&mut root, &segments, value);
    }
    branch_to_value(root)
}

fn insert_path(branch: &mut BTreeMap<String, Node>, segments: &[&str], value: &Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        // Never let a leaf overwrite children that are already present.
        if !matches!(branch.get(*head), Some(Node::Branch(_))) {
            branch.insert(head.to_string(), Node::Leaf(value.clone()));
        }
        return;
    }

    let node = branch.entry(head.to_string()).or_insert_with(|| Node::Branch(BTreeMap::new()));
    if let Node::Leaf(_) = node {
        *node = Node::Branch(BTreeMap::new());
    }
    if let Node::Branch(children) = node {
        insert_path(children, rest, value);
    }
}

fn branch_to_value(branch: BTreeMap<String, Node>) -> Value {
    if let Some(indices) = array_indices(&branch) {
        let mut items: Vec<(usize, Node)> =
            indices.into_iter().zip(branch.into_values()).collect();
        items.sort_by_key(|(index, _)| *index);
        return Value::Array(items.into_iter().map(|(_, node)| node_to_value(node)).collect());
    }

    let mut map = Map::new();
    for (segment, node) in branch {
        map.insert(unescape_segment(&segment), node_to_value(node));
    }
    Value::Object(map)
}

fn node_to_value(node: Node) -> Value {
    match node {
        Node::Leaf(value) => value,
        Node::Branch(children) => branch_to_value(children),
    }
}

/// Parsed indices (in key order) when the segments are exactly `0..n`.
fn array_indices(branch: &BTreeMap<String, Node>) -> Option<Vec<usize>> {
    if branch.is_empty() {
        return None;
    }
    let mut indices = Vec::with_capacity(branch.len());
    for segment in branch.keys() {
        if segment.len() > 1 && segment.starts_with('0') {
            return None;
        }
        indices.push(segment.parse::<usize>().ok()?);
    }
    let mut sorted = indices.clone();
    sorted.sort_unstable();
    if sorted.iter().enumerate().all(|(expected, actual)| expected == *actual) {
        Some(indices)
    } else {
        None
    }
}

// ── Diff ────────────────────────────────────────────────────────────

/// Compute the sets/removes that turn `old` into `new`.
pub fn diff_flat(old: &FlatMap, new: &FlatMap) -> FlatDiff {
    let set = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let remove = old.keys().filter(|key| !new.contains_key(*key)).cloned().collect();
    FlatDiff { set, remove }
}
