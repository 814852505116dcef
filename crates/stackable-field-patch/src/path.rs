//! Canonical field paths.
//!
//! Paths are rendered dot-separated (`spec.template.metadata.labels`). Array elements get a
//! bracket suffix: a literal document addresses them by position (`args[0]`), whereas the
//! managed fields of an object address them by merge key (`containers[name="nginx"]`) or by
//! value (`finalizers[="example.com/cleanup"]`). Field names which would make the rendering
//! ambiguous are quoted (`annotations["example.com/owner"]`).

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Write as _},
};

use serde_json::Value;
use snafu::{Snafu, ensure};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("JSON pointer {pointer:?} must be empty or start with a slash"))]
    InvalidPointer { pointer: String },
}

/// A single step in a [`FieldPath`].
///
/// Selector values are kept as canonical JSON text, which makes segments totally ordered and
/// keeps `"80"` and `80` apart.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathSegment {
    /// A named field of an object.
    Field(String),

    /// A positional array element.
    Index(usize),

    /// An array element identified by its merge key(s), sorted by key name.
    Key(Vec<(String, String)>),

    /// An element of a set-like array, identified by its own value.
    Value(String),
}

impl PathSegment {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    /// Builds a [`PathSegment::Key`] out of the key fields of an array element.
    pub fn key<'a>(fields: impl IntoIterator<Item = (&'a str, &'a Value)>) -> Self {
        let mut fields: Vec<_> = fields
            .into_iter()
            .map(|(name, value)| (name.to_owned(), canonical_json(value)))
            .collect();
        fields.sort();
        Self::Key(fields)
    }

    pub fn value(value: &Value) -> Self {
        Self::Value(canonical_json(value))
    }

    /// Returns `true` if this segment is one of the array selectors.
    pub fn is_selector(&self) -> bool {
        !matches!(self, Self::Field(_))
    }

    /// Checks whether `element` is addressed by this (selector) segment when it lives at
    /// `position` in its array.
    fn selects(&self, position: usize, element: &Value) -> bool {
        match self {
            Self::Field(_) => false,
            Self::Index(index) => *index == position,
            Self::Key(fields) => fields.iter().all(|(name, expected)| {
                element
                    .get(name)
                    .is_some_and(|actual| &canonical_json(actual) == expected)
            }),
            Self::Value(expected) => &canonical_json(element) == expected,
        }
    }
}

/// A canonical path to a field inside a Kubernetes object.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path consisting only of field names, e.g. `["metadata", "annotations"]`.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        Self(fields.into_iter().map(PathSegment::field).collect())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Returns `true` if `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Returns `true` if `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.0.len() < other.0.len() && self.is_prefix_of(other)
    }

    /// Returns `true` if the path starts with the given field names.
    pub fn starts_with_fields(&self, fields: &[&str]) -> bool {
        fields.len() <= self.0.len()
            && fields
                .iter()
                .zip(&self.0)
                .all(|(expected, segment)| matches!(segment, PathSegment::Field(name) if name == expected))
    }

    /// Looks up the value this path points at inside `document`.
    pub fn resolve<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(document, |current, segment| step(current, segment))
    }

    /// Checks whether this path, taken from a literal `document` (index-based selectors), and
    /// `other`, taken from managed fields (key-based selectors), address overlapping parts of an
    /// object. Two paths overlap if one is a prefix of the other once positional selectors have
    /// been resolved against `document`.
    pub fn overlaps_in(&self, other: &Self, document: &Value) -> bool {
        let mut current = Some(document);

        for (ours, theirs) in self.0.iter().zip(&other.0) {
            let node = current;
            current = node.and_then(|node| step(node, ours));

            if ours == theirs {
                continue;
            }

            let PathSegment::Index(position) = ours else {
                return false;
            };
            let Some(element) = current else {
                return false;
            };
            if !theirs.selects(*position, element) {
                return false;
            }
        }

        true
    }

    /// Converts an RFC 6901 JSON pointer into a path. Numeric tokens become positional
    /// selectors wherever `document` holds an array at that position.
    pub fn from_json_pointer(pointer: &str, document: &Value) -> Result<Self, Error> {
        if pointer.is_empty() {
            return Ok(Self::root());
        }
        ensure!(
            pointer.starts_with('/'),
            InvalidPointerSnafu { pointer }
        );

        let mut segments = Vec::new();
        let mut current = Some(document);

        for token in pointer[1..].split('/') {
            let token = token.replace("~1", "/").replace("~0", "~");
            let segment = match current {
                Some(Value::Array(items)) if token == "-" => PathSegment::Index(items.len()),
                Some(Value::Array(_)) => match token.parse() {
                    Ok(index) => PathSegment::Index(index),
                    Err(_) => PathSegment::Field(token),
                },
                _ => PathSegment::Field(token),
            };
            current = current.and_then(|node| step(node, &segment));
            segments.push(segment);
        }

        Ok(Self(segments))
    }
}

impl From<Vec<PathSegment>> for FieldPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if needs_quoting(name) => {
                    write!(f, "[{}]", Value::String(name.clone()))?;
                }
                PathSegment::Field(name) => {
                    if position > 0 {
                        f.write_char('.')?;
                    }
                    f.write_str(name)?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
                PathSegment::Key(fields) => {
                    f.write_char('[')?;
                    for (nth, (name, value)) in fields.iter().enumerate() {
                        if nth > 0 {
                            f.write_char(',')?;
                        }
                        write!(f, "{name}={value}")?;
                    }
                    f.write_char(']')?;
                }
                PathSegment::Value(value) => write!(f, "[={value}]")?,
            }
        }
        Ok(())
    }
}

fn needs_quoting(name: &str) -> bool {
    name.is_empty()
        || name
            .chars()
            .any(|c| matches!(c, '.' | '[' | ']' | '"' | '=' | ',') || c.is_whitespace())
}

fn step<'a>(node: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match (node, segment) {
        (Value::Object(fields), PathSegment::Field(name)) => fields.get(name),
        (Value::Array(items), selector) => items
            .iter()
            .enumerate()
            .find(|(position, item)| selector.selects(*position, item))
            .map(|(_, item)| item),
        _ => None,
    }
}

/// Lists the path of every leaf of a literal document, with positional array selectors.
///
/// Empty objects and arrays are leaves themselves. Scalars at the root produce no path.
pub fn document_paths(document: &Value) -> Vec<FieldPath> {
    let mut paths = Vec::new();
    collect_document_paths(document, &FieldPath::root(), &mut paths);
    paths
}

fn collect_document_paths(node: &Value, path: &FieldPath, paths: &mut Vec<FieldPath>) {
    match node {
        Value::Object(fields) if !fields.is_empty() => {
            for (name, child) in fields {
                collect_document_paths(child, &path.child(PathSegment::field(name)), paths);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                collect_document_paths(child, &path.child(PathSegment::Index(index)), paths);
            }
        }
        _ if path.is_root() => {}
        _ => paths.push(path.clone()),
    }
}

/// Serializes `value` as compact JSON with object keys sorted, independent of the order in
/// which they were parsed.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(fields) => {
            let sorted: BTreeMap<_, _> = fields.iter().collect();
            let body = sorted
                .into_iter()
                .map(|(name, child)| {
                    format!("{}:{}", Value::String(name.clone()), canonical_json(child))
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn rendered(paths: &[FieldPath]) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn document_paths_are_listed_per_leaf() {
        let document = json!({
            "data": {"k": "v", "other": "x"},
            "spec": {
                "replicas": 3,
                "template": {"spec": {"containers": [{"name": "app", "args": ["-v"]}]}}
            },
            "metadata": {"labels": {}}
        });

        let mut paths = rendered(&document_paths(&document));
        paths.sort();

        assert_eq!(paths, vec![
            "data.k",
            "data.other",
            "metadata.labels",
            "spec.replicas",
            "spec.template.spec.containers[0].args[0]",
            "spec.template.spec.containers[0].name",
        ]);
    }

    #[test]
    fn scalar_root_has_no_paths() {
        assert!(document_paths(&json!("just a string")).is_empty());
    }

    #[rstest]
    #[case(FieldPath::from_fields(["data", "k"]), "data.k")]
    #[case(
        FieldPath::from_fields(["metadata", "annotations", "example.com/owner"]),
        r#"metadata.annotations["example.com/owner"]"#
    )]
    #[case(
        FieldPath::from_fields(["spec", "containers"]).child(PathSegment::key([("name", &json!("nginx"))])),
        r#"spec.containers[name="nginx"]"#
    )]
    #[case(
        FieldPath::from_fields(["ports"]).child(PathSegment::key([
            ("protocol", &json!("TCP")),
            ("containerPort", &json!(80)),
        ])),
        r#"ports[containerPort=80,protocol="TCP"]"#
    )]
    #[case(
        FieldPath::from_fields(["metadata", "finalizers"]).child(PathSegment::value(&json!("a/b"))),
        r#"metadata.finalizers[="a/b"]"#
    )]
    #[case(FieldPath::from_fields(["args"]).child(PathSegment::Index(2)), "args[2]")]
    fn paths_render_canonically(#[case] path: FieldPath, #[case] expected: &str) {
        assert_eq!(path.to_string(), expected);
    }

    #[test]
    fn resolve_follows_all_selector_kinds() {
        let document = json!({
            "spec": {
                "containers": [
                    {"name": "sidecar", "image": "busybox"},
                    {"name": "app", "image": "nginx"}
                ],
                "finalizers": ["one", "two"]
            }
        });

        let by_key = FieldPath::from_fields(["spec", "containers"])
            .child(PathSegment::key([("name", &json!("app"))]))
            .child(PathSegment::field("image"));
        let by_index = FieldPath::from_fields(["spec", "containers"])
            .child(PathSegment::Index(0))
            .child(PathSegment::field("image"));
        let by_value =
            FieldPath::from_fields(["spec", "finalizers"]).child(PathSegment::value(&json!("two")));

        assert_eq!(by_key.resolve(&document), Some(&json!("nginx")));
        assert_eq!(by_index.resolve(&document), Some(&json!("busybox")));
        assert_eq!(by_value.resolve(&document), Some(&json!("two")));
        assert_eq!(
            FieldPath::from_fields(["spec", "missing"]).resolve(&document),
            None
        );
    }

    #[test]
    fn positional_and_keyed_paths_overlap_through_the_document() {
        let patch = json!({"spec": {"containers": [{"name": "app", "image": "nginx:2"}]}});
        let touched = FieldPath::from_fields(["spec", "containers"])
            .child(PathSegment::Index(0))
            .child(PathSegment::field("image"));

        let same_container = FieldPath::from_fields(["spec", "containers"])
            .child(PathSegment::key([("name", &json!("app"))]))
            .child(PathSegment::field("image"));
        let other_container = FieldPath::from_fields(["spec", "containers"])
            .child(PathSegment::key([("name", &json!("sidecar"))]))
            .child(PathSegment::field("image"));
        let whole_spec = FieldPath::from_fields(["spec"]);
        let sibling = FieldPath::from_fields(["spec", "replicas"]);

        assert!(touched.overlaps_in(&same_container, &patch));
        assert!(!touched.overlaps_in(&other_container, &patch));
        assert!(touched.overlaps_in(&whole_spec, &patch));
        assert!(!touched.overlaps_in(&sibling, &patch));
    }

    #[rstest]
    #[case("/data/k", "data.k")]
    #[case("/spec/args/1", "spec.args[1]")]
    #[case("/spec/args/-", "spec.args[2]")]
    #[case("/metadata/annotations/example.com~1owner", r#"metadata.annotations["example.com/owner"]"#)]
    #[case("/data/0", "data.0")]
    #[case("", "")]
    fn json_pointers_become_paths(#[case] pointer: &str, #[case] expected: &str) {
        let document = json!({"spec": {"args": ["a", "b"]}, "data": {}});
        let path = FieldPath::from_json_pointer(pointer, &document).expect("valid pointer");
        assert_eq!(path.to_string(), expected);
    }

    #[test]
    fn json_pointer_must_start_with_slash() {
        let err = FieldPath::from_json_pointer("data/k", &json!({})).expect_err("invalid pointer");
        assert_eq!(err, Error::InvalidPointer {
            pointer: "data/k".to_owned()
        });
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [true, null], "x": "s"}}"#)
            .expect("valid JSON");
        assert_eq!(canonical_json(&a), r#"{"a":{"x":"s","y":[true,null]},"b":1}"#);
    }

    #[test]
    fn prefix_relations() {
        let parent = FieldPath::from_fields(["spec"]);
        let child = FieldPath::from_fields(["spec", "replicas"]);

        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_ancestor_of(&child));
        assert!(child.is_prefix_of(&child));
        assert!(!child.is_ancestor_of(&child));
        assert!(child.starts_with_fields(&["spec"]));
        assert!(!parent.starts_with_fields(&["spec", "replicas"]));
    }
}
