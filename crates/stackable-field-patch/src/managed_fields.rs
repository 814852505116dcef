//! Typed representation of the `FieldsV1` ownership encoding.
//!
//! The API server records which manager owns which field as a nested JSON object whose keys
//! carry a type prefix:
//!
//! - `f:<name>` is a named field of an object,
//! - `k:<json object>` is an array element identified by its merge keys,
//! - `v:<json value>` is a set element identified by its value,
//! - `i:<index>` is an array element identified by its position and
//! - `.` marks that the node itself (and not only its children) is owned.
//!
//! See <https://kubernetes.io/docs/reference/using-api/server-side-apply/#field-management>.

use std::{collections::BTreeMap, num::ParseIntError};

use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu, ensure};

use crate::path::{FieldPath, PathSegment, canonical_json};

const SELF_MARKER: &str = ".";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("managed fields node at {path:?} is not an object"))]
    NotAnObject { path: String },

    #[snafu(display("managed fields key {key:?} at {path:?} has an unknown prefix"))]
    UnknownPrefix { key: String, path: String },

    #[snafu(display("failed to parse selector {key:?} at {path:?}"))]
    ParseSelector {
        source: serde_json::Error,
        key: String,
        path: String,
    },

    #[snafu(display("merge key selector {key:?} at {path:?} is not an object"))]
    KeySelectorNotAnObject { key: String, path: String },

    #[snafu(display("failed to parse index selector {key:?} at {path:?}"))]
    ParseIndex {
        source: ParseIntError,
        key: String,
        path: String,
    },

    #[snafu(display("managed fields node at {path:?} mixes object fields and array elements"))]
    MixedNodeKinds { path: String },
}

/// A node of the ownership tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldNode {
    /// The node is owned as a whole, no children are tracked.
    #[default]
    Leaf,

    /// An object whose children are addressed by field name.
    Object {
        owned: bool,
        fields: BTreeMap<String, FieldNode>,
    },

    /// An array whose children are addressed by a selector. The keys are always one of the
    /// selector variants of [`PathSegment`].
    Array {
        owned: bool,
        items: BTreeMap<PathSegment, FieldNode>,
    },
}

impl FieldNode {
    /// Parses the raw `fieldsV1` value of a managed fields entry.
    pub fn from_fields_v1(raw: &Value) -> Result<Self, Error> {
        parse_node(raw, &FieldPath::root())
    }

    /// Builds a tree out of a set of owned paths. Paths that are a prefix of other paths are
    /// marked as owned at their own level.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a FieldPath>) -> Self {
        let mut trie = Trie::default();
        for path in paths {
            trie.insert(path.segments());
        }
        trie.into_node()
    }

    /// Serializes the tree back into the `fieldsV1` encoding.
    pub fn to_fields_v1(&self) -> Value {
        match self {
            Self::Leaf => Value::Object(Map::new()),
            Self::Object { owned, fields } => {
                let mut encoded = marker(*owned);
                for (name, child) in fields {
                    encoded.insert(format!("f:{name}"), child.to_fields_v1());
                }
                Value::Object(encoded)
            }
            Self::Array { owned, items } => {
                let mut encoded = marker(*owned);
                for (selector, child) in items {
                    encoded.insert(encode_selector(selector), child.to_fields_v1());
                }
                Value::Object(encoded)
            }
        }
    }

    /// Lists every owned path in the tree: one per leaf and one per node that carries the
    /// self marker. The root itself is never listed.
    pub fn paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        self.collect_paths(&FieldPath::root(), &mut paths);
        paths
    }

    fn collect_paths(&self, path: &FieldPath, paths: &mut Vec<FieldPath>) {
        match self {
            Self::Leaf => {
                if !path.is_root() {
                    paths.push(path.clone());
                }
            }
            Self::Object { owned, fields } => {
                if *owned && !path.is_root() {
                    paths.push(path.clone());
                }
                for (name, child) in fields {
                    child.collect_paths(&path.child(PathSegment::field(name)), paths);
                }
            }
            Self::Array { owned, items } => {
                if *owned && !path.is_root() {
                    paths.push(path.clone());
                }
                for (selector, child) in items {
                    child.collect_paths(&path.child(selector.clone()), paths);
                }
            }
        }
    }
}

fn marker(owned: bool) -> Map<String, Value> {
    let mut encoded = Map::new();
    if owned {
        encoded.insert(SELF_MARKER.to_owned(), Value::Object(Map::new()));
    }
    encoded
}

fn encode_selector(selector: &PathSegment) -> String {
    match selector {
        PathSegment::Field(name) => format!("f:{name}"),
        PathSegment::Index(index) => format!("i:{index}"),
        PathSegment::Key(fields) => {
            // The values are canonical JSON already, so they can be spliced in verbatim.
            let body = fields
                .iter()
                .map(|(name, value)| format!("{}:{value}", Value::String(name.clone())))
                .collect::<Vec<_>>()
                .join(",");
            format!("k:{{{body}}}")
        }
        PathSegment::Value(value) => format!("v:{value}"),
    }
}

fn parse_node(raw: &Value, path: &FieldPath) -> Result<FieldNode, Error> {
    let Value::Object(entries) = raw else {
        return NotAnObjectSnafu {
            path: path.to_string(),
        }
        .fail();
    };

    let owned = entries.contains_key(SELF_MARKER);
    let mut fields = BTreeMap::new();
    let mut items = BTreeMap::new();

    for (key, child) in entries {
        if key == SELF_MARKER {
            continue;
        }

        let segment = parse_key(key, path)?;
        let child = parse_node(child, &path.child(segment.clone()))?;
        match segment {
            PathSegment::Field(name) => {
                fields.insert(name, child);
            }
            selector => {
                items.insert(selector, child);
            }
        }
    }

    ensure!(
        fields.is_empty() || items.is_empty(),
        MixedNodeKindsSnafu {
            path: path.to_string()
        }
    );

    Ok(if !fields.is_empty() {
        FieldNode::Object { owned, fields }
    } else if !items.is_empty() {
        FieldNode::Array { owned, items }
    } else {
        FieldNode::Leaf
    })
}

fn parse_key(key: &str, path: &FieldPath) -> Result<PathSegment, Error> {
    let Some((prefix, rest)) = key.split_once(':') else {
        return UnknownPrefixSnafu {
            key,
            path: path.to_string(),
        }
        .fail();
    };

    match prefix {
        "f" => Ok(PathSegment::field(rest)),
        "i" => rest
            .parse()
            .map(PathSegment::Index)
            .with_context(|_| ParseIndexSnafu {
                key,
                path: path.to_string(),
            }),
        "v" => {
            let value: Value = serde_json::from_str(rest).with_context(|_| ParseSelectorSnafu {
                key,
                path: path.to_string(),
            })?;
            Ok(PathSegment::value(&value))
        }
        "k" => {
            let value: Value = serde_json::from_str(rest).with_context(|_| ParseSelectorSnafu {
                key,
                path: path.to_string(),
            })?;
            let Value::Object(key_fields) = value else {
                return KeySelectorNotAnObjectSnafu {
                    key,
                    path: path.to_string(),
                }
                .fail();
            };
            let mut fields: Vec<_> = key_fields
                .iter()
                .map(|(name, value)| (name.clone(), canonical_json(value)))
                .collect();
            fields.sort();
            Ok(PathSegment::Key(fields))
        }
        _ => UnknownPrefixSnafu {
            key,
            path: path.to_string(),
        }
        .fail(),
    }
}

#[derive(Default)]
struct Trie {
    terminal: bool,
    children: BTreeMap<PathSegment, Trie>,
}

impl Trie {
    fn insert(&mut self, segments: &[PathSegment]) {
        match segments.split_first() {
            None => self.terminal = true,
            Some((first, rest)) => self.children.entry(first.clone()).or_default().insert(rest),
        }
    }

    fn into_node(self) -> FieldNode {
        if self.children.is_empty() {
            return FieldNode::Leaf;
        }

        let owned = self.terminal;
        let mut fields = BTreeMap::new();
        let mut items = BTreeMap::new();
        for (segment, child) in self.children {
            match segment {
                PathSegment::Field(name) => {
                    fields.insert(name, child.into_node());
                }
                selector => {
                    items.insert(selector, child.into_node());
                }
            }
        }

        // A node cannot be both an object and an array. Should a caller hand us such paths,
        // the object view wins, which mirrors how the API server treats typed objects.
        if fields.is_empty() {
            FieldNode::Array { owned, items }
        } else {
            FieldNode::Object { owned, fields }
        }
    }
}
