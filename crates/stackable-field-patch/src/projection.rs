//! Flattened, order independent views of the fields a binding owns.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::{FieldPath, canonical_json};

/// `path -> value` of every field a binding owns.
///
/// Two projections are equal if they contain the same entries, regardless of how the patch
/// document they were computed from was formatted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Projection(BTreeMap<String, String>);

impl Projection {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(path, value)| (path.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Projection {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(path, value)| (path.into(), value.into()))
                .collect(),
        )
    }
}

/// The projection of a binding, or the explicit statement that none can be computed.
///
/// `Unknown` is distinct from an empty projection: it is used for patch kinds for which the
/// API server reports no ownership, and for targets which do not exist yet at plan time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProjectionState {
    Known { fields: Projection },
    Unknown,
}

impl ProjectionState {
    pub fn known(&self) -> Option<&Projection> {
        match self {
            Self::Known { fields } => Some(fields),
            Self::Unknown => None,
        }
    }
}

impl From<Projection> for ProjectionState {
    fn from(fields: Projection) -> Self {
        Self::Known { fields }
    }
}

/// Renders a field value for a projection.
///
/// Strings are taken verbatim, other scalars use their JSON literal form and compound values
/// are rendered as compact JSON with sorted keys.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        Value::Null | Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Object(_) | Value::Array(_) => canonical_json(value),
    }
}

/// Only keeps the deepest paths: a path is dropped if another owned path lies below it.
///
/// The API server marks list items (and maps created by a manager) as owned on their own,
/// in addition to their owned children. Projecting those would drag in fields other managers
/// own inside the same item.
pub fn leaf_paths(owned: &BTreeSet<FieldPath>) -> BTreeSet<&FieldPath> {
    owned
        .iter()
        .filter(|path| {
            // Descendants sort directly after their ancestor.
            owned
                .range::<FieldPath, _>((
                    std::ops::Bound::Excluded(*path),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .is_none_or(|next| !path.is_ancestor_of(next))
        })
        .collect()
}

/// Flattens `object` into a projection, restricted to the `owned` paths.
///
/// Owned paths which no longer resolve (e.g. because the value was removed) are skipped.
pub fn flatten(object: &Value, owned: &BTreeSet<FieldPath>) -> Projection {
    leaf_paths(owned)
        .into_iter()
        .filter_map(|path| {
            let value = path.resolve(object);
            if value.is_none() {
                tracing::debug!(path = %path, "owned path does not resolve, skipping");
            }
            value.map(|value| (path.to_string(), stringify(value)))
        })
        .collect()
}
