//! Which field manager owns which field of an object.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    managed_fields::{self, FieldNode},
    manager::ManagerEquivalence,
    path::{FieldPath, PathSegment},
};

/// Subtrees which are never part of a patch and which change on their own.
const VOLATILE_SUBTREES: &[&[&str]] = &[
    &["status"],
    &["metadata", "managedFields"],
    &["metadata", "resourceVersion"],
    &["metadata", "generation"],
    &["metadata", "creationTimestamp"],
    &["metadata", "uid"],
    &["metadata", "selfLink"],
];

/// Annotations the API server or built-in controllers update opportunistically, outside of any
/// explicit write by a manager.
const VOLATILE_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
    "control-plane.alpha.kubernetes.io/leader",
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse managed fields of manager {manager:?}"))]
    ParseManagedFields {
        source: managed_fields::Error,
        manager: String,
    },
}

/// Returns `true` for paths which must be ignored for conflict and drift detection.
pub fn is_volatile(path: &FieldPath) -> bool {
    if VOLATILE_SUBTREES
        .iter()
        .any(|subtree| path.starts_with_fields(subtree))
    {
        return true;
    }

    match path.segments() {
        [
            PathSegment::Field(metadata),
            PathSegment::Field(annotations),
            PathSegment::Field(annotation),
            ..,
        ] => {
            metadata == "metadata"
                && annotations == "annotations"
                && VOLATILE_ANNOTATIONS.contains(&annotation.as_str())
        }
        _ => false,
    }
}

/// Maps every owned path of an object to the managers owning it, in the order in which the
/// managed fields entries list them.
///
/// Built fresh from the live object on every cycle. Volatile paths (see [`is_volatile`]) are
/// dropped while building.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipIndex {
    owners: BTreeMap<FieldPath, Vec<String>>,
}

impl OwnershipIndex {
    pub fn from_object(object: &DynamicObject) -> Result<Self, Error> {
        Self::from_entries(object.metadata.managed_fields.as_deref().unwrap_or_default())
    }

    pub fn from_entries(entries: &[ManagedFieldsEntry]) -> Result<Self, Error> {
        let mut owners: BTreeMap<FieldPath, Vec<String>> = BTreeMap::new();

        for entry in entries {
            let Some(manager) = &entry.manager else {
                tracing::debug!(operation = ?entry.operation, "skipping managed fields entry without manager");
                continue;
            };
            let Some(fields) = &entry.fields_v1 else {
                continue;
            };

            let node = FieldNode::from_fields_v1(&fields.0)
                .with_context(|_| ParseManagedFieldsSnafu { manager })?;

            for path in node.paths() {
                if is_volatile(&path) {
                    continue;
                }
                let path_owners = owners.entry(path).or_default();
                if !path_owners.contains(manager) {
                    path_owners.push(manager.clone());
                }
            }
        }

        Ok(Self { owners })
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// All managers owning `path`, in managed fields order.
    pub fn owners(&self, path: &FieldPath) -> &[String] {
        self.owners.get(path).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &[String])> {
        self.owners
            .iter()
            .map(|(path, owners)| (path, owners.as_slice()))
    }

    /// All distinct managers appearing in the index.
    pub fn managers(&self) -> BTreeSet<&str> {
        self.owners
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// The paths owned by any manager of the given equivalence class.
    pub fn paths_owned_by(&self, equivalence: &ManagerEquivalence) -> BTreeSet<FieldPath> {
        self.owners
            .iter()
            .filter(|(_, owners)| owners.iter().any(|owner| equivalence.contains(owner)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Resolves every path to a single manager.
    ///
    /// If several managers claim a path, the first one wins. The index never arbitrates
    /// between them, it only reports what the API server recorded.
    pub fn resolve(&self) -> BTreeMap<FieldPath, String> {
        self.owners
            .iter()
            .filter_map(|(path, owners)| {
                if owners.len() > 1 {
                    tracing::debug!(
                        path = %path,
                        ?owners,
                        "path is claimed by multiple managers, using the first one"
                    );
                }
                owners.first().map(|owner| (path.clone(), owner.clone()))
            })
            .collect()
    }

    /// Builds the persisted ownership snapshot. Paths we share with other managers are
    /// attributed to us, as one writer cannot own a path twice.
    pub fn snapshot(&self, equivalence: &ManagerEquivalence, ours: &str) -> OwnershipSnapshot {
        let entries = self
            .resolve()
            .into_iter()
            .map(|(path, first_owner)| {
                let owner = if self
                    .owners(&path)
                    .iter()
                    .any(|owner| equivalence.contains(owner))
                {
                    ours.to_owned()
                } else {
                    first_owner
                };
                (path.to_string(), owner)
            })
            .collect();

        OwnershipSnapshot(entries)
    }
}

/// The persisted `path -> manager` form of an [`OwnershipIndex`], as recorded after the last
/// successful cycle of a binding.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct OwnershipSnapshot(BTreeMap<String, String>);

impl OwnershipSnapshot {
    pub fn owner(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(path, owner)| (path.as_str(), owner.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for OwnershipSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
