//! Field manager identities.
//!
//! Every patch binding writes under its own field manager, built from a reserved prefix and
//! the binding id. At plan time a binding may not have an id yet, in which case the dry run is
//! performed under a placeholder identity. [`ManagerEquivalence`] makes the placeholder and the
//! real identity interchangeable when ownership is compared.

use std::{collections::BTreeSet, fmt::Display};

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// Prefix of the field managers of patch bindings.
pub const DEFAULT_PATCH_MANAGER_PREFIX: &str = "field-patch.stackable.tech/";

/// Suffix of the placeholder manager used while planning bindings without an id.
pub const PLANNED_MANAGER_SUFFIX: &str = "planned";

/// Prefix of the field managers used by the full object lifecycle tooling.
pub const DEFAULT_LIFECYCLE_MANAGER_PREFIX: &str = "manifest.stackable.tech/";

/// Annotation set by the full object lifecycle tooling on objects it owns.
pub const DEFAULT_LIFECYCLE_ANNOTATION: &str = "manifest.stackable.tech/managed";

/// The API server rejects field managers longer than this.
const MAX_FIELD_MANAGER_LENGTH: usize = 128;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("binding id must not be empty"))]
    EmptyBindingId,

    #[snafu(display(
        "binding id {binding_id:?} is reserved for planning and cannot be used for a binding"
    ))]
    ReservedBindingId { binding_id: String },

    #[snafu(display(
        "field manager {manager:?} exceeds the maximum length of {MAX_FIELD_MANAGER_LENGTH} characters"
    ))]
    FieldManagerTooLong { manager: String },

    #[snafu(display(
        "field manager {manager:?} does not start with the patch manager prefix {prefix:?}"
    ))]
    ForeignFieldManager { manager: String, prefix: String },
}

/// The reserved field manager names and annotations this tool recognizes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerPolicy {
    /// Prefix shared by the field managers of all patch bindings.
    pub patch_prefix: String,

    /// Prefix of the field managers used by the full object lifecycle tooling.
    pub lifecycle_prefix: String,

    /// Annotation the full object lifecycle tooling puts on objects it owns.
    pub lifecycle_annotation: String,
}

impl Default for ManagerPolicy {
    fn default() -> Self {
        Self {
            patch_prefix: DEFAULT_PATCH_MANAGER_PREFIX.to_owned(),
            lifecycle_prefix: DEFAULT_LIFECYCLE_MANAGER_PREFIX.to_owned(),
            lifecycle_annotation: DEFAULT_LIFECYCLE_ANNOTATION.to_owned(),
        }
    }
}

impl ManagerPolicy {
    /// The placeholder identity used while planning a binding that does not have an id yet.
    pub fn planned_manager(&self) -> FieldManager {
        FieldManager {
            name: format!("{}{PLANNED_MANAGER_SUFFIX}", self.patch_prefix),
            planned: true,
        }
    }

    /// The identity of the binding with the given id.
    pub fn bound_manager(&self, binding_id: &str) -> Result<FieldManager, Error> {
        ensure!(!binding_id.is_empty(), EmptyBindingIdSnafu);
        ensure!(
            binding_id != PLANNED_MANAGER_SUFFIX,
            ReservedBindingIdSnafu { binding_id }
        );

        let name = format!("{}{binding_id}", self.patch_prefix);
        ensure!(
            name.len() <= MAX_FIELD_MANAGER_LENGTH,
            FieldManagerTooLongSnafu { manager: name }
        );

        Ok(FieldManager {
            name,
            planned: false,
        })
    }

    /// Restores a bound identity from its persisted name.
    pub fn manager_from_name(&self, name: &str) -> Result<FieldManager, Error> {
        let Some(binding_id) = name.strip_prefix(&self.patch_prefix) else {
            return ForeignFieldManagerSnafu {
                manager: name,
                prefix: &self.patch_prefix,
            }
            .fail();
        };
        self.bound_manager(binding_id)
    }

    /// Returns `true` if `manager` belongs to any patch binding (including the placeholder).
    pub fn is_patch_manager(&self, manager: &str) -> bool {
        manager.starts_with(&self.patch_prefix)
    }

    /// Returns `true` if `manager` belongs to the full object lifecycle tooling.
    pub fn is_lifecycle_manager(&self, manager: &str) -> bool {
        manager.starts_with(&self.lifecycle_prefix)
    }

    /// Builds the equivalence class of `manager`: its own name plus the planning placeholder.
    pub fn equivalence(&self, manager: &FieldManager) -> ManagerEquivalence {
        ManagerEquivalence {
            names: BTreeSet::from([manager.name.clone(), self.planned_manager().name]),
        }
    }
}

/// A field manager identity used to write patches.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FieldManager {
    name: String,
    planned: bool,
}

impl FieldManager {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for the planning placeholder.
    pub fn is_planned(&self) -> bool {
        self.planned
    }
}

impl Display for FieldManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// The set of manager names which all stand for the same eventual writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerEquivalence {
    names: BTreeSet<String>,
}

impl ManagerEquivalence {
    pub fn contains(&self, manager: &str) -> bool {
        self.names.contains(manager)
    }
}
