//! Detects who a patch would take fields away from, and refuses patches which must never be
//! applied at all.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::Value;
use snafu::Snafu;
use strum::Display;

use crate::{
    diagnostics::Diagnostic,
    manager::{FieldManager, ManagerEquivalence, ManagerPolicy},
    ownership::{OwnershipIndex, OwnershipSnapshot},
    path::FieldPath,
};

/// How many entries are listed in a message before the rest is summarized.
pub const DISPLAY_LIMIT: usize = 5;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "{target} is managed as a whole by {manager:?} and cannot be patched partially"
    ))]
    ManagedByLifecycleManager { target: String, manager: String },

    #[snafu(display(
        "{target} carries the annotation {annotation:?}, it is managed as a whole and cannot be patched partially"
    ))]
    ManagedByLifecycleAnnotation { target: String, annotation: String },

    #[snafu(display(
        "fields of {target} are already patched by another binding with field manager {manager:?}: {paths}"
    ))]
    OverlappingBinding {
        target: String,
        manager: String,
        paths: String,
    },
}

/// Refuses objects which are managed as a whole by the full object lifecycle tooling.
/// Patching those partially would create write races nobody can resolve.
pub fn check_self_management(
    target: &str,
    object: &DynamicObject,
    policy: &ManagerPolicy,
) -> Result<(), Error> {
    let annotated = object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&policy.lifecycle_annotation))
        .is_some_and(|value| value != "false");
    if annotated {
        return ManagedByLifecycleAnnotationSnafu {
            target,
            annotation: &policy.lifecycle_annotation,
        }
        .fail();
    }

    let lifecycle_manager = object
        .metadata
        .managed_fields
        .iter()
        .flatten()
        .filter_map(|entry| entry.manager.as_deref())
        .find(|manager| policy.is_lifecycle_manager(manager));
    if let Some(manager) = lifecycle_manager {
        return ManagedByLifecycleManagerSnafu { target, manager }.fail();
    }

    Ok(())
}

/// Refuses patches which touch fields another patch binding already owns. Two bindings
/// writing the same field would take it from each other on every cycle.
///
/// `context` is the document positional selectors in `touched` refer to, see
/// [`Patch::touched_paths`](crate::patch::Patch::touched_paths).
pub fn check_cross_binding(
    target: &str,
    touched: &[FieldPath],
    context: &Value,
    live: &OwnershipIndex,
    policy: &ManagerPolicy,
    equivalence: &ManagerEquivalence,
) -> Result<(), Error> {
    let mut overlaps: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for (owned_path, owners) in live.iter() {
        let foreign_bindings = owners
            .iter()
            .filter(|owner| policy.is_patch_manager(owner) && !equivalence.contains(owner));
        for owner in foreign_bindings {
            if touched
                .iter()
                .any(|path| path.overlaps_in(owned_path, context))
            {
                overlaps
                    .entry(owner.as_str())
                    .or_default()
                    .push(owned_path.to_string());
            }
        }
    }

    match overlaps.into_iter().next() {
        Some((manager, paths)) => OverlappingBindingSnafu {
            target,
            manager,
            paths: summarize(&paths),
        }
        .fail(),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, Debug, Display, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "kebab-case")]
pub enum TransitionKind {
    /// Nobody owned the field before.
    FirstOwnership,

    /// The field is taken over from another manager.
    Takeover,

    /// A field the binding owned after its last cycle is now owned by somebody else.
    Lost,
}

/// A change of ownership of a single field.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub path: String,
    pub current_owner: Option<String>,
    pub incoming_owner: String,
    pub kind: TransitionKind,
}

impl ConflictRecord {
    fn describe(&self) -> String {
        format!(
            "{path}: {current} -> {incoming}",
            path = self.path,
            current = self.current_owner.as_deref().unwrap_or("<none>"),
            incoming = self.incoming_owner
        )
    }
}

/// All ownership transitions of one cycle.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conflicts(Vec<ConflictRecord>);

impl Conflicts {
    pub fn records(&self) -> &[ConflictRecord] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn of_kind(&self, kind: TransitionKind) -> impl Iterator<Item = &ConflictRecord> {
        self.0.iter().filter(move |record| record.kind == kind)
    }

    /// Aggregates all records into a single user facing diagnostic.
    ///
    /// It is a warning if any field changes hands between managers, and informational if
    /// fields only become owned for the first time.
    pub fn to_diagnostic(&self) -> Option<Diagnostic> {
        if self.0.is_empty() {
            return None;
        }

        let changed = self
            .0
            .iter()
            .filter(|record| record.kind != TransitionKind::FirstOwnership)
            .count();
        let lines: Vec<_> = self.0.iter().map(ConflictRecord::describe).collect();
        let detail = summarize_lines(&lines);

        Some(if changed > 0 {
            Diagnostic::warning(
                format!(
                    "{changed} field(s) change ownership, {total} ownership transition(s) in total",
                    total = self.0.len()
                ),
                detail,
            )
        } else {
            Diagnostic::info(
                format!("{} field(s) become owned for the first time", self.0.len()),
                detail,
            )
        })
    }
}

/// Diffs the ownership of an object before and after a (simulated) apply.
///
/// `before` is the live ownership, `after` the one reported by the apply. `previous` is the
/// snapshot recorded by the last successful cycle of the binding, if any.
pub fn ownership_transitions(
    before: &OwnershipIndex,
    after: &OwnershipIndex,
    previous: Option<&OwnershipSnapshot>,
    equivalence: &ManagerEquivalence,
    incoming: &FieldManager,
) -> Conflicts {
    let mut records = Vec::new();

    for path in after.paths_owned_by(equivalence) {
        let owners = before.owners(&path);
        if owners.iter().any(|owner| equivalence.contains(owner)) {
            continue;
        }

        let rendered = path.to_string();
        match owners.first() {
            Some(current) => {
                tracing::warn!(
                    path = rendered,
                    current_owner = current,
                    incoming_owner = incoming.name(),
                    "taking over field from another manager"
                );
                records.push(ConflictRecord {
                    path: rendered,
                    current_owner: Some(current.clone()),
                    incoming_owner: incoming.name().to_owned(),
                    kind: TransitionKind::Takeover,
                });
            }
            None => {
                let owned_previously = previous
                    .and_then(|snapshot| snapshot.owner(&rendered))
                    .is_some_and(|owner| equivalence.contains(owner));
                if !owned_previously {
                    records.push(ConflictRecord {
                        path: rendered,
                        current_owner: None,
                        incoming_owner: incoming.name().to_owned(),
                        kind: TransitionKind::FirstOwnership,
                    });
                }
            }
        }
    }

    let resolved_after = after.resolve();
    let resolved_after: BTreeMap<String, (&FieldPath, &String)> = resolved_after
        .iter()
        .map(|(path, owner)| (path.to_string(), (path, owner)))
        .collect();
    for (path, owner) in previous.iter().flat_map(|snapshot| snapshot.iter()) {
        if !equivalence.contains(owner) {
            continue;
        }
        let Some(&(after_path, new_owner)) = resolved_after.get(path) else {
            continue;
        };
        if after
            .owners(after_path)
            .iter()
            .any(|owner| equivalence.contains(owner))
        {
            continue;
        }

        tracing::warn!(
            path,
            new_owner,
            "field owned by this binding was taken over by another manager"
        );
        records.push(ConflictRecord {
            path: path.to_owned(),
            current_owner: Some(incoming.name().to_owned()),
            incoming_owner: new_owner.clone(),
            kind: TransitionKind::Lost,
        });
    }

    Conflicts(records)
}

/// Joins items into a single line, summarizing everything past [`DISPLAY_LIMIT`].
pub fn summarize(items: &[String]) -> String {
    let mut summary = items
        .iter()
        .take(DISPLAY_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > DISPLAY_LIMIT {
        summary.push_str(&format!(" (+{} more)", items.len() - DISPLAY_LIMIT));
    }
    summary
}

pub(crate) fn summarize_lines(lines: &[String]) -> String {
    let mut summary = lines
        .iter()
        .take(DISPLAY_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    if lines.len() > DISPLAY_LIMIT {
        summary.push_str(&format!("\n+{} more", lines.len() - DISPLAY_LIMIT));
    }
    summary
}
