//! Compares the values a binding declares with the values found on the live object.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{
    conflict::summarize_lines,
    diagnostics::Diagnostic,
    manager::ManagerEquivalence,
    ownership::OwnershipIndex,
    path::{FieldPath, document_paths},
    projection::{Projection, stringify},
};

/// An owned field whose live value differs from the declared one.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriftedField {
    pub path: String,
    pub declared: String,

    /// `None` if the field was removed from the live object.
    pub live: Option<String>,

    /// The managers other than this binding which own the field on the live object. Empty if
    /// the value was overwritten without taking ownership.
    pub interfering_managers: Vec<String>,
}

/// Compares the `stored` projection of the last successful cycle with the `live` object.
///
/// The stored projection is the reference, not the patch as it is configured now: a patch
/// edited since the last apply is a planned change, not drift. Values are compared in their
/// projected form, ownership alone is not enough because a writer may clobber a value without
/// ever showing up in the managed fields.
pub fn detect_drift(
    stored: &Projection,
    live: &Value,
    live_ownership: &OwnershipIndex,
    equivalence: &ManagerEquivalence,
) -> Vec<DriftedField> {
    // Owned paths address list items by key, which plain document paths cannot.
    let mut live_paths: BTreeMap<String, FieldPath> = document_paths(live)
        .into_iter()
        .map(|path| (path.to_string(), path))
        .collect();
    live_paths.extend(
        live_ownership
            .iter()
            .map(|(path, _)| (path.to_string(), path.clone())),
    );

    stored
        .iter()
        .filter_map(|(rendered, declared)| {
            let path = live_paths.get(rendered);
            let live_value = path.and_then(|path| path.resolve(live)).map(stringify);
            if live_value.as_deref() == Some(declared) {
                return None;
            }

            let interfering_managers: Vec<_> = path
                .map(|path| live_ownership.owners(path))
                .unwrap_or_default()
                .iter()
                .filter(|owner| !equivalence.contains(owner))
                .cloned()
                .collect();

            tracing::warn!(
                path = rendered,
                ?interfering_managers,
                "field drifted from its applied value"
            );

            Some(DriftedField {
                path: rendered.to_owned(),
                declared: declared.to_owned(),
                live: live_value,
                interfering_managers,
            })
        })
        .collect()
}

/// Summarizes the drifted fields into one warning.
pub fn drift_diagnostic(drifted: &[DriftedField], corrected: bool) -> Option<Diagnostic> {
    if drifted.is_empty() {
        return None;
    }

    let lines: Vec<_> = drifted
        .iter()
        .map(|field| {
            let live = field
                .live
                .as_deref()
                .map_or_else(|| "<removed>".to_owned(), |live| format!("{live:?}"));
            let managers = if field.interfering_managers.is_empty() {
                "an unknown writer".to_owned()
            } else {
                field.interfering_managers.join(", ")
            };
            format!(
                "{path}: declared {declared:?}, found {live} (changed by {managers})",
                path = field.path,
                declared = field.declared,
            )
        })
        .collect();

    let summary = if corrected {
        format!("{} field(s) drifted and were restored", drifted.len())
    } else {
        format!("{} field(s) drifted and could not be restored", drifted.len())
    };

    Some(Diagnostic::warning(summary, summarize_lines(&lines)))
}
