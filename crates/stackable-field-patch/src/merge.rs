//! Builds the object that is sent to the API server for a merge patch.

use serde_json::Value;
use snafu::{Snafu, ensure};

use crate::target::TargetRef;

/// Fields of the patch document which address the object and therefore must not differ from
/// the target.
const IDENTITY_FIELDS: &[&[&str]] = &[
    &["apiVersion"],
    &["kind"],
    &["metadata", "name"],
    &["metadata", "namespace"],
];

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "patch sets {field} to {patched:?}, which does not match the target's {expected:?}"
    ))]
    IdentityOverride {
        field: String,
        patched: String,
        expected: String,
    },
}

/// Deep-merges `overlay` onto `base`.
///
/// Maps are merged key by key. Anything else (scalars, arrays, or a map meeting a non-map)
/// is replaced wholesale by the overlay.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_fields), Value::Object(overlay_fields)) => {
            for (name, overlay_child) in overlay_fields {
                match base_fields.get_mut(name) {
                    Some(base_child) => deep_merge(base_child, overlay_child),
                    None => {
                        base_fields.insert(name.clone(), overlay_child.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Refuses patch documents that would silently address a different object.
pub fn check_identity(target: &TargetRef, document: &Value) -> Result<(), Error> {
    for field in IDENTITY_FIELDS {
        let patched = field
            .iter()
            .try_fold(document, |node, name| node.get(name));
        let Some(patched) = patched else {
            continue;
        };

        let expected = match *field {
            ["apiVersion"] => Some(target.api_version.as_str()),
            ["kind"] => Some(target.kind.as_str()),
            ["metadata", "name"] => Some(target.name.as_str()),
            _ => target.namespace.as_deref(),
        };

        ensure!(
            patched.as_str().is_some() && patched.as_str() == expected,
            IdentityOverrideSnafu {
                field: field.join("."),
                patched: patched.as_str().map_or_else(|| patched.to_string(), ToOwned::to_owned),
                expected: expected.unwrap_or_default(),
            }
        );
    }

    Ok(())
}

/// Builds the minimal object to apply: the identity fields of the target (namespaced like the
/// live object) with the patch document merged on top.
pub fn build_apply_object(
    target: &TargetRef,
    live_namespace: Option<&str>,
    document: &Value,
) -> Result<Value, Error> {
    check_identity(target, document)?;

    let mut object = target.identity(live_namespace);
    deep_merge(&mut object, document);

    // The document may repeat the namespace of a cluster-scoped target, which the API server
    // would reject.
    if live_namespace.is_none()
        && let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut)
    {
        metadata.remove("namespace");
    }

    Ok(object)
}
