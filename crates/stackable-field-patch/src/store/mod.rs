//! The object store the engine drives: reading objects and writing them through forced
//! server-side apply, either for real or as a dry run.

use std::{fmt::Display, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use kube::core::DynamicObject;
use regex::Regex;
use serde_json::Value;
use snafu::Snafu;

use crate::target::{self, TargetRef};

mod kube_store;
#[cfg(test)]
pub(crate) mod memory;

pub use kube_store::KubeStore;

static INVALID_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[Ii]nvalid: \[?|, )(?P<field>[A-Za-z0-9_.\-/\[\]]+): (?:Invalid value|Forbidden|Required value|Unsupported value|Duplicate value|Too long|Too many|Not found)",
    )
    .expect("failed to compile invalid field regex")
});

static UNDECLARED_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<field>\.[A-Za-z0-9_.\-/\[\]]+): field not declared in schema")
        .expect("failed to compile undeclared field regex")
});

static UNKNOWN_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"unknown field "(?P<field>[^"]+)""#)
        .expect("failed to compile unknown field regex")
});

/// Whether a write is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// The API server runs the full write pipeline, including admission and ownership
    /// tracking, but discards the result.
    DryRun,
    Persist,
}

impl WriteMode {
    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }
}

/// A write which carries no ownership information.
#[derive(Clone, Copy, Debug)]
pub enum StorePatch<'a> {
    Json(&'a json_patch::Patch),
    Merge(&'a Value),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("{target} does not exist"))]
    NotFound { target: String },

    #[snafu(display("the API server rejected the write to {target}: {rejection}"))]
    Rejected { target: String, rejection: Rejection },

    #[snafu(display("invalid target reference"))]
    InvalidTarget { source: target::Error },

    #[snafu(display("failed to discover the API resource for {gvk}"))]
    Discovery { source: kube::Error, gvk: String },

    #[snafu(display("request for {target} failed"))]
    Request { source: kube::Error, target: String },

    #[snafu(display("{operation} of {target} did not complete within {timeout:?}"))]
    Timeout {
        operation: String,
        target: String,
        timeout: Duration,
    },
}

impl StoreError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}

/// A write refused by the API server, decoded so that the offending fields are named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The write changes fields which cannot be changed after creation.
    ImmutableField { fields: Vec<String> },

    /// The write contains unknown fields or values the schema does not allow.
    SchemaValidation { fields: Vec<String> },

    /// A non-forced write ran into fields owned by other managers.
    Conflict { message: String },

    Other {
        code: u16,
        reason: String,
        message: String,
    },
}

impl Rejection {
    /// Decodes an API status into a rejection.
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        if code == 409 && reason == "Conflict" {
            return Self::Conflict {
                message: message.to_owned(),
            };
        }

        let invalid_fields = captured_fields(&INVALID_FIELD_REGEX, message);

        if message.contains("field is immutable") {
            return Self::ImmutableField {
                fields: invalid_fields,
            };
        }

        let mut schema_fields = invalid_fields;
        schema_fields.extend(
            captured_fields(&UNDECLARED_FIELD_REGEX, message)
                .into_iter()
                .map(|field| field.trim_start_matches('.').to_owned()),
        );
        schema_fields.extend(captured_fields(&UNKNOWN_FIELD_REGEX, message));
        schema_fields.dedup();

        if matches!(reason, "Invalid" | "BadRequest") && !schema_fields.is_empty() {
            return Self::SchemaValidation {
                fields: schema_fields,
            };
        }

        Self::Other {
            code,
            reason: reason.to_owned(),
            message: message.to_owned(),
        }
    }
}

fn captured_fields(regex: &Regex, message: &str) -> Vec<String> {
    regex
        .captures_iter(message)
        .filter_map(|captures| captures.name("field"))
        .map(|field| field.as_str().to_owned())
        .collect()
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImmutableField { fields } => {
                write!(f, "immutable field(s) changed: {}", fields.join(", "))
            }
            Self::SchemaValidation { fields } => {
                write!(f, "field(s) rejected by the schema: {}", fields.join(", "))
            }
            Self::Conflict { message } => write!(f, "conflict: {message}"),
            Self::Other {
                code,
                reason,
                message,
            } => write!(f, "{reason} ({code}): {message}"),
        }
    }
}

/// Access to the objects patch bindings target.
///
/// Every call is a single request. Implementations must report absent objects as
/// [`StoreError::NotFound`] (or `None` from [`ObjectStore::get`]) and never retry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches the live object, `None` if it does not exist.
    async fn get(&self, target: &TargetRef) -> Result<Option<DynamicObject>, StoreError>;

    /// Writes `object` through forced server-side apply under `manager`, taking over any
    /// conflicting fields.
    async fn apply(
        &self,
        target: &TargetRef,
        object: &Value,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError>;

    /// Writes a JSON patch or a JSON merge patch under `manager`.
    async fn patch(
        &self,
        target: &TargetRef,
        patch: StorePatch<'_>,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::immutable_selector(
        422,
        "Invalid",
        r#"Deployment.apps "web" is invalid: spec.selector: Invalid value: v1.LabelSelector{MatchLabels:map[string]string{"app":"other"}}: field is immutable"#,
        Rejection::ImmutableField { fields: vec!["spec.selector".to_owned()] }
    )]
    #[case::immutable_multiple(
        422,
        "Invalid",
        r#"Job.batch "migrate" is invalid: [spec.template: Invalid value: "...": field is immutable, spec.completions: Invalid value: 3: field is immutable]"#,
        Rejection::ImmutableField {
            fields: vec!["spec.template".to_owned(), "spec.completions".to_owned()],
        }
    )]
    #[case::undeclared_field(
        500,
        "BadRequest",
        ".spec.replicass: field not declared in schema",
        Rejection::SchemaValidation { fields: vec!["spec.replicass".to_owned()] }
    )]
    #[case::unknown_field(
        400,
        "BadRequest",
        r#"failed to create typed patch object: errors: unknown field "replicass""#,
        Rejection::SchemaValidation { fields: vec!["replicass".to_owned()] }
    )]
    #[case::invalid_value(
        422,
        "Invalid",
        r#"ConfigMap "game-demo" is invalid: metadata.labels: Invalid value: "-bad": name part must consist of alphanumeric characters"#,
        Rejection::SchemaValidation { fields: vec!["metadata.labels".to_owned()] }
    )]
    #[case::conflict(
        409,
        "Conflict",
        r#"Apply failed with 1 conflict: conflict with "kubectl": .data.k"#,
        Rejection::Conflict {
            message: r#"Apply failed with 1 conflict: conflict with "kubectl": .data.k"#.to_owned(),
        }
    )]
    #[case::forbidden(
        403,
        "Forbidden",
        "configmaps \"game-demo\" is forbidden: User \"dev\" cannot patch resource",
        Rejection::Other {
            code: 403,
            reason: "Forbidden".to_owned(),
            message: "configmaps \"game-demo\" is forbidden: User \"dev\" cannot patch resource"
                .to_owned(),
        }
    )]
    fn rejection_decoding(
        #[case] code: u16,
        #[case] reason: &str,
        #[case] message: &str,
        #[case] expected: Rejection,
    ) {
        assert_eq!(Rejection::from_status(code, reason, message), expected);
    }

    #[test]
    fn rejections_name_their_fields() {
        let rejection = Rejection::ImmutableField {
            fields: vec!["spec.selector".to_owned()],
        };
        assert_eq!(
            rejection.to_string(),
            "immutable field(s) changed: spec.selector"
        );
    }
}
