use std::fmt::Display;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{Snafu, ensure};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("target apiVersion {api_version:?} is invalid"))]
    InvalidApiVersion { api_version: String },

    #[snafu(display("target kind must not be empty"))]
    EmptyKind,

    #[snafu(display("target name must not be empty"))]
    EmptyName,
}

/// Identifies the single object a patch binding targets.
///
/// A namespace given for a cluster-scoped kind is ignored rather than rejected. Changing any
/// of the fields means targeting a different object, so callers must replace the binding
/// instead of updating it in place.
#[derive(Clone, Debug, Deserialize, Serialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl TargetRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<&str>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.map(ToOwned::to_owned),
        }
    }

    /// Checks that the reference can address an object at all.
    pub fn validate(&self) -> Result<(), Error> {
        self.group_version_kind()?;
        ensure!(!self.name.is_empty(), EmptyNameSnafu);
        Ok(())
    }

    pub fn group_version_kind(&self) -> Result<GroupVersionKind, Error> {
        ensure!(!self.kind.is_empty(), EmptyKindSnafu);

        // The core group has no name, so "v1" is a valid apiVersion while "/v1" is not.
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => {
                ensure!(
                    !group.is_empty(),
                    InvalidApiVersionSnafu {
                        api_version: &self.api_version
                    }
                );
                (group, version)
            }
            None => ("", self.api_version.as_str()),
        };
        ensure!(
            !version.is_empty() && !version.contains('/'),
            InvalidApiVersionSnafu {
                api_version: &self.api_version
            }
        );

        Ok(GroupVersionKind::gvk(group, version, &self.kind))
    }

    /// The identity fields every object sent to the API server must carry.
    ///
    /// Uses the namespace of `live` rather than the one of the reference, so that the namespace
    /// of cluster-scoped objects is dropped.
    pub fn identity(&self, live_namespace: Option<&str>) -> Value {
        let mut metadata = json!({ "name": self.name });
        if let Some(namespace) = live_namespace {
            metadata["namespace"] = Value::String(namespace.to_owned());
        }
        json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "metadata": metadata,
        })
    }
}

impl Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(
                f,
                "{kind}.{api_version} {namespace}/{name}",
                kind = self.kind,
                api_version = self.api_version,
                name = self.name
            ),
            None => write!(
                f,
                "{kind}.{api_version} {name}",
                kind = self.kind,
                api_version = self.api_version,
                name = self.name
            ),
        }
    }
}
