use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use stackable_field_patch::{
    engine::PatchBinding,
    manager::ManagerPolicy,
    patch::{self, PatchSource},
    target::{self, TargetRef},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read binding configuration from {path:?}"))]
    ReadBinding {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse binding configuration"))]
    ParseBinding { source: serde_yaml::Error },

    #[snafu(display("binding configuration has an invalid target"))]
    InvalidTarget { source: target::Error },

    #[snafu(display("binding configuration has an invalid patch"))]
    InvalidPatch { source: patch::Error },
}

/// A patch binding as written by users.
///
/// ```yaml
/// target:
///   apiVersion: v1
///   kind: ConfigMap
///   name: game-demo
///   namespace: default
/// patch:
///   merge: |
///     data:
///       k: v
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BindingConfig {
    pub target: TargetRef,
    pub patch: PatchSource,

    /// Overrides of the reserved field manager names.
    #[serde(default)]
    pub managers: ManagerPolicy,
}

impl BindingConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).context(ReadBindingSnafu { path })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        serde_yaml::from_str(contents).context(ParseBindingSnafu)
    }

    /// Validates the configuration and parses the patch payload.
    pub fn binding(&self) -> Result<PatchBinding, Error> {
        self.target.validate().context(InvalidTargetSnafu)?;
        Ok(PatchBinding {
            target: self.target.clone(),
            patch: self.patch.parse().context(InvalidPatchSnafu)?,
        })
    }
}
