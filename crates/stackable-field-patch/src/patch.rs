//! The three kinds of patches a binding can carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};
use strum::Display;

use crate::path::{self, FieldPath, document_paths};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("exactly one patch kind must be specified, but none was given"))]
    NoPatchKind,

    #[snafu(display("exactly one patch kind must be specified, but got {kinds:?}"))]
    MultiplePatchKinds { kinds: Vec<PatchKind> },

    #[snafu(display("failed to parse {kind} patch"))]
    ParsePatch {
        source: serde_yaml::Error,
        kind: PatchKind,
    },

    #[snafu(display("{kind} patch must be a map at its top level"))]
    NotAMap { kind: PatchKind },

    #[snafu(display("failed to convert JSON patch operation path"))]
    ConvertOperationPath { source: path::Error },
}

#[derive(Clone, Copy, Debug, Display, Deserialize, Serialize, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum PatchKind {
    /// A document deep-merged through server-side apply.
    Merge,

    /// An RFC 6902 JSON patch.
    JsonPatch,

    /// An RFC 7396 JSON merge patch.
    MergePatch,
}

/// The unparsed patch payloads of a binding, as they appear in its configuration.
///
/// Exactly one of the fields must be set. The payloads are YAML or JSON text.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_patch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_patch: Option<String>,
}

impl PatchSource {
    pub fn parse(&self) -> Result<Patch, Error> {
        let given: Vec<_> = [
            (PatchKind::Merge, &self.merge),
            (PatchKind::JsonPatch, &self.json_patch),
            (PatchKind::MergePatch, &self.merge_patch),
        ]
        .into_iter()
        .filter_map(|(kind, payload)| payload.as_deref().map(|payload| (kind, payload)))
        .collect();

        match given.as_slice() {
            [] => NoPatchKindSnafu.fail(),
            [(kind, payload)] => Patch::parse(*kind, payload),
            _ => MultiplePatchKindsSnafu {
                kinds: given.iter().map(|(kind, _)| *kind).collect::<Vec<_>>(),
            }
            .fail(),
        }
    }
}

/// What a patch kind is able to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchCapabilities {
    /// The API server reports field ownership for a dry run of this kind, which allows a
    /// projection to be computed before the patch is applied.
    pub supports_projection: bool,
}

/// A parsed patch.
#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    /// Deep-merged onto the target through a forced server-side apply.
    Merge(Value),

    /// Applied operation by operation.
    JsonPatch(json_patch::Patch),

    /// `null` removes a key, everything else overrides. Arrays are never merged.
    MergePatch(Value),
}

impl Patch {
    pub fn parse(kind: PatchKind, payload: &str) -> Result<Self, Error> {
        match kind {
            PatchKind::Merge | PatchKind::MergePatch => {
                let document: Value =
                    serde_yaml::from_str(payload).context(ParsePatchSnafu { kind })?;
                ensure!(document.is_object(), NotAMapSnafu { kind });
                Ok(if kind == PatchKind::Merge {
                    Self::Merge(document)
                } else {
                    Self::MergePatch(document)
                })
            }
            PatchKind::JsonPatch => {
                let operations: json_patch::Patch =
                    serde_yaml::from_str(payload).context(ParsePatchSnafu { kind })?;
                Ok(Self::JsonPatch(operations))
            }
        }
    }

    pub fn kind(&self) -> PatchKind {
        match self {
            Self::Merge(_) => PatchKind::Merge,
            Self::JsonPatch(_) => PatchKind::JsonPatch,
            Self::MergePatch(_) => PatchKind::MergePatch,
        }
    }

    pub fn capabilities(&self) -> PatchCapabilities {
        PatchCapabilities {
            supports_projection: matches!(self, Self::Merge(_)),
        }
    }

    /// Lists the paths this patch writes to, together with the document any positional
    /// selectors in those paths refer to.
    ///
    /// Document based patches refer to themselves, JSON patch operations refer to the `live`
    /// document they are going to be applied to.
    pub fn touched_paths<'a>(
        &'a self,
        live: &'a Value,
    ) -> Result<(Vec<FieldPath>, &'a Value), Error> {
        match self {
            Self::Merge(document) | Self::MergePatch(document) => {
                Ok((document_paths(document), document))
            }
            Self::JsonPatch(operations) => {
                let mut paths = Vec::new();
                for operation in &operations.0 {
                    for pointer in operation_pointers(operation) {
                        paths.push(
                            FieldPath::from_json_pointer(&pointer, live)
                                .context(ConvertOperationPathSnafu)?,
                        );
                    }
                }
                Ok((paths, live))
            }
        }
    }
}

/// The pointers a JSON patch operation writes to. `test` only reads, `move` also removes its
/// source.
fn operation_pointers(operation: &json_patch::PatchOperation) -> Vec<String> {
    use json_patch::PatchOperation;

    match operation {
        PatchOperation::Add(op) => vec![op.path.to_string()],
        PatchOperation::Remove(op) => vec![op.path.to_string()],
        PatchOperation::Replace(op) => vec![op.path.to_string()],
        PatchOperation::Move(op) => vec![op.from.to_string(), op.path.to_string()],
        PatchOperation::Copy(op) => vec![op.path.to_string()],
        PatchOperation::Test(_) => Vec::new(),
    }
}
