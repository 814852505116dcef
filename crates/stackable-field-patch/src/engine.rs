//! Drives patch bindings through their plan, apply and read phases.

use std::{future::Future, time::Duration};

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use tracing::{Span, field::Empty, instrument};

use crate::{
    conflict::{self, Conflicts, check_cross_binding, check_self_management, ownership_transitions},
    diagnostics::{Diagnostic, Diagnostics},
    drift::{DriftedField, detect_drift, drift_diagnostic},
    manager::{self, FieldManager, ManagerEquivalence, ManagerPolicy},
    merge::{self, build_apply_object, check_identity},
    ownership::{self, OwnershipIndex, OwnershipSnapshot},
    patch::{self, Patch, PatchKind},
    projection::{ProjectionState, flatten},
    store::{ObjectStore, Rejection, StoreError, StorePatch, TimeoutSnafu, WriteMode},
    target::{self, TargetRef},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid target reference"))]
    InvalidTarget { source: target::Error },

    #[snafu(display("invalid field manager identity"))]
    InvalidManager { source: manager::Error },

    #[snafu(display("invalid merge document for {target}"))]
    InvalidMergeDocument { source: merge::Error, target: String },

    #[snafu(display("failed to determine the fields the {kind} patch touches"))]
    TouchedPaths {
        source: patch::Error,
        kind: PatchKind,
    },

    #[snafu(display("{kind} patch cannot be applied to {target}"))]
    LocalPatch {
        source: json_patch::PatchError,
        kind: PatchKind,
        target: String,
    },

    #[snafu(display("{target} does not exist"))]
    TargetNotFound { target: String },

    #[snafu(display("refusing to patch"))]
    Refused { source: conflict::Error },

    #[snafu(display("failed to read the managed fields of {target}"))]
    ReadOwnership {
        source: ownership::Error,
        target: String,
    },

    #[snafu(display("failed to serialize {target}"))]
    SerializeObject {
        source: serde_json::Error,
        target: String,
    },

    #[snafu(display("failed to {operation} {target}"))]
    Store {
        source: StoreError,
        operation: String,
        target: String,
    },
}

/// The kind of failure, which tells the caller what to do about it.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCategory {
    /// The binding itself is invalid. Nothing was sent to the API server.
    Configuration,

    /// The target cannot be patched: it is absent, managed as a whole or already patched by
    /// another binding. Nothing was written.
    Target,

    /// The API server refused the write. The rejection names the offending fields.
    StoreRejection,

    /// The API server could not be reached or answered with something unusable.
    Store,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidTarget { .. }
            | Self::InvalidManager { .. }
            | Self::InvalidMergeDocument { .. }
            | Self::TouchedPaths { .. }
            | Self::LocalPatch { .. } => ErrorCategory::Configuration,
            Self::TargetNotFound { .. } | Self::Refused { .. } => ErrorCategory::Target,
            Self::Store { source, .. } => match source {
                StoreError::Rejected { .. } => ErrorCategory::StoreRejection,
                StoreError::NotFound { .. } => ErrorCategory::Target,
                StoreError::InvalidTarget { .. } => ErrorCategory::Configuration,
                _ => ErrorCategory::Store,
            },
            Self::ReadOwnership { .. } | Self::SerializeObject { .. } => ErrorCategory::Store,
        }
    }

    /// The decoded rejection, if the API server refused a write.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Store { source, .. } => source.rejection(),
            _ => None,
        }
    }
}

/// A patch and the object it targets.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchBinding {
    pub target: TargetRef,
    pub patch: Patch,
}

/// What the calling tool persists per binding after every successful cycle.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindingState {
    pub manager_identity: String,
    pub last_projection: ProjectionState,
    #[serde(default)]
    pub last_ownership_snapshot: OwnershipSnapshot,
}

#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    /// Upper bound for every single request to the store. Requests running into it fail and
    /// are not retried.
    pub request_timeout: Option<Duration>,
}

/// The predicted outcome of applying a binding.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// The identity the prediction was made under. This is the planning placeholder for
    /// bindings which have not been applied yet.
    pub manager: String,
    pub projection: ProjectionState,

    /// Whether the projection differs from the one recorded by the previous cycle.
    pub changed: bool,
    pub conflicts: Conflicts,
    pub diagnostics: Diagnostics,
}

/// The outcome of applying a binding.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Applied {
    pub state: BindingState,
    pub conflicts: Conflicts,
    pub diagnostics: Diagnostics,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    /// The state to persist. It is the previous state if drift could not be corrected.
    pub state: BindingState,
    pub drift_detected: bool,
    pub drifted: Vec<DriftedField>,
    pub diagnostics: Diagnostics,
}

/// The outcome of reading a binding.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum Reconciled {
    Present(Reconciliation),

    /// The target was deleted. The caller should forget the binding.
    TargetGone,
}

/// The live object together with what was derived from it.
struct Observed {
    object: DynamicObject,
    document: Value,
    ownership: OwnershipIndex,
}

impl Observed {
    fn new(target: &TargetRef, object: DynamicObject) -> Result<Self, Error> {
        let document = serde_json::to_value(&object).with_context(|_| SerializeObjectSnafu {
            target: target.to_string(),
        })?;
        let ownership = OwnershipIndex::from_object(&object).with_context(|_| {
            ReadOwnershipSnafu {
                target: target.to_string(),
            }
        })?;

        Ok(Self {
            object,
            document,
            ownership,
        })
    }

    fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }
}

/// Plans, applies and reconciles patch bindings against an [`ObjectStore`].
///
/// Nothing is cached between calls: every call fetches the live object again, so that the
/// ownership it reasons about is never stale. Separate bindings can be driven concurrently.
pub struct FieldPatcher<S> {
    store: S,
    policy: ManagerPolicy,
    options: EngineOptions,
}

impl<S: ObjectStore> FieldPatcher<S> {
    pub fn new(store: S, policy: ManagerPolicy, options: EngineOptions) -> Self {
        Self {
            store,
            policy,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &ManagerPolicy {
        &self.policy
    }

    /// Predicts the projection of a binding through a dry run, without writing anything.
    ///
    /// `prior` is the state recorded by the previous cycle. Without it, the prediction runs
    /// under the planning placeholder identity.
    #[instrument(
        name = "compute_projection",
        skip_all,
        fields(target = %binding.target, patch = %binding.patch.kind(), manager = Empty)
    )]
    pub async fn compute_projection(
        &self,
        binding: &PatchBinding,
        prior: Option<&BindingState>,
    ) -> Result<Plan, Error> {
        let target = &binding.target;
        check_binding(binding)?;

        let manager = match prior {
            Some(state) => self
                .policy
                .manager_from_name(&state.manager_identity)
                .context(InvalidManagerSnafu)?,
            None => self.policy.planned_manager(),
        };
        Span::current().record("manager", manager.name());
        let equivalence = self.policy.equivalence(&manager);

        let Some(live) = self.get(target).await? else {
            tracing::info!("target does not exist yet, projection is unknown");
            let mut diagnostics = Diagnostics::default();
            diagnostics.push(Diagnostic::info(
                format!("{target} does not exist yet"),
                "The projection is computed once the object exists, at the latest when the patch is applied.",
            ));
            return Ok(Plan {
                manager: manager.name().to_owned(),
                projection: ProjectionState::Unknown,
                changed: true,
                conflicts: Conflicts::default(),
                diagnostics,
            });
        };
        self.check_write_allowed(binding, &live, &equivalence)?;

        let mut diagnostics = Diagnostics::default();
        let (projection, conflicts) = match &binding.patch {
            Patch::Merge(document) => {
                let result = self
                    .apply_document(target, &live, document, &manager, WriteMode::DryRun)
                    .await?;
                let owned = result.ownership.paths_owned_by(&equivalence);
                let conflicts = ownership_transitions(
                    &live.ownership,
                    &result.ownership,
                    prior.map(|state| &state.last_ownership_snapshot),
                    &equivalence,
                    &manager,
                );
                (
                    ProjectionState::from(flatten(&result.document, &owned)),
                    conflicts,
                )
            }
            Patch::JsonPatch(operations) => {
                let mut document = live.document.clone();
                json_patch::patch(&mut document, &operations.0).with_context(|_| {
                    LocalPatchSnafu {
                        kind: PatchKind::JsonPatch,
                        target: target.to_string(),
                    }
                })?;
                diagnostics.push(projection_unavailable(PatchKind::JsonPatch));
                (ProjectionState::Unknown, Conflicts::default())
            }
            Patch::MergePatch(_) => {
                diagnostics.push(projection_unavailable(PatchKind::MergePatch));
                (ProjectionState::Unknown, Conflicts::default())
            }
        };
        diagnostics.extend(conflicts.to_diagnostic());

        let changed = match (&projection, prior) {
            (ProjectionState::Known { .. }, Some(state)) => projection != state.last_projection,
            _ => true,
        };
        tracing::debug!(changed, conflicts = conflicts.len(), "computed projection");

        Ok(Plan {
            manager: manager.name().to_owned(),
            projection,
            changed,
            conflicts,
            diagnostics,
        })
    }

    /// Applies a binding under its real identity and records the resulting state.
    ///
    /// Taking over fields from other managers is reported, never refused. The target must
    /// exist.
    #[instrument(
        name = "apply_and_update_projection",
        skip_all,
        fields(target = %binding.target, patch = %binding.patch.kind(), manager = Empty)
    )]
    pub async fn apply_and_update_projection(
        &self,
        binding: &PatchBinding,
        binding_id: &str,
        prior: Option<&BindingState>,
    ) -> Result<Applied, Error> {
        let target = &binding.target;
        check_binding(binding)?;

        let manager = self
            .policy
            .bound_manager(binding_id)
            .context(InvalidManagerSnafu)?;
        Span::current().record("manager", manager.name());
        let equivalence = self.policy.equivalence(&manager);

        let live = self
            .get(target)
            .await?
            .with_context(|| TargetNotFoundSnafu {
                target: target.to_string(),
            })?;
        self.check_write_allowed(binding, &live, &equivalence)?;

        let mut diagnostics = Diagnostics::default();
        let result = match &binding.patch {
            Patch::Merge(document) => {
                self.apply_document(target, &live, document, &manager, WriteMode::Persist)
                    .await?
            }
            Patch::JsonPatch(operations) => {
                diagnostics.push(projection_unavailable(PatchKind::JsonPatch));
                self.patch(target, StorePatch::Json(operations), &manager, WriteMode::Persist)
                    .await?
            }
            Patch::MergePatch(document) => {
                diagnostics.push(projection_unavailable(PatchKind::MergePatch));
                self.patch(target, StorePatch::Merge(document), &manager, WriteMode::Persist)
                    .await?
            }
        };

        let conflicts = ownership_transitions(
            &live.ownership,
            &result.ownership,
            prior.map(|state| &state.last_ownership_snapshot),
            &equivalence,
            &manager,
        );
        diagnostics.extend(conflicts.to_diagnostic());

        let last_projection = if binding.patch.capabilities().supports_projection {
            let owned = result.ownership.paths_owned_by(&equivalence);
            ProjectionState::from(flatten(&result.document, &owned))
        } else {
            ProjectionState::Unknown
        };

        Ok(Applied {
            state: BindingState {
                manager_identity: manager.name().to_owned(),
                last_projection,
                last_ownership_snapshot: result.ownership.snapshot(&equivalence, manager.name()),
            },
            conflicts,
            diagnostics,
        })
    }

    /// Reads a binding: detects fields whose live value no longer matches the projection
    /// recorded by the last cycle and restores them.
    ///
    /// Drift is only restored by applying the patch again if that reproduces the recorded
    /// projection and no other binding owns the drifted fields. Otherwise, and if restoring
    /// fails, the drift is reported through diagnostics and the previous state is kept.
    #[instrument(
        name = "reconcile",
        skip_all,
        fields(target = %binding.target, manager = %state.manager_identity)
    )]
    pub async fn reconcile(
        &self,
        binding: &PatchBinding,
        state: &BindingState,
    ) -> Result<Reconciled, Error> {
        let target = &binding.target;
        check_binding(binding)?;

        let manager = self
            .policy
            .manager_from_name(&state.manager_identity)
            .context(InvalidManagerSnafu)?;
        let equivalence = self.policy.equivalence(&manager);

        let Some(live) = self.get(target).await? else {
            tracing::info!("target is gone");
            return Ok(Reconciled::TargetGone);
        };

        let mut diagnostics = Diagnostics::default();
        let unchanged = |diagnostics| {
            Ok(Reconciled::Present(Reconciliation {
                state: state.clone(),
                drift_detected: false,
                drifted: Vec::new(),
                diagnostics,
            }))
        };

        if let Err(err) = check_self_management(&target.to_string(), &live.object, &self.policy) {
            tracing::warn!(error = %err, "target became managed as a whole, not reconciling");
            diagnostics.push(Diagnostic::warning(
                "target is managed as a whole",
                err.to_string(),
            ));
            return unchanged(diagnostics);
        }

        let Patch::Merge(document) = &binding.patch else {
            diagnostics.push(projection_unavailable(binding.patch.kind()));
            return unchanged(diagnostics);
        };
        let Some(stored) = state.last_projection.known() else {
            diagnostics.push(Diagnostic::info(
                "no projection recorded",
                "Drift is checked once the binding has been applied with a projection.",
            ));
            return unchanged(diagnostics);
        };

        let drifted = detect_drift(stored, &live.document, &live.ownership, &equivalence);
        if drifted.is_empty() {
            tracing::debug!("no drift detected");
            return Ok(Reconciled::Present(Reconciliation {
                state: BindingState {
                    manager_identity: manager.name().to_owned(),
                    last_projection: state.last_projection.clone(),
                    last_ownership_snapshot: live.ownership.snapshot(&equivalence, manager.name()),
                },
                drift_detected: false,
                drifted,
                diagnostics,
            }));
        }

        match self.check_overlaps(binding, &live, &equivalence) {
            Ok(()) => {}
            Err(err) if err.category() == ErrorCategory::Configuration => return Err(err),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "drifted fields are patched by another binding, not correcting"
                );
                return Ok(uncorrected(
                    state,
                    diagnostics,
                    drifted,
                    "drift could not be corrected",
                    snafu::Report::from_error(&err).to_string(),
                ));
            }
        }

        let declared = match self
            .apply_document(target, &live, document, &manager, WriteMode::DryRun)
            .await
        {
            Ok(declared) => declared,
            Err(err) if err.category() == ErrorCategory::Configuration => return Err(err),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to predict declared values, keeping the previous state"
                );
                return Ok(uncorrected(
                    state,
                    diagnostics,
                    drifted,
                    "drift could not be corrected",
                    snafu::Report::from_error(&err).to_string(),
                ));
            }
        };

        // Restoring means applying the patch again, which must not roll out unplanned changes.
        let owned = declared.ownership.paths_owned_by(&equivalence);
        if flatten(&declared.document, &owned) != *stored {
            tracing::warn!("patch changed since it was last applied, not correcting drift");
            return Ok(uncorrected(
                state,
                diagnostics,
                drifted,
                "patch changed since it was last applied",
                "Drifted fields are restored by the next apply of the binding.",
            ));
        }

        let corrected = match self
            .apply_document(target, &live, document, &manager, WriteMode::Persist)
            .await
        {
            Ok(corrected) => corrected,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to restore drifted fields, keeping the previous state"
                );
                return Ok(uncorrected(
                    state,
                    diagnostics,
                    drifted,
                    "drift could not be corrected",
                    snafu::Report::from_error(&err).to_string(),
                ));
            }
        };
        tracing::info!(fields = drifted.len(), "restored drifted fields");

        diagnostics.extend(drift_diagnostic(&drifted, true));
        let conflicts = ownership_transitions(
            &live.ownership,
            &corrected.ownership,
            Some(&state.last_ownership_snapshot),
            &equivalence,
            &manager,
        );
        diagnostics.extend(conflicts.to_diagnostic());

        let owned = corrected.ownership.paths_owned_by(&equivalence);
        Ok(Reconciled::Present(Reconciliation {
            state: BindingState {
                manager_identity: manager.name().to_owned(),
                last_projection: ProjectionState::from(flatten(&corrected.document, &owned)),
                last_ownership_snapshot: corrected
                    .ownership
                    .snapshot(&equivalence, manager.name()),
            },
            drift_detected: true,
            drifted,
            diagnostics,
        }))
    }

    /// Refuses targets managed as a whole and fields patched by other bindings.
    fn check_write_allowed(
        &self,
        binding: &PatchBinding,
        live: &Observed,
        equivalence: &ManagerEquivalence,
    ) -> Result<(), Error> {
        check_self_management(&binding.target.to_string(), &live.object, &self.policy)
            .context(RefusedSnafu)?;
        self.check_overlaps(binding, live, equivalence)
    }

    /// Refuses fields which another binding owns, so that bindings never take fields from
    /// each other.
    fn check_overlaps(
        &self,
        binding: &PatchBinding,
        live: &Observed,
        equivalence: &ManagerEquivalence,
    ) -> Result<(), Error> {
        let kind = binding.patch.kind();
        let (touched, context) = binding
            .patch
            .touched_paths(&live.document)
            .context(TouchedPathsSnafu { kind })?;
        check_cross_binding(
            &binding.target.to_string(),
            &touched,
            context,
            &live.ownership,
            &self.policy,
            equivalence,
        )
        .context(RefusedSnafu)
    }

    async fn get(&self, target: &TargetRef) -> Result<Option<Observed>, Error> {
        self.request("get", target, self.store.get(target))
            .await?
            .map(|object| Observed::new(target, object))
            .transpose()
    }

    /// Deep-merges `document` onto the identity of the target and force-applies it.
    async fn apply_document(
        &self,
        target: &TargetRef,
        live: &Observed,
        document: &Value,
        manager: &FieldManager,
        mode: WriteMode,
    ) -> Result<Observed, Error> {
        let object = build_apply_object(target, live.namespace(), document).with_context(|_| {
            InvalidMergeDocumentSnafu {
                target: target.to_string(),
            }
        })?;
        let operation = if mode.is_dry_run() { "dry-run apply" } else { "apply" };

        let result = self
            .request(
                operation,
                target,
                self.store.apply(target, &object, manager.name(), mode),
            )
            .await?;
        Observed::new(target, result)
    }

    async fn patch(
        &self,
        target: &TargetRef,
        patch: StorePatch<'_>,
        manager: &FieldManager,
        mode: WriteMode,
    ) -> Result<Observed, Error> {
        let result = self
            .request(
                "patch",
                target,
                self.store.patch(target, patch, manager.name(), mode),
            )
            .await?;
        Observed::new(target, result)
    }

    /// Runs a single store request, bounded by the configured timeout.
    async fn request<T>(
        &self,
        operation: &str,
        target: &TargetRef,
        request: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, Error> {
        let result = match self.options.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(_elapsed) => TimeoutSnafu {
                    operation,
                    target: target.to_string(),
                    timeout,
                }
                .fail(),
            },
            None => request.await,
        };
        result.context(StoreSnafu {
            operation,
            target: target.to_string(),
        })
    }
}

/// Checks everything that can be checked without the API server.
fn check_binding(binding: &PatchBinding) -> Result<(), Error> {
    binding.target.validate().context(InvalidTargetSnafu)?;
    if let Patch::Merge(document) = &binding.patch {
        check_identity(&binding.target, document).with_context(|_| InvalidMergeDocumentSnafu {
            target: binding.target.to_string(),
        })?;
    }
    Ok(())
}

/// Reports drift which is not restored, keeping the previous state.
fn uncorrected(
    state: &BindingState,
    mut diagnostics: Diagnostics,
    drifted: Vec<DriftedField>,
    summary: &str,
    detail: impl Into<String>,
) -> Reconciled {
    diagnostics.extend(drift_diagnostic(&drifted, false));
    diagnostics.push(Diagnostic::warning(summary, detail));
    Reconciled::Present(Reconciliation {
        state: state.clone(),
        drift_detected: true,
        drifted,
        diagnostics,
    })
}

fn projection_unavailable(kind: PatchKind) -> Diagnostic {
    Diagnostic::info(
        format!("no projection for {kind} patches"),
        "The API server reports no field ownership for this patch kind, so the outcome cannot be predicted and every apply may or may not change the object.",
    )
}
