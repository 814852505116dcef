use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
    core::DynamicObject,
    discovery::{self, Scope},
};
use serde_json::Value;
use snafu::ResultExt;

use super::{
    DiscoverySnafu, InvalidTargetSnafu, ObjectStore, Rejection, StoreError, StorePatch, WriteMode,
};
use crate::target::TargetRef;

/// An [`ObjectStore`] backed by a Kubernetes API server.
///
/// The API resource of every target is discovered on each call, so that cluster-scoped kinds
/// are addressed without their (ignored) namespace.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn api(&self, target: &TargetRef) -> Result<Api<DynamicObject>, StoreError> {
        let gvk = target.group_version_kind().context(InvalidTargetSnafu)?;
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|_| DiscoverySnafu {
                gvk: format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind),
            })?;

        tracing::debug!(
            plural = resource.plural,
            scope = ?capabilities.scope,
            "discovered API resource"
        );

        let api = match (&capabilities.scope, &target.namespace) {
            (Scope::Cluster, namespace) => {
                if namespace.is_some() {
                    tracing::debug!(%target, "ignoring namespace of cluster-scoped target");
                }
                Api::all_with(self.client.clone(), &resource)
            }
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
        };
        Ok(api)
    }
}

/// Splits API errors into absent objects, decoded rejections and everything else.
fn request_error(source: kube::Error, target: &TargetRef) -> StoreError {
    match &source {
        kube::Error::Api(status) if status.code == 404 => StoreError::NotFound {
            target: target.to_string(),
        },
        kube::Error::Api(status) => StoreError::Rejected {
            target: target.to_string(),
            rejection: Rejection::from_status(status.code, &status.reason, &status.message),
        },
        _ => StoreError::Request {
            source,
            target: target.to_string(),
        },
    }
}

fn write_params(manager: &str, mode: WriteMode) -> PatchParams {
    PatchParams {
        field_manager: Some(manager.to_owned()),
        dry_run: mode.is_dry_run(),
        ..PatchParams::default()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, target: &TargetRef) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api(target).await?;
        api.get_opt(&target.name)
            .await
            .map_err(|source| request_error(source, target))
    }

    async fn apply(
        &self,
        target: &TargetRef,
        object: &Value,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(target).await?;
        let mut params = PatchParams::apply(manager).force();
        if mode.is_dry_run() {
            params = params.dry_run();
        }

        let applied = api
            .patch(&target.name, &params, &Patch::Apply(object))
            .await
            .map_err(|source| request_error(source, target))?;

        if !mode.is_dry_run() {
            tracing::info!(%target, manager, "applied patch");
        }
        Ok(applied)
    }

    async fn patch(
        &self,
        target: &TargetRef,
        patch: StorePatch<'_>,
        manager: &str,
        mode: WriteMode,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(target).await?;
        let params = write_params(manager, mode);

        let result = match patch {
            StorePatch::Json(operations) => {
                api.patch(&target.name, &params, &Patch::Json::<()>(operations.clone()))
                    .await
            }
            StorePatch::Merge(document) => {
                api.patch(&target.name, &params, &Patch::Merge(document))
                    .await
            }
        };
        let patched = result.map_err(|source| request_error(source, target))?;

        if !mode.is_dry_run() {
            tracing::info!(%target, manager, "patched object");
        }
        Ok(patched)
    }
}
