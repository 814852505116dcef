//! Plans, applies and reconciles a single field patch binding against the cluster the current
//! kubeconfig points at. Results are printed to stdout as YAML.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser};
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_field_patch::{
    engine::{self, EngineOptions, FieldPatcher, Reconciled},
    store::KubeStore,
};

use crate::config::BindingConfig;

mod config;
mod logging;
mod state;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitLogging { source: logging::Error },

    #[snafu(display("failed to load binding"))]
    LoadBinding { source: config::Error },

    #[snafu(display("failed to load binding state"))]
    LoadState { source: state::Error },

    #[snafu(display("failed to save binding state"))]
    SaveState { source: state::Error },

    #[snafu(display("failed to forget binding state"))]
    RemoveState { source: state::Error },

    #[snafu(display("binding has no state in {path:?}, it needs to be applied first"))]
    MissingState { path: PathBuf },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to plan binding ({} error)", source.category()))]
    Plan { source: engine::Error },

    #[snafu(display("failed to apply binding ({} error)", source.category()))]
    Apply { source: engine::Error },

    #[snafu(display("failed to reconcile binding ({} error)", source.category()))]
    Reconcile { source: engine::Error },

    #[snafu(display("failed to print result"))]
    PrintResult { source: serde_yaml::Error },
}

#[derive(Debug, Parser)]
#[command(name = "field-patch", version, about)]
enum Command {
    /// Predict the fields a binding would own, without writing anything.
    Plan(CommonArguments),

    /// Apply a binding and record its state.
    Apply(ApplyArguments),

    /// Detect and correct drift of an applied binding.
    Reconcile(CommonArguments),
}

#[derive(Debug, Args)]
struct CommonArguments {
    /// Path of the binding configuration.
    #[arg(long, env = "FIELD_PATCH_BINDING")]
    binding: PathBuf,

    /// Path of the binding state file.
    #[arg(long, env = "FIELD_PATCH_STATE", default_value = "field-patch-state.json")]
    state: PathBuf,

    /// Timeout of every single request to the API server, e.g. `30s`.
    #[arg(long, env = "FIELD_PATCH_REQUEST_TIMEOUT", value_parser = humantime::parse_duration)]
    request_timeout: Option<Duration>,
}

#[derive(Debug, Args)]
struct ApplyArguments {
    #[command(flatten)]
    common: CommonArguments,

    /// Stable identifier of the binding. The field manager of the binding is derived from it.
    #[arg(long, env = "FIELD_PATCH_BINDING_ID")]
    binding_id: String,
}

impl CommonArguments {
    async fn patcher(&self, config: &BindingConfig) -> Result<FieldPatcher<KubeStore>, Error> {
        let client = kube::Client::try_default()
            .await
            .context(CreateClientSnafu)?;
        Ok(FieldPatcher::new(
            KubeStore::new(client),
            config.managers.clone(),
            EngineOptions {
                request_timeout: self.request_timeout,
            },
        ))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let command = Command::parse();
    logging::initialize_logging("FIELD_PATCH_LOG", "field-patch").context(InitLoggingSnafu)?;

    match command {
        Command::Plan(arguments) => {
            let config = BindingConfig::load(&arguments.binding).context(LoadBindingSnafu)?;
            let binding = config.binding().context(LoadBindingSnafu)?;
            let prior = state::load(&arguments.state).context(LoadStateSnafu)?;

            let plan = arguments
                .patcher(&config)
                .await?
                .compute_projection(&binding, prior.as_ref())
                .await
                .context(PlanSnafu)?;
            print_yaml(&plan)
        }
        Command::Apply(ApplyArguments { common, binding_id }) => {
            let config = BindingConfig::load(&common.binding).context(LoadBindingSnafu)?;
            let binding = config.binding().context(LoadBindingSnafu)?;
            let prior = state::load(&common.state).context(LoadStateSnafu)?;

            let applied = common
                .patcher(&config)
                .await?
                .apply_and_update_projection(&binding, &binding_id, prior.as_ref())
                .await
                .context(ApplySnafu)?;
            state::save(&common.state, &applied.state).context(SaveStateSnafu)?;
            print_yaml(&applied)
        }
        Command::Reconcile(arguments) => {
            let config = BindingConfig::load(&arguments.binding).context(LoadBindingSnafu)?;
            let binding = config.binding().context(LoadBindingSnafu)?;
            let prior = state::load(&arguments.state)
                .context(LoadStateSnafu)?
                .with_context(|| MissingStateSnafu {
                    path: arguments.state.clone(),
                })?;

            let reconciled = arguments
                .patcher(&config)
                .await?
                .reconcile(&binding, &prior)
                .await
                .context(ReconcileSnafu)?;
            match &reconciled {
                Reconciled::Present(reconciliation) => {
                    state::save(&arguments.state, &reconciliation.state)
                        .context(SaveStateSnafu)?;
                }
                Reconciled::TargetGone => {
                    tracing::info!(object = %binding.target, "target is gone, forgetting binding");
                    state::remove(&arguments.state).context(RemoveStateSnafu)?;
                }
            }
            print_yaml(&reconciled)
        }
    }
}

fn print_yaml(result: &impl Serialize) -> Result<(), Error> {
    let yaml = serde_yaml::to_string(result).context(PrintResultSnafu)?;
    print!("{yaml}");
    Ok(())
}
