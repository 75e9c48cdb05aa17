use std::sync::Arc;

use clap::Parser;
use dynakube_operator::{
    cli::{Command, RunArguments},
    crd::DynaKube,
    logging::initialize_logging,
    yaml::CustomResourceExt,
};
use dynakube_webhook::{WebhookState, lookup_cluster_uuid, router, server::WebhookServer};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "dynakube-webhook";
const LOG_ENV_VAR: &str = "DYNAKUBE_WEBHOOK_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print the CustomResourceDefinition"))]
    PrintCrd {
        source: dynakube_operator::yaml::Error,
    },

    #[snafu(display("failed to initialize logging"))]
    InitLogging {
        source: dynakube_operator::logging::Error,
    },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to determine the cluster UUID"))]
    ClusterUuid { source: dynakube_webhook::Error },

    #[snafu(display("failed to run the webhook server"))]
    RunServer {
        source: dynakube_webhook::server::Error,
    },
}

#[derive(Parser)]
#[command(
    name = APP_NAME,
    author,
    version,
    about = "Admission webhook for DynaKubes and OneAgent code-module injection"
)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    match Opts::parse().command {
        Command::Crd => DynaKube::print_yaml_schema().context(PrintCrdSnafu)?,
        Command::Run(arguments) => run(arguments).await?,
    }
    Ok(())
}

async fn run(arguments: RunArguments) -> Result<(), Error> {
    let RunArguments {
        operator_namespace,
        bind_address,
        cluster_uuid,
        init_image,
        log_format,
    } = arguments;

    initialize_logging(LOG_ENV_VAR, APP_NAME, log_format).context(InitLoggingSnafu)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %operator_namespace,
        "starting {APP_NAME}"
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let cluster_uuid = match cluster_uuid {
        Some(cluster_uuid) => cluster_uuid,
        None => lookup_cluster_uuid(&client)
            .await
            .context(ClusterUuidSnafu)?,
    };

    let state = WebhookState::new(client, operator_namespace, cluster_uuid, init_image);
    WebhookServer::new(router(Arc::new(state)), bind_address)
        .run()
        .await
        .context(RunServerSnafu)
}
