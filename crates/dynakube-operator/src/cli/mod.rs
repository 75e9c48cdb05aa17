//! Command line of the DynaKube webhook.
//!
//! ```no_run
//! use clap::Parser;
//! use dynakube_operator::{cli, crd::DynaKube, yaml::CustomResourceExt};
//!
//! #[derive(clap::Parser)]
//! struct Opts {
//!     #[clap(subcommand)]
//!     command: cli::Command,
//! }
//!
//! # fn main() -> Result<(), dynakube_operator::yaml::Error> {
//! match Opts::parse().command {
//!     cli::Command::Crd => DynaKube::print_yaml_schema()?,
//!     cli::Command::Run(_arguments) => {
//!         // Run the webhook
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use clap::{Args, Parser};

use crate::logging::LogFormat;

/// A common set of commands used by operator binaries.
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the webhook server.
    Run(Run),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Namespace the operator and its DynaKubes live in.
    #[arg(long, env = "POD_NAMESPACE")]
    pub operator_namespace: String,

    /// Address the admission server listens on.
    #[arg(long, env, default_value = "0.0.0.0:8443")]
    pub bind_address: SocketAddr,

    /// UID of the `kube-system` namespace. Looked up when not given.
    #[arg(long, env)]
    pub cluster_uuid: Option<String>,

    /// Image of the init container that downloads the code modules.
    #[arg(long, env)]
    pub init_image: String,

    #[arg(long, env, value_enum, default_value_t)]
    pub log_format: LogFormat,
}
