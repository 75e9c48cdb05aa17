//! Admission validation of DynaKubes.
//!
//! A DynaKube runs through two ordered pipelines. Every check of the denying pipeline that fails
//! contributes a reason, the reasons are joined into one denial. The warning pipeline only adds
//! advisory messages to an allowed response. Both pipelines are pure functions of the candidate
//! and a [`ClusterState`] snapshot, so identical inputs give identical results.

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::DaemonSet, core::v1::Namespace};
use kube::{Api, ResourceExt, api::ListParams};

use crate::crd::DynaKube;

mod deny;
pub mod image;
mod warn;

/// Name of the DaemonSet running the CSI driver in the operator namespace.
pub const CSI_DRIVER_DAEMONSET_NAME: &str = "dynatrace-oneagent-csi-driver";

const ISTIO_API_GROUP: &str = "networking.istio.io";

/// Cluster lookups the validator needs.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// All DynaKubes in the cluster.
    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, kube::Error>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, kube::Error>;

    async fn csi_driver_exists(&self, namespace: &str) -> Result<bool, kube::Error>;

    async fn istio_installed(&self) -> Result<bool, kube::Error>;
}

#[async_trait]
impl ClusterReader for kube::Client {
    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, kube::Error> {
        let api: Api<DynaKube> = Api::all(self.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, kube::Error> {
        let api: Api<Namespace> = Api::all(self.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn csi_driver_exists(&self, namespace: &str) -> Result<bool, kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.clone(), namespace);
        Ok(api.get_opt(CSI_DRIVER_DAEMONSET_NAME).await?.is_some())
    }

    async fn istio_installed(&self) -> Result<bool, kube::Error> {
        let groups = self.list_api_groups().await?;
        Ok(groups.groups.iter().any(|group| group.name == ISTIO_API_GROUP))
    }
}

/// Everything the pipelines look at besides the candidate itself.
///
/// Lookups that failed are left empty (or `None`), the checks depending on them are skipped
/// rather than denying a DynaKube because the API server hiccuped.
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    pub operator_namespace: String,
    pub dynakubes: Vec<DynaKube>,
    pub namespaces: Vec<Namespace>,
    pub csi_driver_available: Option<bool>,
    pub istio_installed: Option<bool>,
}

impl ClusterState {
    #[tracing::instrument(skip(reader))]
    pub async fn gather(reader: &dyn ClusterReader, operator_namespace: &str) -> Self {
        let dynakubes = reader.list_dynakubes().await.unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to list dynakubes, skipping overlap checks");
            Vec::new()
        });
        let namespaces = reader.list_namespaces().await.unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to list namespaces, skipping namespace selector checks");
            Vec::new()
        });
        let csi_driver_available = reader
            .csi_driver_exists(operator_namespace)
            .await
            .inspect_err(|error| tracing::warn!(%error, "failed to look up the CSI driver"))
            .ok();
        let istio_installed = reader
            .istio_installed()
            .await
            .inspect_err(|error| tracing::warn!(%error, "failed to look up Istio API group"))
            .ok();

        Self {
            operator_namespace: operator_namespace.to_owned(),
            dynakubes,
            namespaces,
            csi_driver_available,
            istio_installed,
        }
    }

    /// Other DynaKubes in the cluster, i.e. all except `dynakube` itself.
    pub fn others<'a>(&'a self, dynakube: &'a DynaKube) -> impl Iterator<Item = &'a DynaKube> {
        self.dynakubes.iter().filter(move |other| {
            other.name_any() != dynakube.name_any() || other.namespace() != dynakube.namespace()
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    pub denials: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn is_allowed(&self) -> bool {
        self.denials.is_empty()
    }

    /// All denial reasons as one message, one per line.
    pub fn denial_reason(&self) -> Option<String> {
        (!self.is_allowed()).then(|| self.denials.join("\n"))
    }
}

/// A single check. Returns a message if the check fires.
type Check = fn(&DynaKube, &ClusterState) -> Option<String>;

/// Runs both pipelines against a snapshot of the cluster.
pub fn validate(dynakube: &DynaKube, cluster: &ClusterState) -> Validation {
    let validation = Validation {
        denials: run(deny::CHECKS, dynakube, cluster),
        warnings: run(warn::CHECKS, dynakube, cluster),
    };

    if validation.is_allowed() {
        tracing::info!(
            dynakube.name = %dynakube.name_any(),
            warnings = validation.warnings.len(),
            "dynakube is valid"
        );
    } else {
        tracing::info!(
            dynakube.name = %dynakube.name_any(),
            denials = validation.denials.len(),
            "dynakube is invalid"
        );
    }
    validation
}

fn run(checks: &[(&str, Check)], dynakube: &DynaKube, cluster: &ClusterState) -> Vec<String> {
    checks
        .iter()
        .filter_map(|(name, check)| {
            let message = check(dynakube, cluster)?;
            tracing::debug!(check = name, "validation check fired");
            Some(message)
        })
        .collect()
}

/// Gathers the cluster state through `reader` and validates `dynakube` against it.
pub async fn validate_with(
    reader: &dyn ClusterReader,
    operator_namespace: &str,
    dynakube: &DynaKube,
) -> Validation {
    let cluster = ClusterState::gather(reader, operator_namespace).await;
    validate(dynakube, &cluster)
}
