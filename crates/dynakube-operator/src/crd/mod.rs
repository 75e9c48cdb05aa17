//! The DynaKube custom resource.
//!
//! A DynaKube describes how a cluster is monitored: which OneAgent mode is deployed (at most one
//! of classic fullstack, host monitoring, cloud-native fullstack and application monitoring),
//! whether an ActiveGate runs and with which capabilities, and how pod metadata is enriched.
//! Feature flags are not part of the spec; they live in the annotations, see
//! [`crate::feature_flags`].

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::core::v1::{EnvVar, ResourceRequirements, Toleration},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumIter, EnumString};
use url::Url;

use crate::feature_flags::FeatureFlags;

pub mod conditions;
pub mod status;

pub use status::DynaKubeStatus;

pub const TENANT_SECRET_TOKEN_KEY: &str = "tenant-token";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse API URL {api_url:?}"))]
    ParseApiUrl {
        source: url::ParseError,
        api_url: String,
    },

    #[snafu(display("unable to derive a tenant UUID from API URL {api_url:?}"))]
    NoTenantInApiUrl { api_url: String },

    #[snafu(display("failed to serialize the DynaKube spec"))]
    SerializeSpec { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Deploys and configures Dynatrace OneAgents, ActiveGates and code-module injection.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta4",
    kind = "DynaKube",
    plural = "dynakubes",
    shortname = "dk",
    status = "DynaKubeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Dynatrace API URL including the `/api` path, e.g. `https://<tenant>.live.dynatrace.com/api`.
    #[serde(rename = "apiUrl")]
    pub api_url: String,

    /// Name of the secret holding the API and PaaS tokens. Defaults to the DynaKube name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    /// Name of a ConfigMap holding additional trusted CA certificates in PEM format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_cas: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Network zone used by OneAgents and ActiveGates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Disable certificate checks against the Dynatrace API.
    #[serde(default)]
    pub skip_cert_check: bool,

    /// Create Istio objects so the cluster can reach the Dynatrace environment.
    #[serde(default)]
    pub enable_istio: bool,

    /// Pull secret to use instead of the one generated from the tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_pull_secret: Option<String>,

    /// Minimum minutes between Dynatrace API requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynatrace_api_request_threshold: Option<u16>,

    #[serde(default)]
    pub one_agent: OneAgentSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_gate: Option<ActiveGateSpec>,

    #[serde(default)]
    pub metadata_enrichment: MetadataEnrichmentSpec,
}

/// A proxy given either inline or through a secret key.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Name of a secret with a `proxy` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

impl ProxySpec {
    pub fn is_set(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.is_empty())
            || self.value_from.as_deref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classic_fullstack: Option<HostInjectSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_monitoring: Option<HostInjectSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_fullstack: Option<CloudNativeFullStackSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<ApplicationMonitoringSpec>,

    /// Host group the OneAgents are assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,
}

/// Settings shared by all modes that deploy a OneAgent DaemonSet.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInjectSpec {
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oneagent_resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Extra arguments passed to the OneAgent installer, e.g. `--set-host-group=<group>`.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Settings shared by all modes that inject code modules into application pods.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInjectionSpec {
    /// Restricts injection to namespaces matching this selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Resources of the injected init container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,

    /// Image containing the code modules, used by the CSI driver or as a self-extracting init image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudNativeFullStackSpec {
    #[serde(flatten)]
    pub host: HostInjectSpec,

    #[serde(flatten)]
    pub app_injection: AppInjectionSpec,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMonitoringSpec {
    #[serde(flatten)]
    pub app_injection: AppInjectionSpec,

    /// Deliver code modules through the CSI driver instead of downloading them in the init container.
    #[serde(default)]
    pub use_csi_driver: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateSpec {
    /// Any of `routing`, `kubernetes-monitoring`, `metrics-ingest` and `dynatrace-api`.
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum ActiveGateCapability {
    Routing,
    KubernetesMonitoring,
    MetricsIngest,
    DynatraceApi,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

/// The OneAgent deployment modes. At most one may be configured.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum OneAgentMode {
    ClassicFullstack,
    HostMonitoring,
    CloudNativeFullstack,
    ApplicationMonitoring,
}

impl OneAgentSpec {
    /// Every configured mode, in declaration order.
    pub fn modes(&self) -> Vec<OneAgentMode> {
        [
            (
                self.classic_fullstack.is_some(),
                OneAgentMode::ClassicFullstack,
            ),
            (self.host_monitoring.is_some(), OneAgentMode::HostMonitoring),
            (
                self.cloud_native_fullstack.is_some(),
                OneAgentMode::CloudNativeFullstack,
            ),
            (
                self.application_monitoring.is_some(),
                OneAgentMode::ApplicationMonitoring,
            ),
        ]
        .into_iter()
        .filter_map(|(set, mode)| set.then_some(mode))
        .collect()
    }

    pub fn mode(&self) -> Option<OneAgentMode> {
        self.modes().into_iter().next()
    }

    /// The host-level spec of the modes that run a OneAgent DaemonSet.
    pub fn host_inject_spec(&self) -> Option<&HostInjectSpec> {
        self.classic_fullstack
            .as_ref()
            .or(self.host_monitoring.as_ref())
            .or(self.cloud_native_fullstack.as_ref().map(|spec| &spec.host))
    }

    /// The injection spec of the modes that mutate application pods.
    pub fn app_injection_spec(&self) -> Option<&AppInjectionSpec> {
        self.cloud_native_fullstack
            .as_ref()
            .map(|spec| &spec.app_injection)
            .or(self
                .application_monitoring
                .as_ref()
                .map(|spec| &spec.app_injection))
    }

    /// The host group, taken from the field or from a `--set-host-group=` installer argument.
    pub fn host_group(&self) -> Option<String> {
        if let Some(group) = self.host_group.as_deref().filter(|g| !g.is_empty()) {
            return Some(group.to_owned());
        }
        self.host_group_from_args()
    }

    pub fn host_group_from_args(&self) -> Option<String> {
        self.host_inject_spec()?
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("--set-host-group="))
            .map(ToOwned::to_owned)
    }
}

impl ActiveGateSpec {
    pub fn has_capability(&self, capability: ActiveGateCapability) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.parse::<ActiveGateCapability>().ok() == Some(capability))
    }
}

impl DynaKube {
    pub fn feature_flags(&self) -> FeatureFlags<'_> {
        FeatureFlags::new(self.annotations())
    }

    /// Name of the secret holding the API and PaaS tokens.
    pub fn tokens_secret_name(&self) -> String {
        self.spec
            .tokens
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    pub fn oneagent_tenant_secret_name(&self) -> String {
        format!("{}-oneagent-tenant-secret", self.name_any())
    }

    pub fn activegate_tenant_secret_name(&self) -> String {
        format!("{}-activegate-tenant-secret", self.name_any())
    }

    /// Pull secrets pods and DaemonSets use for Dynatrace images: the one generated from the
    /// tokens, followed by the custom one if configured.
    pub fn pull_secret_names(&self) -> Vec<String> {
        let mut names = vec![format!("{}-pull-secret", self.name_any())];
        if let Some(custom) = self.spec.custom_pull_secret.as_deref().filter(|s| !s.is_empty()) {
            names.push(custom.to_owned());
        }
        names
    }

    /// Host part of the API URL, or `None` if it cannot be parsed.
    pub fn api_url_host(&self) -> Option<String> {
        Url::parse(&self.spec.api_url)
            .ok()?
            .host_str()
            .map(ToOwned::to_owned)
    }

    /// Tenant UUID reported by the connection-info request.
    pub fn tenant_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .one_agent
            .connection_info
            .tenant_uuid
            .as_deref()
            .filter(|uuid| !uuid.is_empty())
    }

    /// Tenant derived from the API URL: `/e/<tenant>/api` for managed environments, the first
    /// host label otherwise.
    pub fn tenant_uuid_from_api_url(&self) -> Result<String> {
        let api_url = &self.spec.api_url;
        let url = Url::parse(api_url).context(ParseApiUrlSnafu { api_url })?;

        let segments: Vec<_> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if let ["e", tenant, "api", ..] = segments.as_slice() {
            return Ok((*tenant).to_owned());
        }

        url.host_str()
            .and_then(|host| host.split('.').next())
            .filter(|label| !label.is_empty())
            .map(ToOwned::to_owned)
            .context(NoTenantInApiUrlSnafu { api_url })
    }

    pub fn is_classic_fullstack(&self) -> bool {
        self.spec.one_agent.classic_fullstack.is_some()
    }

    pub fn is_host_monitoring(&self) -> bool {
        self.spec.one_agent.host_monitoring.is_some()
    }

    pub fn is_cloud_native_fullstack(&self) -> bool {
        self.spec.one_agent.cloud_native_fullstack.is_some()
    }

    pub fn is_application_monitoring(&self) -> bool {
        self.spec.one_agent.application_monitoring.is_some()
    }

    /// Whether a OneAgent DaemonSet is deployed to nodes.
    pub fn needs_oneagent(&self) -> bool {
        self.is_classic_fullstack() || self.is_host_monitoring() || self.is_cloud_native_fullstack()
    }

    /// Whether the chosen mode relies on the CSI driver.
    ///
    /// With node image pull enabled, app injection no longer needs the driver.
    pub fn needs_csi(&self) -> bool {
        if self.is_host_monitoring() {
            return true;
        }
        if self.feature_flags().is_node_image_pull() {
            return false;
        }

        let app_monitoring_with_csi = self
            .spec
            .one_agent
            .application_monitoring
            .as_ref()
            .is_some_and(|spec| spec.use_csi_driver);

        self.is_cloud_native_fullstack() || app_monitoring_with_csi
    }

    /// Whether the chosen mode can use a CSI volume at all.
    pub fn supports_csi(&self) -> bool {
        self.is_host_monitoring() || self.is_cloud_native_fullstack() || self.is_application_monitoring()
    }

    pub fn needs_activegate(&self) -> bool {
        self.spec
            .active_gate
            .as_ref()
            .is_some_and(|ag| !ag.capabilities.is_empty())
    }

    pub fn needs_app_injection(&self) -> bool {
        self.is_cloud_native_fullstack() || self.is_application_monitoring()
    }

    pub fn is_metadata_enrichment_enabled(&self) -> bool {
        self.spec.metadata_enrichment.enabled.unwrap_or(false)
    }

    /// Namespace selector that restricts code-module injection.
    pub fn oneagent_namespace_selector(&self) -> Option<&LabelSelector> {
        self.spec
            .one_agent
            .app_injection_spec()?
            .namespace_selector
            .as_ref()
    }

    pub fn code_modules_image(&self) -> Option<&str> {
        self.spec
            .one_agent
            .app_injection_spec()?
            .code_modules_image
            .as_deref()
            .filter(|image| !image.is_empty())
    }

    /// Minimum time between two requests of the same kind against the Dynatrace API.
    ///
    /// The spec field wins over the feature flag.
    pub fn api_request_threshold(&self) -> Duration {
        match self.spec.dynatrace_api_request_threshold {
            Some(minutes) => Duration::from_secs(u64::from(minutes) * 60),
            None => self.feature_flags().api_request_threshold(),
        }
    }

    /// Value for the `DT_DEPLOYMENT_METADATA` variable of injected containers.
    pub fn deployment_metadata(&self, cluster_uuid: &str) -> String {
        let deployment_type = self
            .spec
            .one_agent
            .mode()
            .map_or_else(String::new, |mode| format!("-{mode}"));
        format!(
            "orchestration_tech=Operator{deployment_type};script_version={version};orchestrator_id={cluster_uuid}",
            version = env!("CARGO_PKG_VERSION")
        )
    }

    /// SHA-256 over the serialized spec, used to detect spec changes between API requests.
    pub fn spec_hash(&self) -> Result<String> {
        let serialized = serde_json::to_vec(&self.spec).context(SerializeSpecSnafu)?;
        Ok(format!("{:x}", Sha256::digest(serialized)))
    }
}
