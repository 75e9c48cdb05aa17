use std::time::Duration;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::Display;

use crate::crd::conditions::{DynaKubeCondition, set_condition};

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DynaKubePhase>,

    /// UID of the `kube-system` namespace, used as cluster identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_system_uuid: Option<String>,

    /// Monitored entity ID of the Kubernetes cluster in Dynatrace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_cluster_meid: Option<String>,

    #[serde(default)]
    pub dynatrace_api: DynatraceApiStatus,

    #[serde(default)]
    pub one_agent: OneAgentStatus,

    #[serde(default)]
    pub active_gate: ActiveGateStatus,

    #[serde(default)]
    pub code_modules: VersionStatus,

    #[serde(default)]
    pub metadata_enrichment: MetadataEnrichmentStatus,

    #[serde(default)]
    pub conditions: Vec<DynaKubeCondition>,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, JsonSchema, PartialEq, Eq, Serialize)]
pub enum DynaKubePhase {
    Running,
    Deploying,
    Error,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynatraceApiStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_token_scope_request: Option<Time>,

    #[serde(default)]
    pub process_module_config: RequestPeriod,
}

/// Bookkeeping for a rate-limited Dynatrace API request.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPeriod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_period: Option<Time>,

    /// Hash of the configuration the last request was made with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_config: Option<String>,
}

impl RequestPeriod {
    /// A request is throttled while the threshold has not elapsed since the last one and the
    /// configuration did not change in the meantime.
    pub fn is_throttled(&self, now: Timestamp, threshold: Duration, config_hash: &str) -> bool {
        !is_request_outdated(self.last_request_period.as_ref(), now, threshold)
            && self.prev_config.as_deref() == Some(config_hash)
    }

    /// Records a successful request.
    pub fn record(&mut self, now: Timestamp, config_hash: impl Into<String>) {
        self.last_request_period = Some(Time(now));
        self.prev_config = Some(config_hash.into());
    }
}

/// Whether `threshold` has elapsed since `last_request`. A missing timestamp is always outdated.
pub fn is_request_outdated(last_request: Option<&Time>, now: Timestamp, threshold: Duration) -> bool {
    let Some(Time(last_request)) = last_request else {
        return true;
    };

    let elapsed = now.duration_since(*last_request);
    elapsed.is_negative() || elapsed.unsigned_abs() >= threshold
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfoStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_uuid: Option<String>,

    /// Comma separated list of communication endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationHostStatus {
    pub protocol: String,
    pub host: String,
    pub port: u32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentConnectionInfoStatus {
    #[serde(flatten)]
    pub connection_info: ConnectionInfoStatus,

    #[serde(default)]
    pub communication_hosts: Vec<CommunicationHostStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentStatus {
    #[serde(default)]
    pub connection_info: OneAgentConnectionInfoStatus,

    #[serde(flatten)]
    pub version: VersionStatus,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateStatus {
    #[serde(default)]
    pub connection_info: ConnectionInfoStatus,

    #[serde(flatten)]
    pub version: VersionStatus,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_timestamp: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentStatus {
    #[serde(default)]
    pub rules: Vec<EnrichmentRule>,
}

/// Maps a namespace label or annotation onto pod metadata.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRule {
    #[serde(rename = "type")]
    pub type_: EnrichmentRuleType,

    /// Name of the namespace label or annotation to read.
    pub source: String,

    /// Key (without prefix) the value is written to. Empty means a synthetic key is used.
    #[serde(default)]
    pub target: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrichmentRuleType {
    #[default]
    #[strum(serialize = "label")]
    Label,
    #[strum(serialize = "annotation")]
    Annotation,
}

impl DynaKubeStatus {
    pub fn set_condition(&mut self, condition: DynaKubeCondition) -> bool {
        set_condition(&mut self.conditions, condition, Timestamp::now())
    }

    /// SHA-256 over the serialized status. Comparing it before and after a reconcile tells whether
    /// the status subresource has to be written.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        let serialized = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(serialized)))
    }
}
