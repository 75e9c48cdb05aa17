//! Kubernetes cluster settings and dashboard registration.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::dtclient::{
    Client, MissingKubeSystemUuidSnafu, Result, TokenKind, UnexpectedSettingsResponseSnafu,
};

pub const KUBERNETES_SETTINGS_SCHEMA_ID: &str = "builtin:cloud.kubernetes";
const KUBERNETES_SETTINGS_SCHEMA_VERSION: &str = "1.0.27";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubernetesSettings<'a> {
    label: &'a str,
    cluster_id_enabled: bool,
    cluster_id: &'a str,
    cloud_application_pipeline_enabled: bool,
    open_metrics_pipeline_enabled: bool,
    enabled: bool,
    event_processing_active: bool,
    event_processing_v2_active: bool,
    filter_events: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsObject<'a> {
    schema_id: &'a str,
    schema_version: &'a str,
    scope: String,
    value: KubernetesSettings<'a>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsObjectResponse {
    #[serde(default)]
    object_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredEntity {
    pub entity_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub last_seen_tms: i64,
}

#[derive(Deserialize)]
struct MonitoredEntitiesResponse {
    #[serde(default)]
    entities: Vec<MonitoredEntity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsCountResponse {
    #[serde(default)]
    total_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubernetesCredentials<'a> {
    label: &'a str,
    endpoint_url: &'a str,
    auth_token: &'a str,
    active: bool,
    certificate_check_enabled: bool,
    workload_integration_enabled: bool,
    events_integration_enabled: bool,
}

#[derive(Deserialize)]
struct KubernetesCredentialsResponse {
    #[serde(default)]
    id: String,
}

/// Entity ID Dynatrace derives for a Kubernetes cluster from its kube-system namespace UID.
pub fn kubernetes_cluster_entity_id(kube_system_uuid: &str) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    // 64-bit FNV-1
    let hash = kube_system_uuid
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| hash.wrapping_mul(PRIME) ^ u64::from(byte));

    let hex: String = hash
        .to_le_bytes()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect();
    format!("KUBERNETES_CLUSTER-{hex}")
}

impl Client {
    /// Creates the `builtin:cloud.kubernetes` settings object for the cluster and returns its ID.
    #[tracing::instrument(skip(self))]
    pub async fn create_setting(&self, label: &str, kube_system_uuid: &str) -> Result<String> {
        ensure!(!kube_system_uuid.is_empty(), MissingKubeSystemUuidSnafu);

        let body = [SettingsObject {
            schema_id: KUBERNETES_SETTINGS_SCHEMA_ID,
            schema_version: KUBERNETES_SETTINGS_SCHEMA_VERSION,
            scope: kubernetes_cluster_entity_id(kube_system_uuid),
            value: KubernetesSettings {
                label,
                cluster_id_enabled: true,
                cluster_id: kube_system_uuid,
                cloud_application_pipeline_enabled: true,
                open_metrics_pipeline_enabled: false,
                enabled: true,
                event_processing_active: false,
                event_processing_v2_active: false,
                filter_events: false,
            },
        }];

        let request = self
            .request(Method::POST, "/v2/settings/objects", TokenKind::DataPlane)?
            .query(&[("validateOnly", "false")])
            .json(&body);

        let response: Vec<SettingsObjectResponse> = self.execute_json(request).await?;
        match <[SettingsObjectResponse; 1]>::try_from(response) {
            Ok([object]) => Ok(object.object_id),
            Err(response) => UnexpectedSettingsResponseSnafu {
                count: response.len(),
            }
            .fail(),
        }
    }

    /// Lists the monitored Kubernetes cluster entities belonging to `kube_system_uuid`.
    #[tracing::instrument(skip(self))]
    pub async fn get_monitored_entities(
        &self,
        kube_system_uuid: &str,
    ) -> Result<Vec<MonitoredEntity>> {
        ensure!(!kube_system_uuid.is_empty(), MissingKubeSystemUuidSnafu);

        let selector = format!("type(KUBERNETES_CLUSTER),kubernetesClusterId({kube_system_uuid})");
        let request = self
            .request(Method::GET, "/v2/entities", TokenKind::DataPlane)?
            .query(&[
                ("pageSize", "500"),
                ("entitySelector", selector.as_str()),
                ("from", "-365d"),
                ("fields", "+lastSeenTms"),
            ]);

        let response: MonitoredEntitiesResponse = self.execute_json(request).await?;
        Ok(response.entities)
    }

    /// Counts the Kubernetes settings objects scoped to any of `entities`.
    #[tracing::instrument(skip_all)]
    pub async fn get_settings_count(&self, entities: &[MonitoredEntity]) -> Result<usize> {
        if entities.is_empty() {
            return Ok(0);
        }

        let scopes = entities
            .iter()
            .map(|entity| entity.entity_id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .request(Method::GET, "/v2/settings/objects", TokenKind::DataPlane)?
            .query(&[
                ("schemaIds", KUBERNETES_SETTINGS_SCHEMA_ID),
                ("scopes", scopes.as_str()),
            ]);

        let response: SettingsCountResponse = self.execute_json(request).await?;
        Ok(response.total_count)
    }

    /// Registers the cluster on the Kubernetes dashboard and returns the credentials ID.
    #[tracing::instrument(skip(self, bearer_token))]
    pub async fn add_to_dashboard(
        &self,
        label: &str,
        endpoint: &str,
        bearer_token: &str,
    ) -> Result<String> {
        let request = self
            .request(
                Method::POST,
                "/config/v1/kubernetes/credentials",
                TokenKind::DataPlane,
            )?
            .json(&KubernetesCredentials {
                label,
                endpoint_url: endpoint,
                auth_token: bearer_token,
                active: true,
                certificate_check_enabled: true,
                workload_integration_enabled: true,
                events_integration_enabled: true,
            });

        let response: KubernetesCredentialsResponse = self.execute_json(request).await?;
        Ok(response.id)
    }
}
