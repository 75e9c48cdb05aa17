//! Tenant connection info for OneAgents and ActiveGates.

use serde::Deserialize;
use snafu::ensure;

use crate::dtclient::{
    Client, NoCommunicationHostsSnafu, Result, TokenKind,
    endpoint::{CommunicationHost, parse_endpoint_list},
};

const COMMUNICATION_SUFFIX: &str = "communication";

/// Everything an agent needs to connect to its tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub tenant_uuid: String,
    pub tenant_token: String,

    /// All endpoints in the order the server returned them.
    pub endpoints: Vec<String>,

    /// The endpoint agents should prefer, always ending in `communication`.
    pub communication_endpoint: Option<String>,

    /// `endpoints` parsed into hosts. Invalid entries are dropped.
    pub communication_hosts: Vec<CommunicationHost>,
}

impl ConnectionInfo {
    pub fn new(
        tenant_uuid: impl Into<String>,
        tenant_token: impl Into<String>,
        endpoints: Vec<String>,
    ) -> Self {
        let tenant_uuid = tenant_uuid.into();
        let communication_endpoint = preferred_endpoint(&tenant_uuid, &endpoints);
        let communication_hosts = parse_endpoint_list(endpoints.iter().map(String::as_str));

        Self {
            tenant_uuid,
            tenant_token: tenant_token.into(),
            endpoints,
            communication_endpoint,
            communication_hosts,
        }
    }

    /// The endpoint list in its comma separated form.
    pub fn endpoints_string(&self) -> String {
        self.endpoints.join(",")
    }

    /// Fails with [`NoCommunicationHosts`](crate::dtclient::Error::NoCommunicationHosts) if none of the endpoints could be parsed.
    pub fn ensure_communication_hosts(&self) -> Result<()> {
        ensure!(!self.communication_hosts.is_empty(), NoCommunicationHostsSnafu);
        Ok(())
    }
}

/// Picks the first endpoint containing the tenant UUID, falling back to the first endpoint.
pub fn preferred_endpoint(tenant_uuid: &str, endpoints: &[String]) -> Option<String> {
    let matching = endpoints
        .iter()
        .find(|endpoint| !tenant_uuid.is_empty() && endpoint.contains(tenant_uuid));

    let endpoint = match matching {
        Some(endpoint) => endpoint,
        None => {
            let first = endpoints.first()?;
            tracing::debug!(
                tenant.uuid = %tenant_uuid,
                endpoint = %first,
                "no endpoint contains the tenant UUID, using the first one"
            );
            first
        }
    };

    Some(with_communication_suffix(endpoint))
}

fn with_communication_suffix(endpoint: &str) -> String {
    if endpoint.ends_with(COMMUNICATION_SUFFIX) {
        return endpoint.to_owned();
    }

    let separator = if endpoint.ends_with('/') { "" } else { "/" };
    format!("{endpoint}{separator}{COMMUNICATION_SUFFIX}")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentConnectionInfoResponse {
    #[serde(rename = "tenantUUID", default)]
    tenant_uuid: String,
    #[serde(default)]
    tenant_token: String,
    #[serde(default)]
    communication_endpoints: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayConnectionInfoResponse {
    #[serde(rename = "tenantUUID", default)]
    tenant_uuid: String,
    #[serde(default)]
    tenant_token: String,
    #[serde(default)]
    communication_endpoints: String,
}

impl Client {
    #[tracing::instrument(skip(self))]
    pub async fn get_oneagent_connection_info(&self) -> Result<ConnectionInfo> {
        let mut request = self.request(
            reqwest::Method::GET,
            "/v1/deployment/installer/agent/connectioninfo",
            TokenKind::Installer,
        )?;
        if let Some(network_zone) = &self.network_zone {
            request = request.query(&[
                ("networkZone", network_zone.as_str()),
                ("defaultZoneFallback", "true"),
            ]);
        }

        let response: AgentConnectionInfoResponse = self.execute_json(request).await?;
        Ok(ConnectionInfo::new(
            response.tenant_uuid,
            response.tenant_token,
            response.communication_endpoints,
        ))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_activegate_connection_info(&self) -> Result<ConnectionInfo> {
        let response: GatewayConnectionInfoResponse = self
            .get_json(
                "/v1/deployment/installer/gateway/connectioninfo",
                TokenKind::Installer,
            )
            .await?;

        let endpoints = response
            .communication_endpoints
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        Ok(ConnectionInfo::new(
            response.tenant_uuid,
            response.tenant_token,
            endpoints,
        ))
    }
}
