use reqwest::Method;
use serde::Deserialize;

use crate::dtclient::{Client, Result, TokenKind};

/// Optional filters for [`Client::query_activegates`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveGateQuery {
    pub hostname: Option<String>,
    pub network_zone: Option<String>,
    pub network_address: Option<String>,
    pub update_status: Option<String>,
}

impl ActiveGateQuery {
    fn to_query(&self) -> Vec<(&'static str, &str)> {
        let mut query = vec![("osType", "LINUX"), ("type", "ENVIRONMENT")];
        let optional = [
            ("hostname", &self.hostname),
            ("networkZone", &self.network_zone),
            ("networkAddress", &self.network_address),
            ("updateStatus", &self.update_status),
        ];
        query.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.as_deref().map(|value| (key, value))),
        );
        query
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGate {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub network_zone: String,
    #[serde(default)]
    pub network_addresses: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub auto_update_status: Option<String>,
    /// Epoch milliseconds since the ActiveGate is offline, `0` or absent while online.
    #[serde(default)]
    pub offline_since: Option<i64>,
}

impl ActiveGate {
    pub fn is_online(&self) -> bool {
        self.offline_since.unwrap_or_default() <= 0
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveGatesResponse {
    #[serde(default)]
    active_gates: Vec<ActiveGate>,
}

impl Client {
    /// Lists the online environment ActiveGates that match `query`.
    #[tracing::instrument(skip(self))]
    pub async fn query_activegates(&self, query: &ActiveGateQuery) -> Result<Vec<ActiveGate>> {
        let request = self
            .request(Method::GET, "/v2/activeGates", TokenKind::DataPlane)?
            .query(&query.to_query());

        let response: ActiveGatesResponse = self.execute_json(request).await?;
        Ok(response
            .active_gates
            .into_iter()
            .filter(ActiveGate::is_online)
            .collect())
    }
}
