//! IP to host entity index, built from the tenant's host inventory.

use std::{collections::HashMap, time::Duration};

use k8s_openapi::jiff::Timestamp;
use serde::Deserialize;
use snafu::{OptionExt, ensure};

use crate::dtclient::{Client, EntityIdUnsetSnafu, HostNotFoundSnafu, Result, TokenKind};

/// Hosts not seen for longer than this are ignored when building the cache.
pub const INACTIVE_HOST_THRESHOLD: Duration = Duration::from_secs(30 * 60);

const DEFAULT_NETWORK_ZONE: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub entity_id: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostInfoResponse {
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub agent_version: Option<AgentVersion>,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub network_zone_id: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub last_seen_timestamp: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct AgentVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub timestamp: String,
}

#[derive(Debug, Default)]
pub struct HostCache {
    hosts: HashMap<String, HostInfo>,
}

impl HostCache {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, ip: &str) -> Option<&HostInfo> {
        self.hosts.get(ip)
    }

    /// Replaces the cache content with the active hosts of `network_zone`.
    ///
    /// If two hosts share an IP, the later one wins.
    pub fn rebuild(
        &mut self,
        hosts: Vec<HostInfoResponse>,
        network_zone: Option<&str>,
        now: Timestamp,
    ) {
        self.hosts.clear();

        let cutoff_ms = now.as_millisecond() - INACTIVE_HOST_THRESHOLD.as_millis() as i64;
        let mut inactive = Vec::new();

        for host in hosts {
            if host.last_seen_timestamp < cutoff_ms {
                inactive.push(host.entity_id);
                continue;
            }

            if !is_in_network_zone(&host.network_zone_id, network_zone) {
                continue;
            }

            let info = HostInfo {
                version: host
                    .agent_version
                    .map(|v| format!("{}.{}.{}.{}", v.major, v.minor, v.revision, v.timestamp))
                    .unwrap_or_default(),
                entity_id: host.entity_id,
            };

            for ip in host.ip_addresses {
                if let Some(old) = self.hosts.insert(ip.clone(), info.clone()) {
                    tracing::info!(
                        %ip,
                        new = %info.entity_id,
                        old = %old.entity_id,
                        "host cache: replacing host"
                    );
                }
            }
        }

        if !inactive.is_empty() {
            tracing::info!(ids = ?inactive, "host cache: ignoring inactive hosts");
        }
    }
}

fn is_in_network_zone(host_zone: &str, client_zone: Option<&str>) -> bool {
    match client_zone {
        Some(zone) => host_zone == zone,
        None => host_zone.is_empty() || host_zone == DEFAULT_NETWORK_ZONE,
    }
}

impl Client {
    /// Resolves the host entity ID for a node IP.
    ///
    /// The host inventory is fetched when the cache is empty. The cache lock is held for the
    /// whole lookup, including the request.
    #[tracing::instrument(skip(self))]
    pub async fn get_entity_id_for_ip(&self, ip: &str) -> Result<String> {
        let mut cache = self.host_cache.lock().await;

        if cache.is_empty() && !self.disable_host_requests {
            let request = self
                .request(
                    reqwest::Method::GET,
                    "/v1/entity/infrastructure/hosts",
                    TokenKind::DataPlane,
                )?
                .query(&[("includeDetails", "false")]);
            let hosts: Vec<HostInfoResponse> = self.execute_json(request).await?;
            cache.rebuild(hosts, self.network_zone.as_deref(), Timestamp::now());
        }

        let host = cache.get(ip).context(HostNotFoundSnafu { ip })?;
        ensure!(!host.entity_id.is_empty(), EntityIdUnsetSnafu { ip });
        Ok(host.entity_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::jiff::SignedDuration;
    use mockito::{Matcher, Server};
    use rstest::rstest;

    use super::*;
    use crate::dtclient::{Error, Tokens, tests::client};

    fn host(entity_id: &str, ips: &[&str], zone: &str, last_seen: Timestamp) -> HostInfoResponse {
        HostInfoResponse {
            ip_addresses: ips.iter().map(ToString::to_string).collect(),
            agent_version: Some(AgentVersion {
                major: 1,
                minor: 200,
                revision: 0,
                timestamp: "20200101-000000".to_owned(),
            }),
            entity_id: entity_id.to_owned(),
            network_zone_id: zone.to_owned(),
            last_seen_timestamp: last_seen.as_millisecond(),
        }
    }

    #[test]
    fn inactive_hosts_are_evicted() {
        let now = Timestamp::now();
        let mut cache = HostCache::default();
        cache.rebuild(
            vec![
                host("HOST-1", &["1.1.1.1"], "", now - SignedDuration::from_mins(31)),
                host("HOST-2", &["2.2.2.2"], "", now - SignedDuration::from_mins(29)),
            ],
            None,
            now,
        );

        assert!(cache.get("1.1.1.1").is_none());
        assert_eq!(cache.get("2.2.2.2").map(|h| h.entity_id.as_str()), Some("HOST-2"));
        assert_eq!(
            cache.get("2.2.2.2").map(|h| h.version.as_str()),
            Some("1.200.0.20200101-000000")
        );
    }

    #[rstest]
    #[case(None, "", true)]
    #[case(None, "default", true)]
    #[case(None, "zone-a", false)]
    #[case(Some("zone-a"), "zone-a", true)]
    #[case(Some("zone-a"), "", false)]
    #[case(Some("zone-a"), "default", false)]
    fn network_zone_match(
        #[case] client_zone: Option<&str>,
        #[case] host_zone: &str,
        #[case] indexed: bool,
    ) {
        let now = Timestamp::now();
        let mut cache = HostCache::default();
        cache.rebuild(vec![host("HOST-1", &["1.1.1.1"], host_zone, now)], client_zone, now);
        assert_eq!(cache.get("1.1.1.1").is_some(), indexed);
    }

    #[test]
    fn later_host_wins_shared_ip() {
        let now = Timestamp::now();
        let mut cache = HostCache::default();
        cache.rebuild(
            vec![
                host("HOST-1", &["1.1.1.1", "3.3.3.3"], "", now),
                host("HOST-2", &["1.1.1.1"], "", now),
            ],
            None,
            now,
        );

        assert_eq!(cache.get("1.1.1.1").map(|h| h.entity_id.as_str()), Some("HOST-2"));
        assert_eq!(cache.get("3.3.3.3").map(|h| h.entity_id.as_str()), Some("HOST-1"));
    }

    fn hosts_body(now: Timestamp) -> String {
        serde_json::json!([
            {
                "entityId": "HOST-42",
                "ipAddresses": ["10.0.0.1"],
                "networkZoneId": "default",
                "lastSeenTimestamp": now.as_millisecond(),
                "agentVersion": {"major": 1, "minor": 250, "revision": 0, "timestamp": "20220901-000000"}
            },
            {
                "entityId": "",
                "ipAddresses": ["10.0.0.2"],
                "lastSeenTimestamp": now.as_millisecond()
            }
        ])
        .to_string()
    }

    #[tokio::test]
    async fn lookup_builds_cache_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/entity/infrastructure/hosts")
            .match_query(Matcher::UrlEncoded("includeDetails".into(), "false".into()))
            .with_body(hosts_body(Timestamp::now()))
            .expect(1)
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(client.get_entity_id_for_ip("10.0.0.1").await.unwrap(), "HOST-42");

        let error = client.get_entity_id_for_ip("10.0.0.2").await.unwrap_err();
        assert!(matches!(error, Error::EntityIdUnset { .. }));

        let error = client.get_entity_id_for_ip("10.0.0.3").await.unwrap_err();
        assert!(matches!(error, Error::HostNotFound { .. }));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn disabled_host_requests() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/entity/infrastructure/hosts")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = Client::builder()
            .url(format!("{}/api", server.url()))
            .tokens(Tokens::new("api", "paas"))
            .disable_host_requests(true)
            .build()
            .unwrap();

        let error = client.get_entity_id_for_ip("10.0.0.1").await.unwrap_err();
        assert!(matches!(error, Error::HostNotFound { .. }));
        mock.assert_async().await;
    }
}
