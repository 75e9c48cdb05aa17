//! Process module configuration, the agent configuration the tenant hands out per revision.

use std::collections::BTreeMap;

use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::{
    crd::DynaKube,
    dtclient::{
        Client, EmptyConfigurationSnafu, HashSpecSnafu, MalformedServerResponseSnafu, Result,
        TokenKind,
    },
};

pub const GENERAL_SECTION: &str = "general";
const HOST_GROUP_KEY: &str = "hostGroup";
const TENANT_KEY: &str = "tenant";
const TENANT_TOKEN_KEY: &str = "tenantToken";
const SERVER_KEY: &str = "serverAddress";
const PROXY_KEY: &str = "proxy";
const NO_PROXY_KEY: &str = "noProxy";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ProcessModuleConfig {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub properties: Vec<ProcessModuleProperty>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ProcessModuleProperty {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl ProcessModuleProperty {
    pub fn new(
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl ProcessModuleConfig {
    /// Sets `property`, replacing every existing entry with the same section and key.
    ///
    /// An empty value only removes existing entries.
    pub fn add(&mut self, property: ProcessModuleProperty) -> &mut Self {
        self.properties
            .retain(|p| !(p.section == property.section && p.key == property.key));

        if !property.value.is_empty() {
            self.properties.push(property);
        }
        self
    }

    pub fn add_host_group(&mut self, host_group: &str) -> &mut Self {
        self.add(ProcessModuleProperty::new(
            GENERAL_SECTION,
            HOST_GROUP_KEY,
            host_group,
        ))
    }

    pub fn add_connection_info(
        &mut self,
        tenant_uuid: &str,
        tenant_token: &str,
        endpoints: &str,
    ) -> &mut Self {
        self.add(ProcessModuleProperty::new(
            GENERAL_SECTION,
            TENANT_KEY,
            tenant_uuid,
        ))
        .add(ProcessModuleProperty::new(
            GENERAL_SECTION,
            TENANT_TOKEN_KEY,
            tenant_token,
        ))
        .add(ProcessModuleProperty::new(
            GENERAL_SECTION,
            SERVER_KEY,
            format!("{{{endpoints}}}"),
        ))
    }

    pub fn add_proxy(&mut self, proxy: &str) -> &mut Self {
        self.add(ProcessModuleProperty::new(GENERAL_SECTION, PROXY_KEY, proxy))
    }

    pub fn add_no_proxy(&mut self, no_proxy: &str) -> &mut Self {
        self.add(ProcessModuleProperty::new(
            GENERAL_SECTION,
            NO_PROXY_KEY,
            no_proxy,
        ))
    }

    /// Groups the properties by section. Later duplicates win.
    pub fn to_map(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut map: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for property in &self.properties {
            map.entry(property.section.clone())
                .or_default()
                .insert(property.key.clone(), property.value.clone());
        }
        map
    }
}

impl Client {
    /// Fetches the process module configuration if it changed since `previous_revision`.
    ///
    /// Returns `None` if the configuration is unchanged (304) or the tenant does not support the
    /// endpoint (404).
    #[tracing::instrument(skip(self))]
    pub async fn get_process_module_config(
        &self,
        previous_revision: u64,
    ) -> Result<Option<ProcessModuleConfig>> {
        let revision = previous_revision.to_string();
        let mut query = vec![("revision", revision.as_str())];
        if let Some(host_group) = &self.host_group {
            query.push(("hostGroup", host_group.as_str()));
        }

        let request = self
            .request(
                Method::GET,
                "/v1/deployment/installer/agent/processmoduleconfig",
                TokenKind::Installer,
            )?
            .query(&query);

        let response = self.send(request).await?;
        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => return Ok(None),
            StatusCode::NOT_FOUND => {
                self.log_process_module_config_unsupported();
                return Ok(None);
            }
            _ => {}
        }

        let headers = response.headers().clone();
        let body = self.read_body(response).await?;
        if !status.is_success() {
            return Err(self.error_from_response(status, &headers, &body));
        }

        let config: ProcessModuleConfig =
            serde_json::from_slice(&body).context(MalformedServerResponseSnafu {
                status: status.as_u16(),
            })?;
        ensure!(!config.properties.is_empty(), EmptyConfigurationSnafu);

        Ok(Some(config))
    }
}

/// Fetches the process module configuration for `dynakube`, at most once per API request
/// threshold unless its spec changed in the meantime.
///
/// A throttled call returns `None` without contacting the tenant. Successful requests are
/// recorded in the status of `dynakube`.
#[tracing::instrument(skip_all, fields(dynakube.name = %dynakube.name_any()))]
pub async fn poll_process_module_config(
    client: &Client,
    dynakube: &mut DynaKube,
    previous_revision: u64,
    now: Timestamp,
) -> Result<Option<ProcessModuleConfig>> {
    let threshold = dynakube.api_request_threshold();
    let spec_hash = dynakube.spec_hash().context(HashSpecSnafu)?;
    let period = &mut dynakube
        .status
        .get_or_insert_default()
        .dynatrace_api
        .process_module_config;

    if period.is_throttled(now, threshold, &spec_hash) {
        tracing::debug!("process module config was requested recently, skipping request");
        return Ok(None);
    }

    let config = client.get_process_module_config(previous_revision).await?;
    period.record(now, spec_hash);
    Ok(config)
}
