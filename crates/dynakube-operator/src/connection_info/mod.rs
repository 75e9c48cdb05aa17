//! Keeps the tenant connection info of a DynaKube fresh.
//!
//! The connection info lives in two places: the DynaKube status (tenant UUID, endpoints, time of
//! the last request) and a tenant secret holding the tenant token. The Dynatrace API is only asked
//! again when the secret is gone or the request threshold has elapsed.

use async_trait::async_trait;
use k8s_openapi::{
    ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp,
};
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::{
    crd::{
        DynaKube, DynaKubeStatus, TENANT_SECRET_TOKEN_KEY,
        conditions::{
            ACTIVEGATE_CONNECTION_INFO_CONDITION_TYPE, ConditionStatus, DynaKubeCondition,
            ONEAGENT_CONNECTION_INFO_CONDITION_TYPE, UPDATED_REASON, remove_condition,
            set_condition,
        },
        status::{ConnectionInfoStatus, is_request_outdated},
    },
    dtclient::{self, connection_info::ConnectionInfo},
};

pub const FIELD_MANAGER: &str = "dynakube-operator";

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Subsystem {
    OneAgent,
    ActiveGate,
}

impl Subsystem {
    fn condition_type(self) -> &'static str {
        match self {
            Self::OneAgent => ONEAGENT_CONNECTION_INFO_CONDITION_TYPE,
            Self::ActiveGate => ACTIVEGATE_CONNECTION_INFO_CONDITION_TYPE,
        }
    }

    fn secret_name(self, dynakube: &DynaKube) -> String {
        match self {
            Self::OneAgent => dynakube.oneagent_tenant_secret_name(),
            Self::ActiveGate => dynakube.activegate_tenant_secret_name(),
        }
    }

    fn is_needed(self, dynakube: &DynaKube) -> bool {
        match self {
            Self::OneAgent => dynakube.needs_oneagent() || dynakube.needs_app_injection(),
            Self::ActiveGate => dynakube.needs_activegate(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch {subsystem} connection info"))]
    FetchConnectionInfo {
        source: dtclient::Error,
        subsystem: Subsystem,
    },

    #[snafu(display("failed to look up tenant secret {secret_name:?}"))]
    ReadTenantSecret {
        source: kube::Error,
        secret_name: String,
    },

    #[snafu(display("failed to write tenant secret {secret_name:?}"))]
    WriteTenantSecret {
        source: kube::Error,
        secret_name: String,
    },

    #[snafu(display("failed to hash the DynaKube status"))]
    HashStatus { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Where connection info comes from.
#[async_trait]
pub trait ConnectionInfoSource: Send + Sync {
    async fn oneagent_connection_info(&self) -> dtclient::Result<ConnectionInfo>;
    async fn activegate_connection_info(&self) -> dtclient::Result<ConnectionInfo>;
}

#[async_trait]
impl ConnectionInfoSource for dtclient::Client {
    async fn oneagent_connection_info(&self) -> dtclient::Result<ConnectionInfo> {
        self.get_oneagent_connection_info().await
    }

    async fn activegate_connection_info(&self) -> dtclient::Result<ConnectionInfo> {
        self.get_activegate_connection_info().await
    }
}

/// Storage for the tenant secrets.
#[async_trait]
pub trait TenantSecretStore: Send + Sync {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;
    async fn apply(&self, namespace: &str, name: &str, tenant_token: &str)
    -> Result<(), kube::Error>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

#[async_trait]
impl TenantSecretStore for kube::Client {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        tenant_token: &str,
    ) -> Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        let secret = tenant_secret(namespace, name, tenant_token);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

pub fn tenant_secret(namespace: &str, name: &str, tenant_token: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        data: Some(
            [(
                TENANT_SECRET_TOKEN_KEY.to_owned(),
                ByteString(tenant_token.as_bytes().to_vec()),
            )]
            .into(),
        ),
        ..Secret::default()
    }
}

/// Refreshes the OneAgent and ActiveGate connection info of `dynakube`.
///
/// Returns whether the status changed and has to be written back.
#[tracing::instrument(skip_all, fields(dynakube.name = %dynakube.name_any()))]
pub async fn reconcile(
    dynakube: &mut DynaKube,
    source: &dyn ConnectionInfoSource,
    secrets: &dyn TenantSecretStore,
    now: Timestamp,
) -> Result<bool> {
    let before = status_hash(dynakube)?;

    let oneagent = reconcile_subsystem(dynakube, Subsystem::OneAgent, source, secrets, now).await;
    let activegate =
        reconcile_subsystem(dynakube, Subsystem::ActiveGate, source, secrets, now).await;
    oneagent?;
    activegate?;

    Ok(status_hash(dynakube)? != before)
}

fn status_hash(dynakube: &DynaKube) -> Result<String> {
    dynakube
        .status
        .clone()
        .unwrap_or_default()
        .hash()
        .context(HashStatusSnafu)
}

async fn reconcile_subsystem(
    dynakube: &mut DynaKube,
    subsystem: Subsystem,
    source: &dyn ConnectionInfoSource,
    secrets: &dyn TenantSecretStore,
    now: Timestamp,
) -> Result<()> {
    let namespace = dynakube.namespace().unwrap_or_default();
    let secret_name = subsystem.secret_name(dynakube);

    if !subsystem.is_needed(dynakube) {
        if let Err(error) = secrets.delete(&namespace, &secret_name).await {
            if !is_not_found(&error) {
                tracing::warn!(%error, secret.name = %secret_name, "failed to delete tenant secret");
            }
        }
        if let Some(status) = dynakube.status.as_mut() {
            clear_status(status, subsystem);
        }
        return Ok(());
    }

    let secret_exists = secrets
        .exists(&namespace, &secret_name)
        .await
        .with_context(|_| ReadTenantSecretSnafu {
            secret_name: secret_name.clone(),
        })?;

    let threshold = dynakube.api_request_threshold();
    let status = dynakube.status.get_or_insert_with(DynaKubeStatus::default);
    let last_request = connection_info_status(status, subsystem).last_request.as_ref();

    if secret_exists && !is_request_outdated(last_request, now, threshold) {
        tracing::debug!(%subsystem, "connection info is up to date, skipping request");
        return Ok(());
    }

    let info = match fetch(source, subsystem).await {
        Ok(info) => info,
        Err(source) => {
            set_condition(
                &mut status.conditions,
                DynaKubeCondition::api_error(subsystem.condition_type(), &source),
                now,
            );
            return Err(Error::FetchConnectionInfo { source, subsystem });
        }
    };

    secrets
        .apply(&namespace, &secret_name, &info.tenant_token)
        .await
        .with_context(|_| WriteTenantSecretSnafu {
            secret_name: secret_name.clone(),
        })?;

    update_status(status, subsystem, &info, now);
    set_condition(
        &mut status.conditions,
        DynaKubeCondition::new(
            subsystem.condition_type(),
            ConditionStatus::True,
            UPDATED_REASON,
            format!("{secret_name} is up to date"),
        ),
        now,
    );
    tracing::info!(%subsystem, tenant.uuid = %info.tenant_uuid, "connection info updated");

    Ok(())
}

async fn fetch(
    source: &dyn ConnectionInfoSource,
    subsystem: Subsystem,
) -> dtclient::Result<ConnectionInfo> {
    let info = match subsystem {
        Subsystem::OneAgent => source.oneagent_connection_info().await?,
        Subsystem::ActiveGate => source.activegate_connection_info().await?,
    };
    info.ensure_communication_hosts()?;
    Ok(info)
}

fn connection_info_status(status: &DynaKubeStatus, subsystem: Subsystem) -> &ConnectionInfoStatus {
    match subsystem {
        Subsystem::OneAgent => &status.one_agent.connection_info.connection_info,
        Subsystem::ActiveGate => &status.active_gate.connection_info,
    }
}

fn update_status(
    status: &mut DynaKubeStatus,
    subsystem: Subsystem,
    info: &ConnectionInfo,
    now: Timestamp,
) {
    let connection_info = ConnectionInfoStatus {
        tenant_uuid: Some(info.tenant_uuid.clone()),
        endpoints: Some(info.endpoints_string()),
        last_request: Some(Time(now)),
    };

    match subsystem {
        Subsystem::OneAgent => {
            let oneagent = &mut status.one_agent.connection_info;
            oneagent.connection_info = connection_info;
            oneagent.communication_hosts = info
                .communication_hosts
                .iter()
                .cloned()
                .map(Into::into)
                .collect();
        }
        Subsystem::ActiveGate => status.active_gate.connection_info = connection_info,
    }
}

fn clear_status(status: &mut DynaKubeStatus, subsystem: Subsystem) {
    match subsystem {
        Subsystem::OneAgent => status.one_agent.connection_info = Default::default(),
        Subsystem::ActiveGate => status.active_gate.connection_info = Default::default(),
    }
    remove_condition(&mut status.conditions, subsystem.condition_type());
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use k8s_openapi::jiff::SignedDuration;

    use super::*;
    use crate::crd::{
        ActiveGateSpec, CloudNativeFullStackSpec, DynaKubeSpec, OneAgentSpec,
        conditions::find_condition, tests::dynakube,
    };

    #[derive(Default)]
    struct FakeSource {
        endpoints: Vec<String>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeSource {
        fn with_endpoints(endpoints: &[&str]) -> Self {
            Self {
                endpoints: endpoints.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn info(&self) -> dtclient::Result<ConnectionInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(dtclient::Error::ServerError {
                    code: 401,
                    message: "Token Authentication failed".to_owned(),
                });
            }
            Ok(ConnectionInfo::new("abc", "tenant-token", self.endpoints.clone()))
        }
    }

    #[async_trait]
    impl ConnectionInfoSource for FakeSource {
        async fn oneagent_connection_info(&self) -> dtclient::Result<ConnectionInfo> {
            self.info()
        }

        async fn activegate_connection_info(&self) -> dtclient::Result<ConnectionInfo> {
            self.info()
        }
    }

    #[derive(Default)]
    struct FakeSecrets {
        secrets: Mutex<BTreeMap<String, String>>,
    }

    impl FakeSecrets {
        fn token(&self, name: &str) -> Option<String> {
            self.secrets.lock().unwrap().get(name).cloned()
        }
    }

    #[async_trait]
    impl TenantSecretStore for FakeSecrets {
        async fn exists(&self, _namespace: &str, name: &str) -> Result<bool, kube::Error> {
            Ok(self.secrets.lock().unwrap().contains_key(name))
        }

        async fn apply(
            &self,
            _namespace: &str,
            name: &str,
            tenant_token: &str,
        ) -> Result<(), kube::Error> {
            self.secrets
                .lock()
                .unwrap()
                .insert(name.to_owned(), tenant_token.to_owned());
            Ok(())
        }

        async fn delete(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
            self.secrets.lock().unwrap().remove(name);
            Ok(())
        }
    }

    fn cloud_native() -> DynaKube {
        dynakube("dk", DynaKubeSpec {
            api_url: "https://abc.live.dynatrace.com/api".to_owned(),
            one_agent: OneAgentSpec {
                cloud_native_fullstack: Some(CloudNativeFullStackSpec::default()),
                ..OneAgentSpec::default()
            },
            ..DynaKubeSpec::default()
        })
    }

    #[tokio::test]
    async fn missing_secret_triggers_request() {
        let mut dk = cloud_native();
        let source = FakeSource::with_endpoints(&["https://h1/communication"]);
        let secrets = FakeSecrets::default();
        let now = Timestamp::now();

        let changed = reconcile(&mut dk, &source, &secrets, now).await.unwrap();

        assert!(changed);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secrets.token("dk-oneagent-tenant-secret").as_deref(), Some("tenant-token"));
        assert_eq!(secrets.token("dk-activegate-tenant-secret"), None);

        let status = dk.status.as_ref().unwrap();
        let info = &status.one_agent.connection_info;
        assert_eq!(info.connection_info.tenant_uuid.as_deref(), Some("abc"));
        assert_eq!(info.connection_info.endpoints.as_deref(), Some("https://h1/communication"));
        assert_eq!(info.connection_info.last_request, Some(Time(now)));
        assert_eq!(info.communication_hosts.len(), 1);
        assert_eq!(dk.tenant_uuid(), Some("abc"));
        assert_eq!(
            find_condition(&status.conditions, ONEAGENT_CONNECTION_INFO_CONDITION_TYPE)
                .map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[tokio::test]
    async fn fresh_connection_info_is_not_requested_again() {
        let mut dk = cloud_native();
        let source = FakeSource::with_endpoints(&["https://h1/communication"]);
        let secrets = FakeSecrets::default();
        let now = Timestamp::now();

        reconcile(&mut dk, &source, &secrets, now).await.unwrap();
        let changed = reconcile(&mut dk, &source, &secrets, now + SignedDuration::from_mins(5))
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outdated_connection_info_is_refreshed() {
        let mut dk = cloud_native();
        let source = FakeSource::with_endpoints(&["https://h1/communication"]);
        let secrets = FakeSecrets::default();
        let now = Timestamp::now();

        reconcile(&mut dk, &source, &secrets, now).await.unwrap();
        let later = now + SignedDuration::from_mins(20);
        let changed = reconcile(&mut dk, &source, &secrets, later).await.unwrap();

        assert!(changed);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            dk.status.unwrap().one_agent.connection_info.connection_info.last_request,
            Some(Time(later))
        );
    }

    #[tokio::test]
    async fn deleted_secret_is_recreated() {
        let mut dk = cloud_native();
        let source = FakeSource::with_endpoints(&["https://h1/communication"]);
        let secrets = FakeSecrets::default();
        let now = Timestamp::now();

        reconcile(&mut dk, &source, &secrets, now).await.unwrap();
        secrets.delete("dynatrace", "dk-oneagent-tenant-secret").await.unwrap();
        reconcile(&mut dk, &source, &secrets, now).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(secrets.token("dk-oneagent-tenant-secret").is_some());
    }

    #[tokio::test]
    async fn no_communication_hosts() {
        let mut dk = cloud_native();
        let source = FakeSource::with_endpoints(&["ftp://nope"]);
        let secrets = FakeSecrets::default();

        let error = reconcile(&mut dk, &source, &secrets, Timestamp::now())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::FetchConnectionInfo {
                source: dtclient::Error::NoCommunicationHosts,
                subsystem: Subsystem::OneAgent,
            }
        ));
        let status = dk.status.as_ref().unwrap();
        assert_eq!(status.one_agent.connection_info.connection_info.last_request, None);
        assert_eq!(secrets.token("dk-oneagent-tenant-secret"), None);
        assert_eq!(
            find_condition(&status.conditions, ONEAGENT_CONNECTION_INFO_CONDITION_TYPE)
                .map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn api_error_sets_false_condition() {
        let mut dk = cloud_native();
        let source = FakeSource {
            fail: true,
            ..FakeSource::default()
        };
        let secrets = FakeSecrets::default();

        reconcile(&mut dk, &source, &secrets, Timestamp::now())
            .await
            .unwrap_err();

        let condition = find_condition(
            &dk.status.as_ref().unwrap().conditions,
            ONEAGENT_CONNECTION_INFO_CONDITION_TYPE,
        )
        .unwrap()
        .clone();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some("DynatraceApiError"));
        assert!(condition.message.unwrap().contains("Token Authentication failed"));
    }

    #[tokio::test]
    async fn activegate_and_cleanup() {
        let mut dk = cloud_native();
        dk.spec.active_gate = Some(ActiveGateSpec {
            capabilities: vec!["routing".to_owned()],
            ..ActiveGateSpec::default()
        });
        let source = FakeSource::with_endpoints(&["https://ag/communication"]);
        let secrets = FakeSecrets::default();
        let now = Timestamp::now();

        reconcile(&mut dk, &source, &secrets, now).await.unwrap();
        assert!(secrets.token("dk-activegate-tenant-secret").is_some());
        assert_eq!(
            dk.status
                .as_ref()
                .unwrap()
                .active_gate
                .connection_info
                .endpoints
                .as_deref(),
            Some("https://ag/communication")
        );

        dk.spec.active_gate = None;
        let changed = reconcile(&mut dk, &source, &secrets, now).await.unwrap();
        assert!(changed);
        assert_eq!(secrets.token("dk-activegate-tenant-secret"), None);
        assert_eq!(
            dk.status.unwrap().active_gate.connection_info,
            ConnectionInfoStatus::default()
        );
    }

    #[test]
    fn tenant_secret_shape() {
        let secret = tenant_secret("dynatrace", "dk-oneagent-tenant-secret", "token");
        assert_eq!(secret.metadata.namespace.as_deref(), Some("dynatrace"));
        assert_eq!(
            secret.data.unwrap()[TENANT_SECRET_TOKEN_KEY],
            ByteString(b"token".to_vec())
        );
    }
}
