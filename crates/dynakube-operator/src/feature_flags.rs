//! Typed access to the feature flags a DynaKube carries in its annotations.
//!
//! Every flag is an entry of [`FeatureFlag`]. A flag is looked up under its current key
//! (`feature.dynatrace.com/<name>`) first and under the old alpha prefix
//! (`alpha.operator.dynatrace.com/feature-<name>`) second. Boolean flags which replaced an
//! inverted `disable-*` flag fall back to that companion through [`FeatureFlags::is_enabled`],
//! so every pair is resolved the same way.

use std::{collections::BTreeMap, time::Duration};

use strum::{AsRefStr, EnumIter, IntoEnumIterator};

pub const FEATURE_FLAG_PREFIX: &str = "feature.dynatrace.com/";
pub const DEPRECATED_FEATURE_FLAG_PREFIX: &str = "alpha.operator.dynatrace.com/feature-";

pub const DEFAULT_MAX_FAILED_CSI_MOUNT_ATTEMPTS: i64 = 10;
pub const DEFAULT_MAX_CSI_MOUNT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_API_REQUEST_THRESHOLD_MINUTES: u64 = 15;
pub const DEFAULT_ONEAGENT_MAX_UNAVAILABLE: i64 = 1;
pub const ISTIO_DEFAULT_ONEAGENT_INITIAL_CONNECT_RETRY: i64 = 6000;
const UNSET_ONEAGENT_INITIAL_CONNECT_RETRY: i64 = -1;

const TRUE_PHRASE: &str = "true";
const FALSE_PHRASE: &str = "false";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum FeatureFlag {
    AutomaticInjection,
    DisableAutomaticInjection,
    NoProxy,
    MaxCsiMountAttempts,
    MaxCsiMountTimeout,
    #[strum(serialize = "injection-readonly-volume")]
    ReadOnlyCsiVolume,
    PublicRegistry,
    OneagentMaxUnavailable,
    #[strum(serialize = "oneagent-initial-connect-retry-ms")]
    OneagentInitialConnectRetry,
    OneagentIgnoreProxy,
    OneagentPrivileged,
    InjectionFailurePolicy,
    IgnoredNamespaces,
    ActivegateUpdates,
    DisableActivegateUpdates,
    #[strum(serialize = "dynatrace-api-request-threshold")]
    ApiRequestThreshold,
    HostsRequests,
    DisableHostsRequests,
    NodeImagePull,
    LabelVersionDetection,
    MetadataEnrichment,
    DisableMetadataEnrichment,
    MultipleOsagentsOnNode,
}

impl FeatureFlag {
    /// The annotation key this flag is read from.
    pub fn key(self) -> String {
        format!("{FEATURE_FLAG_PREFIX}{}", self.as_ref())
    }

    fn deprecated_key(self) -> String {
        format!("{DEPRECATED_FEATURE_FLAG_PREFIX}{}", self.as_ref())
    }

    /// The inverted `disable-*` flag this flag replaced.
    pub fn deprecated_companion(self) -> Option<Self> {
        match self {
            Self::AutomaticInjection => Some(Self::DisableAutomaticInjection),
            Self::ActivegateUpdates => Some(Self::DisableActivegateUpdates),
            Self::HostsRequests => Some(Self::DisableHostsRequests),
            Self::MetadataEnrichment => Some(Self::DisableMetadataEnrichment),
            _ => None,
        }
    }

    /// Whether the flag itself is deprecated in favor of another one.
    pub fn is_deprecated(self) -> bool {
        Self::iter().any(|flag| flag.deprecated_companion() == Some(self))
    }

    /// Value of a boolean flag when neither it nor its companion is set.
    ///
    /// Flags defaulting to `true` are only switched off by an explicit `"false"`, flags
    /// defaulting to `false` are only switched on by an explicit `"true"`.
    fn default_enabled(self) -> bool {
        matches!(
            self,
            Self::AutomaticInjection
                | Self::ActivegateUpdates
                | Self::HostsRequests
                | Self::MetadataEnrichment
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum InjectionFailurePolicy {
    Fail,
    #[default]
    Silent,
}

/// Read-only view over an annotation map.
#[derive(Clone, Copy, Debug)]
pub struct FeatureFlags<'a> {
    annotations: &'a BTreeMap<String, String>,
}

impl<'a> FeatureFlags<'a> {
    pub fn new(annotations: &'a BTreeMap<String, String>) -> Self {
        Self { annotations }
    }

    /// Raw value of `flag`, or the empty string when it is not set.
    pub fn raw(&self, flag: FeatureFlag) -> &'a str {
        self.annotations
            .get(&flag.key())
            .or_else(|| self.annotations.get(&flag.deprecated_key()))
            .map_or("", String::as_str)
    }

    fn int(&self, flag: FeatureFlag, default: i64) -> i64 {
        self.raw(flag).parse().unwrap_or(default)
    }

    /// Resolves a boolean flag, consulting its deprecated (inverted) companion when the flag
    /// itself is unset.
    pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
        let raw = self.raw(flag);

        if !flag.default_enabled() {
            return raw == TRUE_PHRASE;
        }

        let disabled_by_companion = raw.is_empty()
            && flag
                .deprecated_companion()
                .is_some_and(|companion| self.raw(companion) == TRUE_PHRASE);

        raw != FALSE_PHRASE && !disabled_by_companion
    }

    pub fn is_automatic_injection(&self) -> bool {
        self.is_enabled(FeatureFlag::AutomaticInjection)
    }

    pub fn no_proxy(&self) -> &'a str {
        self.raw(FeatureFlag::NoProxy)
    }

    pub fn max_failed_csi_mount_attempts(&self) -> i64 {
        let value = self.int(
            FeatureFlag::MaxCsiMountAttempts,
            DEFAULT_MAX_FAILED_CSI_MOUNT_ATTEMPTS,
        );
        if value < 0 {
            DEFAULT_MAX_FAILED_CSI_MOUNT_ATTEMPTS
        } else {
            value
        }
    }

    pub fn max_csi_mount_timeout(&self) -> Duration {
        humantime::parse_duration(self.raw(FeatureFlag::MaxCsiMountTimeout))
            .unwrap_or(DEFAULT_MAX_CSI_MOUNT_TIMEOUT)
    }

    pub fn is_read_only_csi_volume(&self) -> bool {
        self.is_enabled(FeatureFlag::ReadOnlyCsiVolume)
    }

    pub fn is_public_registry(&self) -> bool {
        self.is_enabled(FeatureFlag::PublicRegistry)
    }

    pub fn oneagent_max_unavailable(&self) -> i64 {
        self.int(
            FeatureFlag::OneagentMaxUnavailable,
            DEFAULT_ONEAGENT_MAX_UNAVAILABLE,
        )
    }

    pub fn oneagent_initial_connect_retry(&self, istio_enabled: bool) -> i64 {
        let value = self.int(
            FeatureFlag::OneagentInitialConnectRetry,
            UNSET_ONEAGENT_INITIAL_CONNECT_RETRY,
        );

        if value == UNSET_ONEAGENT_INITIAL_CONNECT_RETRY && istio_enabled {
            ISTIO_DEFAULT_ONEAGENT_INITIAL_CONNECT_RETRY
        } else {
            value
        }
    }

    pub fn is_oneagent_ignoring_proxy(&self) -> bool {
        self.is_enabled(FeatureFlag::OneagentIgnoreProxy)
    }

    pub fn is_oneagent_privileged(&self) -> bool {
        self.is_enabled(FeatureFlag::OneagentPrivileged)
    }

    pub fn injection_failure_policy(&self) -> InjectionFailurePolicy {
        self.raw(FeatureFlag::InjectionFailurePolicy)
            .parse()
            .unwrap_or_default()
    }

    /// Regular expressions of namespaces that are never injected into.
    pub fn ignored_namespaces(&self, own_namespace: &str) -> Vec<String> {
        let raw = self.raw(FeatureFlag::IgnoredNamespaces);
        if raw.is_empty() {
            return default_ignored_namespaces(own_namespace);
        }

        serde_json::from_str(raw).unwrap_or_else(|error| {
            tracing::error!(%error, "failed to parse ignored-namespaces feature flag, using defaults");
            default_ignored_namespaces(own_namespace)
        })
    }

    pub fn is_activegate_updates_disabled(&self) -> bool {
        !self.is_enabled(FeatureFlag::ActivegateUpdates)
    }

    pub fn api_request_threshold(&self) -> Duration {
        let minutes = u64::try_from(self.int(
            FeatureFlag::ApiRequestThreshold,
            DEFAULT_API_REQUEST_THRESHOLD_MINUTES as i64,
        ))
        .unwrap_or(DEFAULT_API_REQUEST_THRESHOLD_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    pub fn is_hosts_requests_disabled(&self) -> bool {
        !self.is_enabled(FeatureFlag::HostsRequests)
    }

    pub fn is_node_image_pull(&self) -> bool {
        self.is_enabled(FeatureFlag::NodeImagePull)
    }

    pub fn is_label_version_detection(&self) -> bool {
        self.is_enabled(FeatureFlag::LabelVersionDetection)
    }

    pub fn is_metadata_enrichment_injection(&self) -> bool {
        self.is_enabled(FeatureFlag::MetadataEnrichment)
    }

    pub fn is_multiple_osagents_on_node(&self) -> bool {
        self.is_enabled(FeatureFlag::MultipleOsagentsOnNode)
    }

    /// Annotation keys that are set but only understood for backwards compatibility.
    pub fn deprecated_keys_in_use(&self) -> Vec<&'a str> {
        self.annotations
            .keys()
            .filter(|key| {
                key.starts_with(DEPRECATED_FEATURE_FLAG_PREFIX)
                    || FeatureFlag::iter()
                        .filter(|flag| flag.is_deprecated())
                        .any(|flag| flag.key() == **key)
            })
            .map(String::as_str)
            .collect()
    }

    /// Feature flag keys starting with `feature.dynatrace.com/<name_prefix>`.
    pub fn keys_with_prefix(&self, name_prefix: &str) -> Vec<&'a str> {
        self.annotations
            .keys()
            .filter(|key| {
                key.strip_prefix(FEATURE_FLAG_PREFIX)
                    .is_some_and(|name| name.starts_with(name_prefix))
            })
            .map(String::as_str)
            .collect()
    }
}

fn default_ignored_namespaces(own_namespace: &str) -> Vec<String> {
    vec![
        format!("^{own_namespace}$"),
        "^kube-.*".to_owned(),
        "^openshift(-.*)?".to_owned(),
        "^gke-.*".to_owned(),
        "^gmp-.*".to_owned(),
    ]
}
