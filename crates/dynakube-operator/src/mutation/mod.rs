//! Admission mutation of pods.
//!
//! A pod admitted in a namespace monitored by a DynaKube gets the OneAgent code modules injected:
//! an `agent-bin` volume, an init container filling it and user containers that preload the agent
//! from it. Metadata enrichment runs as part of the same mutation. Every call works on its own
//! copy of the request, nothing is kept between admissions.

use const_format::concatcp;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::ResourceExt;
use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::{
    crd::DynaKube,
    feature_flags::InjectionFailurePolicy,
    mutation::workload::{OwnerLookup, resolve_workload},
    selector::LabelSelectorExt,
};

pub mod args;
pub mod metadata;
pub mod oneagent;
pub mod workload;

pub const ANNOTATION_PREFIX: &str = "oneagent.dynatrace.com/";
pub const ANNOTATION_INJECT: &str = concatcp!(ANNOTATION_PREFIX, "inject");
pub const ANNOTATION_INJECTED: &str = concatcp!(ANNOTATION_PREFIX, "injected");
pub const ANNOTATION_REASON: &str = concatcp!(ANNOTATION_PREFIX, "reason");
pub const ANNOTATION_INSTALL_PATH: &str = concatcp!(ANNOTATION_PREFIX, "install-path");
pub const ANNOTATION_FLAVOR: &str = concatcp!(ANNOTATION_PREFIX, "flavor");
pub const ANNOTATION_TECHNOLOGIES: &str = concatcp!(ANNOTATION_PREFIX, "technologies");
pub const ANNOTATION_VOLUME_TYPE: &str = concatcp!(ANNOTATION_PREFIX, "volume-type");

pub const VOLUME_ANNOTATION_PREFIX: &str = "volume.dynatrace.com/";
pub const ANNOTATION_EPHEMERAL_VOLUME_SIZE_LIMIT: &str =
    concatcp!(VOLUME_ANNOTATION_PREFIX, "ephemeral-volume-size-limit");

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("the tenant UUID of dynakube {dynakube:?} is not known yet"))]
    MissingTenantUuid { dynakube: String },

    #[snafu(display("failed to resolve the workload owning the pod"))]
    OwnerLookupFailed { source: workload::Error },

    #[snafu(display("failed to encode an init container argument"))]
    EncodeArgument { source: args::Error },

    #[snafu(display("failed to enrich the pod metadata"))]
    EnrichMetadata { source: metadata::Error },
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Stable value for the pod's reason annotation.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingTenantUuid { .. } => "MissingTenantUUID",
            Self::OwnerLookupFailed { .. } => "OwnerLookupFailed",
            Self::EncodeArgument { .. } => "InvalidInitArgument",
            Self::EnrichMetadata { .. } => "MetadataEnrichmentFailed",
        }
    }
}

/// Everything a single pod admission is decided on.
#[derive(Clone, Debug)]
pub struct MutationRequest {
    pub pod: Pod,
    pub namespace: Namespace,
    pub dynakube: DynaKube,

    /// UID of the `kube-system` namespace.
    pub cluster_uuid: String,

    /// Image of the init container when the code modules are downloaded.
    pub init_image: String,
}

/// Outcome of a pod admission.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Admit the pod as it is.
    Unchanged,

    /// Admit the pod with this spec.
    Patched(Box<Pod>),

    /// Reject the pod.
    Denied(String),
}

impl MutationRequest {
    /// Whether the DynaKube injects into this pod at all.
    pub fn is_injection_enabled(&self) -> bool {
        let dynakube = &self.dynakube;
        if !dynakube.needs_app_injection() {
            return false;
        }

        let flags = dynakube.feature_flags();
        let namespace_name = self.namespace.name_any();
        let operator_namespace = dynakube.namespace().unwrap_or_default();
        if is_ignored_namespace(&flags.ignored_namespaces(&operator_namespace), &namespace_name) {
            tracing::debug!(namespace = %namespace_name, "namespace is ignored");
            return false;
        }

        let per_pod = self
            .pod
            .annotations()
            .get(ANNOTATION_INJECT)
            .and_then(|value| value.parse::<bool>().ok());
        if !per_pod.unwrap_or_else(|| flags.is_automatic_injection()) {
            return false;
        }

        let Some(selector) = dynakube.oneagent_namespace_selector() else {
            return true;
        };
        let labels = self.namespace.metadata.labels.clone().unwrap_or_default();
        selector.matches(&labels).unwrap_or_else(|error| {
            tracing::warn!(%error, "invalid OneAgent namespace selector, skipping injection");
            false
        })
    }
}

fn is_ignored_namespace(patterns: &[String], namespace: &str) -> bool {
    patterns.iter().any(|pattern| match Regex::new(pattern) {
        Ok(regex) => regex.is_match(namespace),
        Err(error) => {
            tracing::warn!(%error, %pattern, "invalid ignored namespace pattern");
            false
        }
    })
}

pub fn is_injected(pod: &Pod) -> bool {
    pod.annotations()
        .get(ANNOTATION_INJECTED)
        .is_some_and(|value| value == "true")
}

/// Decides on a pod admission and mutates the pod if needed.
///
/// A pod that was already injected only gets the containers rewritten that were added since, the
/// init container stays as it is. Failures follow the DynaKube's injection failure policy.
#[tracing::instrument(skip_all, fields(
    pod.name = %workload::pod_name(&request.pod),
    namespace = %request.namespace.name_any(),
    dynakube.name = %request.dynakube.name_any(),
))]
pub async fn mutate(request: &MutationRequest, owners: &dyn OwnerLookup) -> Decision {
    if !request.is_injection_enabled() {
        return Decision::Unchanged;
    }

    let mut pod = request.pod.clone();

    if is_injected(&pod) {
        let reinjected = oneagent::inject_containers(&mut pod, request);
        tracing::debug!(containers = reinjected, "reinvoked on an injected pod");
        return if reinjected > 0 {
            Decision::Patched(Box::new(pod))
        } else {
            Decision::Unchanged
        };
    }

    match inject(&mut pod, request, owners).await {
        Ok(()) => {
            tracing::info!("injected OneAgent into pod");
            Decision::Patched(Box::new(pod))
        }
        Err(error) => {
            tracing::warn!(%error, reason = error.reason(), "failed to inject OneAgent into pod");
            match request.dynakube.feature_flags().injection_failure_policy() {
                InjectionFailurePolicy::Fail => Decision::Denied(error.to_string()),
                InjectionFailurePolicy::Silent => {
                    let mut pod = request.pod.clone();
                    annotate_failure(&mut pod, error.reason());
                    Decision::Patched(Box::new(pod))
                }
            }
        }
    }
}

async fn inject(pod: &mut Pod, request: &MutationRequest, owners: &dyn OwnerLookup) -> Result<()> {
    let volume_type = oneagent::select_volume_type(request);
    let (image, mut args) = oneagent::init_args(request, volume_type)?;

    if metadata::is_enabled(&request.dynakube, &request.namespace) {
        let namespace = request.namespace.name_any();
        let workload = resolve_workload(&request.pod, &namespace, owners)
            .await
            .context(OwnerLookupFailedSnafu)?;
        let rules = request
            .dynakube
            .status
            .as_ref()
            .map(|status| status.metadata_enrichment.rules.as_slice())
            .unwrap_or_default();
        metadata::enrich(pod, &request.namespace, rules, &workload, &mut args)
            .context(EnrichMetadataSnafu)?;
    }

    oneagent::add_volumes(pod, request, volume_type);
    oneagent::inject_containers(pod, request);

    let init_container = oneagent::init_container(request, volume_type, image, args);
    let spec = pod.spec.get_or_insert_default();
    spec.init_containers
        .get_or_insert_default()
        .insert(0, init_container);

    let annotations = pod.annotations_mut();
    annotations.insert(ANNOTATION_INJECTED.to_owned(), "true".to_owned());
    annotations.remove(ANNOTATION_REASON);
    Ok(())
}

fn annotate_failure(pod: &mut Pod, reason: &str) {
    let annotations = pod.annotations_mut();
    annotations.insert(ANNOTATION_INJECTED.to_owned(), "false".to_owned());
    annotations.insert(ANNOTATION_REASON.to_owned(), reason.to_owned());
}
