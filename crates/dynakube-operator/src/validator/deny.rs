use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use strum::IntoEnumIterator;
use url::Url;

use crate::{
    crd::{ActiveGateCapability, DynaKube},
    selector::{LabelSelectorExt, node_selector_matches},
    validation,
    validator::{Check, ClusterState, image::ImageReference},
};

const EXAMPLE_API_URL: &str = "https://ENVIRONMENTID.live.dynatrace.com/api";
const THIRD_GEN_API_URL_MARKER: &str = ".apps.";
const ONEAGENT_ENABLE_VOLUME_STORAGE_ENV: &str = "ONEAGENT_ENABLE_VOLUME_STORAGE";

const ERROR_NO_API_URL: &str = "The DynaKube's specification is missing the API URL or still has the example value set. Make sure you correctly specify the URL in your custom resource.";
const ERROR_THIRD_GEN_API_URL: &str = "The DynaKube's API URL points to a third generation environment URL (containing '.apps.'), which is not supported. Use the environment API URL ending in /api instead, e.g. https://ENVIRONMENTID.live.dynatrace.com/api.";
const ERROR_IMAGE_FIELD_SET_WITHOUT_CSI: &str = "The DynaKube's specification sets a codeModulesImage, but neither the CSI driver nor node image pull is available to use it.";
const ERROR_READ_ONLY_CSI_WITHOUT_CSI: &str = "The DynaKube's specification requests a read-only CSI volume, but the selected OneAgent mode does not use the CSI driver.";
const ERROR_CONFLICTING_ONEAGENT_MODE: &str = "The DynaKube's specification tries to use multiple OneAgent modes at the same time, which is not supported.";
const ERROR_ISTIO_NOT_INSTALLED: &str = "The DynaKube's specification enables the Istio integration, but Istio is not installed in the cluster.";
const ERROR_VOLUME_STORAGE_READ_ONLY_CONFLICT: &str = "The DynaKube's specification runs the OneAgent with a read-only host file system, but disables volume storage, which the read-only mode requires.";

pub(super) const CHECKS: &[(&str, Check)] = &[
    ("apiUrlPresent", api_url_present),
    ("apiUrlWellFormed", api_url_well_formed),
    ("apiUrlNotThirdGen", api_url_not_third_gen),
    ("nameIsDns1035", name_is_dns1035),
    ("csiDaemonSetAvailableIfNeeded", csi_daemonset_available_if_needed),
    ("csiEnabledIfReadOnlyRequested", csi_enabled_if_read_only_requested),
    ("oneAgentModeExclusive", oneagent_mode_exclusive),
    ("nodeSelectorNonOverlapping", node_selector_non_overlapping),
    ("namespaceSelectorNonOverlapping", namespace_selector_non_overlapping),
    ("namespaceSelectorLabelsValid", namespace_selector_labels_valid),
    ("activeGateCapabilitiesValid", activegate_capabilities_valid),
    ("activeGateCapabilitiesUnique", activegate_capabilities_unique),
    ("imageFieldNotTenantRegistry", image_field_not_tenant_registry),
    ("imageFieldParseable", image_field_parseable),
    ("resourcesRequireIstioWhenConfigured", istio_installed_if_enabled),
    ("volumeStorageCompatibleWithReadOnlyHostFs", volume_storage_compatible_with_read_only_host_fs),
];

fn api_url_present(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let api_url = dynakube.spec.api_url.trim();
    (api_url.is_empty() || api_url == EXAMPLE_API_URL).then(|| ERROR_NO_API_URL.to_owned())
}

fn api_url_well_formed(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let api_url = dynakube.spec.api_url.trim();
    if api_url.is_empty() {
        return None;
    }

    let has_host = Url::parse(api_url)
        .ok()
        .and_then(|url| url.host_str().map(|host| !host.is_empty()))
        .unwrap_or(false);

    (!has_host || !api_url.ends_with("/api")).then(|| {
        format!(
            "The DynaKube's API URL {api_url:?} is malformed. It must be an absolute URL ending in /api, e.g. {EXAMPLE_API_URL}."
        )
    })
}

fn api_url_not_third_gen(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    dynakube
        .spec
        .api_url
        .contains(THIRD_GEN_API_URL_MARKER)
        .then(|| ERROR_THIRD_GEN_API_URL.to_owned())
}

fn name_is_dns1035(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let name = dynakube.name_any();
    validation::is_dynakube_name(&name)
        .err()
        .map(|error| format!("The DynaKube's name {name:?} is invalid: {error}."))
}

fn csi_daemonset_available_if_needed(dynakube: &DynaKube, cluster: &ClusterState) -> Option<String> {
    let csi_available = cluster.csi_driver_available?;
    if csi_available {
        return None;
    }

    if dynakube.needs_csi() {
        return Some(format!(
            "The DynaKube's specification requires the CSI driver, but it is not deployed in namespace {namespace:?}.",
            namespace = cluster.operator_namespace
        ));
    }

    (dynakube.code_modules_image().is_some() && !dynakube.feature_flags().is_node_image_pull())
        .then(|| ERROR_IMAGE_FIELD_SET_WITHOUT_CSI.to_owned())
}

fn csi_enabled_if_read_only_requested(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    (dynakube.feature_flags().is_read_only_csi_volume() && !dynakube.needs_csi())
        .then(|| ERROR_READ_ONLY_CSI_WITHOUT_CSI.to_owned())
}

fn oneagent_mode_exclusive(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    (dynakube.spec.one_agent.modes().len() > 1).then(|| ERROR_CONFLICTING_ONEAGENT_MODE.to_owned())
}

/// Two node selectors conflict if either one selects the labels of the other. An empty selector
/// selects every node.
fn node_selectors_conflict(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    node_selector_matches(a, b) || node_selector_matches(b, a)
}

fn node_selector(dynakube: &DynaKube) -> BTreeMap<String, String> {
    dynakube
        .spec
        .one_agent
        .host_inject_spec()
        .map(|spec| spec.node_selector.clone())
        .unwrap_or_default()
}

fn node_selector_non_overlapping(dynakube: &DynaKube, cluster: &ClusterState) -> Option<String> {
    if !dynakube.needs_oneagent() {
        return None;
    }

    let selector = node_selector(dynakube);
    let multiple_allowed = dynakube.feature_flags().is_multiple_osagents_on_node();

    let conflicting: BTreeSet<_> = cluster
        .others(dynakube)
        .filter(|other| other.needs_oneagent())
        .filter(|other| !(multiple_allowed && other.feature_flags().is_multiple_osagents_on_node()))
        .filter(|other| node_selectors_conflict(&selector, &node_selector(other)))
        .map(ResourceExt::name_any)
        .collect();

    if conflicting.is_empty() {
        return None;
    }

    tracing::info!(dynakube.name = %dynakube.name_any(), ?conflicting, "conflicting OneAgent nodeSelector");
    Some(format!(
        "The DynaKube's nodeSelector conflicts with the nodeSelector of other DynaKubes, only one OneAgent per node is supported. Use a nodeSelector to avoid this conflict. Conflicting DynaKubes: {}",
        conflicting.into_iter().collect::<Vec<_>>().join(", ")
    ))
}

/// Whether `selector` selects `labels`. A missing selector selects everything, an invalid one
/// nothing.
fn selects(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    selector.is_none_or(|selector| selector.matches(labels).unwrap_or(false))
}

fn namespace_selector_non_overlapping(dynakube: &DynaKube, cluster: &ClusterState) -> Option<String> {
    if !dynakube.needs_app_injection() {
        return None;
    }

    let selector = dynakube.oneagent_namespace_selector();
    let conflicting: BTreeSet<_> = cluster
        .others(dynakube)
        .filter(|other| other.needs_app_injection())
        .filter(|other| {
            let other_selector = other.oneagent_namespace_selector();
            cluster.namespaces.iter().any(|namespace| {
                let labels = namespace.labels();
                selects(selector, labels) && selects(other_selector, labels)
            })
        })
        .map(ResourceExt::name_any)
        .collect();

    if conflicting.is_empty() {
        return None;
    }

    Some(format!(
        "The DynaKube's namespaceSelector selects namespaces another DynaKube already injects into, which is not supported. Make sure the namespaceSelector does not overlap with the one of other DynaKubes. Conflicting DynaKubes: {}",
        conflicting.into_iter().collect::<Vec<_>>().join(", ")
    ))
}

fn selector_problems(selector: &LabelSelector) -> Vec<String> {
    let mut problems = Vec::new();

    for (key, value) in selector.match_labels.iter().flatten() {
        if let Err(error) = validation::is_label_key(key) {
            problems.push(format!("label key {key:?}: {error}"));
        }
        if let Err(error) = validation::is_label_value(value) {
            problems.push(format!("label value {value:?} of {key:?}: {error}"));
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        if let Err(error) = validation::is_label_key(&requirement.key) {
            problems.push(format!("label key {:?}: {error}", requirement.key));
        }
        for value in requirement.values.iter().flatten() {
            if let Err(error) = validation::is_label_value(value) {
                problems.push(format!("label value {value:?} of {:?}: {error}", requirement.key));
            }
        }
    }

    // Evaluating against no labels surfaces operator errors.
    if let Err(error) = selector.matches(&BTreeMap::new()) {
        problems.push(error.to_string());
    }

    problems
}

fn namespace_selector_labels_valid(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let selectors = [
        ("oneAgent", dynakube.oneagent_namespace_selector()),
        (
            "metadataEnrichment",
            dynakube.spec.metadata_enrichment.namespace_selector.as_ref(),
        ),
    ];

    let problems: Vec<_> = selectors
        .into_iter()
        .filter_map(|(field, selector)| Some((field, selector?)))
        .flat_map(|(field, selector)| {
            selector_problems(selector)
                .into_iter()
                .map(move |problem| format!("{field}: {problem}"))
        })
        .collect();

    (!problems.is_empty()).then(|| {
        format!(
            "The DynaKube's namespaceSelector is invalid: {}",
            problems.join("; ")
        )
    })
}

fn activegate_capabilities(dynakube: &DynaKube) -> &[String] {
    dynakube
        .spec
        .active_gate
        .as_ref()
        .map(|active_gate| active_gate.capabilities.as_slice())
        .unwrap_or_default()
}

fn activegate_capabilities_valid(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let invalid: Vec<_> = activegate_capabilities(dynakube)
        .iter()
        .filter(|capability| capability.parse::<ActiveGateCapability>().is_err())
        .map(String::as_str)
        .collect();

    if invalid.is_empty() {
        return None;
    }

    let valid: Vec<_> = ActiveGateCapability::iter()
        .map(|capability| capability.to_string())
        .collect();
    Some(format!(
        "The DynaKube's specification tries to use invalid ActiveGate capabilities: {}. Valid capabilities are: {}.",
        invalid.join(", "),
        valid.join(", ")
    ))
}

fn activegate_capabilities_unique(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let mut seen = BTreeSet::new();
    let duplicates: BTreeSet<_> = activegate_capabilities(dynakube)
        .iter()
        .filter(|capability| !seen.insert(capability.as_str()))
        .map(String::as_str)
        .collect();

    (!duplicates.is_empty()).then(|| {
        format!(
            "The DynaKube's specification lists ActiveGate capabilities more than once: {}.",
            duplicates.into_iter().collect::<Vec<_>>().join(", ")
        )
    })
}

/// Non-empty image fields, labelled with the name of the field.
fn image_fields(dynakube: &DynaKube) -> Vec<(&'static str, &str)> {
    let oneagent_image = dynakube
        .spec
        .one_agent
        .host_inject_spec()
        .and_then(|spec| spec.image.as_deref());
    let activegate_image = dynakube
        .spec
        .active_gate
        .as_ref()
        .and_then(|active_gate| active_gate.image.as_deref());

    [
        ("oneAgent.image", oneagent_image),
        ("oneAgent.codeModulesImage", dynakube.code_modules_image()),
        ("activeGate.image", activegate_image),
    ]
    .into_iter()
    .filter_map(|(field, image)| Some((field, image.filter(|image| !image.is_empty())?)))
    .collect()
}

fn image_field_not_tenant_registry(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let tenant_host = dynakube.api_url_host()?;

    let offending: Vec<_> = image_fields(dynakube)
        .into_iter()
        .filter(|(_, image)| {
            ImageReference::parse(image)
                .and_then(|reference| reference.registry_host())
                .is_some_and(|host| host.eq_ignore_ascii_case(&tenant_host))
        })
        .map(|(field, image)| format!("{field} ({image})"))
        .collect();

    (!offending.is_empty()).then(|| {
        format!(
            "The DynaKube's specification pulls images from the Dynatrace environment registry {tenant_host}, which is not supported: {}. Use a public or private registry instead.",
            offending.join(", ")
        )
    })
}

fn image_field_parseable(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let unparseable: Vec<_> = image_fields(dynakube)
        .into_iter()
        .filter(|(_, image)| ImageReference::parse(image).is_none())
        .map(|(field, image)| format!("{field} ({image:?})"))
        .collect();

    (!unparseable.is_empty()).then(|| {
        format!(
            "The DynaKube's specification contains image references that cannot be parsed: {}.",
            unparseable.join(", ")
        )
    })
}

fn istio_installed_if_enabled(dynakube: &DynaKube, cluster: &ClusterState) -> Option<String> {
    let installed = cluster.istio_installed?;
    (dynakube.spec.enable_istio && !installed).then(|| ERROR_ISTIO_NOT_INSTALLED.to_owned())
}

/// Modes whose OneAgent mounts the host file system read-only.
pub(super) fn has_read_only_host_fs(dynakube: &DynaKube) -> bool {
    dynakube.is_cloud_native_fullstack() || dynakube.is_host_monitoring()
}

/// The value of the volume storage env var of the OneAgent, if set.
pub(super) fn volume_storage_env(dynakube: &DynaKube) -> Option<&str> {
    dynakube
        .spec
        .one_agent
        .host_inject_spec()?
        .env
        .iter()
        .find(|env| env.name == ONEAGENT_ENABLE_VOLUME_STORAGE_ENV)
        .map(|env| env.value.as_deref().unwrap_or_default())
}

fn volume_storage_compatible_with_read_only_host_fs(
    dynakube: &DynaKube,
    _: &ClusterState,
) -> Option<String> {
    let value = volume_storage_env(dynakube)?;
    (has_read_only_host_fs(dynakube) && value != "true")
        .then(|| ERROR_VOLUME_STORAGE_READ_ONLY_CONFLICT.to_owned())
}
