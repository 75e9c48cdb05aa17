use crate::{
    crd::DynaKube,
    validator::{
        Check, ClusterState,
        deny::{has_read_only_host_fs, volume_storage_env},
    },
};

const ONEAGENT_INSTALLER_SCRIPT_URL_ENV: &str = "ONEAGENT_INSTALLER_SCRIPT_URL";
const ONEAGENT_INSTALLER_TOKEN_ENV: &str = "ONEAGENT_INSTALLER_TOKEN";

const WARNING_MISSING_ACTIVEGATE_MEMORY_LIMIT: &str = "The DynaKube's ActiveGate has no memory limit (activeGate.resources.limits.memory). Set one to keep the ActiveGate from consuming unbounded memory.";
const WARNING_HOST_GROUP_CONFLICT: &str = "The DynaKube's specification sets the host group both with the --set-host-group parameter and the oneAgent.hostGroup field. The field takes precedence over the parameter, remove the parameter.";
const WARNING_ONEAGENT_INSTALLER_ENV_VARS: &str = "The environment variables ONEAGENT_INSTALLER_SCRIPT_URL and ONEAGENT_INSTALLER_TOKEN are only relevant for an unsupported image type. Please ensure you are using a supported image.";
const WARNING_VOLUME_STORAGE_WITH_READ_ONLY_HOST_FS: &str = "The DynaKube's OneAgent enables volume storage while running host monitoring with a read-only host file system, the OneAgent keeps its data in the volume instead of on the host.";

pub(super) const CHECKS: &[(&str, Check)] = &[
    ("deprecatedFeatureFlags", deprecated_feature_flags),
    ("missingActiveGateMemoryLimit", missing_activegate_memory_limit),
    ("ineffectiveOneAgentFeatureFlags", ineffective_oneagent_feature_flags),
    ("hostGroupConflict", host_group_conflict),
    ("unsupportedOneAgentImage", unsupported_oneagent_image),
    ("volumeStorageWithReadOnlyHostFs", volume_storage_with_read_only_host_fs),
];

fn deprecated_feature_flags(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let keys = dynakube.feature_flags().deprecated_keys_in_use();
    (!keys.is_empty()).then(|| {
        format!(
            "The DynaKube uses deprecated feature flags: {}. They are still respected but will be removed in a future release.",
            keys.join(", ")
        )
    })
}

fn missing_activegate_memory_limit(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    if !dynakube.needs_activegate() {
        return None;
    }

    let has_limit = dynakube
        .spec
        .active_gate
        .as_ref()
        .and_then(|active_gate| active_gate.resources.as_ref())
        .and_then(|resources| resources.limits.as_ref())
        .is_some_and(|limits| limits.contains_key("memory"));

    (!has_limit).then(|| WARNING_MISSING_ACTIVEGATE_MEMORY_LIMIT.to_owned())
}

fn ineffective_oneagent_feature_flags(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    if dynakube.needs_oneagent() {
        return None;
    }

    let keys = dynakube.feature_flags().keys_with_prefix("oneagent-");
    (!keys.is_empty()).then(|| {
        format!(
            "The feature flags {} only affect the OneAgent DaemonSet, which the selected mode does not deploy.",
            keys.join(", ")
        )
    })
}

fn host_group_conflict(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let one_agent = &dynakube.spec.one_agent;
    let field_set = one_agent.host_group.as_deref().is_some_and(|group| !group.is_empty());

    (field_set && one_agent.host_group_from_args().is_some())
        .then(|| WARNING_HOST_GROUP_CONFLICT.to_owned())
}

fn unsupported_oneagent_image(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let env = &dynakube.spec.one_agent.host_inject_spec()?.env;
    env.iter()
        .any(|env| {
            env.name == ONEAGENT_INSTALLER_SCRIPT_URL_ENV || env.name == ONEAGENT_INSTALLER_TOKEN_ENV
        })
        .then(|| WARNING_ONEAGENT_INSTALLER_ENV_VARS.to_owned())
}

fn volume_storage_with_read_only_host_fs(dynakube: &DynaKube, _: &ClusterState) -> Option<String> {
    let enabled = volume_storage_env(dynakube)? == "true";
    (enabled && dynakube.is_host_monitoring() && has_read_only_host_fs(dynakube))
        .then(|| WARNING_VOLUME_STORAGE_WITH_READ_ONLY_HOST_FS.to_owned())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::{EnvVar, ResourceRequirements},
        apimachinery::pkg::api::resource::Quantity,
    };

    use super::*;
    use crate::{
        crd::{ActiveGateSpec, ApplicationMonitoringSpec, DynaKubeSpec, OneAgentSpec, tests::dynakube},
        validator::{
            tests::{API_URL, cluster, host_monitoring},
            validate,
        },
    };

    fn annotated(dynakube: &mut DynaKube, pairs: &[(&str, &str)]) {
        dynakube.metadata.annotations = Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        );
    }

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_owned(),
            value: Some(value.to_owned()),
            ..EnvVar::default()
        }
    }

    #[test]
    fn deprecated_flags() {
        let mut dk = host_monitoring("dynakube", &[]);
        annotated(&mut dk, &[
            ("alpha.operator.dynatrace.com/feature-automatic-injection", "false"),
            ("feature.dynatrace.com/disable-hosts-requests", "true"),
            ("feature.dynatrace.com/automatic-injection", "true"),
        ]);

        let message = deprecated_feature_flags(&dk, &cluster(Vec::new())).unwrap();
        assert!(message.contains("alpha.operator.dynatrace.com/feature-automatic-injection"));
        assert!(message.contains("feature.dynatrace.com/disable-hosts-requests"));
        assert!(!message.contains("feature.dynatrace.com/automatic-injection,"));
    }

    #[test]
    fn activegate_memory_limit() {
        let mut dk = dynakube("dynakube", DynaKubeSpec {
            api_url: API_URL.to_owned(),
            active_gate: Some(ActiveGateSpec {
                capabilities: vec!["routing".to_owned()],
                ..ActiveGateSpec::default()
            }),
            ..DynaKubeSpec::default()
        });
        assert!(missing_activegate_memory_limit(&dk, &cluster(Vec::new())).is_some());

        if let Some(active_gate) = dk.spec.active_gate.as_mut() {
            active_gate.resources = Some(ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "memory".to_owned(),
                    Quantity("1.5Gi".to_owned()),
                )])),
                ..ResourceRequirements::default()
            });
        }
        assert!(missing_activegate_memory_limit(&dk, &cluster(Vec::new())).is_none());
    }

    #[test]
    fn oneagent_flags_without_oneagent() {
        let mut dk = dynakube("dynakube", DynaKubeSpec {
            api_url: API_URL.to_owned(),
            one_agent: OneAgentSpec {
                application_monitoring: Some(ApplicationMonitoringSpec::default()),
                ..OneAgentSpec::default()
            },
            ..DynaKubeSpec::default()
        });
        annotated(&mut dk, &[("feature.dynatrace.com/oneagent-privileged", "true")]);

        let message = ineffective_oneagent_feature_flags(&dk, &cluster(Vec::new())).unwrap();
        assert!(message.contains("feature.dynatrace.com/oneagent-privileged"));

        let mut host = host_monitoring("host", &[]);
        annotated(&mut host, &[("feature.dynatrace.com/oneagent-privileged", "true")]);
        assert!(ineffective_oneagent_feature_flags(&host, &cluster(Vec::new())).is_none());
    }

    #[test]
    fn host_group_parameter_and_field() {
        let mut dk = host_monitoring("dynakube", &[]);
        if let Some(spec) = dk.spec.one_agent.host_monitoring.as_mut() {
            spec.args.push("--set-host-group=from-args".to_owned());
        }
        assert!(host_group_conflict(&dk, &cluster(Vec::new())).is_none());

        dk.spec.one_agent.host_group = Some("from-field".to_owned());
        assert!(host_group_conflict(&dk, &cluster(Vec::new())).is_some());
    }

    #[test]
    fn installer_env_vars() {
        let mut dk = host_monitoring("dynakube", &[]);
        assert!(unsupported_oneagent_image(&dk, &cluster(Vec::new())).is_none());

        if let Some(spec) = dk.spec.one_agent.host_monitoring.as_mut() {
            spec.env.push(env(ONEAGENT_INSTALLER_TOKEN_ENV, "token"));
        }
        assert!(unsupported_oneagent_image(&dk, &cluster(Vec::new())).is_some());
    }

    #[test]
    fn volume_storage_in_host_monitoring() {
        let mut dk = host_monitoring("dynakube", &[]);
        if let Some(spec) = dk.spec.one_agent.host_monitoring.as_mut() {
            spec.env.push(env("ONEAGENT_ENABLE_VOLUME_STORAGE", "true"));
        }
        assert!(volume_storage_with_read_only_host_fs(&dk, &cluster(Vec::new())).is_some());
    }

    #[test]
    fn warnings_do_not_deny() {
        let mut dk = host_monitoring("dynakube", &[]);
        annotated(&mut dk, &[("feature.dynatrace.com/disable-hosts-requests", "true")]);

        let validation = validate(&dk, &cluster(vec![dk.clone()]));
        assert!(validation.is_allowed(), "{validation:?}");
        assert_eq!(validation.warnings.len(), 1);
    }
}
