//! Code-module injection: the `agent-bin` volume, the init container that fills it and the
//! rewrite of the user containers that preloads the agent.

use std::collections::BTreeMap;

use const_format::concatcp;
use k8s_openapi::{
    api::core::v1::{
        CSIVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
        ObjectFieldSelector, Pod, Volume, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};
use strum::{Display, EnumString};

use crate::mutation::{
    ANNOTATION_EPHEMERAL_VOLUME_SIZE_LIMIT, ANNOTATION_FLAVOR, ANNOTATION_INSTALL_PATH,
    ANNOTATION_TECHNOLOGIES, ANNOTATION_VOLUME_TYPE, EncodeArgumentSnafu, MissingTenantUuidSnafu,
    MutationRequest, Result, args::InitArgs,
};

pub const AGENT_BIN_VOLUME_NAME: &str = "agent-bin";
pub const CONFIG_VOLUME_NAME: &str = "dynatrace-config";
pub const INIT_CONTAINER_NAME: &str = "dynatrace-operator";
pub const CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";
const LIB_AGENT_PROC_PATH: &str = "agent/lib64/liboneagentproc.so";

/// Where the code modules live inside the code-modules image.
const SOURCE_PATH: &str = "/opt/dynatrace/oneagent";
const INIT_BIN_MOUNT_PATH: &str = "/mnt/bin";
const INIT_CONFIG_MOUNT_PATH: &str = "/mnt/config";

const PRELOAD_PATH: &str = "/etc/ld.so.preload";
const PRELOAD_SUB_PATH: &str = "oneagent/ld.so.preload";
const STORAGE_PATH: &str = "/var/lib/dynatrace/oneagent";

/// Sub-command of the operator image that downloads the code modules.
const BOOTSTRAP_SUBCOMMAND: &str = "bootstrap";

const CSI_MODE_APP: &str = "app";

const LD_PRELOAD_ENV: &str = "LD_PRELOAD";
const DEPLOYMENT_METADATA_ENV: &str = "DT_DEPLOYMENT_METADATA";
const NETWORK_ZONE_ENV: &str = "DT_NETWORK_ZONE";
const STORAGE_ENV: &str = "DT_STORAGE";

/// `(variable, pod label)` pairs exposed with label version detection.
const RELEASE_ENV_LABELS: &[(&str, &str)] = &[
    ("DT_RELEASE_VERSION", "app.kubernetes.io/version"),
    ("DT_RELEASE_PRODUCT", "app.kubernetes.io/part-of"),
];

const LD_PRELOAD_LIB: &str = concatcp!(DEFAULT_INSTALL_PATH, "/", LIB_AGENT_PROC_PATH);

/// How the code modules get into the `agent-bin` volume.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum VolumeType {
    /// Mounted read-only by the CSI driver.
    Csi,
    /// An emptyDir the init container fills.
    Ephemeral,
}

/// Picks the volume type for `pod`. The pod annotation is only honored with node image pull.
pub fn select_volume_type(request: &MutationRequest) -> VolumeType {
    let default = if request.dynakube.needs_csi() {
        VolumeType::Csi
    } else {
        VolumeType::Ephemeral
    };
    if !request.dynakube.feature_flags().is_node_image_pull() {
        return default;
    }

    match request.pod.annotations().get(ANNOTATION_VOLUME_TYPE) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(volume_type = %value, "unknown volume type annotation, using default");
            default
        }),
        None => default,
    }
}

pub fn install_path(pod: &Pod) -> &str {
    pod.annotations()
        .get(ANNOTATION_INSTALL_PATH)
        .map(String::as_str)
        .filter(|path| !path.is_empty())
        .unwrap_or(DEFAULT_INSTALL_PATH)
}

/// Image that extracts itself into the volume, only used for ephemeral volumes with node image
/// pull. `None` means the code modules are downloaded.
fn self_extracting_image(request: &MutationRequest, volume_type: VolumeType) -> Option<String> {
    let dynakube = &request.dynakube;
    if volume_type != VolumeType::Ephemeral || !dynakube.feature_flags().is_node_image_pull() {
        return None;
    }

    let image = dynakube
        .status
        .as_ref()
        .and_then(|status| status.code_modules.image.clone())
        .or_else(|| dynakube.code_modules_image().map(ToOwned::to_owned));
    if image.is_none() {
        tracing::warn!("node image pull is enabled but no code modules image is known, downloading instead");
    }
    image
}

fn code_modules_version(request: &MutationRequest) -> Option<String> {
    let dynakube = &request.dynakube;
    dynakube
        .status
        .as_ref()
        .and_then(|status| status.code_modules.version.clone())
        .or_else(|| {
            dynakube
                .spec
                .one_agent
                .app_injection_spec()
                .and_then(|spec| spec.version.clone())
        })
}

pub fn add_volumes(pod: &mut Pod, request: &MutationRequest, volume_type: VolumeType) {
    let agent_bin = match volume_type {
        VolumeType::Csi => {
            let retry_timeout = request.dynakube.feature_flags().max_csi_mount_timeout();
            Volume {
                name: AGENT_BIN_VOLUME_NAME.to_owned(),
                csi: Some(CSIVolumeSource {
                    driver: CSI_DRIVER_NAME.to_owned(),
                    read_only: Some(true),
                    volume_attributes: Some(BTreeMap::from([
                        ("mode".to_owned(), CSI_MODE_APP.to_owned()),
                        ("dynakube".to_owned(), request.dynakube.name_any()),
                        (
                            "retryTimeout".to_owned(),
                            humantime::format_duration(retry_timeout).to_string(),
                        ),
                    ])),
                    ..CSIVolumeSource::default()
                }),
                ..Volume::default()
            }
        }
        VolumeType::Ephemeral => Volume {
            name: AGENT_BIN_VOLUME_NAME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: request
                    .pod
                    .annotations()
                    .get(ANNOTATION_EPHEMERAL_VOLUME_SIZE_LIMIT)
                    .map(|limit| Quantity(limit.clone())),
                ..EmptyDirVolumeSource::default()
            }),
            ..Volume::default()
        },
    };

    let config = Volume {
        name: CONFIG_VOLUME_NAME.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    };

    let spec = pod.spec.get_or_insert_default();
    let volumes = spec.volumes.get_or_insert_default();
    volumes.push(agent_bin);
    volumes.push(config);
}

/// Arguments and image of the init container, before metadata enrichment appends its arguments.
pub fn init_args(
    request: &MutationRequest,
    volume_type: VolumeType,
) -> Result<(String, InitArgs)> {
    let dynakube = &request.dynakube;
    let pod = &request.pod;

    let (image, mut args) = match self_extracting_image(request, volume_type) {
        Some(image) => (image, InitArgs::new()),
        None => {
            let mut args = InitArgs::from_existing(vec![BOOTSTRAP_SUBCOMMAND.to_owned()]);
            args.optional_arg("version", code_modules_version(request).as_deref())
                .context(EncodeArgumentSnafu)?
                .optional_arg(
                    "flavor",
                    pod.annotations().get(ANNOTATION_FLAVOR).map(String::as_str),
                )
                .context(EncodeArgumentSnafu)?;
            (request.init_image.clone(), args)
        }
    };

    args.arg("source", SOURCE_PATH)
        .context(EncodeArgumentSnafu)?
        .arg("target", INIT_BIN_MOUNT_PATH)
        .context(EncodeArgumentSnafu)?
        .arg("install-path", install_path(pod))
        .context(EncodeArgumentSnafu)?;

    if dynakube.is_cloud_native_fullstack() {
        let tenant_uuid = dynakube.tenant_uuid().context(MissingTenantUuidSnafu {
            dynakube: dynakube.name_any(),
        })?;
        args.flag("is-fullstack")
            .context(EncodeArgumentSnafu)?
            .arg("tenant", tenant_uuid)
            .context(EncodeArgumentSnafu)?;
    }

    let technologies = pod
        .annotations()
        .get(ANNOTATION_TECHNOLOGIES)
        .or_else(|| dynakube.annotations().get(ANNOTATION_TECHNOLOGIES))
        .map(String::as_str);
    args.optional_arg("technology", technologies)
        .context(EncodeArgumentSnafu)?;

    Ok((image, args))
}

pub fn init_container(
    request: &MutationRequest,
    volume_type: VolumeType,
    image: String,
    args: InitArgs,
) -> Container {
    let init_resources = request
        .dynakube
        .spec
        .one_agent
        .app_injection_spec()
        .and_then(|spec| spec.init_resources.clone());
    let security_context = request
        .pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.security_context.clone());

    Container {
        name: INIT_CONTAINER_NAME.to_owned(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        args: Some(args.build()),
        resources: init_resources,
        security_context,
        volume_mounts: Some(vec![
            VolumeMount {
                name: AGENT_BIN_VOLUME_NAME.to_owned(),
                mount_path: INIT_BIN_MOUNT_PATH.to_owned(),
                read_only: Some(volume_type == VolumeType::Csi),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME_NAME.to_owned(),
                mount_path: INIT_CONFIG_MOUNT_PATH.to_owned(),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    }
}

pub fn is_container_injected(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|mount| mount.name == AGENT_BIN_VOLUME_NAME)
}

/// Rewrites every user container that lacks the `agent-bin` mount. Returns the number of
/// rewritten containers.
pub fn inject_containers(pod: &mut Pod, request: &MutationRequest) -> usize {
    let install_path = install_path(&request.pod).to_owned();
    let Some(spec) = pod.spec.as_mut() else {
        return 0;
    };

    let mut injected = 0;
    for container in spec
        .containers
        .iter_mut()
        .filter(|container| !is_container_injected(container))
    {
        inject_container(container, request, &install_path);
        injected += 1;
    }
    injected
}

fn inject_container(container: &mut Container, request: &MutationRequest, install_path: &str) {
    tracing::debug!(container.name = %container.name, "injecting OneAgent into container");

    container.volume_mounts.get_or_insert_default().extend([
        VolumeMount {
            name: AGENT_BIN_VOLUME_NAME.to_owned(),
            mount_path: install_path.to_owned(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME_NAME.to_owned(),
            mount_path: PRELOAD_PATH.to_owned(),
            sub_path: Some(PRELOAD_SUB_PATH.to_owned()),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME_NAME.to_owned(),
            mount_path: STORAGE_PATH.to_owned(),
            sub_path: Some(format!("oneagent/{}", container.name)),
            ..VolumeMount::default()
        },
    ]);

    let env = container.env.get_or_insert_default();
    add_preload(env, install_path);

    let dynakube = &request.dynakube;
    set_env_if_absent(
        env,
        DEPLOYMENT_METADATA_ENV,
        dynakube.deployment_metadata(&request.cluster_uuid),
    );
    if let Some(network_zone) = dynakube.spec.network_zone.as_deref().filter(|zone| !zone.is_empty()) {
        set_env_if_absent(env, NETWORK_ZONE_ENV, network_zone);
    }
    set_env_if_absent(env, STORAGE_ENV, STORAGE_PATH);

    if dynakube.feature_flags().is_label_version_detection() {
        for (name, label) in RELEASE_ENV_LABELS {
            if env.iter().any(|var| var.name == *name) {
                continue;
            }
            env.push(EnvVar {
                name: (*name).to_owned(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: format!("metadata.labels['{label}']"),
                        ..ObjectFieldSelector::default()
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            });
        }
    }
}

/// Adds the agent library to `LD_PRELOAD`, keeping whatever separator the existing value uses.
fn add_preload(env: &mut Vec<EnvVar>, install_path: &str) {
    let library = if install_path == DEFAULT_INSTALL_PATH {
        LD_PRELOAD_LIB.to_owned()
    } else {
        format!("{install_path}/{LIB_AGENT_PROC_PATH}")
    };

    let Some(var) = env.iter_mut().find(|var| var.name == LD_PRELOAD_ENV) else {
        env.push(EnvVar {
            name: LD_PRELOAD_ENV.to_owned(),
            value: Some(library),
            ..EnvVar::default()
        });
        return;
    };

    let existing = var.value.as_deref().unwrap_or_default();
    if existing.contains(install_path) {
        return;
    }
    var.value = Some(if existing.is_empty() {
        library
    } else {
        let separator = if existing.contains(' ') { ' ' } else { ':' };
        format!("{existing}{separator}{library}")
    });
}

fn set_env_if_absent(env: &mut Vec<EnvVar>, name: &str, value: impl Into<String>) {
    if env.iter().any(|var| var.name == name) {
        return;
    }
    env.push(EnvVar {
        name: name.to_owned(),
        value: Some(value.into()),
        ..EnvVar::default()
    });
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn env(value: Option<&str>) -> Vec<EnvVar> {
        value
            .map(|value| EnvVar {
                name: LD_PRELOAD_ENV.to_owned(),
                value: Some(value.to_owned()),
                ..EnvVar::default()
            })
            .into_iter()
            .collect()
    }

    #[rstest]
    #[case(None, LD_PRELOAD_LIB)]
    #[case(Some(""), LD_PRELOAD_LIB)]
    #[case(Some("/lib/a.so"), concatcp!("/lib/a.so:", LD_PRELOAD_LIB))]
    #[case(Some("/lib/a.so /lib/b.so"), concatcp!("/lib/a.so /lib/b.so ", LD_PRELOAD_LIB))]
    #[case(Some(LD_PRELOAD_LIB), LD_PRELOAD_LIB)]
    fn preload(#[case] existing: Option<&str>, #[case] expected: &str) {
        let mut env = env(existing);
        add_preload(&mut env, DEFAULT_INSTALL_PATH);

        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some(expected));
    }

    #[test]
    fn preload_with_custom_install_path() {
        let mut env = env(None);
        add_preload(&mut env, "/custom");
        assert_eq!(
            env[0].value.as_deref(),
            Some("/custom/agent/lib64/liboneagentproc.so")
        );
    }

    #[test]
    fn env_is_not_overridden() {
        let mut env = vec![EnvVar {
            name: STORAGE_ENV.to_owned(),
            value: Some("/data".to_owned()),
            ..EnvVar::default()
        }];
        set_env_if_absent(&mut env, STORAGE_ENV, STORAGE_PATH);
        set_env_if_absent(&mut env, NETWORK_ZONE_ENV, "zone");

        assert_eq!(env.len(), 2);
        assert_eq!(env[0].value.as_deref(), Some("/data"));
    }
}
