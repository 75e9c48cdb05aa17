//! Resolves the workload a pod belongs to by walking controller owner references.

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::OwnerReference};
use kube::{
    Api, ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use snafu::{ResultExt, Snafu};

/// Kind reported for pods without a controller.
pub const POD_KIND: &str = "pod";

/// Owner chains longer than this are cut off, the last resolved owner counts as the workload.
const MAX_OWNER_DEPTH: usize = 10;

/// `(apiVersion, kind)` of the controllers the walk follows.
const WELL_KNOWN_WORKLOADS: &[(&str, &str)] = &[
    ("apps/v1", "ReplicaSet"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("v1", "ReplicationController"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("apps.openshift.io/v1", "DeploymentConfig"),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up {kind} {name:?} in namespace {namespace:?}"))]
    LookupOwner {
        source: kube::Error,
        kind: String,
        name: String,
        namespace: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Reads the owner references of a pod's (transitive) owners.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_references(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Vec<OwnerReference>, kube::Error>;
}

#[async_trait]
impl OwnerLookup for kube::Client {
    async fn owner_references(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Vec<OwnerReference>, kube::Error> {
        let (group, version) = match owner.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", owner.api_version.as_str()),
        };
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &owner.kind));
        let api: Api<DynamicObject> = Api::namespaced_with(self.clone(), namespace, &resource);

        Ok(api.get(&owner.name).await?.owner_references().to_vec())
    }
}

/// The root controller of a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    /// Lower-cased kind, e.g. `deployment`.
    pub kind: String,
    pub name: String,
}

/// Follows controller references of well-known kinds up to the root.
///
/// A pod without a controller is its own workload. The walk stops at a controller of an unknown
/// kind, the object owned by it is reported instead.
#[tracing::instrument(skip(pod, lookup))]
pub async fn resolve_workload(pod: &Pod, namespace: &str, lookup: &dyn OwnerLookup) -> Result<Workload> {
    let mut workload = Workload {
        kind: POD_KIND.to_owned(),
        name: pod_name(pod),
    };
    let mut owners = pod.owner_references().to_vec();

    for _ in 0..MAX_OWNER_DEPTH {
        let Some(controller) = owners.iter().find(|owner| owner.controller == Some(true)) else {
            break;
        };
        if !is_well_known(controller) {
            tracing::debug!(
                owner.kind = %controller.kind,
                owner.name = %controller.name,
                "controller is not a well-known workload, stopping"
            );
            break;
        }

        workload = Workload {
            kind: controller.kind.to_lowercase(),
            name: controller.name.clone(),
        };
        owners = lookup
            .owner_references(namespace, controller)
            .await
            .with_context(|_| LookupOwnerSnafu {
                kind: controller.kind.clone(),
                name: controller.name.clone(),
                namespace,
            })?;
    }

    Ok(workload)
}

fn is_well_known(owner: &OwnerReference) -> bool {
    WELL_KNOWN_WORKLOADS
        .iter()
        .any(|(api_version, kind)| owner.api_version == *api_version && owner.kind == *kind)
}

/// Name of the pod. Pods created by controllers only carry a `generateName` at admission, its
/// trailing random suffix separator is cut.
pub fn pod_name(pod: &Pod) -> String {
    if let Some(name) = pod.metadata.name.as_deref().filter(|name| !name.is_empty()) {
        return name.to_owned();
    }

    let generate_name = pod.metadata.generate_name.as_deref().unwrap_or_default();
    generate_name
        .rsplit_once('-')
        .map_or(generate_name, |(base, _)| base)
        .to_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::*;

    /// Owner references per owner name.
    #[derive(Default)]
    pub(crate) struct FakeOwners {
        pub owners: BTreeMap<String, Vec<OwnerReference>>,
        pub fail: bool,
    }

    #[async_trait]
    impl OwnerLookup for FakeOwners {
        async fn owner_references(
            &self,
            _namespace: &str,
            owner: &OwnerReference,
        ) -> Result<Vec<OwnerReference>, kube::Error> {
            if self.fail {
                let mut status = kube::core::Status::failure("not found", "NotFound");
                status.code = 404;
                return Err(kube::Error::Api(Box::new(status)));
            }
            Ok(self.owners.get(&owner.name).cloned().unwrap_or_default())
        }
    }

    pub(crate) fn controller(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    fn pod(owners: Vec<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some("app-7d9f8b6c5d-".to_owned()),
                owner_references: Some(owners),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[tokio::test]
    async fn deployment_is_root() {
        let lookup = FakeOwners {
            owners: BTreeMap::from([(
                "app-7d9f8b6c5d".to_owned(),
                vec![controller("apps/v1", "Deployment", "app")],
            )]),
            ..FakeOwners::default()
        };
        let pod = pod(vec![controller("apps/v1", "ReplicaSet", "app-7d9f8b6c5d")]);

        let workload = resolve_workload(&pod, "app", &lookup).await.unwrap();
        assert_eq!(workload, Workload {
            kind: "deployment".to_owned(),
            name: "app".to_owned(),
        });
    }

    #[tokio::test]
    async fn pod_without_controller() {
        let mut owner = controller("apps/v1", "ReplicaSet", "ignored");
        owner.controller = None;
        let pod = pod(vec![owner]);

        let workload = resolve_workload(&pod, "app", &FakeOwners::default()).await.unwrap();
        assert_eq!(workload, Workload {
            kind: POD_KIND.to_owned(),
            name: "app-7d9f8b6c5d".to_owned(),
        });
    }

    #[tokio::test]
    async fn unknown_controller_stops_walk() {
        let lookup = FakeOwners {
            owners: BTreeMap::from([(
                "batch-job".to_owned(),
                vec![controller("example.com/v1", "Pipeline", "pipeline")],
            )]),
            ..FakeOwners::default()
        };
        let pod = pod(vec![controller("batch/v1", "Job", "batch-job")]);

        let workload = resolve_workload(&pod, "app", &lookup).await.unwrap();
        assert_eq!(workload.kind, "job");
        assert_eq!(workload.name, "batch-job");
    }

    #[tokio::test]
    async fn lookup_failure() {
        let lookup = FakeOwners {
            fail: true,
            ..FakeOwners::default()
        };
        let pod = pod(vec![controller("apps/v1", "ReplicaSet", "app-7d9f8b6c5d")]);

        let error = resolve_workload(&pod, "app", &lookup).await.unwrap_err();
        assert!(error.to_string().contains("ReplicaSet"), "{error}");
    }

    #[test]
    fn pod_name_from_generate_name() {
        let mut pod = pod(Vec::new());
        assert_eq!(pod_name(&pod), "app-7d9f8b6c5d");

        pod.metadata.name = Some("app-7d9f8b6c5d-x2kq9".to_owned());
        assert_eq!(pod_name(&pod), "app-7d9f8b6c5d-x2kq9");
    }
}
