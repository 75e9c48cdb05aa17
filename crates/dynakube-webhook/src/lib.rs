//! Admission webhook of the DynaKube operator.
//!
//! The webhook answers two kinds of admission reviews: DynaKubes are validated, workload pods are
//! mutated to inject the OneAgent code modules. Cluster reads go through the reader traits of
//! [`dynakube_operator`], so the handlers can be driven by in-memory fakes as well as by a
//! [`kube::Client`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use dynakube_operator::{
    crd::DynaKube,
    mutation::{self, Decision, MutationRequest, workload::OwnerLookup},
    validator::{self, ClusterReader},
};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    Api, ResourceExt,
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, SerializePatchError},
};
use snafu::{OptionExt, ResultExt, Snafu};
use tower_http::trace::TraceLayer;

pub mod server;

pub const MUTATE_PODS_PATH: &str = "/mutate/pods";
pub const VALIDATE_DYNAKUBES_PATH: &str = "/validate/dynakubes";
pub const HEALTH_PATH: &str = "/health";

/// Namespace label naming the DynaKube that monitors the namespace.
pub const DYNAKUBE_INSTANCE_LABEL: &str = "dynakube.internal.dynatrace.com/instance";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up namespace {namespace:?}"))]
    LookupNamespace {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to look up dynakube {dynakube:?} in namespace {namespace:?}"))]
    LookupDynaKube {
        source: kube::Error,
        dynakube: String,
        namespace: String,
    },

    #[snafu(display("the kube-system namespace has no UID"))]
    MissingClusterUuid,

    #[snafu(display("failed to serialize pod"))]
    SerializePod { source: serde_json::Error },

    #[snafu(display("failed to serialize JSON patch"))]
    SerializePatch { source: SerializePatchError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Reads the objects a pod admission depends on.
#[async_trait]
pub trait PodContextReader: Send + Sync {
    async fn namespace(&self, name: &str) -> Result<Namespace, kube::Error>;

    async fn dynakube(&self, namespace: &str, name: &str) -> Result<Option<DynaKube>, kube::Error>;
}

#[async_trait]
impl PodContextReader for kube::Client {
    async fn namespace(&self, name: &str) -> Result<Namespace, kube::Error> {
        Api::<Namespace>::all(self.clone()).get(name).await
    }

    async fn dynakube(&self, namespace: &str, name: &str) -> Result<Option<DynaKube>, kube::Error> {
        Api::<DynaKube>::namespaced(self.clone(), namespace)
            .get_opt(name)
            .await
    }
}

/// UID of the `kube-system` namespace, identifies the cluster towards Dynatrace.
pub async fn lookup_cluster_uuid(client: &kube::Client) -> Result<String> {
    let namespace = PodContextReader::namespace(client, "kube-system")
        .await
        .context(LookupNamespaceSnafu {
            namespace: "kube-system",
        })?;
    namespace.metadata.uid.context(MissingClusterUuidSnafu)
}

pub struct WebhookState {
    pub operator_namespace: String,
    pub cluster_uuid: String,
    pub init_image: String,
    pub pods: Arc<dyn PodContextReader>,
    pub owners: Arc<dyn OwnerLookup>,
    pub cluster: Arc<dyn ClusterReader>,
}

impl WebhookState {
    pub fn new(
        client: kube::Client,
        operator_namespace: String,
        cluster_uuid: String,
        init_image: String,
    ) -> Self {
        Self {
            operator_namespace,
            cluster_uuid,
            init_image,
            pods: Arc::new(client.clone()),
            owners: Arc::new(client.clone()),
            cluster: Arc::new(client),
        }
    }

    /// Collects namespace and DynaKube of `pod`. `None` if no DynaKube monitors the namespace.
    async fn mutation_request(&self, pod: Pod, namespace: &str) -> Result<Option<MutationRequest>> {
        let namespace = self
            .pods
            .namespace(namespace)
            .await
            .context(LookupNamespaceSnafu { namespace })?;

        let Some(dynakube_name) = namespace.labels().get(DYNAKUBE_INSTANCE_LABEL).cloned() else {
            return Ok(None);
        };
        let dynakube = self
            .pods
            .dynakube(&self.operator_namespace, &dynakube_name)
            .await
            .with_context(|_| LookupDynaKubeSnafu {
                dynakube: dynakube_name.clone(),
                namespace: self.operator_namespace.clone(),
            })?;
        let Some(dynakube) = dynakube else {
            tracing::warn!(
                namespace = %namespace.name_any(),
                dynakube.name = %dynakube_name,
                "namespace references a dynakube that does not exist"
            );
            return Ok(None);
        };

        Ok(Some(MutationRequest {
            pod,
            namespace,
            dynakube,
            cluster_uuid: self.cluster_uuid.clone(),
            init_image: self.init_image.clone(),
        }))
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PODS_PATH, post(mutate_pods))
        .route(VALIDATE_DYNAKUBES_PATH, post(validate_dynakubes))
        .layer(TraceLayer::new_for_http())
        // The health route is below the trace layer so as not to be instrumented
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .with_state(state)
}

async fn mutate_pods(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return Json(
                AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                    .into_review(),
            );
        }
    };
    Json(mutate_pod(&state, &request).await.into_review())
}

async fn validate_dynakubes(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynaKube>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynaKube> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return Json(
                AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                    .into_review(),
            );
        }
    };
    Json(validate_dynakube(&state, &request).await.into_review())
}

/// Runs the mutator on the pod of `request` and answers with a JSON patch.
///
/// Pods are admitted unchanged if their namespace or DynaKube cannot be read.
#[tracing::instrument(skip_all, fields(uid = %request.uid))]
pub async fn mutate_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let (Some(pod), Some(namespace)) = (&request.object, &request.namespace) else {
        return response;
    };

    let mutation_request = match state.mutation_request(pod.clone(), namespace).await {
        Ok(Some(mutation_request)) => mutation_request,
        Ok(None) => return response,
        Err(error) => {
            tracing::warn!(%error, "failed to collect the pod's context, admitting it unchanged");
            return response;
        }
    };

    match mutation::mutate(&mutation_request, state.owners.as_ref()).await {
        Decision::Unchanged => response,
        Decision::Denied(message) => response.deny(message),
        Decision::Patched(mutated) => match patch(response, pod, &mutated) {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(%error, "failed to build the pod patch, admitting it unchanged");
                AdmissionResponse::from(request)
            }
        },
    }
}

fn patch(response: AdmissionResponse, original: &Pod, mutated: &Pod) -> Result<AdmissionResponse> {
    let original = serde_json::to_value(original).context(SerializePodSnafu)?;
    let mutated = serde_json::to_value(mutated).context(SerializePodSnafu)?;
    response
        .with_patch(json_patch::diff(&original, &mutated))
        .context(SerializePatchSnafu)
}

/// Runs both validation pipelines on the DynaKube of `request`.
#[tracing::instrument(skip_all, fields(uid = %request.uid))]
pub async fn validate_dynakube(
    state: &WebhookState,
    request: &AdmissionRequest<DynaKube>,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request);
    let Some(dynakube) = &request.object else {
        return response;
    };

    let validation =
        validator::validate_with(state.cluster.as_ref(), &state.operator_namespace, dynakube).await;
    if let Some(reason) = validation.denial_reason() {
        return response.deny(reason);
    }
    if !validation.warnings.is_empty() {
        response.warnings = Some(validation.warnings);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use dynakube_operator::crd::{CloudNativeFullStackSpec, DynaKubeSpec, OneAgentSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use serde_json::{Value, json};
    use tower::ServiceExt as _;

    use super::*;

    struct FakeCluster {
        namespaces: BTreeMap<String, Namespace>,
        dynakubes: Vec<DynaKube>,
    }

    #[async_trait]
    impl PodContextReader for FakeCluster {
        async fn namespace(&self, name: &str) -> Result<Namespace, kube::Error> {
            Ok(self.namespaces.get(name).cloned().unwrap_or_default())
        }

        async fn dynakube(&self, namespace: &str, name: &str) -> Result<Option<DynaKube>, kube::Error> {
            Ok(self
                .dynakubes
                .iter()
                .find(|dk| dk.name_any() == name && dk.namespace().as_deref() == Some(namespace))
                .cloned())
        }
    }

    #[async_trait]
    impl ClusterReader for FakeCluster {
        async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, kube::Error> {
            Ok(self.dynakubes.clone())
        }

        async fn list_namespaces(&self) -> Result<Vec<Namespace>, kube::Error> {
            Ok(self.namespaces.values().cloned().collect())
        }

        async fn csi_driver_exists(&self, _namespace: &str) -> Result<bool, kube::Error> {
            Ok(true)
        }

        async fn istio_installed(&self) -> Result<bool, kube::Error> {
            Ok(false)
        }
    }

    #[async_trait]
    impl OwnerLookup for FakeCluster {
        async fn owner_references(
            &self,
            _namespace: &str,
            _owner: &OwnerReference,
        ) -> Result<Vec<OwnerReference>, kube::Error> {
            Ok(Vec::new())
        }
    }

    fn dynakube(api_url: &str) -> DynaKube {
        let mut dynakube = DynaKube::new("dynakube", DynaKubeSpec {
            api_url: api_url.to_owned(),
            one_agent: OneAgentSpec {
                cloud_native_fullstack: Some(CloudNativeFullStackSpec::default()),
                ..OneAgentSpec::default()
            },
            ..DynaKubeSpec::default()
        });
        dynakube.metadata.namespace = Some("dynatrace".to_owned());
        dynakube
    }

    fn namespace(name: &str, dynakube: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: dynakube.map(|dynakube| {
                    BTreeMap::from([(DYNAKUBE_INSTANCE_LABEL.to_owned(), dynakube.to_owned())])
                }),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }

    fn state() -> Arc<WebhookState> {
        let mut dynakube = dynakube("https://abc12345.live.dynatrace.com/api");
        let status = dynakube.status.get_or_insert_default();
        status.one_agent.connection_info.connection_info.tenant_uuid = Some("abc12345".to_owned());

        let cluster = Arc::new(FakeCluster {
            namespaces: BTreeMap::from([
                ("app".to_owned(), namespace("app", Some("dynakube"))),
                ("plain".to_owned(), namespace("plain", None)),
            ]),
            dynakubes: vec![dynakube],
        });
        Arc::new(WebhookState {
            operator_namespace: "dynatrace".to_owned(),
            cluster_uuid: "cluster-uid".to_owned(),
            init_image: "registry.example.com/dynatrace-operator:1.0".to_owned(),
            pods: cluster.clone(),
            owners: cluster.clone(),
            cluster,
        })
    }

    fn pod_review(namespace: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0c9a8d74-9cb7-44dd-b98e-09fd62def2f4",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "app-0",
                "namespace": namespace,
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "app-0", "namespace": namespace},
                    "spec": {"containers": [{"name": "app", "image": "registry.example.com/app:1.0"}]}
                },
                "oldObject": null,
                "dryRun": false
            }
        })
    }

    fn dynakube_review(dynakube: &DynaKube) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "7d0f4b35-92c6-4a4f-9a1c-3cf2f0d8e2b1",
                "kind": {"group": "dynatrace.com", "version": "v1beta4", "kind": "DynaKube"},
                "resource": {"group": "dynatrace.com", "version": "v1beta4", "resource": "dynakubes"},
                "name": "dynakube",
                "namespace": "dynatrace",
                "operation": "CREATE",
                "userInfo": {},
                "object": dynakube,
                "oldObject": null,
                "dryRun": false
            }
        })
    }

    async fn post_review(path: &str, review: &Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(review.to_string()))
            .unwrap();

        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<Value>(&body).unwrap()["response"].clone()
    }

    #[tokio::test]
    async fn health() {
        let request = Request::builder().uri(HEALTH_PATH).body(Body::empty()).unwrap();
        let response = router(state()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn pod_in_monitored_namespace_is_patched() {
        let response = post_review(MUTATE_PODS_PATH, &pod_review("app")).await;

        assert_eq!(response["allowed"], true);
        assert_eq!(response["patchType"], "JSONPatch");
        assert!(!response["patch"].is_null(), "{response}");
    }

    #[tokio::test]
    async fn pod_in_unmonitored_namespace_is_unchanged() {
        let response = post_review(MUTATE_PODS_PATH, &pod_review("plain")).await;

        assert_eq!(response["allowed"], true);
        assert!(response["patch"].is_null(), "{response}");
    }

    #[tokio::test]
    async fn invalid_dynakube_is_denied() {
        let response = post_review(VALIDATE_DYNAKUBES_PATH, &dynakube_review(&dynakube(""))).await;

        assert_eq!(response["allowed"], false);
        assert!(
            response["status"]["message"]
                .as_str()
                .is_some_and(|message| !message.is_empty()),
            "{response}"
        );
    }

    #[tokio::test]
    async fn valid_dynakube_is_allowed() {
        let dynakube = dynakube("https://abc12345.live.dynatrace.com/api");
        let response = post_review(VALIDATE_DYNAKUBES_PATH, &dynakube_review(&dynakube)).await;

        assert_eq!(response["allowed"], true, "{response}");
    }

    #[test]
    fn patch_describes_the_mutation() {
        let original = Pod::default();
        let mut mutated = original.clone();
        mutated
            .annotations_mut()
            .insert("oneagent.dynatrace.com/injected".to_owned(), "true".to_owned());

        let request: AdmissionRequest<Pod> =
            serde_json::from_value::<AdmissionReview<Pod>>(pod_review("app"))
                .unwrap()
                .try_into()
                .unwrap();
        let response = patch(AdmissionResponse::from(&request), &original, &mutated).unwrap();

        let operations: Value = serde_json::from_slice(response.patch.as_deref().unwrap()).unwrap();
        assert_eq!(operations[0]["op"], "add");
        assert_eq!(operations[0]["path"], "/metadata/annotations");
    }
}
