//! `RunPod` API client implementation.
//!
//! Pods are managed through the REST API; GPU pricing and the runtime port
//! table come from the GraphQL API. Both are bearer-token authenticated and
//! every call runs under the client's [`RetryPolicy`].

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::capacity::{
    CapacityBackend, GpuOffering, InstanceRequest, InstanceSnapshot, Market, TerminateResult,
};
use crate::error::{CapacityError, PodleaseError, Result};
use crate::retry::{with_backoff, RetryPolicy};

use super::types::{CreatePodRequest, GpuType, Pod, RuntimePort};

/// `RunPod` REST API base URL.
pub const RUNPOD_REST_URL: &str = "https://rest.runpod.io/v1";

/// `RunPod` GraphQL API URL.
pub const RUNPOD_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Body fragment the API returns when an offering is sold out.
const NO_INSTANCES_MARKER: &str = "no longer any instances available";

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 200;

/// `RunPod` API client.
#[derive(Debug, Clone)]
pub struct RunPodClient {
    /// HTTP client.
    client: Client,
    /// API key.
    api_key: String,
    /// REST base URL.
    rest_url: String,
    /// GraphQL URL.
    graphql_url: String,
    /// Retry schedule for transient failures.
    retry: RetryPolicy,
}

/// GraphQL request structure.
#[derive(Debug, Serialize)]
struct GraphQLRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<serde_json::Value>,
}

/// GraphQL response structure.
#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLError>>,
}

/// GraphQL error structure.
#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

impl RunPodClient {
    /// Creates a new `RunPod` API client against the public endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_key: &str, retry: RetryPolicy) -> Result<Self> {
        Self::with_endpoints(api_key, RUNPOD_REST_URL, RUNPOD_GRAPHQL_URL, retry)
    }

    /// Creates a client against custom endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_endpoints(
        api_key: &str,
        rest_url: &str,
        graphql_url: &str,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CapacityError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            rest_url: rest_url.trim_end_matches('/').to_string(),
            graphql_url: graphql_url.to_string(),
            retry,
        })
    }

    /// Sends one REST request and returns the raw successful response.
    async fn rest_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let url = format!("{}{path}", self.rest_url);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CapacityError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify(status, &text).into())
    }

    /// Sends a REST request with retries and decodes the JSON body.
    async fn rest<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        self.rest_with(&self.retry, method, path, body).await
    }

    /// Like [`Self::rest`] with an explicit retry policy.
    async fn rest_with<T: DeserializeOwned>(
        &self,
        retry: &RetryPolicy,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = with_backoff(retry, PodleaseError::is_retryable, || {
            self.rest_once(method.clone(), path, body.as_ref())
        })
        .await?;

        response.json::<T>().await.map_err(|e| {
            CapacityError::invalid(format!("Failed to parse response from {path}: {e}")).into()
        })
    }

    /// Executes a GraphQL query with retries.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Option<serde_json::Value>,
    ) -> Result<T> {
        let request = GraphQLRequest { query, variables };
        with_backoff(&self.retry, PodleaseError::is_retryable, || {
            self.graphql_once(&request)
        })
        .await
    }

    /// Executes a single GraphQL request.
    async fn graphql_once<T: DeserializeOwned>(&self, request: &GraphQLRequest<'_>) -> Result<T> {
        trace!("Executing GraphQL query: {}", request.query);

        let response = self
            .client
            .post(&self.graphql_url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| CapacityError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status, &text).into());
        }

        let gql_response: GraphQLResponse<T> = response
            .json()
            .await
            .map_err(|e| CapacityError::invalid(format!("Failed to parse response: {e}")))?;

        if let Some(errors) = gql_response.errors.filter(|e| !e.is_empty()) {
            let message = errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            if message.to_lowercase().contains("unauthorized") {
                return Err(CapacityError::Auth { message }.into());
            }
            return Err(CapacityError::Rejected {
                status: 400,
                message,
            }
            .into());
        }

        gql_response
            .data
            .ok_or_else(|| CapacityError::invalid("No data in response").into())
    }

    /// Looks up the public TCP port mapped to container port 22.
    ///
    /// The REST API sometimes omits the mapping (or reports the UDP one) while
    /// the pod is starting; the GraphQL runtime table is authoritative.
    async fn ssh_port_from_runtime(&self, pod_id: &str) -> Option<u16> {
        #[derive(Deserialize)]
        struct Response {
            myself: Myself,
        }
        #[derive(Deserialize)]
        struct Myself {
            pods: Vec<RuntimePod>,
        }
        #[derive(Deserialize)]
        struct RuntimePod {
            id: String,
            runtime: Option<Runtime>,
        }
        #[derive(Deserialize)]
        struct Runtime {
            #[serde(default)]
            ports: Vec<RuntimePort>,
        }

        let query = r"
            query MyPods {
                myself {
                    pods {
                        id
                        runtime {
                            ports {
                                privatePort
                                publicPort
                                type
                            }
                        }
                    }
                }
            }
        ";

        match self.graphql::<Response>(query, None).await {
            Ok(response) => response
                .myself
                .pods
                .into_iter()
                .find(|p| p.id == pod_id)
                .and_then(|p| p.runtime)
                .and_then(|r| {
                    r.ports.into_iter().find(|p| {
                        p.private_port == 22 && p.port_type.as_deref() == Some("tcp")
                    })
                })
                .and_then(|p| p.public_port),
            Err(e) => {
                debug!("Runtime port lookup for {pod_id} failed: {e}");
                None
            }
        }
    }

    /// Validates the API key by making a test request.
    ///
    /// # Errors
    ///
    /// Returns an error if the API cannot be reached.
    pub async fn validate_api_key(&self) -> Result<bool> {
        match self.rest::<Vec<Pod>>(Method::GET, "/pods", None).await {
            Ok(_) => Ok(true),
            Err(PodleaseError::Capacity(CapacityError::Auth { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CapacityBackend for RunPodClient {
    async fn list_offerings(&self, market: Market) -> Result<Vec<GpuOffering>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "gpuTypes")]
            gpu_types: Vec<GpuType>,
        }

        let query = r"
            query GpuTypes {
                gpuTypes {
                    id
                    displayName
                    memoryInGb
                    secureCloud
                    communityCloud
                    securePrice
                    communityPrice
                    secureSpotPrice
                    communitySpotPrice
                    maxGpuCountSecureCloud
                    maxGpuCountCommunityCloud
                }
            }
        ";

        let response: Response = self.graphql(query, None).await?;
        debug!("Fetched {} GPU types", response.gpu_types.len());

        Ok(response
            .gpu_types
            .into_iter()
            .map(|gpu| gpu.into_offering(market))
            .collect())
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<InstanceSnapshot> {
        info!(
            "Creating pod {} on {} ({} cloud, {})",
            request.name,
            request.offering_id,
            request.market.cloud_type(),
            request.market
        );

        let body = serde_json::to_value(CreatePodRequest::from(request))
            .map_err(|e| PodleaseError::internal(format!("Failed to encode pod request: {e}")))?;

        // A create that failed in transit may still have created the pod,
        // so it is sent once and never replayed.
        let created: Result<Pod> = self
            .rest_with(&RetryPolicy::none(), Method::POST, "/pods", Some(body))
            .await;

        match created {
            Ok(pod) => Ok(pod.into_snapshot()),
            Err(PodleaseError::Capacity(CapacityError::CapacityUnavailable { message, .. })) => {
                Err(CapacityError::CapacityUnavailable {
                    offering: request.offering_id.clone(),
                    message,
                }
                .into())
            }
            Err(e) if e.is_retryable() => {
                warn!("Creating pod {} failed ({e}); checking whether it exists", request.name);
                match self.find_live_pod(&request.name).await {
                    Some(pod) => {
                        info!("Pod {} was created as {}", request.name, pod.id);
                        Ok(pod)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_instance(&self, id: &str) -> Result<InstanceSnapshot> {
        let pod: Pod = self
            .rest(Method::GET, &format!("/pods/{id}"), None)
            .await
            .map_err(|e| not_found_as(e, id))?;

        let mut snapshot = pod.into_snapshot();
        if snapshot.ssh_port.is_none() && snapshot.public_ip.is_some() {
            snapshot.ssh_port = self.ssh_port_from_runtime(id).await;
        }
        Ok(snapshot)
    }

    async fn terminate_instance(&self, id: &str) -> Result<TerminateResult> {
        let path = format!("/pods/{id}");
        let result = with_backoff(&self.retry, PodleaseError::is_retryable, || {
            self.rest_once(Method::DELETE, &path, None)
        })
        .await;

        match result {
            Ok(_) => Ok(TerminateResult::Terminated),
            Err(e) if e.is_not_found() => {
                warn!("Pod {id} was already gone");
                Ok(TerminateResult::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>> {
        let pods: Vec<Pod> = self.rest(Method::GET, "/pods", None).await?;
        Ok(pods.into_iter().map(Pod::into_snapshot).collect())
    }
}

impl RunPodClient {
    /// Returns the live pod named `name`, if the account has one.
    async fn find_live_pod(&self, name: &str) -> Option<InstanceSnapshot> {
        match self.list_instances().await {
            Ok(pods) => pods
                .into_iter()
                .find(|pod| pod.name == name && !pod.status.is_gone()),
            Err(e) => {
                warn!("Could not list pods to look for {name}: {e}");
                None
            }
        }
    }
}

/// Replaces the placeholder id of a `NotFound` error.
fn not_found_as(error: PodleaseError, id: &str) -> PodleaseError {
    if error.is_not_found() {
        CapacityError::NotFound { id: id.to_string() }.into()
    } else {
        error
    }
}

/// Maps a failed HTTP response onto the capacity error taxonomy.
fn classify(status: StatusCode, body: &str) -> CapacityError {
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();

    if body.to_lowercase().contains(NO_INSTANCES_MARKER) {
        return CapacityError::CapacityUnavailable {
            offering: String::new(),
            message,
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CapacityError::Auth {
            message: String::from("API key was rejected; check RUNPOD_API_KEY"),
        },
        StatusCode::NOT_FOUND => CapacityError::NotFound { id: String::new() },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => CapacityError::Transient {
            status: Some(status.as_u16()),
            message,
        },
        s if s.is_server_error() => CapacityError::Transient {
            status: Some(s.as_u16()),
            message,
        },
        s => CapacityError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    fn client_for(server: &MockServer) -> RunPodClient {
        RunPodClient::with_endpoints(
            "rpa_test",
            &server.uri(),
            &format!("{}/graphql", server.uri()),
            fast_retry(),
        )
        .expect("client should build")
    }

    fn running_pod(ssh: Option<u16>) -> serde_json::Value {
        let mut pod = serde_json::json!({
            "id": "pod-1",
            "name": "podlease-test",
            "desiredStatus": "RUNNING",
            "publicIp": "203.0.113.5",
        });
        if let Some(port) = ssh {
            pod["portMappings"] = serde_json::json!({ "22": port });
        }
        pod
    }

    #[test]
    fn test_classify_statuses() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, ""),
            CapacityError::Auth { .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, "upstream"),
            CapacityError::Transient {
                status: Some(502),
                ..
            }
        ));
        assert!(matches!(
            classify(
                StatusCode::INTERNAL_SERVER_ERROR,
                "There are no longer any instances available with the requested specifications"
            ),
            CapacityError::CapacityUnavailable { .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "bad image"),
            CapacityError::Rejected { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn test_get_instance_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pods/pod-1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pods/pod-1"))
            .and(header("authorization", "Bearer rpa_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(running_pod(Some(40022))))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = client_for(&server)
            .get_instance("pod-1")
            .await
            .expect("third attempt succeeds");
        assert_eq!(snapshot.ssh_port, Some(40022));
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .list_offerings(Market::OnDemand)
            .await
            .expect_err("401 is fatal");
        assert!(matches!(err, PodleaseError::Capacity(CapacityError::Auth { .. })));
    }

    #[tokio::test]
    async fn test_sold_out_offering_is_capacity_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "There are no longer any instances available with the requested specifications.",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let request = InstanceRequest {
            name: String::from("podlease-test"),
            image: String::from("img"),
            offering_id: String::from("NVIDIA L4"),
            gpu_count: 1,
            ports: vec![String::from("22/tcp")],
            disk_gb: 20,
            market: Market::OnDemand,
            env: std::collections::BTreeMap::new(),
        };

        let err = client_for(&server)
            .create_instance(&request)
            .await
            .expect_err("sold out");
        match err {
            PodleaseError::Capacity(CapacityError::CapacityUnavailable { offering, .. }) => {
                assert_eq!(offering, "NVIDIA L4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn create_request() -> InstanceRequest {
        InstanceRequest {
            name: String::from("podlease-20250101-120000"),
            image: String::from("img"),
            offering_id: String::from("NVIDIA L4"),
            gpu_count: 1,
            ports: vec![String::from("22/tcp")],
            disk_gb: 20,
            market: Market::OnDemand,
            env: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_is_sent_once_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_instance(&create_request())
            .await
            .expect_err("503 is surfaced");
        assert!(matches!(
            err,
            PodleaseError::Capacity(CapacityError::Transient {
                status: Some(503),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_create_failure_adopts_pod_created_anyway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;
        let mut created = running_pod(None);
        created["id"] = serde_json::json!("pod-9");
        created["name"] = serde_json::json!("podlease-20250101-120000");
        created["desiredStatus"] = serde_json::json!("CREATED");
        let mut stale = running_pod(None);
        stale["name"] = serde_json::json!("podlease-20250101-120000");
        stale["desiredStatus"] = serde_json::json!("TERMINATED");
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([stale, created])),
            )
            .mount(&server)
            .await;

        let snapshot = client_for(&server)
            .create_instance(&create_request())
            .await
            .expect("existing pod is returned");
        assert_eq!(snapshot.id, "pod-9");
    }

    #[tokio::test]
    async fn test_terminate_treats_404_as_already_gone() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/pods/pod-1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .terminate_instance("pod-1")
            .await
            .expect("404 is not an error");
        assert_eq!(result, TerminateResult::AlreadyGone);
    }

    #[tokio::test]
    async fn test_ssh_port_falls_back_to_runtime_ports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pods/pod-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(running_pod(None)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "myself": { "pods": [{
                    "id": "pod-1",
                    "runtime": { "ports": [
                        { "privatePort": 22, "publicPort": 40023, "type": "udp" },
                        { "privatePort": 22, "publicPort": 40022, "type": "tcp" }
                    ]}
                }]}}
            })))
            .mount(&server)
            .await;

        let snapshot = client_for(&server)
            .get_instance("pod-1")
            .await
            .expect("pod exists");
        assert_eq!(snapshot.ssh_port, Some(40022));
    }

    #[tokio::test]
    async fn test_list_offerings_maps_prices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "gpuTypes": [{
                    "id": "NVIDIA RTX A4000",
                    "displayName": "RTX A4000",
                    "memoryInGb": 16,
                    "secureCloud": true,
                    "communityCloud": true,
                    "securePrice": 0.32,
                    "communitySpotPrice": 0.12
                }]}
            })))
            .mount(&server)
            .await;

        let offerings = client_for(&server)
            .list_offerings(Market::Interruptible)
            .await
            .expect("offerings");
        assert_eq!(offerings.len(), 1);
        assert_eq!(offerings[0].interruptible_cost, Some(0.12));
        assert_eq!(offerings[0].available, 1);
    }
}
