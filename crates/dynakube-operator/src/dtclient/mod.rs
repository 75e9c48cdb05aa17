//! Client for the Dynatrace tenant API.
//!
//! Every request is authenticated with one of the two tokens held in [`Tokens`], decoded from JSON
//! and mapped onto [`Error`]. A single [`Client`] can be shared between tasks: the only mutable
//! state is the host cache, which sits behind one mutex.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use reqwest::{
    Method, RequestBuilder, Response, StatusCode,
    header::{AUTHORIZATION, HeaderMap},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dtclient::hosts::HostCache;

pub mod activegate;
pub mod agent;
pub mod cluster;
pub mod connection_info;
pub mod endpoint;
pub mod events;
pub mod hosts;
pub mod process_module_config;
pub mod settings;
pub mod token;

pub use token::{TokenKind, TokenScopes, Tokens};

/// Environment variable limiting how much of an error response body is logged.
pub const ERROR_LOG_LEN_ENV: &str = "DT_CLIENT_API_ERROR_LOG_LEN";
pub const DEFAULT_ERROR_LOG_LEN: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const PROXY_HEADERS: [&str; 3] = ["x-forwarded-for", "forwarded", "via"];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("the Dynatrace API URL is empty"))]
    EmptyUrl,

    #[snafu(display("neither an API token nor a PaaS token was provided"))]
    EmptyTokens,

    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("invalid proxy URL"))]
    InvalidProxy { source: reqwest::Error },

    #[snafu(display("failed to parse trusted certificate bundle"))]
    InvalidCertificate { source: reqwest::Error },

    #[snafu(display("no {kind} token set for request to {url:?}"))]
    MissingToken { kind: TokenKind, url: String },

    #[snafu(display("request to {url:?} failed"))]
    Transport { source: reqwest::Error, url: String },

    #[snafu(display("failed to read response body from {url:?}"))]
    BodyRead { source: reqwest::Error, url: String },

    #[snafu(display("request to {url:?} was cancelled"))]
    Cancelled { url: String },

    #[snafu(display("dynatrace server error {code}: {message}"))]
    ServerError { code: i64, message: String },

    #[snafu(display("malformed response from server (status {status})"))]
    MalformedServerResponse {
        source: serde_json::Error,
        status: u16,
    },

    #[snafu(display("server returned an empty agent version"))]
    EmptyVersion,

    #[snafu(display("process module configuration has no properties"))]
    EmptyConfiguration,

    #[snafu(display("no host with IP {ip:?} found"))]
    HostNotFound { ip: String },

    #[snafu(display("host with IP {ip:?} has no entity ID"))]
    EntityIdUnset { ip: String },

    #[snafu(display("no communication hosts available"))]
    NoCommunicationHosts,

    #[snafu(display("settings response does not contain exactly one entry, found {count}"))]
    UnexpectedSettingsResponse { count: usize },

    #[snafu(display("no kube-system namespace UUID given"))]
    MissingKubeSystemUuid,

    #[snafu(display("event payload has no event type"))]
    EventMissingType,

    #[snafu(display("event payload has no entity to attach to"))]
    EventMissingAttachRules,

    #[snafu(display("failed to write agent download"))]
    WriteDownload { source: std::io::Error },

    #[snafu(display("failed to hash the DynaKube spec"))]
    HashSpec { source: crate::crd::Error },
}

/// A pending request together with the URL it targets.
pub(crate) struct ApiRequest {
    url: String,
    builder: RequestBuilder,
}

impl ApiRequest {
    pub(crate) fn query<T: Serialize + ?Sized>(self, query: &T) -> Self {
        Self {
            url: self.url,
            builder: self.builder.query(query),
        }
    }

    pub(crate) fn json<T: Serialize + ?Sized>(self, json: &T) -> Self {
        Self {
            url: self.url,
            builder: self.builder.json(json),
        }
    }
}

/// Shape of every non-2xx response body the tenant API returns.
#[derive(Debug, Deserialize)]
struct ServerErrorResponse {
    error: ServerErrorBody,
}

#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    url: String,
    tokens: Tokens,
    network_zone: Option<String>,
    host_group: Option<String>,
    disable_host_requests: bool,
    error_log_len: usize,
    host_cache: Arc<Mutex<HostCache>>,
    process_module_config_unsupported_logged: Arc<AtomicBool>,
    cancellation: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ClientBuilder {
    url: String,
    tokens: Tokens,
    network_zone: Option<String>,
    host_group: Option<String>,
    proxy: Option<String>,
    no_proxy: Option<String>,
    trusted_certificates: Option<Vec<u8>>,
    skip_certificate_check: bool,
    disable_host_requests: bool,
    timeout: Option<Duration>,
    error_log_len: Option<usize>,
}

impl ClientBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn tokens(mut self, tokens: Tokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn network_zone(mut self, network_zone: impl Into<String>) -> Self {
        self.network_zone = Some(network_zone.into()).filter(|zone| !zone.is_empty());
        self
    }

    pub fn host_group(mut self, host_group: impl Into<String>) -> Self {
        self.host_group = Some(host_group.into()).filter(|group| !group.is_empty());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into()).filter(|proxy| !proxy.is_empty());
        self
    }

    /// Comma separated list of hosts that bypass the proxy.
    pub fn no_proxy(mut self, no_proxy: impl Into<String>) -> Self {
        self.no_proxy = Some(no_proxy.into()).filter(|no_proxy| !no_proxy.is_empty());
        self
    }

    /// PEM bundle of additional CA certificates to trust.
    pub fn trusted_certificates(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.trusted_certificates = Some(pem.into());
        self
    }

    pub fn skip_certificate_check(mut self, skip: bool) -> Self {
        self.skip_certificate_check = skip;
        self
    }

    pub fn disable_host_requests(mut self, disable: bool) -> Self {
        self.disable_host_requests = disable;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn error_log_len(mut self, len: usize) -> Self {
        self.error_log_len = Some(len);
        self
    }

    pub fn build(self) -> Result<Client> {
        let url = self.url.trim().trim_end_matches('/').to_owned();
        ensure!(!url.is_empty(), EmptyUrlSnafu);
        ensure!(!self.tokens.is_empty(), EmptyTokensSnafu);

        let mut http = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .danger_accept_invalid_certs(self.skip_certificate_check);

        if let Some(proxy) = &self.proxy {
            let no_proxy = self.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string);
            let proxy = reqwest::Proxy::all(proxy)
                .context(InvalidProxySnafu)?
                .no_proxy(no_proxy);
            http = http.proxy(proxy);
        }

        if let Some(pem) = &self.trusted_certificates {
            for certificate in
                reqwest::Certificate::from_pem_bundle(pem).context(InvalidCertificateSnafu)?
            {
                http = http.add_root_certificate(certificate);
            }
        }

        let error_log_len = self.error_log_len.unwrap_or_else(|| {
            std::env::var(ERROR_LOG_LEN_ENV)
                .ok()
                .and_then(|len| len.parse().ok())
                .unwrap_or(DEFAULT_ERROR_LOG_LEN)
        });

        Ok(Client {
            http: http.build().context(BuildHttpClientSnafu)?,
            url,
            tokens: self.tokens,
            network_zone: self.network_zone,
            host_group: self.host_group,
            disable_host_requests: self.disable_host_requests,
            error_log_len,
            host_cache: Arc::default(),
            process_module_config_unsupported_logged: Arc::default(),
            cancellation: CancellationToken::new(),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Returns a client whose requests are aborted once `token` is cancelled.
    ///
    /// The returned client shares the host cache with `self`.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            ..self.clone()
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn network_zone(&self) -> Option<&str> {
        self.network_zone.as_deref()
    }

    pub fn host_group(&self) -> Option<&str> {
        self.host_group.as_deref()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    /// Starts a request against `path` authenticated with the token of `kind`.
    fn request(&self, method: Method, path: &str, kind: TokenKind) -> Result<ApiRequest> {
        let url = self.endpoint(path);
        let token = self.tokens.select(kind).ok_or_else(|| Error::MissingToken {
            kind,
            url: url.clone(),
        })?;

        let builder = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, format!("Api-Token {token}"));
        Ok(ApiRequest { url, builder })
    }

    async fn send(&self, request: ApiRequest) -> Result<Response> {
        let ApiRequest { url, builder } = request;
        let request = builder
            .build()
            .with_context(|_| TransportSnafu { url: url.clone() })?;

        tokio::select! {
            () = self.cancellation.cancelled() => CancelledSnafu { url }.fail(),
            response = self.http.execute(request) => response.context(TransportSnafu { url }),
        }
    }

    async fn read_body(&self, response: Response) -> Result<Vec<u8>> {
        let url = response.url().to_string();

        tokio::select! {
            () = self.cancellation.cancelled() => CancelledSnafu { url }.fail(),
            body = response.bytes() => Ok(body.context(BodyReadSnafu { url })?.to_vec()),
        }
    }

    /// Sends the request and returns status and body of a 2xx response.
    async fn execute_with_status(&self, request: ApiRequest) -> Result<(StatusCode, Vec<u8>)> {
        let response = self.send(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = self.read_body(response).await?;

        if status.is_success() {
            Ok((status, body))
        } else {
            Err(self.error_from_response(status, &headers, &body))
        }
    }

    async fn execute(&self, request: ApiRequest) -> Result<Vec<u8>> {
        Ok(self.execute_with_status(request).await?.1)
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let (status, body) = self.execute_with_status(request).await?;
        serde_json::from_slice(&body).context(MalformedServerResponseSnafu {
            status: status.as_u16(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, kind: TokenKind) -> Result<T> {
        self.execute_json(self.request(Method::GET, path, kind)?)
            .await
    }

    /// Maps a non-2xx response onto either [`Error::ServerError`] or
    /// [`Error::MalformedServerResponse`].
    fn error_from_response(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Error {
        let body_text = String::from_utf8_lossy(body);
        let truncated: String = body_text.chars().take(self.error_log_len).collect();
        let proxy_headers: Vec<String> = PROXY_HEADERS
            .iter()
            .filter_map(|name| {
                headers
                    .get(*name)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| format!("{name}={value}"))
            })
            .collect();

        tracing::debug!(
            status = status.as_u16(),
            body = %truncated,
            proxy_headers = ?proxy_headers,
            "dynatrace API returned an error response"
        );

        match serde_json::from_slice::<ServerErrorResponse>(body) {
            Ok(response) => Error::ServerError {
                code: response.error.code,
                message: response.error.message,
            },
            Err(source) => Error::MalformedServerResponse {
                source,
                status: status.as_u16(),
            },
        }
    }

    /// Logs the first 404 for the process module configuration endpoint only.
    fn log_process_module_config_unsupported(&self) {
        if !self
            .process_module_config_unsupported_logged
            .swap(true, Ordering::Relaxed)
        {
            tracing::info!(
                "dynatrace cluster does not support process module configuration, skipping"
            );
        }
    }
}
