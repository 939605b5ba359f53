//! Distribution Spec v2 registry client.
//!
//! Speaks the Registry-v2 HTTP protocol directly: blob existence checks,
//! monolithic and chunked uploads, manifest push/pull with media-type
//! negotiation, and streaming blob downloads with incremental digest
//! verification. HTTPS is required except for `localhost` and hosts the
//! plan explicitly marks insecure.
//!
//! ## Upload state machine
//!
//! ```text
//! Start -> (HEAD exists? yes -> Done)
//!       -> POST blobs/uploads/        (202, Location)
//!       -> (small blob? monolithic PUT ?digest=...)
//!       -> else loop: PATCH chunk     (202, new Location)
//!               until all bytes sent
//!           then PUT ?digest=...      (empty body)
//!       -> 201 Created; Docker-Content-Digest must match.
//! ```
//!
//! A `413` on the monolithic PUT degrades to chunked mode once; a `416`
//! resynchronizes the next chunk start from the server-reported range;
//! `5xx` and transport errors retry with capped exponential backoff.
//!
//! ## Authentication
//!
//! On a `401` carrying a `WWW-Authenticate: Bearer` challenge the client
//! exchanges its credential at the token realm and retries with the
//! bearer token. Tokens are cached per scope for the session; a second
//! `401` after a bearer retry is [`Error::AuthFailure`] — no loops.

use crate::auth::Credential;
use crate::constants::{
    DOCKER_IO_HOST, DOCKER_IO_REGISTRY, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE,
    MAX_MANIFEST_SIZE, MONOLITHIC_UPLOAD_LIMIT, REGISTRY_CONNECT_TIMEOUT, REGISTRY_MAX_ATTEMPTS,
    REGISTRY_REQUEST_TIMEOUT, RETRY_BASE_DELAY, RETRY_MAX_DELAY, UPLOAD_CHUNK_SIZE,
};
use crate::digest::{Digest, DigestVerifier};
use crate::error::{Error, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// A parsed image reference: `host/repository:tag` or `@digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry authority (may carry a port).
    pub host: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag or `sha256:...` digest.
    pub reference: String,
}

impl ImageReference {
    /// Parses an image reference string.
    ///
    /// `docker.io` is rewritten to its real v2 endpoint and bare
    /// single-segment repositories get the `library/` prefix:
    ///
    /// - `python:3.11-slim` -> `registry-1.docker.io/library/python:3.11-slim`
    /// - `ghcr.io/org/app:v1` -> as written
    /// - `localhost:5000/app@sha256:...` -> digest reference
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() || input.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageReference {
                reference: input.chars().take(64).collect(),
                reason: format!("empty or longer than {} bytes", MAX_IMAGE_REF_LEN),
            });
        }

        let valid = input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c));
        if !valid {
            return Err(Error::InvalidImageReference {
                reference: input.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        // Split off the host: the first segment counts as a registry
        // only when it looks like one (a dot or port separator).
        let (host, remainder) = match input.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') => {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_IO_HOST.to_string(), input.to_string()),
        };

        let host = if host == DOCKER_IO_HOST {
            DOCKER_IO_REGISTRY.to_string()
        } else {
            host
        };

        let (repository, reference) = match remainder.split_once('@') {
            Some((repo, digest)) => {
                Digest::parse(digest)?;
                (repo.to_string(), digest.to_string())
            }
            None => match remainder.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
                _ => (remainder.clone(), "latest".to_string()),
            },
        };

        if repository.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: input.to_string(),
                reason: "empty repository".to_string(),
            });
        }

        // Docker Hub official images live under library/.
        let repository = if host == DOCKER_IO_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            host,
            repository,
            reference,
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reference.starts_with("sha256:") {
            write!(f, "{}/{}@{}", self.host, self.repository, self.reference)
        } else {
            write!(f, "{}/{}:{}", self.host, self.repository, self.reference)
        }
    }
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses a `WWW-Authenticate` header into a bearer challenge.
///
/// Quoted values may contain commas (`scope="repository:x:push,pull"`),
/// so the parameters are walked with quote awareness rather than split
/// on commas. Returns `None` for non-Bearer schemes or a challenge
/// without a realm.
pub fn parse_www_authenticate(header: &str) -> Option<BearerChallenge> {
    let mut rest = header.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq]
            .trim_matches(|c: char| c == ',' || c.is_whitespace())
            .to_string();
        let after = &rest[eq + 1..];

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            let close = quoted.find('"')?;
            (&quoted[..close], &quoted[close + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim(), &after[end..])
        };

        match key.as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remainder;
    }

    realm.map(|realm| BearerChallenge {
        realm,
        service,
        scope,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryErrorBody {
    #[serde(default)]
    errors: Vec<RegistryErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct RegistryErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Result of a manifest pull.
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: Digest,
}

/// Registry-v2 client bound to one registry host.
///
/// Holds the session credential and an in-memory bearer-token cache
/// keyed by scope; both live only as long as the client.
pub struct RegistryClient {
    host: String,
    base_url: String,
    http: reqwest::Client,
    credential: Option<Credential>,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Creates a client for `host`.
    ///
    /// `credential` is whatever the auth chain resolved for the host;
    /// `insecure_hosts` lists hosts allowed over plain HTTP in addition
    /// to localhost.
    pub fn new(
        host: &str,
        credential: Option<Credential>,
        insecure_hosts: &[String],
    ) -> Result<Self> {
        let scheme = if is_local_host(host) || insecure_hosts.iter().any(|h| h == host) {
            "http"
        } else {
            "https"
        };

        let http = reqwest::Client::builder()
            .connect_timeout(REGISTRY_CONNECT_TIMEOUT)
            .timeout(REGISTRY_REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::RegistryHttp {
                status: 0,
                endpoint: format!("client init for {}: {}", host, e),
            })?;

        Ok(Self {
            host: host.to_string(),
            base_url: format!("{}://{}/v2", scheme, host),
            http,
            credential,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// The registry host this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    // =========================================================================
    // Public protocol surface
    // =========================================================================

    /// Checks blob existence via HEAD.
    pub async fn exists_blob(&self, repo: &str, digest: &Digest) -> Result<bool> {
        let url = format!("{}/{}/blobs/{}", self.base_url, repo, digest);
        let response = self
            .execute(Method::HEAD, &url, None, HeaderMap::new(), repo)
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.http_error(status, &url, response).await),
        }
    }

    /// Uploads a blob, skipping the upload when the registry already has
    /// it. Returns `true` when bytes were actually transferred.
    pub async fn put_blob(&self, repo: &str, digest: &Digest, data: Vec<u8>) -> Result<bool> {
        if self.exists_blob(repo, digest).await? {
            debug!("blob {} already on {}", digest, self.host);
            return Ok(false);
        }
        self.upload_blob(repo, digest, data).await?;
        Ok(true)
    }

    /// Uploads a blob unconditionally (no existence probe). For callers
    /// that already issued the HEAD themselves.
    pub async fn upload_blob(&self, repo: &str, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let location = self.initiate_upload(repo).await?;

        if (data.len() as u64) <= MONOLITHIC_UPLOAD_LIMIT {
            match self.upload_monolithic(repo, &location, digest, &data).await {
                Ok(()) => return Ok(()),
                Err(Error::RegistryHttp { status: 413, .. }) => {
                    // Registry rejected the single-shot body; a fresh
                    // session is needed because the first one is spent.
                    info!("monolithic upload of {} rejected, degrading to chunked", digest);
                    let location = self.initiate_upload(repo).await?;
                    return self.upload_chunked(repo, &location, digest, &data).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.upload_chunked(repo, &location, digest, &data).await
    }

    /// Pushes a manifest under a tag or digest reference.
    pub async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        manifest: Vec<u8>,
        media_type: &str,
    ) -> Result<Digest> {
        let url = format!("{}/{}/manifests/{}", self.base_url, repo, reference);
        let expected = Digest::from_bytes(&manifest);

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            media_type.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid manifest media type '{}'", media_type))
            })?,
        );

        let response = self
            .execute(Method::PUT, &url, Some(manifest), headers, repo)
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(self.http_error(status, &url, response).await);
        }

        if let Some(returned) = header_digest(response.headers()) {
            if returned != expected {
                return Err(Error::DigestMismatch {
                    expected: expected.to_string(),
                    actual: returned.to_string(),
                });
            }
        }

        info!("pushed manifest {} to {}/{}", expected, self.host, repo);
        Ok(expected)
    }

    /// Fetches a manifest (or index) by tag or digest.
    ///
    /// `accept` lists the media types to negotiate. When the reference
    /// is a digest, the body is verified against it.
    pub async fn get_manifest(
        &self,
        repo: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<PulledManifest> {
        let url = format!("{}/{}/manifests/{}", self.base_url, repo, reference);

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            accept.join(", ").parse().map_err(|_| {
                Error::InvalidConfig("invalid accept media types".to_string())
            })?,
        );

        let response = self
            .execute(Method::GET, &url, None, headers, repo)
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(self.http_error(status, &url, response).await);
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let header_digest = header_digest(response.headers());

        let bytes = response.bytes().await.map_err(|e| Error::RegistryHttp {
            status: 0,
            endpoint: format!("{}: {}", url, e),
        })?;
        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(Error::BlobTooLarge {
                size: bytes.len() as u64,
                limit: MAX_MANIFEST_SIZE as u64,
            });
        }

        let computed = Digest::from_bytes(&bytes);
        if let Ok(expected) = Digest::parse(reference) {
            if computed != expected {
                return Err(Error::DigestMismatch {
                    expected: expected.to_string(),
                    actual: computed.to_string(),
                });
            }
        }

        Ok(PulledManifest {
            bytes: bytes.to_vec(),
            media_type,
            digest: header_digest.unwrap_or(computed),
        })
    }

    /// Streams a blob into `sink`, verifying the digest incrementally.
    ///
    /// Returns the number of bytes written. Any deviation from the
    /// expected digest is [`Error::DigestMismatch`] and fatal.
    pub async fn get_blob(
        &self,
        repo: &str,
        digest: &Digest,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let url = format!("{}/{}/blobs/{}", self.base_url, repo, digest);
        let response = self
            .execute(Method::GET, &url, None, HeaderMap::new(), repo)
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(self.http_error(status, &url, response).await);
        }

        let mut verifier = DigestVerifier::new(digest.clone());
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::RegistryHttp {
                status: 0,
                endpoint: format!("{}: {}", url, e),
            })?;
            verifier.update(&chunk);
            if verifier.received() > MAX_LAYER_SIZE {
                return Err(Error::BlobTooLarge {
                    size: verifier.received(),
                    limit: MAX_LAYER_SIZE,
                });
            }
            sink.write_all(&chunk)?;
        }

        let received = verifier.received();
        verifier.verify()?;
        Ok(received)
    }

    /// Fetches a config blob with the tighter config size limit.
    pub async fn get_config_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let size = self.get_blob(repo, digest, &mut buf).await?;
        if size > MAX_CONFIG_SIZE as u64 {
            return Err(Error::BlobTooLarge {
                size,
                limit: MAX_CONFIG_SIZE as u64,
            });
        }
        Ok(buf)
    }

    // =========================================================================
    // Upload internals
    // =========================================================================

    async fn initiate_upload(&self, repo: &str) -> Result<String> {
        let url = format!("{}/{}/blobs/uploads/", self.base_url, repo);
        let response = self
            .execute(Method::POST, &url, Some(Vec::new()), HeaderMap::new(), repo)
            .await?;

        let status = response.status();
        if status != StatusCode::ACCEPTED && status != StatusCode::CREATED {
            return Err(self.http_error(status, &url, response).await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::PushFailed(format!(
                "{} returned no upload Location",
                self.host
            )))?;

        Ok(self.absolutize(location))
    }

    async fn upload_monolithic(
        &self,
        repo: &str,
        location: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<()> {
        let url = with_digest_param(location, digest);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/octet-stream".parse().unwrap());
        headers.insert(CONTENT_LENGTH, data.len().to_string().parse().unwrap());

        let response = self
            .execute(Method::PUT, &url, Some(data.to_vec()), headers, repo)
            .await?;

        self.finish_upload(response, digest, &url).await
    }

    async fn upload_chunked(
        &self,
        repo: &str,
        location: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<()> {
        let mut location = location.to_string();
        let mut offset: usize = 0;

        while offset < data.len() {
            let end = (offset + UPLOAD_CHUNK_SIZE).min(data.len());
            let chunk = data[offset..end].to_vec();

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, "application/octet-stream".parse().unwrap());
            headers.insert(CONTENT_LENGTH, chunk.len().to_string().parse().unwrap());
            headers.insert(
                CONTENT_RANGE,
                format!("{}-{}", offset, end - 1).parse().unwrap(),
            );

            let response = self
                .execute(Method::PATCH, &location, Some(chunk), headers, repo)
                .await?;

            match response.status() {
                StatusCode::ACCEPTED => {
                    if let Some(next) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                    {
                        location = self.absolutize(next);
                    }
                    offset = end;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    // Resynchronize from the server's view of the upload.
                    let range_end = response
                        .headers()
                        .get(RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_range_end);
                    match range_end {
                        Some(server_end) => {
                            warn!(
                                "upload range desync at {} (server has 0-{}), resyncing",
                                offset, server_end
                            );
                            offset = server_end as usize + 1;
                            if let Some(next) =
                                response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                            {
                                location = self.absolutize(next);
                            }
                        }
                        None => {
                            let url = location.clone();
                            return Err(self
                                .http_error(StatusCode::RANGE_NOT_SATISFIABLE, &url, response)
                                .await);
                        }
                    }
                }
                status => {
                    let url = location.clone();
                    return Err(self.http_error(status, &url, response).await);
                }
            }
        }

        // Finalize with an empty-body PUT carrying the digest.
        let url = with_digest_param(&location, digest);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "0".parse().unwrap());

        let response = self
            .execute(Method::PUT, &url, Some(Vec::new()), headers, repo)
            .await?;
        self.finish_upload(response, digest, &url).await
    }

    async fn finish_upload(
        &self,
        response: Response,
        digest: &Digest,
        url: &str,
    ) -> Result<()> {
        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::ACCEPTED {
            return Err(self.http_error(status, url, response).await);
        }

        if let Some(returned) = header_digest(response.headers()) {
            if &returned != digest {
                return Err(Error::DigestMismatch {
                    expected: digest.to_string(),
                    actual: returned.to_string(),
                });
            }
        }

        debug!("uploaded blob {} to {}", digest, self.host);
        Ok(())
    }

    // =========================================================================
    // Request execution: retries and auth
    // =========================================================================

    /// Sends a request with retry/backoff and the 401 challenge dance.
    ///
    /// Retriable failures (transport errors, `5xx`) back off
    /// exponentially up to the attempt cap. At most one token exchange
    /// happens per call; a second `401` is terminal.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: HeaderMap,
        repo: &str,
    ) -> Result<Response> {
        let mut challenged = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let mut request = self
                .http
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            if let Some(auth) = self.auth_header(repo) {
                request = request.header(AUTHORIZATION, auth);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if attempt < REGISTRY_MAX_ATTEMPTS {
                        warn!("request to {} failed ({}), retrying", url, e);
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(Error::RegistryHttp {
                        status: 0,
                        endpoint: format!("{}: {}", url, e),
                    });
                }
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !challenged {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_www_authenticate);

                match challenge {
                    Some(challenge) => {
                        self.exchange_token(&challenge).await?;
                        challenged = true;
                        continue;
                    }
                    None => {
                        return Err(Error::AuthFailure {
                            host: self.host.clone(),
                        });
                    }
                }
            }

            if status == StatusCode::UNAUTHORIZED && challenged {
                return Err(Error::AuthFailure {
                    host: self.host.clone(),
                });
            }

            if status.is_server_error() && attempt < REGISTRY_MAX_ATTEMPTS {
                warn!("{} returned {} for {}, retrying", self.host, status, url);
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }

            return Ok(response);
        }
    }

    /// The Authorization header for a request: a cached bearer token for
    /// the repo's scope wins, otherwise the session credential.
    fn auth_header(&self, repo: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap();
        for (scope, token) in tokens.iter() {
            if scope.contains(repo) || scope.is_empty() {
                return Some(format!("Bearer {}", token));
            }
        }
        drop(tokens);

        self.credential.as_ref().map(|c| c.header_value())
    }

    /// Exchanges the session credential for a bearer token at the
    /// challenge realm and caches it under the challenge scope.
    async fn exchange_token(&self, challenge: &BearerChallenge) -> Result<()> {
        let mut params = Vec::new();
        if let Some(service) = &challenge.service {
            params.push(("service", service.clone()));
        }
        if let Some(scope) = &challenge.scope {
            params.push(("scope", scope.clone()));
        }

        debug!(
            "token exchange at {} (scope: {:?})",
            challenge.realm, challenge.scope
        );

        let mut request = self.http.get(&challenge.realm).query(&params);
        if let Some(credential) = &self.credential {
            request = request.header(AUTHORIZATION, credential.header_value());
        }

        let response = request.send().await.map_err(|e| Error::RegistryHttp {
            status: 0,
            endpoint: format!("{}: {}", challenge.realm, e),
        })?;

        if !response.status().is_success() {
            return Err(Error::AuthFailure {
                host: self.host.clone(),
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|_| Error::AuthFailure {
            host: self.host.clone(),
        })?;

        let token = parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::AuthFailure {
                host: self.host.clone(),
            })?;

        self.tokens
            .lock()
            .unwrap()
            .insert(challenge.scope.clone().unwrap_or_default(), token);
        Ok(())
    }

    /// Decodes a Distribution-spec error body into the terminal error.
    async fn http_error(&self, status: StatusCode, url: &str, response: Response) -> Error {
        if let Ok(body) = response.bytes().await {
            if let Ok(parsed) = serde_json::from_slice::<RegistryErrorBody>(&body) {
                for detail in &parsed.errors {
                    warn!(
                        "{} error from {}: {} ({})",
                        status, self.host, detail.message, detail.code
                    );
                }
            }
        }
        Error::RegistryHttp {
            status: status.as_u16(),
            endpoint: url.to_string(),
        }
    }

    /// Registries may return relative upload locations.
    fn absolutize(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            let scheme_host = self.base_url.trim_end_matches("/v2");
            format!("{}{}", scheme_host, location)
        }
    }
}

fn is_local_host(host: &str) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    bare == "localhost" || bare == "127.0.0.1" || bare == "::1"
}

/// Appends the `digest` query parameter to an upload URL that may
/// already carry session parameters.
fn with_digest_param(location: &str, digest: &Digest) -> String {
    let separator = if location.contains('?') { '&' } else { '?' };
    format!("{}{}digest={}", location, separator, digest)
}

fn header_digest(headers: &HeaderMap) -> Option<Digest> {
    headers
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Digest::parse(s).ok())
}

/// Extracts the end offset from a `Range: 0-<end>` header.
fn parse_range_end(range: &str) -> Option<u64> {
    range.rsplit('-').next()?.trim().parse().ok()
}

fn backoff_delay(attempt: u32) -> std::time::Duration {
    let exp = RETRY_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(RETRY_MAX_DELAY)
}
