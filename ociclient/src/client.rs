use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client as ReqwestClient, RequestBuilder, Response, StatusCode, Url, header};
use serde::Deserialize;
use tracing::debug;

use crate::blob::BlobStream;
use crate::digest::OciDigest;
use crate::error::{ClientError, Result};
use crate::models::{DOCKER_MANIFEST_V2, MediaTypeSniff, OCI_MANIFEST_V1};

/// Largest body sent in one `PATCH` of a chunked blob upload.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// A client for interacting with an OCI registry.
pub struct Client {
    registry_url: String,
    auth: Option<String>,
    client: ReqwestClient,
    // bearer tokens, keyed by the repository they were issued for
    tokens: Mutex<HashMap<String, String>>,
    upload_chunk_size: usize,
}

impl Client {
    /// Create a new client for the given registry host.
    ///
    /// The host is reached over https unless `insecure` is set. A host that
    /// already carries a scheme is used as-is.
    pub fn new(host: &str, insecure: bool) -> Self {
        let host = host.trim_end_matches('/');
        let registry_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else if insecure {
            format!("http://{host}")
        } else {
            format!("https://{host}")
        };

        Self {
            registry_url,
            auth: None,
            client: ReqwestClient::new(),
            tokens: Mutex::new(HashMap::new()),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    /// Bound the size of each chunk sent while pushing blobs.
    pub fn with_upload_chunk_size(mut self, upload_chunk_size: usize) -> Self {
        self.upload_chunk_size = upload_chunk_size.max(1);
        self
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Create a new session for the given repository.
    pub fn new_session<'a>(&'a self, repository: &'a str) -> ClientSession<'a> {
        ClientSession {
            client: self,
            repository,
        }
    }

    /// Use basic credentials for every following request.
    ///
    /// The credentials are checked against the API version endpoint, going
    /// through the token service when the registry asks for one.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        self.auth = Some(STANDARD.encode(format!("{username}:{password}")));
        self.tokens
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let url = format!("{}/v2/", self.registry_url);
        let response = self.send(None, |client| client.get(&url)).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized(
                format!("{} refused the credentials of {username}", self.registry_url),
            )),
            _ => Err(unexpected_status("Authentication", response).await),
        }
    }

    /// Check if the registry API is available.
    pub async fn check_api(&self) -> Result<bool> {
        let url = format!("{}/v2/", self.registry_url);
        let response = self.send(None, |client| client.get(&url)).await?;

        // If we get a 401, the API is still available but requires authentication
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(true);
        }

        Ok(response.status() == StatusCode::OK)
    }

    fn cached_token(&self, scope: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    fn store_token(&self, scope: &str, token: String) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string(), token);
    }

    fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        if let Some(token) = self.cached_token(scope) {
            request.bearer_auth(token)
        } else if let Some(auth) = &self.auth {
            request.header(header::AUTHORIZATION, format!("Basic {auth}"))
        } else {
            request
        }
    }

    /// Send a request, obtaining a bearer token and retrying once if the
    /// registry answers with a `Bearer` challenge.
    ///
    /// `build` is called again for the retry, so request bodies must be cheap
    /// to clone.
    async fn send<F>(&self, repository: Option<&str>, build: F) -> Result<Response>
    where
        F: Fn(&ReqwestClient) -> RequestBuilder,
    {
        let scope = repository.unwrap_or_default();
        let response = self.authorize(build(&self.client), scope).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = match response.headers().get(header::WWW_AUTHENTICATE) {
            Some(value) => BearerChallenge::parse(value.to_str()?),
            None => None,
        };
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        let Some(token) = self.fetch_token(&challenge).await? else {
            return Ok(response);
        };

        self.store_token(scope, token.clone());
        Ok(build(&self.client).bearer_auth(token).send().await?)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<Option<String>> {
        let mut token_url = Url::parse(&challenge.realm)?;
        if let Some(service) = &challenge.service {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        if let Some(scope) = &challenge.scope {
            token_url.query_pairs_mut().append_pair("scope", scope);
        }
        debug!(realm = %challenge.realm, scope = ?challenge.scope, "requesting bearer token");

        let mut request = self.client.get(token_url);
        if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, format!("Basic {auth}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "token service refused the request");
            return Ok(None);
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.token.or(token.access_token))
    }

    fn location(&self, response: &Response) -> Result<Url> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .ok_or(ClientError::MissingHeader("Location"))?
            .to_str()?;
        Ok(Url::parse(&self.registry_url)?.join(location)?)
    }
}

// Token authentication response from the auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in challenge_params(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

// Quoted values may contain commas, e.g. scope="repository:app:pull,push"
fn challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            rest = quoted.get(end + 1..).unwrap_or("");
            quoted[..end].to_string()
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        params.push((key, value));
    }

    params
}

async fn unexpected_status(operation: &'static str, response: Response) -> ClientError {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ClientError::Unauthorized(format!("{operation} was refused with {status}"));
    }
    let body = response.text().await.unwrap_or_default();
    ClientError::UnexpectedStatus {
        operation,
        status,
        body,
    }
}

/// A session for interacting with a specific repository in an OCI registry.
pub struct ClientSession<'a> {
    client: &'a Client,
    repository: &'a str,
}

impl ClientSession<'_> {
    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.client.registry_url, self.repository, path)
    }

    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&ReqwestClient) -> RequestBuilder,
    {
        self.client.send(Some(self.repository), build).await
    }

    /// Fetch the raw manifest stored under `reference`.
    pub async fn get_manifest(&self, reference: &str) -> Result<Bytes> {
        let url = self.url(&format!("manifests/{reference}"));
        let accept = format!("{DOCKER_MANIFEST_V2}, {OCI_MANIFEST_V1}");
        debug!(%url, "fetching manifest");

        let response = self
            .send(|client| client.get(&url).header(header::ACCEPT, accept.as_str()))
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(format!(
                "manifest {}:{reference}",
                self.repository
            ))),
            _ => Err(unexpected_status("Fetching manifest", response).await),
        }
    }

    /// Store a raw manifest under `reference`, byte for byte.
    pub async fn put_manifest(&self, reference: &str, content: Bytes) -> Result<()> {
        let url = self.url(&format!("manifests/{reference}"));
        let media_type = MediaTypeSniff::of(&content);
        debug!(%url, %media_type, "pushing manifest");

        let response = self
            .send(|client| {
                client
                    .put(&url)
                    .header(header::CONTENT_TYPE, media_type.as_str())
                    .body(content.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(unexpected_status("Pushing manifest", response).await);
        }
        Ok(())
    }

    /// Check if a blob with the given digest exists.
    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        let url = self.url(&format!("blobs/{digest}"));
        let response = self.send(|client| client.head(&url)).await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected_status("Checking blob", response).await),
        }
    }

    /// Stream a blob with the given digest.
    pub async fn pull_blob(&self, digest: &OciDigest) -> Result<BlobStream<'static>> {
        let url = self.url(&format!("blobs/{digest}"));
        debug!(%url, "pulling blob");
        let response = self.send(|client| client.get(&url)).await?;

        match response.status() {
            StatusCode::OK => {
                let size = response.content_length();
                let stream = response.bytes_stream().map_err(io::Error::other);
                Ok(BlobStream::new(size, stream))
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(format!(
                "blob {digest} in {}",
                self.repository
            ))),
            _ => Err(unexpected_status("Pulling blob", response).await),
        }
    }

    /// Upload a blob as a chunked upload session.
    ///
    /// At most one upload chunk of the stream is held in memory; the final
    /// remainder travels with the closing `PUT`.
    pub async fn push_blob(&self, digest: &OciDigest, mut data: BlobStream<'_>) -> Result<()> {
        let start_url = self.url("blobs/uploads/");
        let response = self
            .send(|client| client.post(&start_url).header(header::CONTENT_LENGTH, 0))
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(unexpected_status("Starting blob upload", response).await);
        }
        let mut location = self.client.location(&response)?;

        let chunk_size = self.client.upload_chunk_size;
        let mut buffer = BytesMut::new();
        let mut offset: u64 = 0;

        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= chunk_size {
                let body = buffer.split_to(chunk_size).freeze();
                let len = body.len() as u64;
                location = self.upload_chunk(&location, offset, body).await?;
                offset += len;
            }
        }

        let mut complete_url = location;
        complete_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        let body = buffer.freeze();
        debug!(%digest, size = offset + body.len() as u64, "completing blob upload");

        let response = self
            .send(|client| {
                client
                    .put(complete_url.clone())
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(unexpected_status("Completing blob upload", response).await);
        }
        Ok(())
    }

    async fn upload_chunk(&self, location: &Url, offset: u64, body: Bytes) -> Result<Url> {
        let end = offset + body.len() as u64 - 1;
        debug!(start = offset, end, "uploading chunk");

        let response = self
            .send(|client| {
                client
                    .patch(location.clone())
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_RANGE, format!("{offset}-{end}"))
                    .body(body.clone())
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(unexpected_status("Uploading chunk", response).await);
        }
        self.client.location(&response)
    }
}
