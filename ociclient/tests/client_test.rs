use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{TryStreamExt, stream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use ociclient::models::OCI_MANIFEST_V1;
use ociclient::{BlobStream, Client, ClientError, OciDigest};

const TOKEN: &str = "secret-token";

#[derive(Default)]
struct RegistryState {
    base: String,
    require_token: bool,
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
    blobs: HashMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, Vec<u8>>,
    next_upload: u64,
    patch_requests: usize,
    token_requests: usize,
}

type Shared = Arc<Mutex<RegistryState>>;

// Answer with a bearer challenge unless the request carries the test token
fn challenge(state: &RegistryState, headers: &HeaderMap, name: Option<&str>) -> Option<Response> {
    if !state.require_token {
        return None;
    }
    let expected = format!("Bearer {TOKEN}");
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(expected.as_str()) {
        return None;
    }
    let scope = name
        .map(|name| format!(",scope=\"repository:{name}:pull,push\""))
        .unwrap_or_default();
    let value = format!(
        "Bearer realm=\"{}/token\",service=\"test-registry\"{scope}",
        state.base
    );
    Some((StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, value)]).into_response())
}

async fn token(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    state.token_requests += 1;
    let expected = format!("Basic {}", STANDARD.encode("user:pass"));
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(serde_json::json!({ "token": TOKEN })).into_response()
}

async fn api_version_check(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, None) {
        return response;
    }
    StatusCode::OK.into_response()
}

async fn get_manifest(
    State(state): State<Shared>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    match state.manifests.get(&(name, reference)) {
        Some((media_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, media_type.clone())], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_manifest(
    State(state): State<Shared>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .manifests
        .insert((name, reference), (media_type, body.to_vec()));
    StatusCode::CREATED.into_response()
}

async fn get_blob(
    State(state): State<Shared>,
    Path((name, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    match state.blobs.get(&(name, digest)) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_upload(
    State(state): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    state.next_upload += 1;
    let uuid = format!("upload-{}", state.next_upload);
    state.uploads.insert(uuid.clone(), Vec::new());
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");
    (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
}

async fn upload_chunk(
    State(state): State<Shared>,
    Path((name, uuid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    state.patch_requests += 1;
    let Some(upload) = state.uploads.get_mut(&uuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    upload.extend_from_slice(&body);
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");
    (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
}

async fn complete_upload(
    State(state): State<Shared>,
    Path((name, uuid)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(response) = challenge(&state, &headers, Some(&name)) {
        return response;
    }
    let Some(mut content) = state.uploads.remove(&uuid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    content.extend_from_slice(&body);

    let Some(digest) = query.get("digest") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let verified = digest
        .parse::<OciDigest>()
        .map(|d| d.verify(&content))
        .unwrap_or(false);
    if !verified {
        return (StatusCode::BAD_REQUEST, "DIGEST_INVALID").into_response();
    }
    state.blobs.insert((name, digest.clone()), content);
    StatusCode::CREATED.into_response()
}

// Helper function to start a registry server for testing
async fn start_test_server(require_token: bool) -> (JoinHandle<()>, String, Shared) {
    // Use a random available port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let base = format!("http://127.0.0.1:{port}");

    let state: Shared = Arc::new(Mutex::new(RegistryState {
        base: base.clone(),
        require_token,
        ..Default::default()
    }));

    let app = Router::new()
        .route("/token", get(token))
        .route("/v2/", get(api_version_check))
        .route(
            "/v2/{name}/manifests/{reference}",
            get(get_manifest).put(put_manifest),
        )
        .route("/v2/{name}/blobs/{digest}", get(get_blob))
        .route("/v2/{name}/blobs/uploads/", post(start_upload))
        .route(
            "/v2/{name}/blobs/uploads/{uuid}",
            patch(upload_chunk).put(complete_upload),
        )
        .with_state(state.clone());

    // Start server in a separate task
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (server, base, state)
}

fn chunked(parts: &[&'static [u8]]) -> BlobStream<'static> {
    let chunks: Vec<std::io::Result<Bytes>> =
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
    BlobStream::new(None, stream::iter(chunks))
}

#[tokio::test]
async fn test_manifest_round_trip_keeps_bytes_and_media_type() {
    let (server, base, state) = start_test_server(false).await;
    let client = Client::new(&base, true);
    let session = client.new_session("app");

    let manifest = format!(r#"{{"mediaType":"{OCI_MANIFEST_V1}","config":{{}},"layers":[]}}"#);
    session
        .put_manifest("1.0", Bytes::from(manifest.clone()))
        .await
        .unwrap();

    let fetched = session.get_manifest("1.0").await.unwrap();
    assert_eq!(fetched, manifest.as_bytes());

    let (media_type, _) = state.lock().unwrap().manifests[&("app".to_string(), "1.0".to_string())].clone();
    assert_eq!(media_type, OCI_MANIFEST_V1);

    server.abort();
}

#[tokio::test]
async fn test_missing_manifest_is_not_found() {
    let (server, base, _) = start_test_server(false).await;
    let client = Client::new(&base, true);

    let err = client.new_session("app").get_manifest("nope").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err:?}");

    server.abort();
}

#[tokio::test]
async fn test_chunked_push_and_streaming_pull() {
    let (server, base, state) = start_test_server(false).await;
    let client = Client::new(&base, true).with_upload_chunk_size(4);
    let session = client.new_session("app");

    let content = b"hello world!";
    let digest = OciDigest::sha256(content);
    assert!(!session.blob_exists(&digest).await.unwrap());

    session
        .push_blob(&digest, chunked(&[b"hel", b"lo wor", b"ld!"]))
        .await
        .unwrap();

    assert_eq!(state.lock().unwrap().patch_requests, 3);
    assert!(session.blob_exists(&digest).await.unwrap());

    let pulled = session.pull_blob(&digest).await.unwrap();
    assert_eq!(pulled.size(), Some(content.len() as u64));
    let chunks: Vec<Bytes> = pulled.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), content);

    server.abort();
}

#[tokio::test]
async fn test_blob_pull_of_unknown_digest_is_not_found() {
    let (server, base, _) = start_test_server(false).await;
    let client = Client::new(&base, true);

    let result = client
        .new_session("app")
        .pull_blob(&OciDigest::sha256(b"missing"))
        .await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));

    server.abort();
}

#[tokio::test]
async fn test_push_with_wrong_digest_is_rejected() {
    let (server, base, _) = start_test_server(false).await;
    let client = Client::new(&base, true);

    let result = client
        .new_session("app")
        .push_blob(&OciDigest::sha256(b"expected"), chunked(&[b"actual"]))
        .await;
    match result {
        Err(ClientError::UnexpectedStatus { status, .. }) => {
            assert_eq!(status.as_u16(), StatusCode::BAD_REQUEST.as_u16())
        }
        other => panic!("expected a rejected upload, got {other:?}"),
    }

    server.abort();
}

#[tokio::test]
async fn test_bearer_token_flow() {
    let (server, base, state) = start_test_server(true).await;
    let mut client = Client::new(&base, true);
    client.authenticate("user", "pass").await.unwrap();

    let session = client.new_session("secured");
    let digest = OciDigest::sha256(b"layer");
    session
        .push_blob(&digest, BlobStream::from_bytes(Bytes::from_static(b"layer")))
        .await
        .unwrap();
    assert!(session.blob_exists(&digest).await.unwrap());

    // one token for the version check, one for the repository
    assert_eq!(state.lock().unwrap().token_requests, 2);

    server.abort();
}

#[tokio::test]
async fn test_wrong_credentials_are_unauthorized() {
    let (server, base, _) = start_test_server(true).await;
    let mut client = Client::new(&base, true);

    let err = client.authenticate("user", "wrong").await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized(_)), "unexpected error: {err:?}");

    server.abort();
}
