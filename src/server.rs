//! HTTP surface: the router, shared state and the thin handlers that map
//! query strings onto the gateway, metadata and upstream modules.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::Method,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::extractor::Extractor;
use crate::gateway::{DownloadQuery, DownloadRequest, Gateway};
use crate::metadata::{self, MediaInfo};
use crate::progress::SessionRegistry;
use crate::upstream::{
    CatalogClient, ExtractorResolver, JsonResolver, LinkResolver, Resolution, ResolverChain,
    TaskResolver,
};

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    extractor: Arc<Extractor>,
    sessions: Arc<SessionRegistry>,
    catalog: CatalogClient,
    resolver: TaskResolver,
    chain: Arc<ResolverChain>,
}

impl AppState {
    pub fn from_config(extractor: Extractor, config: &GatewayConfig) -> Self {
        let extractor = Arc::new(extractor);
        let sessions = Arc::new(SessionRegistry::new());
        let resolver = TaskResolver::new(&config.resolver_base_url);

        let mut engines: Vec<Arc<dyn LinkResolver>> = vec![Arc::new(resolver.clone())];
        if let Some(endpoint) = &config.fallback_resolver_url {
            engines.push(Arc::new(JsonResolver::new(
                endpoint.clone(),
                config.fallback_resolver_key.clone(),
            )));
        }
        engines.push(Arc::new(ExtractorResolver::new(extractor.clone())));
        let chain = ResolverChain::new(engines);
        tracing::info!(engines = ?chain.engine_names(), "resolver chain ready");

        Self {
            gateway: Arc::new(Gateway::new(extractor.clone(), sessions.clone())),
            extractor,
            sessions,
            catalog: CatalogClient::new(&config.catalog_base_url, config.catalog_token.clone()),
            resolver,
            chain: Arc::new(chain),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/download", get(download))
        .route("/api/info", get(info))
        .route("/api/search", get(search))
        .route("/api/catalog/trending", get(catalog_trending))
        .route("/api/catalog/search", get(catalog_search))
        .route("/api/catalog/searchmulti", get(catalog_search_multi))
        .route("/api/resolver/start", get(resolver_start))
        .route("/api/resolver/check", get(resolver_check))
        .route("/api/resolve", get(resolve))
        .route("/ws", get(push_channel))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskQuery {
    id: Option<String>,
}

fn required(value: Option<String>, message: &str) -> GatewayResult<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GatewayError::invalid(message))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> GatewayResult<Response> {
    let request = DownloadRequest::from_query(query)?;
    state.gateway.handle(request).await
}

async fn info(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> GatewayResult<Json<MediaInfo>> {
    let url = required(query.url, "URL required")?;
    Ok(Json(metadata::describe(&state.extractor, &url).await?))
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> GatewayResult<Json<Value>> {
    let q = required(query.q, "Search query required")?;
    let results = metadata::search(&state.extractor, &q, query.limit.as_deref()).await?;
    Ok(Json(json!({ "results": results })))
}

async fn catalog_trending(State(state): State<AppState>) -> GatewayResult<Json<Value>> {
    Ok(Json(state.catalog.trending().await?))
}

async fn catalog_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> GatewayResult<Json<Value>> {
    let q = required(query.q, "Search query required")?;
    Ok(Json(state.catalog.search_movies(&q).await?))
}

async fn catalog_search_multi(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> GatewayResult<Json<Value>> {
    let q = required(query.q, "Search query required")?;
    Ok(Json(state.catalog.search_multi(&q).await?))
}

async fn resolver_start(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> GatewayResult<Json<Value>> {
    let url = required(query.url, "URL required")?;
    Ok(Json(state.resolver.start(&url).await?))
}

async fn resolver_check(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> GatewayResult<Json<Value>> {
    let id = required(query.id, "Task ID required")?;
    Ok(Json(state.resolver.check(&id).await?))
}

async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> GatewayResult<Json<Resolution>> {
    let url = required(query.url, "URL required")?;
    Ok(Json(state.chain.resolve(&url).await?))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "extractor": state.extractor.program().display().to_string(),
        "sessions": state.sessions.len(),
    }))
}

async fn push_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_progress(socket, state.sessions))
}

/// Owns one push-channel connection: announces its session id, forwards
/// progress events, and unregisters when either side goes away.
async fn relay_progress(socket: WebSocket, sessions: Arc<SessionRegistry>) {
    let (session_id, mut events) = sessions.register();
    tracing::debug!(%session_id, "push channel connected");
    let (mut sender, mut receiver) = socket.split();

    let hello = json!({ "type": "session", "sessionId": session_id }).to_string();
    if sender.send(Message::Text(hello.into())).await.is_ok() {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let message = json!({ "type": "progress", "percent": event.percent }).to_string();
                    if sender.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    sessions.unregister(&session_id);
    tracing::debug!(%session_id, "push channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_with_env;
    use crate::progress::{ProgressEvent, ProgressSink};
    use crate::test_support::{RecordingSink, install_stub, recorded_args, spawn_upstream};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio_tungstenite::connect_async;
    use tower::ServiceExt;

    fn config(dir: &Path) -> GatewayConfig {
        load_config_with_env(dir.join("absent-env"), |_| None).unwrap()
    }

    fn state_for(stub: &Path) -> AppState {
        let extractor = Extractor::new(stub, stub.with_file_name("cookies.txt"))
            .with_kill_grace(Duration::from_millis(500));
        AppState::from_config(extractor, &config(stub.parent().unwrap()))
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_url_is_rejected_before_spawning() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "printf 'x'\n");
        let response = get(router(state_for(&stub)), "/download?format=720").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "URL required");
        assert!(recorded_args(dir.path()).is_none());
    }

    #[tokio::test]
    async fn unknown_format_selects_default_height() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "printf 'x'\n");
        let response = get(
            router(state_for(&stub)),
            "/download?url=https%3A%2F%2Fexample.com%2Fv&format=abc",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let args = recorded_args(dir.path()).unwrap();
        assert!(
            args.iter()
                .any(|arg| arg.starts_with("bestvideo[height<=480]"))
        );
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
    }

    #[tokio::test]
    async fn failure_without_output_is_a_json_error() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'ERROR: [generic] HTTP Error 403: Forbidden' >&2\nexit 1\n",
        );
        let response = get(router(state_for(&stub)), "/download?url=https://a/b").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("403"));
    }

    #[tokio::test]
    async fn failure_after_output_keeps_committed_headers() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "printf 'partial'\necho 'ERROR: connection reset' >&2\nexit 1\n",
        );
        let response = get(router(state_for(&stub)), "/download?url=https://a/b").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_some());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"partial");
    }

    #[tokio::test]
    async fn video_download_streams_exact_bytes() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "printf '0123456789'\n");
        let response = get(
            router(state_for(&stub)),
            "/download?url=https://a/b&format=720",
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.ends_with(".mp4\""));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 10);
        assert_eq!(&body[..], b"0123456789");

        let args = recorded_args(dir.path()).unwrap();
        assert!(args.iter().any(|arg| arg.starts_with("bestvideo[height<=720]")));
    }

    #[tokio::test]
    async fn mp3_download_requests_audio_extraction() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "printf 'ID3'\n");
        let response = get(
            router(state_for(&stub)),
            "/download?url=https://a/b&format=mp3",
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let args = recorded_args(dir.path()).unwrap();
        let position = args.iter().position(|arg| arg == "-x").unwrap();
        assert_eq!(args[position + 1], "--audio-format");
        assert_eq!(args[position + 2], "mp3");
    }

    #[tokio::test]
    async fn session_receives_exactly_one_completion() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo '[download]  50.0% of 1.00MiB' >&2\nprintf 'ok'\n",
        );
        let sink = Arc::new(RecordingSink::default());
        let mut state = state_for(&stub);
        state.gateway = Arc::new(Gateway::new(state.extractor.clone(), sink.clone()));

        let response = get(router(state), "/download?url=https://a/b&sessionId=abc").await;
        assert_eq!(response.status(), StatusCode::OK);
        let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        assert!(sink.wait_for_percent("abc", 100.0, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.percents("abc"), vec![50.0, 100.0]);
    }

    #[tokio::test]
    async fn client_disconnect_terminates_extractor() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("terminated");
        let stub = install_stub(
            dir.path(),
            &format!(
                "trap 'touch \"{}\"; exit 143' TERM\nprintf 'first'\nwhile true; do sleep 0.1; done\n",
                marker.display()
            ),
        );
        let response = get(router(state_for(&stub)), "/download?url=https://a/b").await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"first");
        drop(body);

        let started = Instant::now();
        while !marker.exists() && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn slow_metadata_lookup_times_out() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exec sleep 5\n");
        let extractor = Extractor::new(&stub, dir.path().join("cookies.txt"))
            .with_info_timeout(Duration::from_millis(300))
            .with_kill_grace(Duration::from_millis(200));
        let state = AppState::from_config(extractor, &config(dir.path()));

        let response = get(router(state), "/api/info?url=https://a/b").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            body_json(response).await["error"],
            "Timed out. Paste a direct URL."
        );
    }

    #[tokio::test]
    async fn info_returns_normalized_metadata() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo '{\"id\":\"dQw4w9WgXcQ\",\"title\":\"Clip\",\"duration\":212,\"extractor_key\":\"Youtube\"}'\n",
        );
        let response = get(router(state_for(&stub)), "/api/info?url=dQw4w9WgXcQ").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["title"], "Clip");
        assert_eq!(body["videoId"], "dQw4w9WgXcQ");
        assert_eq!(body["duration"], "3:32");
        assert_eq!(
            recorded_args(dir.path()).unwrap().last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[tokio::test]
    async fn search_wraps_results_and_requires_query() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo '{\"id\":\"a1\",\"title\":\"One\",\"channel\":\"C\"}'\necho 'garbage'\n",
        );
        let app = router(state_for(&stub));

        let missing = get(app.clone(), "/api/search").await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let response = get(app, "/api/search?q=cats&limit=3").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
        assert_eq!(body["results"][0]["channel"], "C");
        assert_eq!(
            recorded_args(dir.path()).unwrap().last().map(String::as_str),
            Some("ytsearch3:cats")
        );
    }

    #[tokio::test]
    async fn search_ignores_unusable_limits() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo '{\"id\":\"a1\",\"title\":\"One\"}'\n");
        let app = router(state_for(&stub));

        let response = get(app.clone(), "/api/search?q=cats&limit=abc").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["results"][0]["id"], "a1");
        assert_eq!(
            recorded_args(dir.path()).unwrap().last().map(String::as_str),
            Some("ytsearch12:cats")
        );

        let response = get(app, "/api/search?q=cats&limit=-4").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            recorded_args(dir.path()).unwrap().last().map(String::as_str),
            Some("ytsearch12:cats")
        );
    }

    #[tokio::test]
    async fn push_channel_announces_session_and_forwards_progress() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exit 0\n");
        let state = state_for(&stub);
        let sessions = state.sessions.clone();
        let base = spawn_upstream(router(state)).await;

        let (mut socket, _) = connect_async(format!("{}/ws", base.replacen("http", "ws", 1)))
            .await
            .unwrap();

        let hello = socket.next().await.unwrap().unwrap();
        let hello: Value = serde_json::from_str(hello.to_text().unwrap()).unwrap();
        assert_eq!(hello["type"], "session");
        let session_id = hello["sessionId"].as_str().unwrap().to_string();
        assert_eq!(session_id.len(), 32);
        assert_eq!(sessions.len(), 1);

        sessions.publish(&session_id, ProgressEvent { percent: 42.5 });
        sessions.publish("someone-else", ProgressEvent { percent: 1.0 });
        sessions.publish(&session_id, ProgressEvent::COMPLETE);

        for expected in [42.5, 100.0] {
            let frame = socket.next().await.unwrap().unwrap();
            let frame: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert_eq!(frame, json!({ "type": "progress", "percent": expected }));
        }

        socket.close(None).await.unwrap();
        let started = Instant::now();
        while !sessions.is_empty() && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn catalog_routes_validate_before_calling_upstream() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exit 0\n");
        let app = router(state_for(&stub));

        let response = get(app.clone(), "/api/catalog/search").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get(app, "/api/catalog/trending").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["error"],
            "catalog token not configured"
        );
    }

    #[tokio::test]
    async fn health_reports_extractor_and_sessions() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exit 0\n");
        let state = state_for(&stub);
        let (_id, _events) = state.sessions().register();

        let response = get(router(state), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["extractor"], stub.display().to_string());
    }
}
