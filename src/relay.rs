use std::{
    convert::Infallible,
    error::Error as StdError,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    http::uri::{Authority, Scheme},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, Error as LegacyClientError, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot, time::MissedTickBehavior};
use tracing::Instrument as _;

use crate::{
    config::Config,
    matching::MatchRule,
    queue::Queue,
    replay::{ReplaySummary, Replayer},
};

pub(crate) type RelayBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type RelayHttpsConnector = HttpsConnector<HttpConnector>;
pub(crate) type HttpClient = Client<RelayHttpsConnector, RelayBody>;

/// Fixed response body returned in place of a deferred request. Callers that
/// depend on real upstream data for matched endpoints must be prepared to see
/// this placeholder after an offline bridge.
pub const DEFERRED_BODY: &str = "fetch postponed";
/// Status paired with [`DEFERRED_BODY`]: success-class so the caller's request
/// path does not observe a failure, but honest about the payload not having
/// been delivered yet.
pub const DEFERRED_STATUS: StatusCode = StatusCode::ACCEPTED;

/// Counters exposed on the admin `/status` endpoint.
#[derive(Debug, Default)]
pub struct RuntimeStatus {
    pub requests_total: AtomicU64,
    pub forwarded_total: AtomicU64,
    pub deferred_total: AtomicU64,
    pub replay_passes_total: AtomicU64,
    pub replay_attempted_total: AtomicU64,
    pub replay_failures_total: AtomicU64,
}

impl RuntimeStatus {
    pub fn record_replay_summary(&self, summary: &ReplaySummary) {
        self.replay_passes_total.fetch_add(1, Ordering::Relaxed);
        self.replay_attempted_total
            .fetch_add(summary.attempted as u64, Ordering::Relaxed);
        self.replay_failures_total
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct UpstreamOrigin {
    scheme: Scheme,
    authority: Authority,
}

struct RelayState {
    upstream: UpstreamOrigin,
    rule: MatchRule,
    queue: Queue,
    client: HttpClient,
    status: Arc<RuntimeStatus>,
}

struct AdminState {
    status: Arc<RuntimeStatus>,
    queue: Queue,
    replayer: Arc<Replayer>,
}

#[derive(Debug)]
pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: Option<SocketAddr>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    admin_shutdown_tx: Option<oneshot::Sender<()>>,
    admin_join: Option<tokio::task::JoinHandle<()>>,
    replay_timer_shutdown_tx: Option<oneshot::Sender<()>>,
    replay_timer_join: Option<tokio::task::JoinHandle<()>>,
}

impl RelayHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Some(admin_shutdown_tx) = self.admin_shutdown_tx {
            let _ = admin_shutdown_tx.send(());
        }
        if let Some(replay_timer_shutdown_tx) = self.replay_timer_shutdown_tx {
            let _ = replay_timer_shutdown_tx.send(());
        }
        let _ = self.join.await;
        if let Some(admin_join) = self.admin_join {
            let _ = admin_join.await;
        }
        if let Some(replay_timer_join) = self.replay_timer_join {
            let _ = replay_timer_join.await;
        }
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<RelayHandle> {
    ensure_rustls_crypto_provider()?;

    let upstream = parse_upstream_origin(&config.relay.upstream)?;
    let rule = MatchRule::from_config(&config.offline.rule)?;
    let queue = Queue::from_config(config)?;
    let client = build_http_client()?;
    let status = Arc::new(RuntimeStatus::default());
    let ack = config
        .replay
        .as_ref()
        .and_then(|replay| replay.ack)
        .unwrap_or_default();
    let replay_interval = match config.replay.as_ref().and_then(|replay| replay.interval_secs) {
        Some(0) => anyhow::bail!("replay.interval_secs must be greater than zero"),
        other => other.map(Duration::from_secs),
    };
    let replayer = Arc::new(Replayer::new(queue.clone(), client.clone(), ack));

    let listener = TcpListener::bind(config.relay.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.relay.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let admin_listener = if let Some(admin_port) = config.relay.admin_port {
        let admin_bind_addr = SocketAddr::new(config.relay.listen.ip(), admin_port);
        Some(
            TcpListener::bind(admin_bind_addr)
                .await
                .map_err(|err| anyhow::anyhow!("bind admin {admin_bind_addr}: {err}"))?,
        )
    } else {
        None
    };
    let admin_listen_addr = match admin_listener.as_ref() {
        Some(admin_listener) => Some(
            admin_listener
                .local_addr()
                .map_err(|err| anyhow::anyhow!("get admin local_addr: {err}"))?,
        ),
        None => None,
    };

    let state = Arc::new(RelayState {
        upstream,
        rule,
        queue: queue.clone(),
        client,
        status: Arc::clone(&status),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| relay_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    let (admin_shutdown_tx, admin_join) = if let Some(admin_listener) = admin_listener {
        let (admin_shutdown_tx, mut admin_shutdown_rx) = oneshot::channel::<()>();
        let admin_state = Arc::new(AdminState {
            status: Arc::clone(&status),
            queue,
            replayer: Arc::clone(&replayer),
        });
        let admin_join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut admin_shutdown_rx => break,
                    accept = admin_listener.accept() => {
                        let Ok((stream, _peer)) = accept else { continue };
                        let io = TokioIo::new(stream);
                        let admin_state = Arc::clone(&admin_state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                admin_handler(req, Arc::clone(&admin_state))
                            });
                            let builder = ConnectionBuilder::new(TokioExecutor::new());
                            if let Err(err) = builder.serve_connection(io, service).await {
                                tracing::debug!("admin connection error: {err}");
                            }
                        });
                    }
                }
            }
        });
        (Some(admin_shutdown_tx), Some(admin_join))
    } else {
        (None, None)
    };

    let (replay_timer_shutdown_tx, replay_timer_join) = if let Some(interval) = replay_interval {
        let (timer_shutdown_tx, timer_shutdown_rx) = oneshot::channel::<()>();
        let timer_join = tokio::spawn(replay_timer_loop(
            interval,
            Arc::clone(&replayer),
            Arc::clone(&status),
            timer_shutdown_rx,
        ));
        (Some(timer_shutdown_tx), Some(timer_join))
    } else {
        (None, None)
    };

    Ok(RelayHandle {
        listen_addr,
        admin_listen_addr,
        shutdown_tx,
        join,
        admin_shutdown_tx,
        admin_join,
        replay_timer_shutdown_tx,
        replay_timer_join,
    })
}

async fn replay_timer_loop(
    interval: Duration,
    replayer: Arc<Replayer>,
    status: Arc<RuntimeStatus>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; consume it so the
    // first pass happens one full interval after startup.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                match replayer.on_replay_trigger().await {
                    Ok(summary) => {
                        status.record_replay_summary(&summary);
                        if summary.attempted > 0 {
                            tracing::info!(
                                attempted = summary.attempted,
                                failed = summary.failed,
                                "scheduled replay pass finished"
                            );
                        }
                    }
                    Err(err) => tracing::warn!("scheduled replay pass failed: {err:#}"),
                }
            }
        }
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn parse_upstream_origin(upstream: &str) -> anyhow::Result<UpstreamOrigin> {
    let uri: Uri = upstream
        .parse()
        .map_err(|err| anyhow::anyhow!("parse upstream `{upstream}`: {err}"))?;
    let scheme = uri
        .scheme()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("upstream `{upstream}` must include a scheme"))?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("upstream `{upstream}` must include a host"))?;
    if !uri.path().is_empty() && uri.path() != "/" {
        anyhow::bail!("upstream `{upstream}` must not include a path");
    }
    Ok(UpstreamOrigin { scheme, authority })
}

async fn relay_handler(
    req: Request<Incoming>,
    state: Arc<RelayState>,
) -> Result<Response<RelayBody>, Infallible> {
    state.status.requests_total.fetch_add(1, Ordering::Relaxed);

    let request_method = req.method().to_string();
    let request_path = req.uri().path().to_owned();
    let request_span = tracing::info_span!(
        "relay.request",
        method = %request_method,
        path = %request_path,
    );

    Ok(handle_request(req, state).instrument(request_span).await)
}

async fn handle_request(req: Request<Incoming>, state: Arc<RelayState>) -> Response<RelayBody> {
    let target = match upstream_target_uri(&state.upstream, req.uri()) {
        Ok(target) => target,
        Err(err) => {
            tracing::debug!("failed to build upstream uri: {err:#}");
            return relay_simple_response(
                StatusCode::BAD_GATEWAY,
                "failed to build upstream request",
            );
        }
    };

    if state.rule.matches(&target) {
        deferrable_request(req, target, state.as_ref()).await
    } else {
        passthrough_request(req, target, state.as_ref()).await
    }
}

/// Passthrough path: the request does not match the offline rule, so it is
/// streamed to the upstream unchanged and never touches the queue. Upstream
/// failures of any class surface to the caller as 502.
async fn passthrough_request(
    req: Request<Incoming>,
    target: Uri,
    state: &RelayState,
) -> Response<RelayBody> {
    let (parts, body) = req.into_parts();
    let upstream_req = match build_upstream_request(
        parts.method,
        &target,
        &parts.headers,
        &state.upstream.authority,
        boxed_incoming(body),
    ) {
        Ok(upstream_req) => upstream_req,
        Err(err) => {
            tracing::debug!("failed to build upstream request: {err:#}");
            return relay_simple_response(
                StatusCode::BAD_GATEWAY,
                "failed to build upstream request",
            );
        }
    };

    match state.client.request(upstream_req).await {
        Ok(response) => {
            state.status.forwarded_total.fetch_add(1, Ordering::Relaxed);
            into_relay_response(response)
        }
        Err(err) => {
            tracing::debug!("upstream request failed: {err}");
            relay_simple_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

/// Deferral path: the request matches the offline rule. Its body is buffered
/// as the original chunk sequence so that a connectivity failure can hand the
/// exact payload to the queue; any other failure class propagates as 502
/// without queueing.
async fn deferrable_request(
    req: Request<Incoming>,
    target: Uri,
    state: &RelayState,
) -> Response<RelayBody> {
    let (parts, body) = req.into_parts();
    let chunks = match collect_body_chunks(body).await {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::debug!("failed to read request body: {err}");
            return relay_simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let upstream_req = match build_upstream_request(
        parts.method.clone(),
        &target,
        &parts.headers,
        &state.upstream.authority,
        boxed_full(crate::queue::concat_chunks(&chunks)),
    ) {
        Ok(upstream_req) => upstream_req,
        Err(err) => {
            tracing::debug!("failed to build upstream request: {err:#}");
            return relay_simple_response(
                StatusCode::BAD_GATEWAY,
                "failed to build upstream request",
            );
        }
    };

    match state.client.request(upstream_req).await {
        Ok(response) => {
            state.status.forwarded_total.fetch_add(1, Ordering::Relaxed);
            into_relay_response(response)
        }
        Err(err) if is_connectivity_error(&err) => {
            tracing::info!(url = %target, "upstream unreachable, queueing request for replay: {err}");
            state.status.deferred_total.fetch_add(1, Ordering::Relaxed);
            if let Err(enqueue_err) = state
                .queue
                .enqueue(&target.to_string(), parts.method.as_str(), chunks)
                .await
            {
                // The placeholder is still returned so the caller does not
                // observe a crash; the payload is lost.
                tracing::error!("failed to queue request for replay: {enqueue_err:#}");
            }
            deferred_response()
        }
        Err(err) => {
            tracing::debug!("upstream request failed: {err}");
            relay_simple_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

/// Connectivity-class failures are the only ones that qualify for deferral:
/// the request never reached the network. Errors after a connection was
/// established (resets, protocol errors) do not qualify.
fn is_connectivity_error(err: &LegacyClientError) -> bool {
    err.is_connect()
}

fn deferred_response() -> Response<RelayBody> {
    relay_simple_response(DEFERRED_STATUS, DEFERRED_BODY)
}

fn upstream_target_uri(upstream: &UpstreamOrigin, original: &Uri) -> anyhow::Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(upstream.scheme.clone())
        .authority(upstream.authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| anyhow::anyhow!("assemble upstream uri: {err}"))
}

fn build_upstream_request(
    method: Method,
    target: &Uri,
    headers: &HeaderMap,
    upstream_authority: &Authority,
    body: RelayBody,
) -> anyhow::Result<Request<RelayBody>> {
    let mut upstream_req = Request::builder()
        .method(method)
        .uri(target.clone())
        .body(body)
        .map_err(|err| anyhow::anyhow!("build upstream request: {err}"))?;

    let mut forwarded = headers.clone();
    strip_hop_by_hop_headers(&mut forwarded);
    forwarded.insert(
        header::HOST,
        HeaderValue::from_str(upstream_authority.as_str())
            .map_err(|err| anyhow::anyhow!("render upstream host header: {err}"))?,
    );
    *upstream_req.headers_mut() = forwarded;

    Ok(upstream_req)
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in connection_named {
        headers.remove(name);
    }
    headers.remove(header::CONNECTION);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove(HeaderName::from_static("keep-alive"));
}

/// Reads the request body to completion, preserving the original frame
/// boundaries as the stored chunk sequence.
async fn collect_body_chunks(mut body: Incoming) -> Result<Vec<Bytes>, hyper::Error> {
    let mut chunks = Vec::new();
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            if !data.is_empty() {
                chunks.push(data);
            }
        }
    }
    Ok(chunks)
}

pub(crate) fn boxed_full(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn boxed_incoming(body: Incoming) -> RelayBody {
    body.map_err(|err| Box::new(err) as Box<dyn StdError + Send + Sync>)
        .boxed()
}

fn into_relay_response(response: Response<Incoming>) -> Response<RelayBody> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, boxed_incoming(body))
}

fn relay_simple_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

async fn admin_handler(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<RelayBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/status") => admin_status_response(state.as_ref()).await,
        (&Method::GET, "/queue") => admin_list_queue_response(state.as_ref()).await,
        (&Method::DELETE, "/queue") => admin_clear_queue_response(state.as_ref()).await,
        (&Method::POST, "/replay") => admin_replay_response(state.as_ref()).await,
        _ => admin_error_response(StatusCode::NOT_FOUND, "unknown admin endpoint"),
    };
    Ok(response)
}

async fn admin_status_response(state: &AdminState) -> Response<RelayBody> {
    let queue_depth = match state.queue.count().await {
        Ok(queue_depth) => queue_depth,
        Err(err) => {
            tracing::warn!("failed to read queue depth: {err:#}");
            return admin_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read queue depth",
            );
        }
    };

    let status = &state.status;
    admin_json_response(
        StatusCode::OK,
        &serde_json::json!({
            "queue_depth": queue_depth,
            "requests_total": status.requests_total.load(Ordering::Relaxed),
            "forwarded_total": status.forwarded_total.load(Ordering::Relaxed),
            "deferred_total": status.deferred_total.load(Ordering::Relaxed),
            "replay": {
                "passes_total": status.replay_passes_total.load(Ordering::Relaxed),
                "attempted_total": status.replay_attempted_total.load(Ordering::Relaxed),
                "failures_total": status.replay_failures_total.load(Ordering::Relaxed),
            },
        }),
    )
}

async fn admin_list_queue_response(state: &AdminState) -> Response<RelayBody> {
    match state.queue.list().await {
        Ok(summaries) => admin_json_response(StatusCode::OK, &serde_json::json!(summaries)),
        Err(err) => {
            tracing::warn!("failed to list queue: {err:#}");
            admin_error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list queue")
        }
    }
}

async fn admin_clear_queue_response(state: &AdminState) -> Response<RelayBody> {
    match state.queue.clear().await {
        Ok(cleared) => admin_json_response(StatusCode::OK, &serde_json::json!({ "cleared": cleared })),
        Err(err) => {
            tracing::warn!("failed to clear queue: {err:#}");
            admin_error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to clear queue")
        }
    }
}

async fn admin_replay_response(state: &AdminState) -> Response<RelayBody> {
    match state.replayer.on_replay_trigger().await {
        Ok(summary) => {
            state.status.record_replay_summary(&summary);
            admin_json_response(StatusCode::OK, &serde_json::json!(summary))
        }
        Err(err) => {
            tracing::warn!("replay pass failed: {err:#}");
            admin_error_response(StatusCode::INTERNAL_SERVER_ERROR, "replay pass failed")
        }
    }
}

fn admin_json_response(status: StatusCode, value: &serde_json::Value) -> Response<RelayBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(boxed_full(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn admin_error_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    admin_json_response(status, &serde_json::json!({ "error": message }))
}
