use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri, body::Incoming, service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::mpsc};

use storeforward::queue::Queue;

#[derive(Debug)]
struct CapturedRequest {
    method: Method,
    uri: Uri,
    body: Bytes,
}

#[tokio::test]
async fn replay_trigger_reissues_queued_requests_and_empties_queue() {
    let (upstream_addr, mut upstream_rx, upstream_join) = spawn_upstream().await;
    let storage_dir = tempfile::tempdir().unwrap();

    let queue = Queue::open(storage_dir.path().join("queue.db")).unwrap();
    queue
        .enqueue(
            &format!("http://{upstream_addr}/replayed/a.json"),
            "POST",
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")],
        )
        .await
        .unwrap();
    queue
        .enqueue(
            &format!("http://{upstream_addr}/replayed/b.json"),
            "PUT",
            vec![Bytes::from_static(b"xyz")],
        )
        .await
        .unwrap();

    let relay = serve_relay(upstream_addr, storage_dir.path(), "").await;
    let admin_addr = relay.admin_listen_addr.expect("admin should be listening");

    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 2);
    assert_eq!(summary["failed"], 0);

    let first = upstream_rx.recv().await.unwrap();
    assert_eq!(first.method, Method::POST);
    assert_eq!(first.uri.path(), "/replayed/a.json");
    assert_eq!(&first.body[..], b"abc");

    let second = upstream_rx.recv().await.unwrap();
    assert_eq!(second.method, Method::PUT);
    assert_eq!(second.uri.path(), "/replayed/b.json");
    assert_eq!(&second.body[..], b"xyz");

    assert_eq!(queue.count().await.unwrap(), 0);

    // A second pass with no intervening enqueue finds an empty queue and
    // issues no calls.
    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 0);
    assert_eq!(summary["failed"], 0);
    assert!(upstream_rx.try_recv().is_err());

    relay.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn deferred_request_is_replayed_once_upstream_returns() {
    let dead_addr = reserve_dead_addr().await;
    let storage_dir = tempfile::tempdir().unwrap();

    let relay = serve_relay(dead_addr, storage_dir.path(), "").await;
    let admin_addr = relay.admin_listen_addr.expect("admin should be listening");
    let client = http_client();

    let relay_uri: Uri = format!("http://{}/form.json", relay.listen_addr)
        .parse()
        .unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(relay_uri)
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();
    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    // The origin comes back on the address the queued record points at.
    let (mut upstream_rx, upstream_join) = spawn_upstream_at(dead_addr).await;

    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 1);
    assert_eq!(summary["failed"], 0);

    let captured = upstream_rx.recv().await.unwrap();
    assert_eq!(captured.method, Method::POST);
    assert_eq!(captured.uri.path(), "/form.json");
    assert_eq!(&captured.body[..], b"payload");

    let queue = Queue::open(storage_dir.path().join("queue.db")).unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);

    relay.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn failed_replays_are_acknowledged_with_drained_ack() {
    let dead_addr = reserve_dead_addr().await;
    let storage_dir = tempfile::tempdir().unwrap();

    let queue = Queue::open(storage_dir.path().join("queue.db")).unwrap();
    queue
        .enqueue(
            &format!("http://{dead_addr}/lost.json"),
            "POST",
            vec![Bytes::from_static(b"lost")],
        )
        .await
        .unwrap();

    let relay = serve_relay(dead_addr, storage_dir.path(), "").await;
    let admin_addr = relay.admin_listen_addr.expect("admin should be listening");

    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 1);
    assert_eq!(summary["failed"], 1);

    // Drained acknowledgment drops the record whatever the replay outcome.
    assert_eq!(queue.count().await.unwrap(), 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn delivered_ack_keeps_failed_records_queued() {
    let dead_addr = reserve_dead_addr().await;
    let storage_dir = tempfile::tempdir().unwrap();

    let queue = Queue::open(storage_dir.path().join("queue.db")).unwrap();
    queue
        .enqueue(
            &format!("http://{dead_addr}/retained.json"),
            "POST",
            vec![Bytes::from_static(b"retained")],
        )
        .await
        .unwrap();

    let relay = serve_relay(
        dead_addr,
        storage_dir.path(),
        "\n[replay]\nack = \"delivered\"\n",
    )
    .await;
    let admin_addr = relay.admin_listen_addr.expect("admin should be listening");

    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 1);
    assert_eq!(summary["failed"], 1);
    assert_eq!(queue.count().await.unwrap(), 1);

    // Once the origin is reachable the retained record drains on the next pass.
    let (mut upstream_rx, upstream_join) = spawn_upstream_at(dead_addr).await;

    let summary = trigger_replay(admin_addr).await;
    assert_eq!(summary["attempted"], 1);
    assert_eq!(summary["failed"], 0);

    let captured = upstream_rx.recv().await.unwrap();
    assert_eq!(&captured.body[..], b"retained");
    assert_eq!(queue.count().await.unwrap(), 0);

    relay.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn scheduled_replay_timer_drains_the_queue() {
    let (upstream_addr, mut upstream_rx, upstream_join) = spawn_upstream().await;
    let storage_dir = tempfile::tempdir().unwrap();

    let queue = Queue::open(storage_dir.path().join("queue.db")).unwrap();
    queue
        .enqueue(
            &format!("http://{upstream_addr}/scheduled.json"),
            "POST",
            vec![Bytes::from_static(b"tick")],
        )
        .await
        .unwrap();

    let relay = serve_relay(
        upstream_addr,
        storage_dir.path(),
        "\n[replay]\ninterval_secs = 1\n",
    )
    .await;

    let captured = tokio::time::timeout(Duration::from_secs(10), upstream_rx.recv())
        .await
        .expect("scheduled replay should fire")
        .unwrap();
    assert_eq!(captured.uri.path(), "/scheduled.json");
    assert_eq!(&captured.body[..], b"tick");

    let mut queue_depth = queue.count().await.unwrap();
    for _ in 0..50 {
        if queue_depth == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue_depth = queue.count().await.unwrap();
    }
    assert_eq!(queue_depth, 0);

    relay.shutdown().await;
    upstream_join.abort();
}

async fn serve_relay(
    upstream_addr: SocketAddr,
    storage_path: &std::path::Path,
    replay_section: &str,
) -> storeforward::relay::RelayHandle {
    let config_toml = format!(
        r#"
[relay]
listen = "127.0.0.1:0"
upstream = "http://{upstream_addr}"
admin_port = 0

[offline]
rule = {{ kind = "suffix", value = ".json" }}

[storage]
path = "{}"
{replay_section}
"#,
        storage_path.display()
    );
    let config = storeforward::config::Config::from_toml_str(&config_toml).unwrap();
    storeforward::relay::serve(&config).await.unwrap()
}

async fn trigger_replay(admin_addr: SocketAddr) -> serde_json::Value {
    let client = http_client();
    let uri: Uri = format!("http://{admin_addr}/replay").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();

    let res = client.request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body_bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body_bytes).unwrap()
}

fn http_client() -> Client<HttpConnector, Full<Bytes>> {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

async fn reserve_dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn spawn_upstream() -> (
    SocketAddr,
    mpsc::Receiver<CapturedRequest>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (rx, join) = run_upstream(listener).await;
    (addr, rx, join)
}

async fn spawn_upstream_at(
    addr: SocketAddr,
) -> (mpsc::Receiver<CapturedRequest>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind(addr).await.unwrap();
    run_upstream(listener).await
}

async fn run_upstream(
    listener: TcpListener,
) -> (mpsc::Receiver<CapturedRequest>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<CapturedRequest>(16);

    let join = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body_bytes = body.collect().await.unwrap().to_bytes();
                        tx.send(CapturedRequest {
                            method: parts.method,
                            uri: parts.uri,
                            body: body_bytes,
                        })
                        .await
                        .unwrap();

                        let mut res = Response::new(Full::new(Bytes::from_static(b"ok")));
                        *res.status_mut() = StatusCode::OK;
                        Ok::<_, hyper::Error>(res)
                    }
                });

                let builder = ConnectionBuilder::new(TokioExecutor::new());
                let _ = builder.serve_connection(io, service).await;
            });
        }
    });

    (rx, join)
}
