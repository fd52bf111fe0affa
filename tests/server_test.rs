//! End-to-end tests over real TCP connections: routing, error envelopes,
//! graceful close, and status snapshots.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use quiesce::{FilesConfig, HttpConfig, Response, Server, ServerConfig, ServerError};

use common::{get, init_tracing, post_json, read_response, roundtrip};

fn echo_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |req| async move {
        let mut value: serde_json::Value = req.json()?;
        let foo = value["foo"].as_i64().unwrap_or(0);
        value["bar"] = json!(foo + 1);
        Ok(Response::ok().json(&value))
    }))
}

#[tokio::test]
async fn echo_handler_round_trip() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(&mut stream, &post_json("/", r#"{"foo":42}"#)).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.body_json(), json!({"foo": 42, "bar": 43}));

    drop(stream);
    server.close().await;

    let status = server.status();
    assert!(!status.listener_active);
    assert_eq!(status.active_connections, 0);
    assert_eq!(status.active_requests, 0);
}

#[tokio::test]
async fn keep_alive_serves_multiple_requests() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    for foo in [1, 2, 3] {
        let body = format!(r#"{{"foo":{foo}}}"#);
        let response = roundtrip(&mut stream, &post_json("/", &body)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_json()["bar"], json!(foo + 1));
    }

    server.close().await;
}

#[tokio::test]
async fn handler_error_is_isolated_to_its_request() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |req| async move {
        if req.path() == "/fail" {
            return Err("handler exploded".into());
        }
        Ok(Response::ok().body("fine"))
    }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let failed = roundtrip(&mut stream, &get("/fail")).await;
    assert_eq!(failed.status, 500);
    assert_eq!(failed.body_json(), json!({"error": "500 Server Error"}));

    // same connection keeps working
    let ok = roundtrip(&mut stream, &get("/ok")).await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, b"fine");

    server.close().await;
}

#[tokio::test]
async fn failure_on_one_connection_leaves_another_unaffected() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |req| async move {
        sleep(Duration::from_millis(50)).await;
        if req.path() == "/failure" {
            return Err("handler exploded".into());
        }
        Ok(Response::ok().body("ok"))
    }));
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr();

    let failing = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, &get("/failure")).await
    });
    let succeeding = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, &get("/success")).await
    });

    let (failed, ok) = (failing.await.unwrap(), succeeding.await.unwrap());
    assert_eq!(failed.status, 500);
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, b"ok");

    server.close().await;
}

#[tokio::test]
async fn panicking_handler_maps_to_500() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |req| async move {
        if req.path() == "/panic" {
            panic!("boom");
        }
        Ok(Response::ok())
    }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let response = roundtrip(&mut stream, &get("/panic")).await;
    assert_eq!(response.status, 500);

    let ok = roundtrip(&mut stream, &get("/fine")).await;
    assert_eq!(ok.status, 200);

    server.close().await;
}

#[tokio::test]
async fn unmatched_path_gets_404_envelope() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0")
        .http(HttpConfig::new("/api", |_req| async { Ok(Response::ok()) }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let response = roundtrip(&mut stream, &get("/nope")).await;
    assert_eq!(response.status, 404);
    assert_eq!(
        response.body_json(),
        json!({"error": "404 Not Found", "path": "/nope"})
    );

    server.close().await;
}

#[tokio::test]
async fn root_redirect() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0")
        .root_redirect("/app/")
        .http(HttpConfig::new("/api", |_req| async { Ok(Response::ok()) }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let response = roundtrip(&mut stream, &get("/")).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/app/"));

    server.close().await;
}

#[tokio::test]
async fn malformed_request_gets_400_and_close() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let response = roundtrip(&mut stream, "this is not http\r\n\r\n").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("connection"), Some("close"));

    server.close().await;
}

#[tokio::test]
async fn close_waits_for_inflight_handlers() {
    init_tracing();
    let completed = Arc::new(AtomicUsize::new(0));
    let handler_completed = Arc::clone(&completed);

    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", move |_req| {
        let completed = Arc::clone(&handler_completed);
        async move {
            sleep(Duration::from_millis(200)).await;
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(Response::ok())
        }
    }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, get("/slow").as_bytes())
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(completed.load(Ordering::SeqCst), 0);
    server.close().await;
    // close resolved only after the slow handler finished
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pipelined_responses_keep_request_order() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |req| async move {
        if req.path() == "/slow" {
            sleep(Duration::from_millis(150)).await;
            return Ok(Response::ok().body("slow"));
        }
        Ok(Response::ok().body("fast"))
    }));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    // both requests on the wire at once; the fast handler finishes first
    let pipelined = format!("{}{}", get("/slow"), get("/fast"));
    stream.write_all(pipelined.as_bytes()).await.unwrap();

    let first = read_response(&mut stream).await;
    let second = read_response(&mut stream).await;
    assert_eq!(first.body, b"slow");
    assert_eq!(second.body, b"fast");

    server.close().await;
}

#[tokio::test]
async fn close_immediately_after_bind_resolves() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();
    // no connection was ever made; close must still resolve promptly
    timeout(Duration::from_secs(5), server.close())
        .await
        .expect("close hung");
    assert!(!server.status().listener_active);
}

#[tokio::test]
async fn done_resolves_for_late_waiters() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();
    server.close().await;

    // waiters subscribing after the close completed still resolve
    timeout(Duration::from_secs(5), server.done())
        .await
        .expect("done hung");
    timeout(Duration::from_secs(5), server.close())
        .await
        .expect("repeat close hung");
}

#[tokio::test]
async fn close_is_idempotent_and_concurrent() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();

    let a = server.clone();
    let b = server.clone();
    let c = server.clone();
    let (first, second, third, _) = tokio::join!(
        tokio::spawn(async move { a.close().await }),
        tokio::spawn(async move { b.close().await }),
        tokio::spawn(async move { c.close().await }),
        server.done(),
    );
    first.unwrap();
    second.unwrap();
    third.unwrap();

    assert!(server.is_closing());
    assert!(!server.status().listener_active);
}

#[tokio::test]
async fn on_close_callbacks_run_after_drain() {
    init_tracing();
    let fired = Arc::new(AtomicUsize::new(0));
    let server = Server::bind(echo_config()).await.unwrap();

    let callback_fired = Arc::clone(&fired);
    server.on_close(move || {
        callback_fired.fetch_add(1, Ordering::SeqCst);
    });

    server.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // a second close does not re-run callbacks
    server.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_reflects_inflight_activity() {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0").http(HttpConfig::new("/", |_req| async {
        sleep(Duration::from_millis(300)).await;
        Ok(Response::ok())
    }));
    let server = Server::bind(config).await.unwrap();

    let status = server.status();
    assert!(status.listener_active);
    assert!(status.listener_task_active);
    assert_eq!(status.active_connections, 0);

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, get("/slow").as_bytes())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let status = server.status();
    assert_eq!(status.active_connections, 1);
    assert_eq!(status.active_requests, 1);
    assert_eq!(status.active_request_tasks_running, 1);

    server.close().await;
}

#[tokio::test]
async fn bind_error_carries_address() {
    init_tracing();
    let server = Server::bind(echo_config()).await.unwrap();
    let addr = server.local_addr().to_string();

    let conflict = Server::bind(ServerConfig::new(&addr)).await;
    match conflict {
        Err(ServerError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
        other => panic!("expected bind error, got {other:?}"),
    }

    server.close().await;
}

#[tokio::test]
async fn serves_files_and_rejects_traversal() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("quiesce-files-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("hello.txt"), "hello files").unwrap();

    let config =
        ServerConfig::new("127.0.0.1:0").files(FilesConfig::new("/static", &dir));
    let server = Server::bind(config).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let ok = roundtrip(&mut stream, &get("/static/hello.txt")).await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.header("content-type"), Some("text/plain; charset=utf-8"));
    assert_eq!(ok.body, b"hello files");

    let missing = roundtrip(&mut stream, &get("/static/missing.txt")).await;
    assert_eq!(missing.status, 404);

    let traversal = roundtrip(&mut stream, &get("/static/../secret")).await;
    assert_eq!(traversal.status, 400);

    let encoded_traversal = roundtrip(&mut stream, &get("/static/%2e%2e/secret")).await;
    assert_eq!(encoded_traversal.status, 400);

    server.close().await;
    let _ = std::fs::remove_dir_all(&dir);
}
