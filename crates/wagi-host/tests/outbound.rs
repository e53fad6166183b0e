//! Integration tests for the `wasi_experimental_http` host functions.
//!
//! These tests drive a real guest module against a local axum server:
//! - request and status/handle write-back
//! - header lookup and full header listing
//! - sequential body reads
//! - handle release

use std::net::SocketAddr;

use axum::Router;
use axum::http::header::HeaderName;
use axum::routing::get;
use wagi_host::{HttpProxy, Permissions, ProxyError, add_to_linker};
use wasmtime::{Engine, Instance, Linker, Module, Store};

struct Ctx {
    http: Option<HttpProxy>,
}

const GUEST: &str = r#"
    (module
        (import "wasi_experimental_http" "req"
            (func $req (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
        (import "wasi_experimental_http" "header_get"
            (func $header_get (param i32 i32 i32 i32 i32 i32) (result i32)))
        (import "wasi_experimental_http" "headers_get_all"
            (func $headers_get_all (param i32 i32 i32 i32) (result i32)))
        (import "wasi_experimental_http" "body_read"
            (func $body_read (param i32 i32 i32 i32) (result i32)))
        (import "wasi_experimental_http" "close"
            (func $close (param i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 256) "GET")
        (data (i32.const 512) "x-test")

        ;; url is written by the host at offset 0
        (func (export "do_req") (param $url_len i32) (result i32)
            (call $req
                (i32.const 0) (local.get $url_len)
                (i32.const 256) (i32.const 3)
                (i32.const 0) (i32.const 0)
                (i32.const 0) (i32.const 0)
                (i32.const 300) (i32.const 304)))
        (func (export "status") (result i32)
            (i32.load16_u (i32.const 300)))
        (func (export "handle") (result i32)
            (i32.load (i32.const 304)))
        (func (export "get_header") (param $h i32) (param $cap i32) (result i32)
            (call $header_get (local.get $h)
                (i32.const 512) (i32.const 6)
                (i32.const 600) (local.get $cap)
                (i32.const 308)))
        (func (export "get_all") (param $h i32) (result i32)
            (call $headers_get_all (local.get $h) (i32.const 1024) (i32.const 1024) (i32.const 308)))
        (func (export "read_body") (param $h i32) (param $cap i32) (result i32)
            (call $body_read (local.get $h) (i32.const 4096) (local.get $cap) (i32.const 308)))
        (func (export "written") (result i32)
            (i32.load (i32.const 308)))
        (func (export "close") (param $h i32) (result i32)
            (call $close (local.get $h)))
    )
"#;

async fn start_upstream() -> SocketAddr {
    let app = Router::new().route(
        "/",
        get(|| async {
            (
                [(HeaderName::from_static("x-test"), "yes")],
                "hello from upstream",
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn guest(allowed: &str, max_open: u32) -> (Store<Ctx>, Instance) {
    let engine = Engine::default();
    let mut linker = Linker::new(&engine);
    add_to_linker(&mut linker, |c: &mut Ctx| c.http.as_mut()).unwrap();

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let perms = Permissions::builder()
        .allow_uris([allowed])
        .max_open_responses(max_open)
        .build();
    let mut store = Store::new(
        &engine,
        Ctx {
            http: Some(HttpProxy::new(client, perms)),
        },
    );
    let module = Module::new(&engine, GUEST).unwrap();
    let instance = linker.instantiate(&mut store, &module).unwrap();
    (store, instance)
}

fn call0(store: &mut Store<Ctx>, instance: &Instance, name: &str) -> i32 {
    instance
        .get_typed_func::<(), i32>(&mut *store, name)
        .unwrap()
        .call(&mut *store, ())
        .unwrap()
}

fn call1(store: &mut Store<Ctx>, instance: &Instance, name: &str, a: i32) -> i32 {
    instance
        .get_typed_func::<i32, i32>(&mut *store, name)
        .unwrap()
        .call(&mut *store, a)
        .unwrap()
}

fn call2(store: &mut Store<Ctx>, instance: &Instance, name: &str, a: i32, b: i32) -> i32 {
    instance
        .get_typed_func::<(i32, i32), i32>(&mut *store, name)
        .unwrap()
        .call(&mut *store, (a, b))
        .unwrap()
}

fn send(store: &mut Store<Ctx>, instance: &Instance, url: &str) -> i32 {
    let memory = instance.get_memory(&mut *store, "memory").unwrap();
    memory.write(&mut *store, 0, url.as_bytes()).unwrap();
    call1(store, instance, "do_req", i32::try_from(url.len()).unwrap())
}

fn read(store: &mut Store<Ctx>, instance: &Instance, offset: usize, len: usize) -> Vec<u8> {
    let memory = instance.get_memory(&mut *store, "memory").unwrap();
    memory.data(&*store)[offset..offset + len].to_vec()
}

// ============================================================================
// Test: Full Request Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_request_lifecycle() {
    let addr = start_upstream().await;

    tokio::task::spawn_blocking(move || {
        let (mut store, instance) = guest("http://127.0.0.1", 10);
        let url = format!("http://{addr}/");

        assert_eq!(send(&mut store, &instance, &url), 0);
        assert_eq!(call0(&mut store, &instance, "status"), 200);
        let handle = call0(&mut store, &instance, "handle");
        assert_eq!(handle, 1);

        // Header lookup
        assert_eq!(call2(&mut store, &instance, "get_header", handle, 64), 0);
        let written = call0(&mut store, &instance, "written");
        assert_eq!(written, 3);
        assert_eq!(read(&mut store, &instance, 600, 3), b"yes");

        // Buffer too small for the value
        assert_eq!(
            call2(&mut store, &instance, "get_header", handle, 1),
            ProxyError::BufferTooSmall.code()
        );

        // All headers
        assert_eq!(call1(&mut store, &instance, "get_all", handle), 0);
        let written = usize::try_from(call0(&mut store, &instance, "written")).unwrap();
        let all = String::from_utf8(read(&mut store, &instance, 1024, written)).unwrap();
        assert!(all.contains("x-test:yes\n"), "headers were: {all}");

        // Body in two reads, then end of stream
        assert_eq!(call2(&mut store, &instance, "read_body", handle, 5), 0);
        assert_eq!(call0(&mut store, &instance, "written"), 5);
        assert_eq!(read(&mut store, &instance, 4096, 5), b"hello");

        assert_eq!(call2(&mut store, &instance, "read_body", handle, 256), 0);
        let written = usize::try_from(call0(&mut store, &instance, "written")).unwrap();
        assert_eq!(read(&mut store, &instance, 4096, written), b" from upstream");

        assert_eq!(call2(&mut store, &instance, "read_body", handle, 256), 0);
        assert_eq!(call0(&mut store, &instance, "written"), 0);

        // Release
        assert_eq!(call1(&mut store, &instance, "close", handle), 0);
        assert_eq!(
            call1(&mut store, &instance, "close", handle),
            ProxyError::InvalidHandle.code()
        );
    })
    .await
    .unwrap();
}

// ============================================================================
// Test: Session Cap
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_session_cap_and_monotonic_handles() {
    let addr = start_upstream().await;

    tokio::task::spawn_blocking(move || {
        let (mut store, instance) = guest("http://127.0.0.1", 1);
        let url = format!("http://{addr}/");

        assert_eq!(send(&mut store, &instance, &url), 0);
        let first = call0(&mut store, &instance, "handle");

        assert_eq!(
            send(&mut store, &instance, &url),
            ProxyError::TooManySessions.code()
        );

        // Closing frees a slot; the next handle is never reused
        assert_eq!(call1(&mut store, &instance, "close", first), 0);
        assert_eq!(send(&mut store, &instance, &url), 0);
        let second = call0(&mut store, &instance, "handle");
        assert!(second > first);
    })
    .await
    .unwrap();
}

// ============================================================================
// Test: Allow-list
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_destination_not_allowed() {
    let addr = start_upstream().await;

    tokio::task::spawn_blocking(move || {
        let (mut store, instance) = guest("http://localhost", 10);
        let url = format!("http://{addr}/");
        assert_eq!(
            send(&mut store, &instance, &url),
            ProxyError::DestinationNotAllowed.code()
        );
    })
    .await
    .unwrap();
}
