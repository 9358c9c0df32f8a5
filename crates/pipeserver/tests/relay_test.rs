// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end relay scenarios over an in-memory network.
//!
//! Raw HTTP/1.1 is written straight onto duplex connections; streamed bodies
//! come back with their chunked framing, so body assertions use substrings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use pipeserver::collection::PipeStats;
use pipeserver::server::{respond, AppState};
use relayhttp::test::{send_request, FakeNetwork};
use relayhttp::Server;

struct Relay {
    network: FakeNetwork,
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl Relay {
    async fn start() -> Arc<Self> {
        let network = FakeNetwork::new();
        let addr: SocketAddr = "198.51.100.1:80".parse().unwrap();
        let state = AppState::new("http://relay.test/");
        let connections = network.listen(addr).unwrap();

        let handler_state = state.clone();
        tokio::spawn(async move {
            let server = Server::new(64);
            server
                .serve(connections, move |request, _peer| {
                    let state = handler_state.clone();
                    async move { respond(state, request).await }
                })
                .await;
        });

        Arc::new(Self {
            network,
            state,
            addr,
        })
    }

    /// One complete request/response exchange.
    async fn request(&self, request: impl AsRef<str>) -> String {
        let connection = self.network.connect(self.addr).await.unwrap();
        send_request(connection, request).await.unwrap()
    }

    /// A connection with room to buffer a streamed response while the test
    /// orchestrates other endpoints.
    async fn open(&self) -> DuplexStream {
        let client_addr = "203.0.113.254:12345".parse().unwrap();
        self.network
            .connect_from(self.addr, client_addr, 64 * 1024)
            .await
            .unwrap()
    }

    async fn wait_for_active(&self, what: &str, predicate: impl Fn(&PipeStats) -> bool) {
        for _ in 0..1000 {
            if predicate(&self.state.pipes.active_stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: relay.test\r\n\r\n")
}

fn post(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: relay.test\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn home_page_advertises_a_fresh_pipe() {
    let relay = Relay::start().await;
    let response = relay.request(get("/")).await;
    assert!(response.starts_with("HTTP/1.1 200 "));
    assert!(response.contains("http://relay.test/"));
    assert!(response.contains("Maximum upload size: 64 MB"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_returns_a_key_url() {
    let relay = Relay::start().await;
    let response = relay.request(get("/new")).await;
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let key = body.strip_prefix("http://relay.test/").unwrap();
    assert_eq!(key.len(), 8);
    assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn robots_are_kept_out() {
    let relay = Relay::start().await;
    let response = relay.request(get("/robots.txt")).await;
    assert!(response.contains("User-agent: *\nDisallow: /"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preflight_allows_cross_origin_use() {
    let relay = Relay::start().await;
    let response = relay
        .request("OPTIONS /anything HTTP/1.1\r\nHost: relay.test\r\n\r\n")
        .await;
    assert!(response.starts_with("HTTP/1.1 200 "));
    assert!(response.contains("access-control-allow-origin: *"));
    assert!(response.contains("access-control-allow-methods: POST, GET, OPTIONS, PUT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_methods_on_a_key_are_rejected() {
    let relay = Relay::start().await;
    let response = relay
        .request("DELETE /abc HTTP/1.1\r\nHost: relay.test\r\n\r\n")
        .await;
    assert!(response.starts_with("HTTP/1.1 404 "));
    assert!(response.contains("Invalid Method"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paths_that_are_not_keys_are_not_found() {
    let relay = Relay::start().await;
    for path in ["/no/such", "/abc-def", "/abc.txt"] {
        let response = relay.request(get(path)).await;
        assert!(response.starts_with("HTTP/1.1 404 "), "for {path}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declared_oversize_uploads_are_refused() {
    let relay = Relay::start().await;
    let response = relay
        .request(
            "POST /k HTTP/1.1\r\nHost: relay.test\r\nContent-Length: 67108865\r\n\r\n",
        )
        .await;
    assert!(response.contains("HTTP/1.1 413 "));
    assert!(response.contains("Request body too large"));
}

// S1: one sender, two receivers, everyone sees the bytes, EOF tears it down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_sender_fans_out_to_two_receivers() {
    let relay = Relay::start().await;

    let receivers: Vec<_> = (0..2)
        .map(|_| {
            let relay = relay.clone();
            tokio::spawn(async move { relay.request(get("/k")).await })
        })
        .collect();
    relay
        .wait_for_active("two receivers", |s| s.receiver_count == 2)
        .await;

    let sender = relay.request(post("/k", "hello")).await;
    assert!(sender.starts_with("HTTP/1.1 200 "));

    for receiver in receivers {
        let response = receiver.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 "));
        assert!(response.contains("x-content-type-options: nosniff"));
        assert!(response.contains("access-control-allow-origin: *"));
        assert!(response.contains("hello"));
    }

    relay
        .wait_for_active("pipe teardown", |s| s.pipe_count == 0)
        .await;
    assert_eq!(relay.state.pipes.global_stats().bytes_sent, 5);
}

// S2: sending with nobody listening succeeds and the bytes evaporate.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_with_no_receivers_discards_the_bytes() {
    let relay = Relay::start().await;
    let response = relay.request(post("/k", "data")).await;
    assert!(response.starts_with("HTTP/1.1 200 "));

    relay
        .wait_for_active("pipe teardown", |s| s.pipe_count == 0)
        .await;
    assert_eq!(relay.state.pipes.global_stats().bytes_sent, 4);
}

// S3: fail-mode send is refused when nobody is listening.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_mode_send_requires_a_receiver() {
    let relay = Relay::start().await;
    let response = relay.request(post("/k?mode=fail", "data")).await;
    assert!(response.contains("HTTP/1.1 417 "));
    assert!(response.contains("No receivers connected"));
    assert_eq!(relay.state.pipes.global_stats().bytes_sent, 0);
}

// S4: fail-mode receive is refused when nobody is sending.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_mode_recv_requires_a_sender() {
    let relay = Relay::start().await;
    let response = relay.request(get("/k?mode=fail")).await;
    assert!(response.contains("HTTP/1.1 500 "));
    assert!(response.contains("No senders connected"));
}

// S5: a block-mode sender parks until a receiver turns up.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_sender_waits_for_a_receiver() {
    let relay = Relay::start().await;

    let sender = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.request(post("/k?mode=block", "x")).await })
    };
    relay
        .wait_for_active("parked sender", |s| s.sender_count == 1)
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        relay.state.pipes.global_stats().bytes_sent,
        0,
        "nothing may flow before a receiver attaches"
    );

    let receiver = relay.request(get("/k")).await;
    assert!(receiver.starts_with("HTTP/1.1 200 "));
    let receiver_body = receiver.split("\r\n\r\n").nth(1).unwrap();
    assert!(receiver_body.contains('x'));

    let sender = sender.await.unwrap();
    assert!(sender.starts_with("HTTP/1.1 200 "));
}

// A parked block-mode sender must notice its client giving up and detach,
// rather than holding the pipe until a receiver or the 24 h ceiling.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_sender_detaches_when_its_client_disconnects() {
    let relay = Relay::start().await;

    let mut sender = relay.open().await;
    sender
        .write_all(
            b"POST /k?mode=block HTTP/1.1\r\nHost: relay.test\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
    relay
        .wait_for_active("parked sender", |s| s.sender_count == 1)
        .await;

    // the client goes away mid-upload, before any receiver ever attaches
    drop(sender);

    relay
        .wait_for_active("sender teardown", |s| s.pipe_count == 0)
        .await;
    assert_eq!(relay.state.pipes.global_stats().bytes_sent, 0);
}

// Data a block-mode sender streams while parked is held and delivered once a
// receiver attaches, along with everything sent afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_delivers_data_from_before_and_after_the_receiver() {
    let relay = Relay::start().await;

    let mut sender = relay.open().await;
    sender
        .write_all(
            b"POST /k?mode=block HTTP/1.1\r\nHost: relay.test\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
    sender.write_all(b"1\r\na\r\n").await.unwrap();
    relay
        .wait_for_active("parked sender", |s| s.sender_count == 1)
        .await;

    let receiver = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.request(get("/k")).await })
    };
    relay
        .wait_for_active("both halves attached", |s| s.receiver_count == 2)
        .await;

    sender.write_all(b"1\r\nb\r\n").await.unwrap();
    sender.write_all(b"0\r\n\r\n").await.unwrap();
    sender.shutdown().await.unwrap();

    let mut sender_response = String::new();
    sender.read_to_string(&mut sender_response).await.unwrap();
    assert!(sender_response.starts_with("HTTP/1.1 200 "));

    let receiver = receiver.await.unwrap();
    let body = receiver.split("\r\n\r\n").nth(1).unwrap();
    assert!(body.contains('a'));
    assert!(body.contains('b'));
}

// S6: two interactive peers chat; a plain observer sees only raw bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactive_chat_prefixes_and_suppresses_self_echo() {
    let relay = Relay::start().await;
    let chunked_put =
        |user: &str| format!("PUT /k?i&user={user} HTTP/1.1\r\nHost: relay.test\r\nTransfer-Encoding: chunked\r\n\r\n");

    let mut b = relay.open().await;
    b.write_all(chunked_put("b").as_bytes()).await.unwrap();
    relay
        .wait_for_active("b attached", |s| s.receiver_count == 1)
        .await;

    let mut a = relay.open().await;
    a.write_all(chunked_put("a").as_bytes()).await.unwrap();
    relay
        .wait_for_active("a attached", |s| s.receiver_count == 2)
        .await;

    let observer = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.request(get("/k")).await })
    };
    relay
        .wait_for_active("observer attached", |s| s.receiver_count == 3)
        .await;

    // a says hi: one chunk of "hi\n"
    a.write_all(b"3\r\nhi\n\r\n").await.unwrap();
    relay
        .wait_for_active("chat line delivered", |s| s.bytes_sent == 3)
        .await;

    // a hangs up cleanly; its EOF closes every receiver on the pipe
    a.write_all(b"0\r\n\r\n").await.unwrap();
    a.shutdown().await.unwrap();
    b.write_all(b"0\r\n\r\n").await.unwrap();
    b.shutdown().await.unwrap();

    let mut a_response = String::new();
    a.read_to_string(&mut a_response).await.unwrap();
    let mut b_response = String::new();
    b.read_to_string(&mut b_response).await.unwrap();
    let observer = observer.await.unwrap();

    // b hears about both arrivals and gets the prefixed line
    assert!(b_response.contains("b: connected\n"));
    assert!(b_response.contains("a: connected\n"));
    assert!(b_response.contains("a: hi\n"));

    // a's own bytes are not echoed back, but its own arrival is
    assert!(a_response.contains("a: connected\n"));
    assert!(!a_response.contains("a: hi"));

    // the plain observer sees the raw line and none of the system chatter
    assert!(observer.contains("hi\n"));
    assert!(!observer.contains("connected"));
}

// Cumulative counters survive pipe teardown; active counters do not.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_page_reports_active_and_total() {
    let relay = Relay::start().await;

    relay.request(post("/k", "12345678")).await;
    relay
        .wait_for_active("pipe teardown", |s| s.pipe_count == 0)
        .await;

    let response = relay.request(get("/stats")).await;
    assert!(response.contains("Connected Pipes:        0"));
    assert!(response.contains("Total Pipes:            1"));
    assert!(response.contains("Total Senders:          1"));
    assert!(response.contains("Total Sent:             8 (0 MB)"));
}
