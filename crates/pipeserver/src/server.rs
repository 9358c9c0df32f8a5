// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP dispatch: maps method + path + query onto broker operations

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use bytes::BytesMut;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use relayhttp::response::{self, ErrResponse, GenericResponse, ResponseResult};
use relayhttp::signal::{fast_shutdown_requested, graceful_shutdown_requested};
use relayhttp::Server;

use crate::collection::PipeCollection;
use crate::pipe::Pipe;
use crate::receiver::{CloseNotify, ReceiveWriter, Receiver};
use crate::sender::Sender;
use crate::templates::{render, HomePage, StatsPage};
use crate::util::rand_key;
use crate::Opts;

/// Largest request body a sender may upload.
pub const MAX_UPLOAD_MB: u64 = 64;
const MAX_UPLOAD_BYTES: u64 = MAX_UPLOAD_MB * 1024 * 1024;

/// Length of server-generated pipe keys.
pub const KEY_SIZE: usize = 8;

/// How long a block-mode sender will wait for a receiver.
const BLOCK_MODE_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Buffers a receiver's sink can hold before writers to its pipe are slowed.
const SINK_DEPTH: usize = 16;

static KEY_PATH: Lazy<Regex> = Lazy::new(|| Regex::new("^/([A-Za-z0-9]+)$").unwrap());

/// Everything the handlers share.
pub struct AppState {
    pub pipes: Arc<PipeCollection>,
    base_url: String,
    max_id: AtomicU64,
}

impl AppState {
    pub fn new(base_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pipes: Arc::new(PipeCollection::new()),
            base_url: base_url.into(),
            max_id: AtomicU64::new(0),
        })
    }

    /// Ids are per-request and monotonic; the sender and receiver halves of
    /// one request share one.
    fn next_id(&self) -> u64 {
        self.max_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Per-request relay options, parsed from the query string and headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PipeParams {
    /// Refuse the request if the other side of the pipe is absent.
    failure: bool,
    /// Send side only: park until a receiver attaches.
    block: bool,
    /// Show this peer connect/disconnect messages and username prefixes.
    interactive: bool,
    username: Option<String>,
}

impl PipeParams {
    fn from_request(uri: &Uri, headers: &HeaderMap) -> Self {
        let mode = str_param(uri, "mode");
        let mode = mode.as_deref();
        Self {
            failure: mode == Some("fail") || flag_param(uri, "f") || flag_param(uri, "fail"),
            block: mode == Some("block") || flag_param(uri, "b") || flag_param(uri, "block"),
            interactive: flag_param(uri, "i") || flag_param(uri, "interactive"),
            username: str_param(uri, "user")
                .filter(|user| !user.is_empty())
                .or_else(|| basic_auth_username(headers)),
        }
    }
}

fn str_param(uri: &Uri, name: &str) -> Option<String> {
    if let Some(query) = uri.query() {
        for (k, v) in form_urlencoded::parse(query.as_bytes()) {
            if k == name {
                return Some(v.into_owned());
            }
        }
    }
    None
}

fn flag_param(uri: &Uri, name: &str) -> bool {
    str_param(uri, name).is_some()
}

/// Pull a username out of an `Authorization: Basic` header, so `curl -u name:`
/// works as an alternative to `?user=name`.
fn basic_auth_username(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let username = decoded.split(':').next().unwrap_or_default();
    (!username.is_empty()).then(|| username.to_owned())
}

/// Route one request.
pub async fn respond(state: Arc<AppState>, request: Request<Incoming>) -> GenericResponse {
    if request.method() == Method::OPTIONS {
        return preflight();
    }
    match request.uri().path() {
        "/" => home(&state),
        "/favicon.ico" => response::empty(),
        "/robots.txt" => response::text(StatusCode::OK, "User-agent: *\nDisallow: /"),
        "/new" => new_key(&state),
        "/stats" => stats(&state),
        path => match KEY_PATH.captures(path) {
            Some(captures) => {
                let key = captures[1].to_owned();
                relay(state, key, request).await
            }
            None => response::not_found(),
        },
    }
}

/// Attach a request to its pipe, on the side its method selects.
async fn relay(state: Arc<AppState>, key: String, request: Request<Incoming>) -> GenericResponse {
    let params = PipeParams::from_request(request.uri(), request.headers());
    let id = state.next_id();
    let result = match *request.method() {
        Method::GET => recv(&state, &key, id, &params, None).await,
        Method::POST | Method::PUT => send(&state, key, id, params, request).await,
        _ => Err(ErrResponse(response::text(
            StatusCode::NOT_FOUND,
            "Invalid Method",
        ))),
    };
    match result {
        Ok(response) | Err(ErrResponse(response)) => response,
    }
}

/// Tracks an attached receiver so no exit path can leak it.
///
/// The owning task ends the attachment with [`detach`](Self::detach), which
/// removes the receiver and announces the departure. If the guard is instead
/// dropped still armed (the request future was abandoned mid-setup), it falls
/// back to a synchronous structural detach with no announcement; `Drop` can't
/// run async code and must stay safe during runtime teardown.
struct ReceiverGuard {
    pipes: Arc<PipeCollection>,
    key: String,
    receiver: Arc<Receiver>,
    armed: bool,
}

impl ReceiverGuard {
    fn new(pipes: Arc<PipeCollection>, key: &str, receiver: Arc<Receiver>) -> Self {
        Self {
            pipes,
            key: key.to_owned(),
            receiver,
            armed: true,
        }
    }

    /// Detach from the pipe and announce the departure.
    async fn detach(mut self) {
        self.armed = false;
        let receiver: Arc<dyn ReceiveWriter> = self.receiver.clone();
        self.pipes.remove_receiver(&self.key, receiver).await;
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pipes.detach_receiver(&self.key, self.receiver.id());
        }
    }
}

/// Detaches its sender when dropped.
struct SenderGuard {
    pipes: Arc<PipeCollection>,
    key: String,
    pipe: Arc<Pipe>,
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        self.pipes.remove_sender(&self.key, &self.pipe);
    }
}

/// Receive from the pipe: attach, then stream whatever arrives until either
/// a sender EOF closes us or the client goes away.
///
/// The response has to be returned before body bytes can flow, so the
/// wait-then-detach lives on a spawned hold task rather than in this handler.
/// `send` passes its detach guard through `extra` so the sender half detaches
/// when the shared request does, after the receiver half.
async fn recv(
    state: &Arc<AppState>,
    key: &str,
    id: u64,
    params: &PipeParams,
    extra: Option<SenderGuard>,
) -> ResponseResult {
    let (sink, frames) = mpsc::channel(SINK_DEPTH);
    let (receiver, close_notify) = Receiver::new(id, params.interactive, params.username.clone(), sink);

    // Guard first: if this request future is dropped mid-attach, the guard
    // still runs and detaching an unattached receiver is a no-op.
    let guard = ReceiverGuard::new(state.pipes.clone(), key, receiver.clone());
    let pipe = state.pipes.add_receiver(key, receiver.clone()).await;

    if params.failure && pipe.sender_count() < 1 {
        guard.detach().await;
        return Err(ErrResponse(relay_headers(response::text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "No senders connected",
        ))));
    }

    tokio::spawn(hold(id, receiver, close_notify, guard, extra));

    Ok(relay_headers(response::stream(frames)))
}

/// Park until the pipe closes us (sender EOF) or the client disconnects,
/// then tear down in the order the original's deferred detaches ran: the
/// receiver leaves (and announces its departure) before the sender half does.
async fn hold(
    id: u64,
    receiver: Arc<Receiver>,
    close_notify: CloseNotify,
    guard: ReceiverGuard,
    extra: Option<SenderGuard>,
) {
    tokio::select! {
        _ = close_notify => debug!("receiver {id}: closed by sender EOF"),
        _ = receiver.disconnected() => debug!("receiver {id}: client disconnected"),
    }
    guard.detach().await;
    drop(extra);
}

/// Send to the pipe: attach as a sender and as a receiver, then stream the
/// body in on its own task. Attaching both halves lets a single bidirectional
/// request also hear the pipe, which is what makes `curl -T. url?i` a chat.
async fn send(
    state: &Arc<AppState>,
    key: String,
    id: u64,
    params: PipeParams,
    request: Request<Incoming>,
) -> ResponseResult {
    let pipe = state.pipes.add_sender(&key);
    let sender_guard = SenderGuard {
        pipes: state.pipes.clone(),
        key: key.clone(),
        pipe: pipe.clone(),
    };

    if params.failure && pipe.receiver_count() < 1 {
        return Err(ErrResponse(response::text(
            StatusCode::EXPECTATION_FAILED,
            "No receivers connected",
        )));
    }

    // Refuse declared-oversize uploads before anything waits on them;
    // chunked uploads are cut off by the Limited wrapper mid-copy instead.
    if let Some(length) = request.body().size_hint().exact() {
        if length > MAX_UPLOAD_BYTES {
            return Err(ErrResponse(response::text(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            )));
        }
    }
    let mut body = Limited::new(request.into_body(), MAX_UPLOAD_BYTES as usize);

    // Block mode: park until a receiver attaches, the ceiling elapses, or the
    // client gives up. No response exists yet, so the only disconnect signal
    // is the request body erroring; the park therefore reads ahead of the
    // copy, holding any frames that arrive early until the pipe has somewhere
    // to put them.
    let mut peeked = BytesMut::new();
    let mut body_done = false;
    if params.block && pipe.receiver_count() < 1 {
        let mut receiver_added = pipe.subscribe_receiver_added();
        // re-check after subscribing; an attach in between would otherwise
        // not wake us
        if pipe.receiver_count() < 1 {
            debug!("sender {id}: parked waiting for a receiver");
            let mut ceiling = pin!(tokio::time::sleep(BLOCK_MODE_CEILING));
            loop {
                tokio::select! {
                    _ = receiver_added.notified() => break,
                    _ = &mut ceiling => return Ok(response::empty()),
                    frame = body.frame(), if !body_done => match frame {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                peeked.extend_from_slice(&data);
                            }
                        }
                        // client disconnected (or blew the cap) while
                        // parked: return without transferring
                        Some(Err(err)) => {
                            debug!("sender {id}: upload dropped while parked: {err}");
                            return Ok(response::empty());
                        }
                        None => body_done = true,
                    },
                }
            }
        }
    }

    // Attach the receiver half before the copy starts: a tiny body could
    // otherwise hit EOF and close the pipe before this request is on it,
    // leaving it parked with nothing left to close it.
    let response = recv(state, &key, id, &params, Some(sender_guard)).await?;

    let sender = Sender::new(pipe, id, params.username.clone());
    let peeked = peeked.freeze();
    tokio::spawn(async move {
        let mut copied = peeked.len() as u64;
        if !peeked.is_empty() {
            sender.write(peeked).await;
        }
        if body_done {
            // the whole upload arrived while parked; this is its clean EOF
            sender.close().await;
        } else {
            copied += sender.copy(body).await;
        }
        debug!("sender {id}: finished after {copied} bytes");
    });

    Ok(response)
}

/// The streaming headers: browsers must not sniff or buffer, and anyone may
/// embed a pipe.
fn relay_headers(mut response: GenericResponse) -> GenericResponse {
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn preflight() -> GenericResponse {
    let mut response = response::empty();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS, PUT"),
    );
    response
}

fn home(state: &AppState) -> GenericResponse {
    let url = format!("{}{}", state.base_url, rand_key(KEY_SIZE));
    render(HomePage {
        url: &url,
        max_upload_mb: MAX_UPLOAD_MB,
    })
}

fn new_key(state: &AppState) -> GenericResponse {
    let url = format!("{}{}", state.base_url, rand_key(KEY_SIZE));
    response::text(StatusCode::OK, url)
}

fn stats(state: &AppState) -> GenericResponse {
    render(StatsPage {
        active: state.pipes.active_stats(),
        global: state.pipes.global_stats(),
    })
}

/// Serve until a shutdown is requested.
pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let state = AppState::new(opts.baseurl.clone());
    let server = Server::new(opts.max_clients);

    info!("Listening on http {}", opts.httpaddr);
    let listener = TcpListener::bind(&opts.httpaddr)
        .await
        .with_context(|| format!("binding {}", opts.httpaddr))?;
    let connections = futures::stream::unfold(listener, |listener| async {
        Some((listener.accept().await, listener))
    });

    let run = server.serve(connections, move |request, _peer| {
        let state = state.clone();
        async move { respond(state, request).await }
    });

    let graceful_shutdown = async {
        graceful_shutdown_requested().await;
        info!("Graceful shutdown requested...");
        server.graceful_shutdown().await;
    };

    let run_until_gracefully_shutdown = async { tokio::join!(run, graceful_shutdown) };

    tokio::select! {
        biased;
        _ = fast_shutdown_requested() => info!("Fast shutdown requested..."),
        _ = run_until_gracefully_shutdown => {}
    };

    Ok(())
}
