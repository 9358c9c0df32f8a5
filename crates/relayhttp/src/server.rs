// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::nursery::Nursery;
use crate::response::GenericResponse;

/// Errors that can occur while serving a connection
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    /// Indicates the server was unable to accept a connection.
    #[error("could not accept connection: {0}")]
    Accept(#[from] std::io::Error),
    /// Indicates the server refused a new connection because too many are already open.
    #[error("too overloaded to serve {peer_addr}")]
    Overloaded {
        /// Connection's peer IP address and port
        peer_addr: SocketAddr,
    },
    /// Indicates the server encountered an error while attempting to serve HTTP to a request.
    #[error("error serving {peer_addr} connection: {source}")]
    Http {
        /// Connection's peer IP address and port
        peer_addr: SocketAddr,
        /// Underlying cause
        source: hyper::Error,
    },
}

/// Serves HTTP connections while allowing for graceful shutdowns.
///
/// Relay connections are long-lived (receivers park until a sender closes
/// their pipe), so every connection gets its own task and the connection cap
/// is the only admission control.
pub struct Server {
    concurrent_requests: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a new [`Server`].
    ///
    /// `max_connections` is the maximum number of simultaneous connections that may be handled
    /// across all [`serve`](Self::serve) calls before they start responding with 503s.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_requests = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_requests,
            shutdown,
        }
    }

    /// Serve incoming `connections` with `respond`.
    ///
    /// `connections` is a stream of connection-like objects, and `respond` maps HTTP requests
    /// to responses. Each connection is handled in its own asynchronous task.
    /// [`serve`](Self::serve) resolves after [`graceful_shutdown`](Self::graceful_shutdown)
    /// has been called (or `connections` is exhausted) and this invocation has no ongoing
    /// connections.
    ///
    /// If the [`Server`] is already at its `max_connections` limit (see [`new`](Self::new)),
    /// new connections are served a single minimal 503 response.
    ///
    /// # Cancel Safety
    ///
    /// Cancellation is propagated to all connections handled by this call and blocks until
    /// they terminate. Connections handled by other [`serve`](Self::serve) calls are
    /// unaffected.
    pub async fn serve<P, C, R, F>(&self, connections: P, respond: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let respond = move |request: Request<_>, peer_addr| {
            let respond = respond.clone();
            async move {
                info!("Request: {} {}", request.method(), request.uri());
                let response = respond(request, peer_addr).await;
                info!("Response: {}", response.status());
                response
            }
        };

        // This shutdown receiver is what keeps graceful_shutdown from returning so
        // we need it to be the first thing created so it's the last thing destroyed.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        async fn either<T>(f1: impl Future<Output = T>, f2: impl Future<Output = T>) -> T {
            select! {
                biased; // necessary to guarantee we don't handle connections if already shut down
                x1 = f1 => x1,
                x2 = f2 => x2,
            }
        }

        let mut nursery = Nursery::new();

        info!("Started serving");

        // scope is only to force `connections` to be dropped
        {
            let mut connections = pin!(connections);
            while let Some(accepted) = either(&mut was_shutdown, connections.next()).await {
                let (connection, peer_addr) = match accepted {
                    Ok(a) => a,
                    Err(err) => {
                        error!("{}", ConnectionError::Accept(err));
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr=%peer_addr);
                async {
                    info!("Connected.");
                    let log_guard = Guard(Some(|| info!("Disconnected.")));

                    let permit = match self.concurrent_requests.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!("{}", ConnectionError::Overloaded { peer_addr });
                            let _ = respond_with_temporarily_unavailable(connection).await;
                            return;
                        }
                    };

                    let respond = respond.clone();
                    let service =
                        service_fn(move |r| respond(r, peer_addr).map(Ok::<_, Infallible>));
                    let mut shutdown_receiver = self.shutdown.subscribe();
                    let connection_task = async move {
                        let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                        let _permit = permit;
                        let _log_guard = log_guard;

                        let http_connection = http1::Builder::new()
                            .half_close(true) // senders and receivers both stream until EOF
                            // TODO: header read timeouts
                            .serve_connection(TokioIo::new(connection), service);
                        let http_connection =
                            with_graceful_shutdown(http_connection, wants_shutdown);

                        if let Err(source) = http_connection.await {
                            error!("{}", ConnectionError::Http { peer_addr, source });
                        }
                    };
                    tokio::task::spawn(
                        nursery
                            .chaperone(connection_task)
                            .instrument(Span::current()),
                    );
                }
                .instrument(connection_span.or_current())
                .await;
            }
        }

        nursery.finish().await;
        info!("Stopped serving");
    }

    /// Gracefully shuts down the server.
    ///
    /// New calls to [`serve`](Self::serve) resolve immediately without handling new connections.
    /// Existing calls drop their stream of connections, then wait for their ongoing connections
    /// to finish before resolving. All connections terminate as soon as their current request
    /// finishes (idle connections are terminated immediately).
    ///
    /// # Cancel Safety
    ///
    /// After this has been polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        // Inform all requests that a graceful shutdown has been requested
        self.shutdown.send_replace(true);
        // Ensures we exit all serve() calls, not just finish requests.
        self.shutdown.closed().await;
    }
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // If we're overloaded, don't spend memory spinning up more tasks. Skip parsing
    // the request and preemptively supply a minimal response (allowed by RFC 9110
    // section 7.5), without waiting long for the response to finish.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Both polling a connection and gracefully shutting it down require exclusive
    // access, so we have to manually call them in poll_fn.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}

// Small enough code that I don't want to bother pulling in scopeguard
struct Guard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Guard<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}
