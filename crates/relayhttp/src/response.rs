// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::CONTENT_TYPE;
use hyper::Response;
pub use hyper::StatusCode;
use tokio::sync::mpsc;

/// Holds a [`GenericResponse`], possibly wrapped in an [`ErrResponse`].
pub type ResponseResult = Result<GenericResponse, ErrResponse>;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Wrapper that lets handlers bail out of a request with `?` while still
/// producing an ordinary response.
///
/// Handlers return [`ResponseResult`]; the dispatcher unwraps either variant
/// into the [`GenericResponse`] that goes on the wire.
pub struct ErrResponse(pub GenericResponse);

/// Return an empty GenericResponse.
///
/// Because this is expected to be used with CORS preflight requests, it returns a 200 response
/// instead of 204 for compatibility with Firefox.
pub fn empty() -> GenericResponse {
    let body = Empty::new().map_err(anyhow::Error::from).boxed();
    Response::new(body)
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl ToString,
) -> GenericResponse {
    let body = content.to_string().map_err(anyhow::Error::from).boxed();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    let content_type = "text/plain; charset=utf-8";
    full(status, content_type, content)
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// Return a 200 response whose body is fed from a channel of byte buffers.
///
/// Every buffer sent on the channel becomes its own body frame, so buffers
/// reach the client as soon as the connection can take them. The body ends
/// when the last sender handle for the channel is dropped.
pub fn stream(mut frames: mpsc::Receiver<Bytes>) -> GenericResponse {
    let frames = futures::stream::poll_fn(move |cx| frames.poll_recv(cx));
    let body = StreamBody::new(frames.map(|buffer| Ok::<_, anyhow::Error>(Frame::data(buffer))));
    Response::new(BodyExt::boxed(body))
}
