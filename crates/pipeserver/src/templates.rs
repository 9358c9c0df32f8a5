// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fixed plain-text pages

use askama::Template;
use hyper::StatusCode;
use tracing::error;

use relayhttp::response::{self, GenericResponse};

use crate::collection::PipeStats;

/// The landing page: a freshly generated pipe address and usage examples.
#[derive(Template)]
#[template(path = "home.txt")]
pub struct HomePage<'a> {
    pub url: &'a str,
    pub max_upload_mb: u64,
}

/// Live and cumulative relay counters.
#[derive(Template)]
#[template(path = "stats.txt")]
pub struct StatsPage {
    pub active: PipeStats,
    pub global: PipeStats,
}

/// Render a page as a plain text response.
pub fn render(page: impl Template) -> GenericResponse {
    match page.render() {
        Ok(text) => response::text(StatusCode::OK, text),
        Err(err) => {
            // fixed templates with infallible fields shouldn't fail to render
            error!("rendering template: {err}");
            response::text(StatusCode::INTERNAL_SERVER_ERROR, "template error")
        }
    }
}
