// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{crate_version, Parser};

#[derive(Debug, Parser)]
#[clap(
    name = "pipeserver",
    about = "Ephemeral key-addressed streaming relay over HTTP",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        long,
        env = "PIPESERVER_HTTPADDR",
        help = "The address/port to listen on for http. Use 0.0.0.0:<port> to listen on all addresses",
        default_value = "localhost:8080"
    )]
    pub httpaddr: String,

    #[clap(
        long,
        env = "PIPESERVER_BASEURL",
        help = "The base url of the service, used in generated pipe addresses",
        default_value = "http://localhost:8080/"
    )]
    pub baseurl: String,

    #[clap(
        long,
        env = "PIPESERVER_MAX_CLIENTS",
        help = "Maximum simultaneously connected clients before connections are no longer accepted",
        default_value = "1024"
    )]
    pub max_clients: usize,
}
