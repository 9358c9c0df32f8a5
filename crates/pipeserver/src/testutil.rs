// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory receivers for broker tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::message::display_name;
use crate::receiver::ReceiveWriter;

/// A [`ReceiveWriter`] that records everything written to it.
pub(crate) struct TestReceiver {
    id: u64,
    interactive: bool,
    username: Option<String>,
    fail_writes: bool,
    written: Mutex<Vec<u8>>,
    close_count: AtomicUsize,
}

impl TestReceiver {
    fn build(id: u64, interactive: bool, username: Option<&str>, fail_writes: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            interactive,
            username: username.map(str::to_owned),
            fail_writes,
            written: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn new(id: u64) -> Arc<Self> {
        Self::build(id, false, None, false)
    }

    pub fn interactive(id: u64, username: Option<&str>) -> Arc<Self> {
        Self::build(id, true, username, false)
    }

    /// A receiver whose writes always fail, for poisoning tests.
    pub fn failing(id: u64) -> Arc<Self> {
        Self::build(id, false, None, true)
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
    }

    pub fn closes(&self) -> usize {
        self.close_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReceiveWriter for TestReceiver {
    fn id(&self) -> u64 {
        self.id
    }

    fn interactive(&self) -> bool {
        self.interactive
    }

    fn username(&self) -> String {
        display_name(self.username.as_deref(), self.id)
    }

    async fn write(&self, buffer: Bytes) -> anyhow::Result<usize> {
        if self.fail_writes {
            anyhow::bail!("test receiver {} refuses writes", self.id);
        }
        self.written.lock().unwrap().extend_from_slice(&buffer);
        Ok(buffer.len())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.close_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
