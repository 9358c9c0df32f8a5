// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The keyed registry of live pipes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::message::Message;
use crate::pipe::{Pipe, WriteCompleteHandler};
use crate::receiver::ReceiveWriter;

/// A point-in-time set of counters, used both for the live scan and for
/// snapshots of the cumulative totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub pipe_count: u64,
    pub receiver_count: u64,
    pub sender_count: u64,
    pub bytes_sent: u64,
}

impl PipeStats {
    pub fn mega_bytes_sent(&self) -> u64 {
        self.bytes_sent / 1_000_000
    }
}

/// Cumulative totals since startup. Counters only ever go up; "currently
/// active" numbers come from scanning the live pipes instead.
#[derive(Default)]
struct GlobalStats {
    pipe_count: AtomicU64,
    receiver_count: AtomicU64,
    sender_count: AtomicU64,
    bytes_sent: AtomicU64,
}

impl GlobalStats {
    fn snapshot(&self) -> PipeStats {
        PipeStats {
            pipe_count: self.pipe_count.load(Ordering::Relaxed),
            receiver_count: self.receiver_count.load(Ordering::Relaxed),
            sender_count: self.sender_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl WriteCompleteHandler for GlobalStats {
    fn write_completed(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// All live pipes, partitioned by key.
///
/// Pipes exist only while something is attached: the first attach of either
/// side creates a pipe, and a detach that leaves both sides empty deletes it.
/// The map lock serializes attach/detach against pipe creation and deletion;
/// message fan-out never runs under it.
#[derive(Default)]
pub struct PipeCollection {
    pipes: Mutex<HashMap<String, Arc<Pipe>>>,
    stats: Arc<GlobalStats>,
}

impl PipeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pipe for `key`, creating it if this is the first attach.
    pub fn find_or_create_pipe(&self, key: &str) -> Arc<Pipe> {
        let mut pipes = self.pipes.lock().unwrap();
        self.find_or_create_locked(&mut pipes, key)
    }

    fn find_or_create_locked(
        &self,
        pipes: &mut HashMap<String, Arc<Pipe>>,
        key: &str,
    ) -> Arc<Pipe> {
        pipes
            .entry(key.to_owned())
            .or_insert_with(|| {
                debug!("pipe {key} created");
                self.stats.pipe_count.fetch_add(1, Ordering::Relaxed);
                Pipe::new(self.stats.clone() as Arc<dyn WriteCompleteHandler>)
            })
            .clone()
    }

    /// Remove the pipe from the registry if nothing is attached to it.
    ///
    /// The pipe's own byte counter goes with it; the cumulative totals were
    /// already accumulated through [`WriteCompleteHandler`].
    pub fn delete_pipe_if_empty(&self, key: &str, pipe: &Arc<Pipe>) {
        let mut pipes = self.pipes.lock().unwrap();
        Self::delete_if_empty_locked(&mut pipes, key, pipe);
    }

    fn delete_if_empty_locked(
        pipes: &mut HashMap<String, Arc<Pipe>>,
        key: &str,
        pipe: &Arc<Pipe>,
    ) {
        if pipe.receiver_count() < 1 && pipe.sender_count() < 1 {
            pipes.remove(key);
            debug!("pipe {key} removed");
        }
    }

    /// Attach a receiver, creating the pipe if needed, and announce it.
    pub async fn add_receiver(&self, key: &str, receiver: Arc<dyn ReceiveWriter>) -> Arc<Pipe> {
        let connected = Message::connected(receiver.as_ref());
        let pipe = {
            let mut pipes = self.pipes.lock().unwrap();
            let pipe = self.find_or_create_locked(&mut pipes, key);
            pipe.attach_receiver(receiver);
            self.stats.receiver_count.fetch_add(1, Ordering::Relaxed);
            pipe
        };
        pipe.fan_out(connected).await;
        pipe
    }

    /// Detach a receiver, announce the departure, and drop the pipe if it is
    /// now empty. Detaching from a missing pipe is a no-op.
    pub async fn remove_receiver(&self, key: &str, receiver: Arc<dyn ReceiveWriter>) {
        let disconnected = Message::disconnected(receiver.as_ref());
        let pipe = {
            let mut pipes = self.pipes.lock().unwrap();
            let Some(pipe) = pipes.get(key).cloned() else {
                return;
            };
            pipe.detach_receiver(receiver.id());
            Self::delete_if_empty_locked(&mut pipes, key, &pipe);
            pipe
        };
        pipe.fan_out(disconnected).await;
    }

    /// Structural detach only, without the departure announcement. For
    /// teardown paths that cannot run async code, such as an abandoned
    /// request future whose guard is dropped mid-setup.
    pub(crate) fn detach_receiver(&self, key: &str, id: u64) {
        let mut pipes = self.pipes.lock().unwrap();
        let Some(pipe) = pipes.get(key).cloned() else {
            return;
        };
        pipe.detach_receiver(id);
        Self::delete_if_empty_locked(&mut pipes, key, &pipe);
    }

    /// Attach a sender, creating the pipe if needed.
    pub fn add_sender(&self, key: &str) -> Arc<Pipe> {
        let mut pipes = self.pipes.lock().unwrap();
        let pipe = self.find_or_create_locked(&mut pipes, key);
        pipe.add_sender();
        self.stats.sender_count.fetch_add(1, Ordering::Relaxed);
        pipe
    }

    /// Detach a sender and drop the pipe if it is now empty.
    pub fn remove_sender(&self, key: &str, pipe: &Arc<Pipe>) {
        let mut pipes = self.pipes.lock().unwrap();
        pipe.remove_sender();
        Self::delete_if_empty_locked(&mut pipes, key, pipe);
    }

    /// Counters for what is attached right now, summed over the live pipes.
    pub fn active_stats(&self) -> PipeStats {
        let pipes = self.pipes.lock().unwrap();
        let mut stats = PipeStats::default();
        for pipe in pipes.values() {
            stats.pipe_count += 1;
            stats.receiver_count += pipe.receiver_count() as u64;
            stats.sender_count += pipe.sender_count();
            stats.bytes_sent += pipe.bytes_sent();
        }
        stats
    }

    /// Cumulative totals since startup.
    pub fn global_stats(&self) -> PipeStats {
        self.stats.snapshot()
    }
}
