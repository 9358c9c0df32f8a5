// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A single named fan-out point

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::Message;
use crate::receiver::ReceiveWriter;

/// Invoked after every completed non-system write with the byte count, so the
/// parent collection can keep cumulative totals across pipe deletions.
pub trait WriteCompleteHandler: Send + Sync {
    fn write_completed(&self, bytes: u64);
}

/// One named relay point: the receivers attached to a key, how many senders
/// are pushing into it, and how many payload bytes have moved through it.
///
/// Structural state lives under a mutex that is only held for attach/detach
/// and snapshotting; actual receiver writes happen outside it so one slow
/// client can never block attach/detach or its peers on other pipes.
pub struct Pipe {
    state: Mutex<PipeState>,
    bytes: AtomicU64,
    written: Arc<dyn WriteCompleteHandler>,
}

#[derive(Default)]
struct PipeState {
    receivers: Vec<Arc<dyn ReceiveWriter>>,
    senders: u64,
    subscribers: HashMap<u64, mpsc::Sender<()>>,
    next_subscriber: u64,
}

impl Pipe {
    pub fn new(written: Arc<dyn WriteCompleteHandler>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState::default()),
            bytes: AtomicU64::new(0),
            written,
        })
    }

    /// Attach a receiver and announce it to everyone already on the pipe.
    ///
    /// The announcement is broadcast even when nobody interactive is attached;
    /// the formatter keeps it off the wire for plain receivers.
    pub async fn add_receiver(&self, receiver: Arc<dyn ReceiveWriter>) {
        let connected = Message::connected(receiver.as_ref());
        self.attach_receiver(receiver);
        self.fan_out(connected).await;
    }

    /// Detach a receiver and announce the departure.
    pub async fn remove_receiver(&self, receiver: &dyn ReceiveWriter) {
        let disconnected = Message::disconnected(receiver);
        self.detach_receiver(receiver.id());
        self.fan_out(disconnected).await;
    }

    /// Insert the receiver (membership is by id; re-adding is a no-op) and
    /// wake any block-mode senders waiting for one.
    pub(crate) fn attach_receiver(&self, receiver: Arc<dyn ReceiveWriter>) {
        let mut state = self.state.lock().unwrap();
        if state.receivers.iter().all(|r| r.id() != receiver.id()) {
            state.receivers.push(receiver);
        }
        // Waiting senders poll; a subscriber that already has a wakeup queued
        // is skipped rather than waited on.
        for subscriber in state.subscribers.values() {
            let _ = subscriber.try_send(());
        }
    }

    pub(crate) fn detach_receiver(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.receivers.retain(|r| r.id() != id);
    }

    pub fn add_sender(&self) {
        self.state.lock().unwrap().senders += 1;
    }

    pub fn remove_sender(&self) {
        let mut state = self.state.lock().unwrap();
        state.senders = state.senders.saturating_sub(1);
    }

    pub fn receiver_count(&self) -> usize {
        self.state.lock().unwrap().receivers.len()
    }

    pub fn sender_count(&self) -> u64 {
        self.state.lock().unwrap().senders
    }

    /// Payload bytes delivered through this pipe. System messages don't count.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Register for a wakeup whenever a receiver attaches. The subscription
    /// unregisters itself when dropped.
    pub fn subscribe_receiver_added(self: &Arc<Self>) -> ReceiverAddedSubscription {
        let (tx, rx) = mpsc::channel(1);
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(id, tx);
            id
        };
        ReceiverAddedSubscription {
            pipe: self.clone(),
            id,
            wakeups: rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().unwrap().subscribers.remove(&id);
    }

    /// Fan one buffer out to every attached receiver, shaping it per
    /// recipient. Returns the length of the input buffer.
    ///
    /// Errors from individual receivers are swallowed so one broken receiver
    /// cannot poison the others; a broken receiver detaches itself soon after.
    pub async fn write(&self, buffer: Bytes, from_id: u64, system: bool, from_user: String) -> usize {
        self.fan_out(Message {
            from_id,
            from_user,
            buffer,
            system,
        })
        .await
    }

    pub(crate) async fn fan_out(&self, message: Message) -> usize {
        let receivers = self.state.lock().unwrap().receivers.clone();
        for receiver in &receivers {
            if let Some(rendered) = message.format(receiver.as_ref()) {
                if let Err(err) = receiver.write(rendered).await {
                    debug!("dropping write to receiver {}: {err}", receiver.id());
                }
            }
        }
        let bytes = message.buffer.len();
        if !message.system {
            self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
            self.written.write_completed(bytes as u64);
        }
        bytes
    }

    /// Close every attached receiver: a sender reached EOF.
    ///
    /// Receivers stay attached here; each one detaches itself once it has
    /// observed the close.
    pub async fn close(&self) {
        let receivers = self.state.lock().unwrap().receivers.clone();
        for receiver in &receivers {
            if let Err(err) = receiver.close().await {
                debug!("error closing receiver {}: {err}", receiver.id());
            }
        }
    }
}

/// A registered interest in receivers attaching to a pipe, held by a
/// block-mode sender while it parks.
pub struct ReceiverAddedSubscription {
    pipe: Arc<Pipe>,
    id: u64,
    wakeups: mpsc::Receiver<()>,
}

impl ReceiverAddedSubscription {
    /// Wait for the next receiver to attach.
    pub async fn notified(&mut self) {
        let _ = self.wakeups.recv().await;
    }
}

impl Drop for ReceiverAddedSubscription {
    fn drop(&mut self) {
        self.pipe.unsubscribe(self.id);
    }
}
