// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Marshaling of engine callbacks onto the client thread.
//!
//! The engine invokes its three callbacks on a thread the adapter does not
//! own. The only thing that thread is allowed to do is post a message here;
//! the adapter drains the queue from the client thread and dispatches. The
//! engine holds an [`EnginePoster`], a weak identity: once the adapter (and
//! with it the queue) is gone, posting becomes a no-op, so a callback can
//! never outrun teardown.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use crate::engine::BufferHeader;
use crate::engine::EngineEvent;

/// A marshaled engine callback.
#[derive(Debug)]
pub enum EngineMessage {
    /// EventNotify: command completed, error, port settings changed,
    /// buffer flag.
    Event(EngineEvent),
    /// The engine has finished consuming an input buffer.
    InputReturned(BufferHeader),
    /// The engine has produced (or declared EOS on) an output buffer.
    OutputProduced(BufferHeader),
}

/// FIFO of marshaled callbacks, shared between the engine's callback thread
/// and the client thread.
#[derive(Default)]
pub struct EventQueue {
    messages: Mutex<VecDeque<EngineMessage>>,
    available: Condvar,
}

impl EventQueue {
    pub fn post(&self, message: EngineMessage) {
        self.messages.lock().unwrap().push_back(message);
        self.available.notify_one();
    }

    /// Pops the next message without waiting.
    pub fn try_pop(&self) -> Option<EngineMessage> {
        self.messages.lock().unwrap().pop_front()
    }

    /// Pops the next message, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<EngineMessage> {
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.pop_front() {
            return Some(message);
        }
        let (mut messages, _) = self.available.wait_timeout(messages, timeout).unwrap();
        messages.pop_front()
    }
}

/// The engine's posting end of the queue. Holds only a weak reference: a
/// poster that outlives its adapter delivers nowhere.
#[derive(Clone)]
pub struct EnginePoster {
    queue: Weak<EventQueue>,
}

impl EnginePoster {
    pub fn new(queue: Weak<EventQueue>) -> Self {
        Self { queue }
    }

    fn post(&self, message: EngineMessage) {
        if let Some(queue) = self.queue.upgrade() {
            queue.post(message);
        }
    }

    /// EventNotify callback entry point.
    pub fn event(&self, event: EngineEvent) {
        self.post(EngineMessage::Event(event));
    }

    /// InputReturned callback entry point.
    pub fn input_returned(&self, header: BufferHeader) {
        log::trace!("input buffer returned, id {}", header.timestamp);
        self.post(EngineMessage::InputReturned(header));
    }

    /// OutputProduced callback entry point.
    pub fn output_produced(&self, header: BufferHeader) {
        log::trace!("output buffer produced, id {}", header.timestamp);
        self.post(EngineMessage::OutputProduced(header));
    }
}
