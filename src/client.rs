// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The client-facing notification interface.
//!
//! Every notification is delivered on the client thread, and every one of
//! them passes through [`ClientRoute`] first: an invalidatable token that
//! `destroy` and the error path break so that late engine callbacks can
//! never produce a client-visible side effect.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use thiserror::Error;

use crate::DecodedFormat;
use crate::Resolution;

/// Error kinds surfaced to the client through [`Client::notify_error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("API call in an illegal state")]
    IllegalState,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("input bitstream buffer could not be read")]
    UnreadableInput,
    #[error("platform failure")]
    PlatformFailure,
}

/// Texture target picture buffers are bound to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureTarget {
    Texture2d,
}

/// A client-owned output buffer, identified by a client-assigned id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureBuffer {
    pub id: i32,
}

/// One decoded frame, delivered through a picture buffer. The
/// bitstream-buffer id is rewritten on every delivery from the id the
/// producing decode call stamped into the engine header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub picture_buffer_id: i32,
    pub bitstream_buffer_id: i32,
}

/// Notifications the adapter sends its client. All calls arrive on the
/// client thread.
pub trait Client {
    fn notify_initialization_complete(&mut self, success: bool);
    fn provide_picture_buffers(
        &mut self,
        count: usize,
        format: DecodedFormat,
        planes: usize,
        dimensions: Resolution,
        texture_target: TextureTarget,
    );
    fn dismiss_picture_buffer(&mut self, picture_buffer_id: i32);
    fn picture_ready(&mut self, picture: Picture);
    fn notify_end_of_bitstream_buffer(&mut self, bitstream_buffer_id: i32);
    fn notify_flush_done(&mut self);
    fn notify_reset_done(&mut self);
    fn notify_error(&mut self, error: Error);
}

/// The adapter's route to its client. Holds a weak reference (the embedder
/// owns the client) behind an invalidation token; once invalidated, every
/// notification is elided.
pub struct ClientRoute {
    client: Option<Weak<RefCell<dyn Client>>>,
}

impl ClientRoute {
    /// A route that delivers nowhere, used before `initialize`.
    pub fn unconnected() -> Self {
        Self { client: None }
    }

    pub fn connect(&mut self, client: Rc<RefCell<dyn Client>>) {
        self.client = Some(Rc::downgrade(&client));
    }

    /// Breaks the route. Idempotent; no notification fires after this.
    pub fn invalidate(&mut self) {
        self.client = None;
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.strong_count() > 0)
    }

    /// Runs `f` against the client if the route is still valid.
    pub fn notify(&self, f: impl FnOnce(&mut dyn Client)) {
        if let Some(client) = self.client.as_ref().and_then(Weak::upgrade) {
            f(&mut *client.borrow_mut());
        }
    }
}
