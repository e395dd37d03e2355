// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared-memory transport of compressed input.
//!
//! The client hands over an opaque handle and a size; the adapter maps the
//! region read-only for the duration of the buffer's stay at the engine.
//! Mapped regions are surfaced as [`Bytes`] so the [`InputBinding`] keeps
//! the backing memory alive without copying.

use bytes::Bytes;

/// An opaque, client-supplied shared-memory handle.
pub trait SharedMemoryHandle: Send {
    /// Maps the first `size` bytes of the region read-only.
    fn map_read_only(&self, size: usize) -> anyhow::Result<Bytes>;
}

/// One unit of compressed input handed to [`decode`].
///
/// `id == -1 && size == 0` is the end-of-stream sentinel; it carries no
/// memory.
///
/// [`decode`]: crate::adapter::VideoDecodeAdapter::decode
pub struct BitstreamBuffer {
    pub id: i32,
    pub handle: Option<Box<dyn SharedMemoryHandle>>,
    pub size: usize,
}

impl BitstreamBuffer {
    /// The end-of-stream sentinel pushed through the pipeline by `flush`.
    pub fn end_of_stream() -> Self {
        Self { id: -1, handle: None, size: 0 }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.id == -1 && self.size == 0
    }
}

impl std::fmt::Debug for BitstreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitstreamBuffer").field("id", &self.id).field("size", &self.size).finish()
    }
}

/// Side data attached to an input buffer header while it is at the engine:
/// the mapped region backing the header and the client's bitstream buffer
/// id. Created when the buffer is handed to the engine, dropped when the
/// engine returns it.
#[derive(Debug)]
pub struct InputBinding {
    pub region: Bytes,
    pub bitstream_buffer_id: i32,
}
