// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The buffer registry.
//!
//! Tracks the two populations of engine buffer headers (input and output)
//! and where each one currently lives: free, queued at the engine, or held
//! by the client as a picture. Also owns the per-buffer side data and the
//! work the adapter defers while a transition is in progress (queued
//! bitstream buffers, queued picture ids).
//!
//! A header exists in exactly one place at a time. Input headers move
//! between `free_input` and the engine; output headers live either in the
//! `pictures` map (absent while at the engine) or in the fake-output
//! population used before the first port-settings-changed.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::client::Picture;
use crate::client::PictureBuffer;
use crate::engine::AppData;
use crate::engine::BufferHeader;
use crate::engine::BufferId;
use crate::engine::EngineClient;
use crate::engine::EngineResult;
use crate::shm::BitstreamBuffer;

/// A registered output picture: the client's buffer plus the engine header
/// serving it. The header is `None` while the buffer is queued at the
/// engine.
#[derive(Debug)]
pub struct OutputPicture {
    pub picture_buffer: PictureBuffer,
    pub header: Option<BufferHeader>,
}

#[derive(Default)]
pub struct BufferRegistry {
    free_input: VecDeque<BufferHeader>,
    input_at_engine: usize,

    pictures: BTreeMap<i32, OutputPicture>,
    fake_output: Vec<BufferHeader>,
    fake_at_engine: HashSet<BufferId>,
    output_at_engine: usize,

    queued_bitstream: VecDeque<BitstreamBuffer>,
    queued_pictures: VecDeque<i32>,
}

impl BufferRegistry {
    /// Registers `count` zero-copy input headers on `input_port`, all free.
    /// The backing memory is supplied per-decode.
    pub fn allocate_inputs(
        &mut self,
        engine: &mut EngineClient,
        input_port: u32,
        count: usize,
    ) -> EngineResult<()> {
        for _ in 0..count {
            let header = engine.use_buffer(input_port)?;
            self.free_input.push_back(header);
        }
        Ok(())
    }

    /// Allocates `count` engine-owned output headers used only to drive the
    /// decoder through the first settings-change event.
    pub fn allocate_fake_outputs(
        &mut self,
        engine: &mut EngineClient,
        output_port: u32,
        count: usize,
    ) -> EngineResult<()> {
        for _ in 0..count {
            let mut header = engine.allocate_buffer(output_port)?;
            header.timestamp = -1;
            self.fake_output.push(header);
        }
        Ok(())
    }

    /// Registers the client's picture buffers, one engine header per
    /// picture, each carrying a pre-filled ready-record.
    pub fn adopt_picture_buffers(
        &mut self,
        engine: &mut EngineClient,
        output_port: u32,
        buffers: &[PictureBuffer],
    ) -> EngineResult<()> {
        for picture_buffer in buffers {
            let mut header = engine.use_buffer(output_port)?;
            // The record's bitstream id is garbage until overwritten from
            // the header timestamp on each delivery.
            header.app = AppData::Picture(Picture {
                picture_buffer_id: picture_buffer.id,
                bitstream_buffer_id: -1,
            });
            self.pictures.insert(
                picture_buffer.id,
                OutputPicture { picture_buffer: *picture_buffer, header: Some(header) },
            );
        }
        Ok(())
    }

    pub fn take_free_input(&mut self) -> Option<BufferHeader> {
        self.free_input.pop_front()
    }

    pub fn has_free_input(&self) -> bool {
        !self.free_input.is_empty()
    }

    pub fn free_input_len(&self) -> usize {
        self.free_input.len()
    }

    pub fn note_input_sent(&mut self) {
        self.input_at_engine += 1;
    }

    pub fn input_at_engine(&self) -> usize {
        self.input_at_engine
    }

    /// Re-homes a returned input header to the free list, dropping its
    /// binding (and with it the mapped region). Returns the bitstream id
    /// the client should be notified about, or `None` for EOS inputs.
    pub fn input_returned(&mut self, mut header: BufferHeader) -> Option<i32> {
        debug_assert!(self.input_at_engine > 0);
        self.input_at_engine = self.input_at_engine.saturating_sub(1);
        let eos = header.flags.eos();
        let app = header.take_app();
        header.buffer = None;
        self.free_input.push_back(header);
        if eos {
            return None;
        }
        match app {
            AppData::Input(binding) => Some(binding.bitstream_buffer_id),
            other => {
                log::error!("input returned without a binding: {:?}", other);
                None
            }
        }
    }

    pub fn note_output_sent(&mut self) {
        self.output_at_engine += 1;
    }

    pub fn note_output_returned(&mut self) {
        debug_assert!(self.output_at_engine > 0);
        self.output_at_engine = self.output_at_engine.saturating_sub(1);
    }

    pub fn output_at_engine(&self) -> usize {
        self.output_at_engine
    }

    /// Moves every fake output header out for queueing at the engine.
    pub fn take_fake_outputs(&mut self) -> Vec<BufferHeader> {
        let headers = std::mem::take(&mut self.fake_output);
        for header in &headers {
            self.fake_at_engine.insert(header.id);
        }
        headers
    }

    pub fn is_fake(&self, header: &BufferHeader) -> bool {
        self.fake_at_engine.contains(&header.id)
    }

    /// Forgets a fake header the engine returned; the caller frees it.
    pub fn fake_returned(&mut self, header: &BufferHeader) {
        self.fake_at_engine.remove(&header.id);
    }

    /// Re-homes a fake header without freeing it (teardown path).
    pub fn rehome_fake(&mut self, header: BufferHeader) {
        self.fake_at_engine.remove(&header.id);
        self.fake_output.push(header);
    }

    pub fn has_fake_outputs(&self) -> bool {
        !self.fake_output.is_empty() || !self.fake_at_engine.is_empty()
    }

    pub fn pictures_len(&self) -> usize {
        self.pictures.len()
    }

    pub fn picture_ids(&self) -> Vec<i32> {
        self.pictures.keys().copied().collect()
    }

    pub fn has_picture(&self, picture_buffer_id: i32) -> bool {
        self.pictures.contains_key(&picture_buffer_id)
    }

    /// Takes the header of `picture_buffer_id` for queueing at the engine.
    /// `None` if the id is unknown or the header is already at the engine.
    pub fn take_picture_header(&mut self, picture_buffer_id: i32) -> Option<BufferHeader> {
        self.pictures.get_mut(&picture_buffer_id)?.header.take()
    }

    /// Re-homes a returned output header into its picture slot, using the
    /// ready-record it carries to find the slot.
    pub fn rehome_picture(&mut self, header: BufferHeader) {
        let picture_buffer_id = match &header.app {
            AppData::Picture(picture) => picture.picture_buffer_id,
            other => {
                log::error!("output returned without a ready-record: {:?}", other);
                return;
            }
        };
        match self.pictures.get_mut(&picture_buffer_id) {
            Some(output_picture) => {
                debug_assert!(output_picture.header.is_none());
                output_picture.header = Some(header);
            }
            None => log::error!("returned output for unknown picture {}", picture_buffer_id),
        }
    }

    pub fn queue_bitstream(&mut self, bitstream: BitstreamBuffer) {
        self.queued_bitstream.push_back(bitstream);
    }

    pub fn has_queued_bitstream(&self) -> bool {
        !self.queued_bitstream.is_empty()
    }

    /// Takes the whole deferred bitstream queue for re-issue.
    pub fn take_queued_bitstream(&mut self) -> VecDeque<BitstreamBuffer> {
        std::mem::take(&mut self.queued_bitstream)
    }

    pub fn queue_picture(&mut self, picture_buffer_id: i32) {
        self.queued_pictures.push_back(picture_buffer_id);
    }

    pub fn take_queued_pictures(&mut self) -> VecDeque<i32> {
        std::mem::take(&mut self.queued_pictures)
    }

    /// Frees every header in every population. One stuck buffer must not
    /// leak the rest: per-buffer failures are logged and aggregated into the
    /// return value, and teardown continues. `on_dismiss` fires for each
    /// registered picture id.
    pub fn free_all(
        &mut self,
        engine: &mut EngineClient,
        input_port: u32,
        output_port: u32,
        mut on_dismiss: impl FnMut(i32),
    ) -> bool {
        let mut failure_seen = false;

        while let Some(header) = self.free_input.pop_front() {
            if let Err(e) = engine.free_buffer(input_port, header) {
                log::error!("freeing input buffer failed: {}", e);
                failure_seen = true;
            }
        }
        if self.input_at_engine > 0 {
            log::error!("{} input buffers still at the engine", self.input_at_engine);
            failure_seen = true;
        }

        for (picture_buffer_id, output_picture) in std::mem::take(&mut self.pictures) {
            match output_picture.header {
                Some(header) => {
                    if let Err(e) = engine.free_buffer(output_port, header) {
                        log::error!("freeing output buffer failed: {}", e);
                        failure_seen = true;
                    }
                }
                None => {
                    log::error!("picture {} still at the engine", picture_buffer_id);
                    failure_seen = true;
                }
            }
            on_dismiss(picture_buffer_id);
        }

        for header in std::mem::take(&mut self.fake_output) {
            if let Err(e) = engine.free_buffer(output_port, header) {
                log::error!("freeing fake output buffer failed: {}", e);
                failure_seen = true;
            }
        }
        if !self.fake_at_engine.is_empty() {
            log::error!("{} fake output buffers still at the engine", self.fake_at_engine.len());
            self.fake_at_engine.clear();
            failure_seen = true;
        }

        for picture_buffer_id in std::mem::take(&mut self.queued_pictures) {
            on_dismiss(picture_buffer_id);
        }

        failure_seen
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::fake::FakeEngineControl;
    use crate::engine::fake::INPUT_PORT;
    use crate::engine::fake::OUTPUT_PORT;
    use crate::events::EnginePoster;
    use crate::events::EventQueue;
    use crate::shm::InputBinding;

    fn engine_client() -> (EngineClient, FakeEngineControl, Arc<EventQueue>) {
        let (engine, control) = FakeEngine::new();
        let mut client = EngineClient::new(engine);
        let queue = Arc::new(EventQueue::default());
        client.open_component("fake.decoder", EnginePoster::new(Arc::downgrade(&queue))).unwrap();
        (client, control, queue)
    }

    #[test]
    fn input_population_is_conserved() {
        let (mut engine, control, _queue) = engine_client();
        let mut registry = BufferRegistry::default();
        registry.allocate_inputs(&mut engine, INPUT_PORT, 4).unwrap();
        assert_eq!(registry.free_input_len(), 4);
        assert_eq!(control.registered_buffers(INPUT_PORT), 4);

        let mut header = registry.take_free_input().unwrap();
        registry.note_input_sent();
        assert_eq!(registry.free_input_len() + registry.input_at_engine(), 4);

        header.app = AppData::Input(InputBinding {
            region: Bytes::from_static(b"data"),
            bitstream_buffer_id: 9,
        });
        assert_eq!(registry.input_returned(header), Some(9));
        assert_eq!(registry.free_input_len(), 4);
        assert_eq!(registry.input_at_engine(), 0);
    }

    #[test]
    fn eos_input_return_reports_no_id() {
        let (mut engine, _control, _queue) = engine_client();
        let mut registry = BufferRegistry::default();
        registry.allocate_inputs(&mut engine, INPUT_PORT, 1).unwrap();

        let mut header = registry.take_free_input().unwrap();
        registry.note_input_sent();
        header.flags.set_eos();
        assert_eq!(registry.input_returned(header), None);
        assert_eq!(registry.free_input_len(), 1);
    }

    #[test]
    fn picture_headers_move_between_registry_and_engine() {
        let (mut engine, _control, _queue) = engine_client();
        let mut registry = BufferRegistry::default();
        let buffers = [PictureBuffer { id: 3 }, PictureBuffer { id: 7 }];
        registry.adopt_picture_buffers(&mut engine, OUTPUT_PORT, &buffers).unwrap();
        assert_eq!(registry.picture_ids(), vec![3, 7]);

        let header = registry.take_picture_header(7).unwrap();
        // Absent while at the engine.
        assert!(registry.take_picture_header(7).is_none());

        registry.rehome_picture(header);
        assert!(registry.take_picture_header(7).is_some());
    }

    #[test]
    fn free_all_aggregates_failures_and_continues() {
        let (mut engine, control, _queue) = engine_client();
        let mut registry = BufferRegistry::default();
        registry.allocate_inputs(&mut engine, INPUT_PORT, 2).unwrap();
        let buffers = [PictureBuffer { id: 0 }, PictureBuffer { id: 1 }];
        registry.adopt_picture_buffers(&mut engine, OUTPUT_PORT, &buffers).unwrap();
        registry.queue_picture(1);

        control.set_fail_free_buffer(true);
        let mut dismissed = Vec::new();
        let failure_seen =
            registry.free_all(&mut engine, INPUT_PORT, OUTPUT_PORT, |id| dismissed.push(id));

        // Every buffer was attempted and every picture dismissed despite
        // the per-buffer failures.
        assert!(failure_seen);
        assert_eq!(registry.free_input_len(), 0);
        assert_eq!(registry.pictures_len(), 0);
        assert_eq!(dismissed, vec![0, 1, 1]);
    }

    #[test]
    fn fake_outputs_are_tracked_while_at_engine() {
        let (mut engine, _control, _queue) = engine_client();
        let mut registry = BufferRegistry::default();
        registry.allocate_fake_outputs(&mut engine, OUTPUT_PORT, 2).unwrap();
        assert!(registry.has_fake_outputs());

        let headers = registry.take_fake_outputs();
        assert_eq!(headers.len(), 2);
        for header in &headers {
            assert!(registry.is_fake(header));
        }

        for header in headers {
            registry.fake_returned(&header);
            engine.free_buffer(OUTPUT_PORT, header).unwrap();
        }
        assert!(!registry.has_fake_outputs());
    }
}
