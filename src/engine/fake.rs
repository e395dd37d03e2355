// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A scripted in-process engine for tests.
//!
//! Commands are acknowledged in order through the poster, inputs are held
//! at the engine until a test consumes them, and decoded outputs are
//! produced on request. The buffer-return-before-state-ack ordering the
//! real engine guarantees on the Executing -> Idle transition is modeled
//! here too, so teardown tests exercise the same message interleavings the
//! adapter sees in production.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::engine::BufferFlags;
use crate::engine::BufferHeader;
use crate::engine::BufferId;
use crate::engine::Command;
use crate::engine::CommandAck;
use crate::engine::ComponentHandle;
use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::EngineEvent;
use crate::engine::EngineResult;
use crate::engine::EngineState;
use crate::engine::PortDefinition;
use crate::engine::PortDir;
use crate::engine::PortRange;
use crate::engine::PortSettingsIndex;
use crate::events::EnginePoster;

pub const INPUT_PORT: u32 = 1;
pub const OUTPUT_PORT: u32 = 2;
pub const INPUT_BUFFER_COUNT: u32 = 4;
pub const INPUT_BUFFER_SIZE: u32 = 64 * 1024;

#[derive(Default)]
struct Core {
    poster: Option<EnginePoster>,
    state: Option<EngineState>,
    next_handle: u64,
    next_buffer_id: u64,
    handle_freed: bool,
    deinited: bool,

    input_def: Option<PortDefinition>,
    output_def: Option<PortDefinition>,

    queued_input: VecDeque<BufferHeader>,
    queued_output: VecDeque<BufferHeader>,
    /// Bitstream ids (smuggled through header timestamps) of consumed
    /// inputs awaiting frame production.
    pending_output_ids: VecDeque<i64>,
    eos_pending: bool,

    registered: HashMap<u32, usize>,

    fail_free_buffer: bool,
    fail_empty_this_buffer: bool,
}

impl Core {
    fn poster(&self) -> EnginePoster {
        self.poster.clone().expect("component not open")
    }

    fn return_all_queued(&mut self) {
        let poster = self.poster();
        for header in self.queued_input.drain(..) {
            poster.input_returned(header);
        }
        for mut header in self.queued_output.drain(..) {
            header.filled_len = 0;
            poster.output_produced(header);
        }
    }

    fn maybe_emit_eos(&mut self) {
        if !self.eos_pending || !self.pending_output_ids.is_empty() {
            return;
        }
        let Some(mut header) = self.queued_output.pop_front() else { return };
        self.eos_pending = false;
        header.flags.set_eos();
        header.filled_len = 0;
        header.timestamp = -2;
        let poster = self.poster();
        let mut flags = BufferFlags::default();
        flags.set_eos();
        poster.event(EngineEvent::BufferFlag { port: OUTPUT_PORT, flags });
        poster.output_produced(header);
    }
}

/// Test-side handle for scripting the engine and inspecting its state.
#[derive(Clone)]
pub struct FakeEngineControl {
    core: Arc<Mutex<Core>>,
}

impl FakeEngineControl {
    /// Returns the oldest held input to the adapter.
    pub fn consume_one_input(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        match core.queued_input.pop_front() {
            Some(header) => {
                core.poster().input_returned(header);
                true
            }
            None => false,
        }
    }

    pub fn consume_all_inputs(&self) -> usize {
        let mut count = 0;
        while self.consume_one_input() {
            count += 1;
        }
        count
    }

    /// Produces one decoded frame if both an output buffer and a consumed
    /// input are available.
    pub fn produce_frame(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        let Some(id) = core.pending_output_ids.front().copied() else { return false };
        let Some(mut header) = core.queued_output.pop_front() else { return false };
        core.pending_output_ids.pop_front();
        header.timestamp = id;
        header.filled_len = 1;
        let poster = core.poster();
        poster.output_produced(header);
        core.maybe_emit_eos();
        true
    }

    pub fn produce_all_frames(&self) -> usize {
        let mut count = 0;
        while self.produce_frame() {
            count += 1;
        }
        count
    }

    /// Announces new output port settings, as the engine does once the
    /// stream's real dimensions are known.
    pub fn trigger_settings_change(&self, width: u32, height: u32) {
        let mut core = self.core.lock().unwrap();
        if let Some(def) = core.output_def.as_mut() {
            def.frame_width = width;
            def.frame_height = height;
        }
        core.poster().event(EngineEvent::PortSettingsChanged {
            port: OUTPUT_PORT,
            index: PortSettingsIndex::Definition,
        });
    }

    pub fn emit_error(&self, code: u32) {
        self.core.lock().unwrap().poster().event(EngineEvent::Error { code });
    }

    pub fn set_fail_free_buffer(&self, fail: bool) {
        self.core.lock().unwrap().fail_free_buffer = fail;
    }

    pub fn set_fail_empty_this_buffer(&self, fail: bool) {
        self.core.lock().unwrap().fail_empty_this_buffer = fail;
    }

    pub fn queued_input_len(&self) -> usize {
        self.core.lock().unwrap().queued_input.len()
    }

    pub fn queued_output_len(&self) -> usize {
        self.core.lock().unwrap().queued_output.len()
    }

    pub fn pending_output_ids(&self) -> usize {
        self.core.lock().unwrap().pending_output_ids.len()
    }

    pub fn registered_buffers(&self, port: u32) -> usize {
        self.core.lock().unwrap().registered.get(&port).copied().unwrap_or(0)
    }

    pub fn handle_freed(&self) -> bool {
        self.core.lock().unwrap().handle_freed
    }

    pub fn state(&self) -> Option<EngineState> {
        self.core.lock().unwrap().state
    }
}

pub struct FakeEngine {
    core: Arc<Mutex<Core>>,
}

impl FakeEngine {
    pub fn new() -> (Box<dyn Engine>, FakeEngineControl) {
        let core = Arc::new(Mutex::new(Core::default()));
        (Box::new(FakeEngine { core: core.clone() }), FakeEngineControl { core })
    }
}

impl Engine for FakeEngine {
    fn init(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn deinit(&mut self) -> EngineResult<()> {
        self.core.lock().unwrap().deinited = true;
        Ok(())
    }

    fn component_of_role(&mut self, role: &str) -> EngineResult<String> {
        match role {
            crate::engine::ROLE_AVC | crate::engine::ROLE_VPX => {
                Ok(format!("fake.decoder.{}", role))
            }
            other => Err(EngineError::NoComponent(other.to_owned())),
        }
    }

    fn get_handle(
        &mut self,
        _component: &str,
        poster: EnginePoster,
    ) -> EngineResult<ComponentHandle> {
        let mut core = self.core.lock().unwrap();
        core.poster = Some(poster);
        core.state = Some(EngineState::Loaded);
        core.input_def = Some(PortDefinition {
            port: INPUT_PORT,
            dir: PortDir::Input,
            buffer_count_actual: INPUT_BUFFER_COUNT,
            buffer_count_min: INPUT_BUFFER_COUNT,
            buffer_size: INPUT_BUFFER_SIZE,
            frame_width: 0,
            frame_height: 0,
        });
        core.output_def = Some(PortDefinition {
            port: OUTPUT_PORT,
            dir: PortDir::Output,
            buffer_count_actual: 8,
            buffer_count_min: 4,
            buffer_size: 0,
            frame_width: 0,
            frame_height: 0,
        });
        core.next_handle += 1;
        Ok(ComponentHandle(core.next_handle))
    }

    fn free_handle(&mut self, _handle: ComponentHandle) -> EngineResult<()> {
        self.core.lock().unwrap().handle_freed = true;
        Ok(())
    }

    fn get_video_ports(&mut self, _handle: ComponentHandle) -> EngineResult<PortRange> {
        Ok(PortRange { count: 2, start: INPUT_PORT })
    }

    fn set_role(&mut self, _handle: ComponentHandle, _role: &str) -> EngineResult<()> {
        Ok(())
    }

    fn get_port_definition(
        &mut self,
        _handle: ComponentHandle,
        port: u32,
    ) -> EngineResult<PortDefinition> {
        let core = self.core.lock().unwrap();
        match port {
            INPUT_PORT => Ok(core.input_def.ok_or_else(|| anyhow!("component not open"))?),
            OUTPUT_PORT => Ok(core.output_def.ok_or_else(|| anyhow!("component not open"))?),
            other => Err(anyhow!("unknown port {}", other).into()),
        }
    }

    fn set_port_definition(
        &mut self,
        _handle: ComponentHandle,
        def: &PortDefinition,
    ) -> EngineResult<()> {
        let mut core = self.core.lock().unwrap();
        match def.port {
            INPUT_PORT => core.input_def = Some(*def),
            OUTPUT_PORT => core.output_def = Some(*def),
            other => return Err(anyhow!("unknown port {}", other).into()),
        }
        Ok(())
    }

    fn send_command(&mut self, _handle: ComponentHandle, command: Command) -> EngineResult<()> {
        let mut core = self.core.lock().unwrap();
        match command {
            Command::SetState(state) => {
                // The engine hands back every queued buffer before it
                // acknowledges leaving the active states.
                if matches!(state, EngineState::Idle | EngineState::Invalid)
                    && matches!(
                        core.state,
                        Some(EngineState::Executing) | Some(EngineState::Paused)
                    )
                {
                    core.return_all_queued();
                }
                core.state = Some(state);
                core.poster().event(EngineEvent::CmdComplete(CommandAck::StateSet(state)));
            }
            Command::Flush(port) => {
                let poster = core.poster();
                if port == INPUT_PORT {
                    for header in core.queued_input.drain(..) {
                        poster.input_returned(header);
                    }
                    core.pending_output_ids.clear();
                    core.eos_pending = false;
                } else {
                    for mut header in core.queued_output.drain(..) {
                        header.filled_len = 0;
                        poster.output_produced(header);
                    }
                }
                poster.event(EngineEvent::CmdComplete(CommandAck::Flushed(port)));
            }
            Command::PortDisable(port) => {
                if port == OUTPUT_PORT {
                    let poster = core.poster();
                    for mut header in core.queued_output.drain(..) {
                        header.filled_len = 0;
                        poster.output_produced(header);
                    }
                }
                core.poster().event(EngineEvent::CmdComplete(CommandAck::PortDisabled(port)));
            }
            Command::PortEnable(port) => {
                core.poster().event(EngineEvent::CmdComplete(CommandAck::PortEnabled(port)));
            }
        }
        Ok(())
    }

    fn use_buffer(&mut self, _handle: ComponentHandle, port: u32) -> EngineResult<BufferHeader> {
        let mut core = self.core.lock().unwrap();
        core.next_buffer_id += 1;
        *core.registered.entry(port).or_insert(0) += 1;
        Ok(BufferHeader {
            id: BufferId(core.next_buffer_id),
            port,
            filled_len: 0,
            alloc_len: 0,
            flags: BufferFlags::default(),
            timestamp: 0,
            buffer: None,
            app: Default::default(),
        })
    }

    fn allocate_buffer(
        &mut self,
        handle: ComponentHandle,
        port: u32,
    ) -> EngineResult<BufferHeader> {
        self.use_buffer(handle, port)
    }

    fn free_buffer(
        &mut self,
        _handle: ComponentHandle,
        port: u32,
        _header: BufferHeader,
    ) -> EngineResult<()> {
        let mut core = self.core.lock().unwrap();
        if core.fail_free_buffer {
            return Err(anyhow!("free_buffer failure (scripted)").into());
        }
        match core.registered.get_mut(&port) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            _ => Err(anyhow!("no registered buffer on port {}", port).into()),
        }
    }

    fn empty_this_buffer(
        &mut self,
        _handle: ComponentHandle,
        header: BufferHeader,
    ) -> EngineResult<()> {
        let mut core = self.core.lock().unwrap();
        if core.fail_empty_this_buffer {
            return Err(anyhow!("empty_this_buffer failure (scripted)").into());
        }
        if header.flags.eos() {
            // EOS carries no data; consume it on the spot and remember to
            // emit the EOS output once earlier frames have drained.
            core.eos_pending = true;
            core.poster().input_returned(header);
            core.maybe_emit_eos();
        } else {
            core.pending_output_ids.push_back(header.timestamp);
            core.queued_input.push_back(header);
        }
        Ok(())
    }

    fn fill_this_buffer(
        &mut self,
        _handle: ComponentHandle,
        header: BufferHeader,
    ) -> EngineResult<()> {
        let mut core = self.core.lock().unwrap();
        core.queued_output.push_back(header);
        core.maybe_emit_eos();
        Ok(())
    }
}
