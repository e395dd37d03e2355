// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed surface over the asynchronous codec engine.
//!
//! The engine is a component with two data ports (compressed input, decoded
//! output), a coarse lifecycle state machine and per-port commands. All of
//! its calls complete immediately; acknowledgements and buffer returns
//! arrive later as callbacks on a thread the adapter does not own, posted
//! back through an [`EnginePoster`](crate::events::EnginePoster).
//!
//! Buffer headers are owned values: handing one to the engine with
//! [`Engine::empty_this_buffer`] or [`Engine::fill_this_buffer`] moves it
//! there, and the engine moves it back in the corresponding return message.

#[cfg(test)]
pub mod fake;

use bytes::Bytes;
use thiserror::Error;

use crate::client::Picture;
use crate::events::EnginePoster;
use crate::shm::InputBinding;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no component available for role {0}")]
    NoComponent(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Role name for H.264 decode components.
pub const ROLE_AVC: &str = "video_decoder.avc";
/// Role name for VP8 decode components.
pub const ROLE_VPX: &str = "video_decoder.vpx";

/// Opaque handle to an open engine component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ComponentHandle(pub u64);

/// The engine's lifecycle states, plus the two adapter-side sentinels
/// `Unknown` (component never opened) and `Final` (component shut down).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unknown,
    Loaded,
    Idle,
    Executing,
    Paused,
    Invalid,
    Final,
}

/// AVC profiles the engine distinguishes between when allocating decode
/// resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AvcProfile {
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortDir {
    Input,
    Output,
}

/// Result of querying the component's video port parameter: how many ports
/// it has and the index of the first one.
#[derive(Copy, Clone, Debug)]
pub struct PortRange {
    pub count: u32,
    pub start: u32,
}

/// A port definition as reported (and partially rewritten) through the
/// engine's parameter interface.
#[derive(Copy, Clone, Debug)]
pub struct PortDefinition {
    pub port: u32,
    pub dir: PortDir,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Commands accepted by [`Engine::send_command`]. Completion is reported
/// asynchronously through [`EngineEvent::CmdComplete`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetState(EngineState),
    Flush(u32),
    PortEnable(u32),
    PortDisable(u32),
}

/// Acknowledgement payload of a completed command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandAck {
    StateSet(EngineState),
    Flushed(u32),
    PortEnabled(u32),
    PortDisabled(u32),
}

/// Which part of a port's settings changed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortSettingsIndex {
    Definition,
    OutputCrop,
    Scale,
}

/// Asynchronous events emitted by the engine.
#[derive(Debug)]
pub enum EngineEvent {
    CmdComplete(CommandAck),
    Error { code: u32 },
    PortSettingsChanged { port: u32, index: PortSettingsIndex },
    BufferFlag { port: u32, flags: BufferFlags },
}

/// Per-buffer flag word. Only the EOS bit is meaningful to the adapter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    const EOS: u32 = 1;

    pub fn eos(&self) -> bool {
        self.0 & Self::EOS != 0
    }

    pub fn set_eos(&mut self) {
        self.0 |= Self::EOS;
    }

    pub fn clear_eos(&mut self) {
        self.0 &= !Self::EOS;
    }
}

/// Identity of a registered buffer header, assigned by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Typed side data attached to a buffer header, standing in for the
/// engine's untyped per-header application pointer.
#[derive(Debug, Default)]
pub enum AppData {
    #[default]
    None,
    Input(InputBinding),
    Picture(Picture),
}

/// The engine's per-buffer record. Owned by the adapter except while the
/// buffer is queued at the engine.
#[derive(Debug)]
pub struct BufferHeader {
    pub id: BufferId,
    pub port: u32,
    pub filled_len: usize,
    pub alloc_len: usize,
    pub flags: BufferFlags,
    /// Not a time. The adapter stamps the client's bitstream buffer id here
    /// on input and reads it back from the producing output header, because
    /// the engine offers no other side channel that survives the decode
    /// pipeline.
    pub timestamp: i64,
    pub buffer: Option<Bytes>,
    pub app: AppData,
}

impl BufferHeader {
    /// Drops any attached side data and returns it.
    pub fn take_app(&mut self) -> AppData {
        std::mem::take(&mut self.app)
    }
}

/// The asynchronous component API. Every call returns immediately; command
/// completion, errors and buffer returns arrive through the poster handed
/// to [`Engine::get_handle`].
pub trait Engine {
    fn init(&mut self) -> EngineResult<()>;
    fn deinit(&mut self) -> EngineResult<()>;

    /// Returns the name of the (single) component implementing `role`.
    fn component_of_role(&mut self, role: &str) -> EngineResult<String>;
    fn get_handle(&mut self, component: &str, poster: EnginePoster)
        -> EngineResult<ComponentHandle>;
    fn free_handle(&mut self, handle: ComponentHandle) -> EngineResult<()>;

    fn get_video_ports(&mut self, handle: ComponentHandle) -> EngineResult<PortRange>;
    fn set_role(&mut self, handle: ComponentHandle, role: &str) -> EngineResult<()>;
    fn get_port_definition(&mut self, handle: ComponentHandle, port: u32)
        -> EngineResult<PortDefinition>;
    fn set_port_definition(&mut self, handle: ComponentHandle, def: &PortDefinition)
        -> EngineResult<()>;

    fn send_command(&mut self, handle: ComponentHandle, command: Command) -> EngineResult<()>;

    /// Registers a buffer header on `port` backed by memory the adapter
    /// supplies later (zero-copy input path).
    fn use_buffer(&mut self, handle: ComponentHandle, port: u32) -> EngineResult<BufferHeader>;
    /// Registers a buffer header on `port` backed by engine-allocated
    /// memory.
    fn allocate_buffer(&mut self, handle: ComponentHandle, port: u32)
        -> EngineResult<BufferHeader>;
    fn free_buffer(&mut self, handle: ComponentHandle, port: u32, header: BufferHeader)
        -> EngineResult<()>;

    fn empty_this_buffer(&mut self, handle: ComponentHandle, header: BufferHeader)
        -> EngineResult<()>;
    fn fill_this_buffer(&mut self, handle: ComponentHandle, header: BufferHeader)
        -> EngineResult<()>;
}

/// [`Engine`] plus the handle of the currently open component. All of the
/// adapter's engine traffic goes through this wrapper so that "is a
/// component open" is a single place to check.
pub struct EngineClient {
    engine: Box<dyn Engine>,
    handle: Option<ComponentHandle>,
}

impl EngineClient {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self { engine, handle: None }
    }

    pub fn init(&mut self) -> EngineResult<()> {
        self.engine.init()
    }

    pub fn has_component(&self) -> bool {
        self.handle.is_some()
    }

    pub fn component_of_role(&mut self, role: &str) -> EngineResult<String> {
        self.engine.component_of_role(role)
    }

    pub fn open_component(&mut self, component: &str, poster: EnginePoster) -> EngineResult<()> {
        let handle = self.engine.get_handle(component, poster)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Frees the component handle and deinitializes the engine. Errors are
    /// logged, not propagated: this only runs on teardown paths that must
    /// make progress.
    pub fn close_component(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.engine.free_handle(handle) {
                log::error!("free_handle failed: {}", e);
            }
        }
        if let Err(e) = self.engine.deinit() {
            log::error!("engine deinit failed: {}", e);
        }
    }

    fn component(&self) -> EngineResult<ComponentHandle> {
        self.handle.ok_or_else(|| anyhow::anyhow!("no open component").into())
    }

    pub fn get_video_ports(&mut self) -> EngineResult<PortRange> {
        let handle = self.component()?;
        self.engine.get_video_ports(handle)
    }

    pub fn set_role(&mut self, role: &str) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.set_role(handle, role)
    }

    pub fn get_port_definition(&mut self, port: u32) -> EngineResult<PortDefinition> {
        let handle = self.component()?;
        self.engine.get_port_definition(handle, port)
    }

    pub fn set_port_definition(&mut self, def: &PortDefinition) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.set_port_definition(handle, def)
    }

    pub fn send_command(&mut self, command: Command) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.send_command(handle, command)
    }

    pub fn use_buffer(&mut self, port: u32) -> EngineResult<BufferHeader> {
        let handle = self.component()?;
        self.engine.use_buffer(handle, port)
    }

    pub fn allocate_buffer(&mut self, port: u32) -> EngineResult<BufferHeader> {
        let handle = self.component()?;
        self.engine.allocate_buffer(handle, port)
    }

    pub fn free_buffer(&mut self, port: u32, header: BufferHeader) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.free_buffer(handle, port, header)
    }

    pub fn empty_this_buffer(&mut self, header: BufferHeader) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.empty_this_buffer(handle, header)
    }

    pub fn fill_this_buffer(&mut self, header: BufferHeader) -> EngineResult<()> {
        let handle = self.component()?;
        self.engine.fill_this_buffer(handle, header)
    }
}
