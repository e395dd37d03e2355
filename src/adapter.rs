// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The video decode accelerator adapter.
//!
//! [`VideoDecodeAdapter`] drives the asynchronous codec engine from the
//! client thread. Client calls either act on the engine directly or queue
//! work while a transition is in flight; engine callbacks arrive through
//! the event queue and are dispatched against the pair of coordinates the
//! adapter tracks: the high-level [`OperationState`] (what the client last
//! asked for) and the [`EngineState`] mirror (what the engine last
//! acknowledged).
//!
//! The embedder drives the adapter by calling [`VideoDecodeAdapter::service`]
//! from its event loop; no adapter call blocks on an engine
//! acknowledgement, with the single exception of [`VideoDecodeAdapter::destroy`],
//! which pumps the queue itself until the engine has unwound.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::client::Client;
use crate::client::ClientRoute;
use crate::client::Error;
use crate::client::PictureBuffer;
use crate::client::TextureTarget;
use crate::engine::AppData;
use crate::engine::AvcProfile;
use crate::engine::BufferHeader;
use crate::engine::Command;
use crate::engine::CommandAck;
use crate::engine::Engine;
use crate::engine::EngineClient;
use crate::engine::EngineEvent;
use crate::engine::EngineState;
use crate::engine::PortDir;
use crate::engine::PortSettingsIndex;
use crate::engine::ROLE_AVC;
use crate::engine::ROLE_VPX;
use crate::events::EngineMessage;
use crate::events::EnginePoster;
use crate::events::EventQueue;
use crate::registry::BufferRegistry;
use crate::shm::BitstreamBuffer;
use crate::shm::InputBinding;
use crate::sync_gate::FenceFactory;
use crate::sync_gate::PictureSyncGate;
use crate::DecodedFormat;
use crate::Resolution;
use crate::VideoCodecProfile;

/// Number of picture buffers negotiated with the client, and of fake
/// output buffers allocated before the stream dimensions are known.
pub const NUM_PICTURE_BUFFERS: usize = 8;

/// How often the destroy drain loop wakes to pump engine acknowledgements.
const DESTROY_PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// The adapter's view of what the client most recently asked for. Exactly
/// one is active at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationState {
    None,
    Initializing,
    Flushing,
    Resetting,
    Destroying,
    Erroring,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Codec {
    H264,
    Vp8,
}

impl Codec {
    fn role(&self) -> &'static str {
        match self {
            Codec::H264 => ROLE_AVC,
            Codec::Vp8 => ROLE_VPX,
        }
    }
}

/// Maps a client-requested H.264 profile to the engine's AVC profile. The
/// engine wants High-class resources for everything above Main, so the
/// profiles it has no equivalent for collapse to High444.
///
/// Must not be called for VP8.
fn map_h264_profile(profile: VideoCodecProfile) -> AvcProfile {
    match profile {
        VideoCodecProfile::H264Baseline => AvcProfile::Baseline,
        VideoCodecProfile::H264Main => AvcProfile::Main,
        VideoCodecProfile::H264Extended => AvcProfile::Extended,
        VideoCodecProfile::H264High => AvcProfile::High,
        VideoCodecProfile::H264High10 => AvcProfile::High10,
        VideoCodecProfile::H264High422 => AvcProfile::High422,
        VideoCodecProfile::H264High444Predictive
        | VideoCodecProfile::H264ScalableBaseline
        | VideoCodecProfile::H264ScalableHigh
        | VideoCodecProfile::H264StereoHigh
        | VideoCodecProfile::H264MultiviewHigh => AvcProfile::High444,
        VideoCodecProfile::Vp8 => unreachable!("VP8 has no AVC profile"),
    }
}

pub struct VideoDecodeAdapter {
    engine: EngineClient,
    events: Arc<EventQueue>,
    client: ClientRoute,
    fences: Box<dyn FenceFactory>,

    registry: BufferRegistry,
    sync_gate: PictureSyncGate,

    op_state: OperationState,
    engine_state: EngineState,
    init_begun: bool,

    input_port: u32,
    output_port: u32,
    input_buffer_count: usize,
    input_buffer_size: usize,
    last_requested_dimensions: Resolution,

    h264_profile: Option<AvcProfile>,
}

impl VideoDecodeAdapter {
    /// Creates an adapter over `engine`. Fails if the engine core cannot be
    /// initialized.
    pub fn new(engine: Box<dyn Engine>, fences: Box<dyn FenceFactory>) -> Result<Self, Error> {
        let mut engine = EngineClient::new(engine);
        engine.init().map_err(|e| {
            log::error!("failed to initialize engine core: {}", e);
            Error::PlatformFailure
        })?;
        Ok(Self {
            engine,
            events: Arc::new(EventQueue::default()),
            client: ClientRoute::unconnected(),
            fences,
            registry: BufferRegistry::default(),
            sync_gate: PictureSyncGate::default(),
            op_state: OperationState::None,
            engine_state: EngineState::Unknown,
            init_begun: false,
            input_port: 0,
            output_port: 0,
            input_buffer_count: 0,
            input_buffer_size: 0,
            last_requested_dimensions: Resolution::default(),
            h264_profile: None,
        })
    }

    pub fn operation_state(&self) -> OperationState {
        self.op_state
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    /// The engine AVC profile negotiated at initialization, for H.264
    /// sessions.
    pub fn avc_profile(&self) -> Option<AvcProfile> {
        self.h264_profile
    }

    /// Counters and populations, exposed for embedders that want to assert
    /// the buffer-conservation invariant.
    pub fn input_buffer_count(&self) -> usize {
        self.input_buffer_count
    }

    pub fn free_input_buffers(&self) -> usize {
        self.registry.free_input_len()
    }

    pub fn input_buffers_at_engine(&self) -> usize {
        self.registry.input_at_engine()
    }

    pub fn output_buffers_at_engine(&self) -> usize {
        self.registry.output_at_engine()
    }

    /// Opens the engine component for `profile` and starts driving it
    /// toward EXECUTING. Completion is reported through
    /// `notify_initialization_complete`.
    pub fn initialize(
        &mut self,
        profile: VideoCodecProfile,
        client: Rc<RefCell<dyn Client>>,
    ) -> Result<(), Error> {
        if let Err(error) = self.try_initialize(profile, client) {
            self.stop_on_error(error);
            return Err(error);
        }
        Ok(())
    }

    fn try_initialize(
        &mut self,
        profile: VideoCodecProfile,
        client: Rc<RefCell<dyn Client>>,
    ) -> Result<(), Error> {
        let codec = if profile.is_h264() {
            self.h264_profile = Some(map_h264_profile(profile));
            log::debug!("decoding {:?} as AVC profile {:?}", profile, self.h264_profile);
            Codec::H264
        } else {
            Codec::Vp8
        };

        if !self.fences.supports_fence_sync() {
            log::error!("graphics surface does not support fence sync");
            return Err(Error::PlatformFailure);
        }

        self.client.connect(client);

        self.create_component(codec.role())?;

        debug_assert_eq!(self.op_state, OperationState::None);
        self.op_state = OperationState::Initializing;
        self.begin_transition(EngineState::Idle)?;

        // Register buffers now so the engine has something to bind as it
        // enters IDLE: real input headers, and fake output buffers that
        // drive decoding until the stream's dimensions are known.
        let (registry, engine) = (&mut self.registry, &mut self.engine);
        registry.allocate_inputs(engine, self.input_port, self.input_buffer_count).map_err(
            |e| {
                log::error!("failed to register input buffers: {}", e);
                Error::PlatformFailure
            },
        )?;
        registry.allocate_fake_outputs(engine, self.output_port, NUM_PICTURE_BUFFERS).map_err(
            |e| {
                log::error!("failed to allocate fake output buffers: {}", e);
                Error::PlatformFailure
            },
        )?;

        self.init_begun = true;
        Ok(())
    }

    fn create_component(&mut self, role: &str) -> Result<(), Error> {
        let component = self.engine.component_of_role(role).map_err(|e| {
            log::error!("unsupported role {}: {}", role, e);
            Error::PlatformFailure
        })?;

        let poster = EnginePoster::new(Arc::downgrade(&self.events));
        self.engine.open_component(&component, poster).map_err(|e| {
            log::error!("failed to open component {}: {}", component, e);
            Error::PlatformFailure
        })?;
        self.engine_state = EngineState::Loaded;

        let ports = self.engine.get_video_ports().map_err(|e| {
            log::error!("failed to query video ports: {}", e);
            Error::PlatformFailure
        })?;
        if ports.count != 2 {
            log::error!("expected 2 ports, component reports {}", ports.count);
            return Err(Error::PlatformFailure);
        }
        self.input_port = ports.start;
        self.output_port = ports.start + 1;

        // Components can serve several roles; pin ours.
        self.engine.set_role(role).map_err(|e| {
            log::error!("failed to set component role: {}", e);
            Error::PlatformFailure
        })?;

        let input_def = self.engine.get_port_definition(self.input_port).map_err(|e| {
            log::error!("failed to read input port definition: {}", e);
            Error::PlatformFailure
        })?;
        if input_def.dir != PortDir::Input {
            log::error!("expected input port at index {}", self.input_port);
            return Err(Error::PlatformFailure);
        }
        self.input_buffer_count = input_def.buffer_count_actual as usize;
        self.input_buffer_size = input_def.buffer_size as usize;
        log::debug!(
            "input port {}: {} buffers of {} bytes",
            self.input_port,
            self.input_buffer_count,
            self.input_buffer_size
        );

        let mut output_def = self.engine.get_port_definition(self.output_port).map_err(|e| {
            log::error!("failed to read output port definition: {}", e);
            Error::PlatformFailure
        })?;
        if output_def.dir != PortDir::Output {
            log::error!("expected output port at index {}", self.output_port);
            return Err(Error::PlatformFailure);
        }

        output_def.buffer_count_actual = NUM_PICTURE_BUFFERS as u32;
        // Seed the output dimensions with an impossible value so the engine
        // reports a port-settings-changed event as soon as it learns the
        // stream's real dimensions from decoded data.
        output_def.frame_width = u32::MAX;
        output_def.frame_height = u32::MAX;
        self.engine.set_port_definition(&output_def).map_err(|e| {
            log::error!("failed to rewrite output port definition: {}", e);
            Error::PlatformFailure
        })?;

        Ok(())
    }

    /// Submits one bitstream buffer for decoding, or queues it if a
    /// transition is in progress or no input buffer is free.
    pub fn decode(&mut self, bitstream: BitstreamBuffer) {
        log::trace!("decode, buffer id {}", bitstream.id);

        if self.op_state == OperationState::Resetting
            || self.op_state == OperationState::Initializing
            || self.registry.has_queued_bitstream()
            || !self.registry.has_free_input()
        {
            self.registry.queue_bitstream(bitstream);
            return;
        }

        if let Err(error) = self.try_decode(bitstream) {
            self.stop_on_error(error);
        }
    }

    fn try_decode(&mut self, bitstream: BitstreamBuffer) -> Result<(), Error> {
        if !matches!(self.op_state, OperationState::None | OperationState::Flushing)
            || !matches!(self.engine_state, EngineState::Idle | EngineState::Executing)
        {
            log::error!(
                "decode in invalid state or transition: {:?}, {:?}",
                self.op_state,
                self.engine_state
            );
            return Err(Error::IllegalState);
        }

        // The header is off the free list from here on. An error below
        // consumes it: the error path tears everything down anyway.
        let mut header = self.registry.take_free_input().ok_or(Error::IllegalState)?;
        debug_assert!(matches!(header.app, AppData::None));

        if bitstream.is_end_of_stream() {
            header.filled_len = 0;
            header.alloc_len = 0;
            header.flags.set_eos();
            header.timestamp = -2;
            header.buffer = None;
            self.engine.empty_this_buffer(header).map_err(|e| {
                log::error!("empty_this_buffer failed: {}", e);
                Error::PlatformFailure
            })?;
            self.registry.note_input_sent();
            return Ok(());
        }

        let handle = bitstream.handle.ok_or_else(|| {
            log::error!("bitstream buffer {} has no memory handle", bitstream.id);
            Error::UnreadableInput
        })?;
        let region = handle.map_read_only(bitstream.size).map_err(|e| {
            log::error!("failed to map bitstream buffer {}: {}", bitstream.id, e);
            Error::UnreadableInput
        })?;

        header.filled_len = bitstream.size;
        header.alloc_len = bitstream.size;
        header.flags.clear_eos();
        // Abuse the header's timestamp to propagate the bitstream buffer id
        // to the produced output header, where picture delivery reads it
        // back.
        header.timestamp = bitstream.id as i64;
        header.buffer = Some(region.clone());
        header.app = AppData::Input(InputBinding { region, bitstream_buffer_id: bitstream.id });

        self.engine.empty_this_buffer(header).map_err(|e| {
            log::error!("empty_this_buffer failed: {}", e);
            Error::PlatformFailure
        })?;
        self.registry.note_input_sent();
        Ok(())
    }

    /// Registers the picture buffers the client allocated in response to
    /// `provide_picture_buffers`, then re-enables the output port.
    pub fn assign_picture_buffers(&mut self, buffers: Vec<PictureBuffer>) {
        // Under these operations a fill would fail anyway, and the error
        // path it would trigger skips the buffer-free protocol and leaks
        // the registrations.
        if matches!(
            self.op_state,
            OperationState::Resetting | OperationState::Destroying | OperationState::Erroring
        ) {
            return;
        }

        if !self.can_fill_buffer() {
            log::error!("picture buffers assigned while unable to fill");
            self.stop_on_error(Error::IllegalState);
            return;
        }
        if buffers.len() != NUM_PICTURE_BUFFERS {
            log::error!(
                "wrong picture buffer count: got {}, requested {}",
                buffers.len(),
                NUM_PICTURE_BUFFERS
            );
            self.stop_on_error(Error::InvalidArgument);
            return;
        }

        debug_assert_eq!(self.registry.output_at_engine(), 0);
        debug_assert!(!self.registry.has_fake_outputs());
        debug_assert_eq!(self.registry.pictures_len(), 0);

        let (registry, engine) = (&mut self.registry, &mut self.engine);
        if let Err(e) = registry.adopt_picture_buffers(engine, self.output_port, &buffers) {
            log::error!("failed to register output buffers: {}", e);
            self.stop_on_error(Error::PlatformFailure);
            return;
        }

        if let Err(e) = self.engine.send_command(Command::PortEnable(self.output_port)) {
            log::error!("port enable failed: {}", e);
            self.stop_on_error(Error::PlatformFailure);
        }
    }

    /// Returns a delivered picture for reuse. The buffer goes back to the
    /// engine only once its graphics fence signals.
    pub fn reuse_picture_buffer(&mut self, picture_buffer_id: i32) {
        log::trace!("reuse picture buffer, id {}", picture_buffer_id);
        let fence = match self.fences.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                log::error!("failed to create picture fence: {}", e);
                self.stop_on_error(Error::PlatformFailure);
                return;
            }
        };
        self.sync_gate.defer(picture_buffer_id, fence, Instant::now());
        // First status check happens right away; an idle GPU releases the
        // picture without a poll delay.
        self.poll_picture_fences();
    }

    fn queue_picture_buffer(&mut self, picture_buffer_id: i32) {
        // While ports are flushing, the engine must not be handed buffers.
        if self.op_state == OperationState::Resetting {
            self.registry.queue_picture(picture_buffer_id);
            return;
        }

        // Teardown may have started while the fence was pending. The
        // picture is still in the registry, which is what cleanup walks.
        if !self.can_fill_buffer() {
            return;
        }

        if !self.registry.has_picture(picture_buffer_id) {
            log::error!("missing picture buffer id: {}", picture_buffer_id);
            self.stop_on_error(Error::InvalidArgument);
            return;
        }
        let Some(header) = self.registry.take_picture_header(picture_buffer_id) else {
            log::debug!("picture {} already queued at the engine", picture_buffer_id);
            return;
        };

        self.registry.note_output_sent();
        if let Err(e) = self.engine.fill_this_buffer(header) {
            log::error!("fill_this_buffer failed: {}", e);
            self.stop_on_error(Error::PlatformFailure);
        }
    }

    /// Pushes an end-of-stream marker through the pipeline; completion is
    /// reported through `notify_flush_done` once the EOS picture emerges.
    pub fn flush(&mut self) {
        if self.op_state != OperationState::None || self.engine_state != EngineState::Executing {
            log::error!(
                "flush in invalid state or transition: {:?}, {:?}",
                self.op_state,
                self.engine_state
            );
            self.stop_on_error(Error::IllegalState);
            return;
        }
        self.op_state = OperationState::Flushing;
        self.decode(BitstreamBuffer::end_of_stream());
    }

    fn on_reached_eos_in_flushing(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Executing);
        self.op_state = OperationState::None;
        self.client.notify(|c| c.notify_flush_done());
    }

    /// Drops all undelivered decode state. Completion is reported through
    /// `notify_reset_done` after both ports have flushed.
    pub fn reset(&mut self) {
        if self.op_state != OperationState::None || self.engine_state != EngineState::Executing {
            log::error!(
                "reset in invalid state or transition: {:?}, {:?}",
                self.op_state,
                self.engine_state
            );
            self.stop_on_error(Error::IllegalState);
            return;
        }
        self.op_state = OperationState::Resetting;
        if let Err(error) = self.begin_transition(EngineState::Paused) {
            self.stop_on_error(error);
        }
    }

    /// Tears the adapter down. Synchronous from the caller's point of view:
    /// no client notification fires after this returns. Internally the
    /// engine state machine must unwind asynchronously, so this pumps the
    /// event queue until the component handle clears.
    pub fn destroy(mut self) {
        self.client.invalidate();

        if matches!(self.op_state, OperationState::Erroring | OperationState::Destroying) {
            // The engine-side teardown is already in flight; late callbacks
            // land on a dead weak identity once we drop.
            return;
        }

        debug_assert!(matches!(
            self.op_state,
            OperationState::None | OperationState::Flushing | OperationState::Resetting
        ));

        // Never initialized: nothing to unwind.
        if self.engine_state == EngineState::Unknown {
            return;
        }
        // Already unwound far enough to free the handle directly.
        if matches!(self.engine_state, EngineState::Invalid | EngineState::Loaded) {
            self.shutdown_component();
            return;
        }

        debug_assert!(matches!(
            self.engine_state,
            EngineState::Executing | EngineState::Idle | EngineState::Paused
        ));
        self.op_state = OperationState::Destroying;
        if let Err(error) = self.begin_transition(EngineState::Idle) {
            self.stop_on_error(error);
        }

        // The engine's acknowledgements need a thread to land on, even
        // during process shutdown; keep pumping until the handle clears.
        let events = Arc::clone(&self.events);
        while self.engine.has_component() {
            if let Some(message) = events.pop_timeout(DESTROY_PUMP_INTERVAL) {
                self.dispatch(message);
            }
        }
    }

    /// Drains pending engine messages and polls picture fences. The
    /// embedder calls this from its event loop.
    pub fn service(&mut self) {
        self.pump_events();
        self.poll_picture_fences();
    }

    /// Dispatches every queued engine message.
    pub fn pump_events(&mut self) {
        let events = Arc::clone(&self.events);
        while let Some(message) = events.try_pop() {
            self.dispatch(message);
        }
    }

    /// Dispatches at most one queued engine message. Returns whether one
    /// was dispatched.
    pub fn pump_one_event(&mut self) -> bool {
        let message = self.events.try_pop();
        match message {
            Some(message) => {
                self.dispatch(message);
                true
            }
            None => false,
        }
    }

    /// The earliest instant at which a picture fence is due for a status
    /// check, if any picture is gated.
    pub fn next_fence_deadline(&self) -> Option<Instant> {
        self.sync_gate.next_deadline()
    }

    fn poll_picture_fences(&mut self) {
        for picture_buffer_id in self.sync_gate.poll(Instant::now()) {
            self.queue_picture_buffer(picture_buffer_id);
        }
    }

    fn dispatch(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Event(event) => self.on_engine_event(event),
            EngineMessage::InputReturned(header) => self.on_input_returned(header),
            EngineMessage::OutputProduced(header) => self.on_output_produced(header),
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::CmdComplete(CommandAck::PortDisabled(port)) => {
                debug_assert_eq!(port, self.output_port);
                self.on_output_port_disabled();
            }
            EngineEvent::CmdComplete(CommandAck::PortEnabled(port)) => {
                debug_assert_eq!(port, self.output_port);
                self.on_output_port_enabled();
            }
            EngineEvent::CmdComplete(CommandAck::StateSet(state)) => {
                self.dispatch_state_reached(state);
            }
            EngineEvent::CmdComplete(CommandAck::Flushed(port)) => {
                if matches!(
                    self.op_state,
                    OperationState::Destroying | OperationState::Erroring
                ) {
                    return;
                }
                debug_assert_eq!(self.op_state, OperationState::Resetting);
                if port == self.input_port {
                    self.on_input_port_flush_done();
                } else if port == self.output_port {
                    self.on_output_port_flush_done();
                } else {
                    log::error!("unexpected port flushed: {}", port);
                    debug_assert!(false);
                }
            }
            EngineEvent::Error { code } => {
                if !matches!(
                    self.op_state,
                    OperationState::Destroying | OperationState::Erroring
                ) {
                    log::error!("engine error event: {:#x}", code);
                    self.stop_on_error(Error::PlatformFailure);
                }
            }
            EngineEvent::PortSettingsChanged { port, index } => {
                if port == self.output_port && index == PortSettingsIndex::Definition {
                    // Output resize; kick off handling by pausing the
                    // output port.
                    if let Err(e) = self.engine.send_command(Command::PortDisable(self.output_port))
                    {
                        log::error!("port disable failed: {}", e);
                        self.stop_on_error(Error::PlatformFailure);
                    }
                } else if port == self.output_port {
                    // Crop and scale changes are accepted and ignored.
                    log::debug!("ignoring output port settings change: {:?}", index);
                } else {
                    log::error!("unexpected settings change on port {}", port);
                    self.stop_on_error(Error::PlatformFailure);
                }
            }
            EngineEvent::BufferFlag { port, .. } => {
                if port == self.output_port {
                    // In case of destroy interrupting flush.
                    if self.op_state == OperationState::Destroying {
                        return;
                    }
                    debug_assert_eq!(self.op_state, OperationState::Flushing);
                    // Nothing to do; the EOS picture delivery notifies the
                    // client.
                } else {
                    log::error!("unexpected buffer flag on port {}", port);
                    self.stop_on_error(Error::PlatformFailure);
                }
            }
        }
    }

    fn dispatch_state_reached(&mut self, reached: EngineState) {
        match (self.op_state, reached) {
            (OperationState::Initializing, EngineState::Idle) => {
                self.on_reached_idle_in_initializing()
            }
            (OperationState::Initializing, EngineState::Executing) => {
                self.on_reached_executing_in_initializing()
            }
            (OperationState::Resetting, EngineState::Paused) => {
                self.on_reached_pause_in_resetting()
            }
            (OperationState::Resetting, EngineState::Executing) => {
                self.on_reached_executing_in_resetting()
            }
            // Destroy can interrupt an in-progress reset; the acks for the
            // overwritten transition arrive with the destroy transition
            // already queued at the engine, so they are no-ops here.
            (OperationState::Destroying, EngineState::Paused)
            | (OperationState::Destroying, EngineState::Executing) => (),
            (OperationState::Destroying, EngineState::Idle) => {
                self.on_reached_idle_in_destroying()
            }
            (OperationState::Destroying, EngineState::Loaded) => {
                self.on_reached_loaded_in_destroying()
            }
            (OperationState::Erroring, EngineState::Invalid) => {
                self.on_reached_invalid_in_erroring()
            }
            (op, reached) => {
                log::error!("unexpected state {:?} reached in {:?}", reached, op);
                debug_assert!(false);
            }
        }
    }

    fn on_reached_idle_in_initializing(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Loaded);
        self.engine_state = EngineState::Idle;
        if let Err(error) = self.begin_transition(EngineState::Executing) {
            self.stop_on_error(error);
        }
    }

    fn on_reached_executing_in_initializing(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Idle);
        self.engine_state = EngineState::Executing;
        self.op_state = OperationState::None;

        // Queue the fake buffers to get decoding going. As soon as any data
        // is decoded the engine dismisses them for their dimension
        // mismatch, which produces the settings-change event.
        for header in self.registry.take_fake_outputs() {
            self.registry.note_output_sent();
            if let Err(e) = self.engine.fill_this_buffer(header) {
                log::error!("fill_this_buffer failed: {}", e);
                self.stop_on_error(Error::PlatformFailure);
                return;
            }
        }

        self.client.notify(|c| c.notify_initialization_complete(true));

        // Decodes accepted while initializing waited for this moment.
        self.decode_queued_bitstream_buffers();
    }

    fn on_reached_pause_in_resetting(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Executing);
        self.engine_state = EngineState::Paused;
        // Flush input first; output follows once input acks.
        if let Err(e) = self.engine.send_command(Command::Flush(self.input_port)) {
            log::error!("input port flush failed: {}", e);
            self.stop_on_error(Error::PlatformFailure);
        }
    }

    fn on_input_port_flush_done(&mut self) {
        debug_assert_eq!(self.registry.input_at_engine(), 0);
        if let Err(e) = self.engine.send_command(Command::Flush(self.output_port)) {
            log::error!("output port flush failed: {}", e);
            self.stop_on_error(Error::PlatformFailure);
        }
    }

    fn on_output_port_flush_done(&mut self) {
        debug_assert_eq!(self.registry.output_at_engine(), 0);
        if let Err(error) = self.begin_transition(EngineState::Executing) {
            self.stop_on_error(error);
        }
    }

    fn on_reached_executing_in_resetting(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Paused);
        self.engine_state = EngineState::Executing;
        self.op_state = OperationState::None;
        if !self.client.is_connected() {
            return;
        }

        // Drain the work held back during the reset.
        self.decode_queued_bitstream_buffers();
        for picture_buffer_id in self.registry.take_queued_pictures() {
            self.reuse_picture_buffer(picture_buffer_id);
        }

        self.client.notify(|c| c.notify_reset_done());
    }

    fn decode_queued_bitstream_buffers(&mut self) {
        let buffers = self.registry.take_queued_bitstream();
        if matches!(self.op_state, OperationState::Destroying | OperationState::Erroring) {
            return;
        }
        for bitstream in buffers {
            self.decode(bitstream);
        }
    }

    fn on_reached_idle_in_destroying(&mut self) {
        debug_assert!(matches!(
            self.engine_state,
            EngineState::Executing | EngineState::Idle | EngineState::Paused
        ));
        self.engine_state = EngineState::Idle;

        // The engine returns every queued buffer on the way out of
        // EXECUTING, so no explicit port flush is needed before freeing.
        if let Err(error) = self.begin_transition(EngineState::Loaded) {
            self.stop_on_error(error);
        }

        self.free_engine_buffers();
    }

    fn on_reached_loaded_in_destroying(&mut self) {
        debug_assert_eq!(self.engine_state, EngineState::Idle);
        self.engine_state = EngineState::Loaded;
        self.op_state = OperationState::None;
        self.shutdown_component();
    }

    fn on_reached_invalid_in_erroring(&mut self) {
        self.engine_state = EngineState::Invalid;
        self.free_engine_buffers();
        self.shutdown_component();
    }

    fn shutdown_component(&mut self) {
        self.engine.close_component();
        self.engine_state = EngineState::Final;
    }

    fn free_engine_buffers(&mut self) {
        let (registry, engine, client) = (&mut self.registry, &mut self.engine, &self.client);
        let failure_seen =
            registry.free_all(engine, self.input_port, self.output_port, |picture_buffer_id| {
                client.notify(|c| c.dismiss_picture_buffer(picture_buffer_id));
            });
        if failure_seen {
            log::error!("failed to free some engine buffers");
            self.stop_on_error(Error::PlatformFailure);
        }
    }

    /// Routes every fatal condition: notifies the client at most once,
    /// breaks the notification route, and drives the engine to INVALID so
    /// its resources unwind. Idempotent.
    fn stop_on_error(&mut self, error: Error) {
        if self.op_state == OperationState::Erroring {
            return;
        }

        if self.init_begun {
            self.client.notify(|c| c.notify_error(error));
        }
        self.client.invalidate();

        if matches!(
            self.engine_state,
            EngineState::Invalid | EngineState::Unknown | EngineState::Final
        ) {
            return;
        }

        // Set before sending so a failure below cannot re-enter this path.
        self.op_state = OperationState::Erroring;
        if let Err(e) = self.engine.send_command(Command::SetState(EngineState::Invalid)) {
            // The engine won't deliver the acknowledgement that normally
            // finishes the unwind; do it directly.
            log::error!("failed to request INVALID state: {}", e);
            self.on_reached_invalid_in_erroring();
        }
    }

    fn begin_transition(&mut self, target: EngineState) -> Result<(), Error> {
        debug_assert!(target == EngineState::Invalid || self.op_state != OperationState::None);
        if self.op_state == OperationState::Erroring {
            return Ok(());
        }
        self.engine.send_command(Command::SetState(target)).map_err(|e| {
            log::error!("state transition request failed: {}", e);
            Error::PlatformFailure
        })
    }

    fn on_output_port_disabled(&mut self) {
        let def = match self.engine.get_port_definition(self.output_port) {
            Ok(def) => def,
            Err(e) => {
                log::error!("failed to read output port definition: {}", e);
                self.stop_on_error(Error::PlatformFailure);
                return;
            }
        };
        debug_assert!(def.buffer_count_min as usize <= NUM_PICTURE_BUFFERS);

        // Ask the client for picture buffers of the discovered size;
        // assign_picture_buffers registers them and re-enables the port.
        self.last_requested_dimensions =
            Resolution { width: def.frame_width, height: def.frame_height };
        let dimensions = self.last_requested_dimensions;
        self.client.notify(|c| {
            c.provide_picture_buffers(
                NUM_PICTURE_BUFFERS,
                DecodedFormat::NV12,
                1,
                dimensions,
                TextureTarget::Texture2d,
            )
        });
    }

    fn on_output_port_enabled(&mut self) {
        if self.op_state == OperationState::Resetting {
            // Port flushing is in progress; hold the pictures back until
            // the reset completes.
            for picture_buffer_id in self.registry.picture_ids() {
                self.registry.queue_picture(picture_buffer_id);
            }
            return;
        }

        if !self.can_fill_buffer() {
            self.stop_on_error(Error::IllegalState);
            return;
        }

        // Hand every registered picture to the engine.
        for picture_buffer_id in self.registry.picture_ids() {
            let Some(mut header) = self.registry.take_picture_header(picture_buffer_id) else {
                continue;
            };
            header.flags.clear_eos();
            self.registry.note_output_sent();
            if let Err(e) = self.engine.fill_this_buffer(header) {
                log::error!("fill_this_buffer failed: {}", e);
                self.stop_on_error(Error::PlatformFailure);
                return;
            }
        }
    }

    fn on_input_returned(&mut self, header: BufferHeader) {
        log::trace!("input returned, id {}", header.timestamp);
        if let Some(bitstream_buffer_id) = self.registry.input_returned(header) {
            self.client.notify(|c| c.notify_end_of_bitstream_buffer(bitstream_buffer_id));
        }
        self.decode_queued_bitstream_buffers();
    }

    fn on_output_produced(&mut self, mut header: BufferHeader) {
        let picture_buffer_id = match &header.app {
            AppData::Picture(picture) => picture.picture_buffer_id,
            _ => -1,
        };
        log::trace!("output produced, buffer id {}, picture id {}", header.timestamp, picture_buffer_id);
        self.registry.note_output_returned();

        // Calling into the engine now would fail and re-enter the error
        // path; just park the header where cleanup will find it.
        if matches!(self.op_state, OperationState::Destroying | OperationState::Erroring) {
            if self.registry.is_fake(&header) {
                self.registry.rehome_fake(header);
            } else {
                self.registry.rehome_picture(header);
            }
            return;
        }

        // Fake buffers come back once real decoded data dismisses them for
        // their dimension mismatch; they are done for good.
        if self.registry.is_fake(&header) {
            self.registry.fake_returned(&header);
            if let Err(e) = self.engine.free_buffer(self.output_port, header) {
                log::error!("failed to free fake output buffer: {}", e);
                self.stop_on_error(Error::PlatformFailure);
            }
            return;
        }
        debug_assert!(!self.registry.has_fake_outputs());

        // The EOS picture closes out a flush: notify the client and reuse
        // the underlying picture buffer.
        if header.flags.eos() {
            header.flags.clear_eos();
            self.registry.rehome_picture(header);
            self.on_reached_eos_in_flushing();
            self.reuse_picture_buffer(picture_buffer_id);
            return;
        }

        // During the transition out of EXECUTING and during port flushing
        // all pictures are sent back through here; they must not reach the
        // client.
        if self.op_state == OperationState::Resetting {
            self.registry.rehome_picture(header);
            self.registry.queue_picture(picture_buffer_id);
            return;
        }

        // See try_decode for this abuse of the timestamp field.
        let picture = match &mut header.app {
            AppData::Picture(picture) => {
                picture.bitstream_buffer_id = header.timestamp as i32;
                *picture
            }
            _ => {
                log::error!("produced output carries no ready-record");
                self.stop_on_error(Error::PlatformFailure);
                return;
            }
        };
        self.registry.rehome_picture(header);
        self.client.notify(|c| c.picture_ready(picture));
    }

    fn can_fill_buffer(&self) -> bool {
        !matches!(
            self.op_state,
            OperationState::Destroying | OperationState::Erroring | OperationState::Resetting
        ) && matches!(
            self.engine_state,
            EngineState::Idle | EngineState::Executing | EngineState::Paused
        )
    }
}
