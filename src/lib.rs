// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video decode accelerator adapter.
//!
//! This crate sits between a client requesting video decode services and an
//! asynchronous, callback-driven OpenMAX-IL-style codec engine. The
//! [`adapter::VideoDecodeAdapter`] presents a synchronous-feeling,
//! single-threaded API (`initialize`, `decode`, `assign_picture_buffers`,
//! `reuse_picture_buffer`, `flush`, `reset`, `destroy`) while tracking the
//! engine's lifecycle state machine, owning both buffer populations, and
//! guaranteeing that no engine callback reaches the client after teardown.
//!
//! The engine itself is reached through the [`engine::Engine`] trait; its
//! callbacks run on a thread the adapter does not own and are marshaled back
//! to the client thread through [`events::EventQueue`].

pub mod adapter;
pub mod client;
pub mod engine;
pub mod events;
pub mod registry;
pub mod shm;
pub mod sync_gate;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Formats that decoded picture buffers can be exposed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// One Y and one interleaved UV plane, 4:2:0 sampling, 8 bits per sample.
    NV12,
    /// Y, U and V planes, 4:2:0 sampling, 8 bits per sample.
    I420,
}

/// Codec profiles a client can request a decode session for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodecProfile {
    H264Baseline,
    H264Main,
    H264Extended,
    H264High,
    H264High10,
    H264High422,
    H264High444Predictive,
    H264ScalableBaseline,
    H264ScalableHigh,
    H264StereoHigh,
    H264MultiviewHigh,
    Vp8,
}

impl VideoCodecProfile {
    pub fn is_h264(&self) -> bool {
        !matches!(self, VideoCodecProfile::Vp8)
    }
}

/// A profile the accelerator reports as decodable, with its resolution
/// bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SupportedProfile {
    pub profile: VideoCodecProfile,
    pub min_resolution: Resolution,
    pub max_resolution: Resolution,
    pub encrypted_only: bool,
}

const SUPPORTED_PROFILES: [VideoCodecProfile; 4] = [
    VideoCodecProfile::H264Baseline,
    VideoCodecProfile::H264Main,
    VideoCodecProfile::H264High,
    VideoCodecProfile::Vp8,
];

/// Returns the static list of profiles this accelerator supports.
pub fn supported_profiles() -> Vec<SupportedProfile> {
    SUPPORTED_PROFILES
        .iter()
        .map(|&profile| SupportedProfile {
            profile,
            min_resolution: Resolution { width: 16, height: 16 },
            max_resolution: Resolution { width: 1920, height: 1080 },
            encrypted_only: false,
        })
        .collect()
}
