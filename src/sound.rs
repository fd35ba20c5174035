//! Pluggable audio backend.
//!
//! The protocol core never links an audio device or codec library;
//! playback and record channels drive these traits instead. A client
//! built without a [`SoundDriver`] simply ignores audio media.

use async_trait::async_trait;

use crate::error::SoundError;

/// An open output stream, S16LE interleaved.
#[async_trait]
pub trait SoundOutput: Send {
    /// Write exactly one frame buffer. May fail with
    /// [`SoundError::Underrun`], in which case the caller retries.
    async fn write(&mut self, pcm: &[i16]) -> Result<(), SoundError>;
}

/// An open input stream, S16LE interleaved.
#[async_trait]
pub trait SoundInput: Send {
    /// Fill `pcm` with the next captured frame.
    async fn read(&mut self, pcm: &mut [i16]) -> Result<(), SoundError>;
}

/// Opus packet decoder for one stream configuration.
pub trait OpusDecoder: Send {
    /// Decode one packet into `pcm`; returns samples per channel.
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize, SoundError>;
}

/// Opus encoder with a voice-optimised profile.
pub trait OpusEncoder: Send {
    /// Encode one PCM frame into `out`; returns bytes written.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, SoundError>;
}

/// Factory for audio streams and codecs, supplied by the embedder.
pub trait SoundDriver: Send + Sync {
    /// Open an output stream. `frame_samples` is the buffer size the
    /// channel writes per call (10 ms of audio).
    fn open_output(
        &self,
        channels: u32,
        frequency: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn SoundOutput>, SoundError>;

    /// Open an input stream sized like [`open_output`](Self::open_output).
    fn open_input(
        &self,
        channels: u32,
        frequency: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn SoundInput>, SoundError>;

    fn opus_decoder(&self, frequency: u32, channels: u32)
        -> Result<Box<dyn OpusDecoder>, SoundError>;

    fn opus_encoder(&self, frequency: u32, channels: u32)
        -> Result<Box<dyn OpusEncoder>, SoundError>;
}
