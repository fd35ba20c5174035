//! Playback channel: server→client audio, replayed against the media
//! clock through the pluggable sound backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::connection::{ChannelHandler, Connection};
use crate::primitives::WireReader;
use crate::proto::{
    SPICE_AUDIO_DATA_MODE_OPUS, SPICE_AUDIO_DATA_MODE_RAW, SPICE_MSG_PLAYBACK_DATA,
    SPICE_MSG_PLAYBACK_MODE, SPICE_MSG_PLAYBACK_MUTE, SPICE_MSG_PLAYBACK_START,
    SPICE_MSG_PLAYBACK_STOP, SPICE_MSG_PLAYBACK_VOLUME,
};
use crate::sound::OpusDecoder;
use crate::timebuffer::TimeBuffer;

struct PlaybackState {
    mode: u16,
    channels: u32,
    format: u16,
    frequency: u32,
    decoder: Option<Box<dyn OpusDecoder>>,
    buffer: Option<Arc<TimeBuffer>>,
}

pub struct PlaybackChannel {
    client: Arc<ClientInner>,
    #[allow(dead_code)]
    conn: Arc<Connection>,
    state: Mutex<PlaybackState>,
    muted: AtomicBool,
}

impl PlaybackChannel {
    pub(crate) fn new(client: Arc<ClientInner>, conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(PlaybackChannel {
            client,
            conn,
            state: Mutex::new(PlaybackState {
                mode: 0,
                channels: 0,
                format: 0,
                frequency: 0,
                decoder: None,
                buffer: None,
            }),
            muted: AtomicBool::new(false),
        })
    }

    pub fn set_mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn toggle_mute(&self) {
        self.muted.fetch_xor(true, Ordering::SeqCst);
    }

    fn handle_start(&self, data: &[u8]) {
        let mut r = WireReader::new(data, "playback start");
        let parsed: Result<_, _> = (|| Ok::<_, crate::error::SpiceError>((
            r.u32()?,
            r.u16()?,
            r.u32()?,
            r.u32()?,
        )))();
        let Ok((channels, format, frequency, time)) = parsed else {
            warn!("playback start truncated, giving up");
            return;
        };

        info!(channels, format, frequency, time, "playback start");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if channels == state.channels && format == state.format && frequency == state.frequency {
            return;
        }
        if format != 1 {
            warn!(format, "unsupported audio format, only 1=S16 is supported");
            return;
        }

        let Some(sound) = self.client.sound.as_ref() else {
            debug!("no sound backend, playback ignored");
            return;
        };

        if let Some(old) = state.buffer.take() {
            old.stop();
        }

        // 10 ms of interleaved samples per output frame
        let frame_samples = (channels * frequency / 100) as usize;
        let output = match sound.open_output(channels, frequency, frame_samples) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "failed to open audio output");
                return;
            }
        };

        state.channels = channels;
        state.format = format;
        state.frequency = frequency;
        state.buffer = Some(TimeBuffer::spawn(
            Arc::clone(&self.client.clock),
            output,
            frame_samples,
        ));

        if state.mode == SPICE_AUDIO_DATA_MODE_OPUS {
            match sound.opus_decoder(frequency, channels) {
                Ok(dec) => state.decoder = Some(dec),
                Err(e) => warn!(error = %e, "failed to initialize opus decoder"),
            }
        }
    }

    fn handle_data(&self, data: &[u8]) {
        if self.muted() {
            return;
        }
        if data.len() < 4 {
            return;
        }
        let time = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let media = &data[4..];

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(buffer) = state.buffer.clone() else {
            // audio output is not ready
            return;
        };

        match state.mode {
            SPICE_AUDIO_DATA_MODE_RAW => {
                let pcm: Vec<i16> = media
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                buffer.append(time, pcm);
            }
            SPICE_AUDIO_DATA_MODE_OPUS => {
                // fragments carry 10 ms of audio
                let frame_size = (state.channels * 10 * state.frequency / 1000) as usize;
                let channels = state.channels as usize;
                let Some(decoder) = state.decoder.as_mut() else {
                    return;
                };
                let mut pcm = vec![0i16; frame_size];
                match decoder.decode(media, &mut pcm) {
                    Ok(n) => {
                        pcm.truncate(n * channels);
                        buffer.append(time, pcm);
                    }
                    Err(e) => warn!(error = %e, "opus decode failed"),
                }
            }
            other => debug!(mode = other, "playback data in unknown mode"),
        }
    }
}

#[async_trait]
impl ChannelHandler for PlaybackChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_PLAYBACK_DATA => self.handle_data(data),
            SPICE_MSG_PLAYBACK_MODE => {
                if data.len() < 6 {
                    warn!("playback mode message truncated");
                    return;
                }
                let time = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let mode = u16::from_le_bytes([data[4], data[5]]);
                info!(time, mode, "playback mode");
                self.state.lock().unwrap_or_else(|e| e.into_inner()).mode = mode;
            }
            SPICE_MSG_PLAYBACK_START => self.handle_start(data),
            SPICE_MSG_PLAYBACK_STOP => {
                debug!("playback stop");
            }
            SPICE_MSG_PLAYBACK_VOLUME => {
                if let Some(volumes) = parse_volume(data) {
                    info!(?volumes, "playback volume");
                }
            }
            SPICE_MSG_PLAYBACK_MUTE => {
                if !data.is_empty() {
                    info!(mute = data[0], "playback mute state from server");
                }
            }
            other => debug!(typ = other, "unhandled playback message"),
        }
    }
}

/// `nchannels:u8` then one u16 volume per channel.
pub(crate) fn parse_volume(data: &[u8]) -> Option<Vec<u16>> {
    let count = *data.first()? as usize;
    let rest = &data[1..];
    if rest.len() != count * 2 {
        return None;
    }
    Some(
        rest.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect(),
    )
}
