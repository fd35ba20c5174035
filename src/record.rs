//! Record channel: client→server audio capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::caps::test_cap;
use crate::client::ClientInner;
use crate::connection::{ChannelHandler, Connection};
use crate::playback::parse_volume;
use crate::primitives::WireReader;
use crate::proto::{
    SPICE_AUDIO_DATA_MODE_OPUS, SPICE_AUDIO_DATA_MODE_RAW, SPICE_MSGC_RECORD_DATA,
    SPICE_MSGC_RECORD_MODE, SPICE_MSGC_RECORD_START_MARK, SPICE_MSG_RECORD_MUTE,
    SPICE_MSG_RECORD_START, SPICE_MSG_RECORD_STOP, SPICE_MSG_RECORD_VOLUME,
    SPICE_RECORD_CAP_OPUS,
};
use crate::sound::{OpusEncoder, SoundInput};

struct RecordState {
    channels: u32,
    format: u16,
    frequency: u32,
}

pub struct RecordChannel {
    client: Arc<ClientInner>,
    conn: Arc<Connection>,
    /// Self handle so the reader callback can spawn the capture task.
    me: Weak<RecordChannel>,
    /// Preferred encoding, fixed at connect from the negotiated caps.
    mode: u16,
    state: Mutex<RecordState>,
    /// Cleared by RECORD_STOP; the capture loop checks it after every
    /// frame.
    running: Arc<AtomicBool>,
}

impl RecordChannel {
    pub(crate) fn new(client: Arc<ClientInner>, conn: Arc<Connection>) -> Arc<Self> {
        let mode = if test_cap(
            conn.valid_caps().first().copied().unwrap_or(0),
            SPICE_RECORD_CAP_OPUS,
        ) {
            SPICE_AUDIO_DATA_MODE_OPUS
        } else {
            SPICE_AUDIO_DATA_MODE_RAW
        };

        Arc::new_cyclic(|me| RecordChannel {
            client,
            conn,
            me: me.clone(),
            mode,
            state: Mutex::new(RecordState { channels: 0, format: 0, frequency: 0 }),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether a capture loop is currently active.
    pub fn is_recording(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn handle_start(self: Arc<Self>, data: &[u8]) {
        let mut r = WireReader::new(data, "record start");
        let parsed: Result<_, _> =
            (|| Ok::<_, crate::error::SpiceError>((r.u32()?, r.u16()?, r.u32()?)))();
        let Ok((channels, format, frequency)) = parsed else {
            warn!("record start truncated, giving up");
            return;
        };

        info!(channels, format, frequency, "record start");

        // announce our mode stamped with the current media time
        let mm_time = self.client.clock.time();
        let mut mode_msg = Vec::with_capacity(6);
        mode_msg.extend_from_slice(&mm_time.to_le_bytes());
        mode_msg.extend_from_slice(&self.mode.to_le_bytes());
        if let Err(e) = self.conn.send(SPICE_MSGC_RECORD_MODE, &mode_msg).await {
            warn!(error = %e, "record mode send failed");
            return;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if channels == state.channels
                && format == state.format
                && frequency == state.frequency
            {
                return;
            }
            if format != 1 {
                warn!(format, "unsupported audio format, only 1=S16 is supported");
                return;
            }
            state.channels = channels;
            state.format = format;
            state.frequency = frequency;
        }

        let Some(sound) = self.client.sound.as_ref() else {
            debug!("no sound backend, record ignored");
            return;
        };

        let frame_samples = (10 * channels * frequency / 1000) as usize;
        let input = match sound.open_input(channels, frequency, frame_samples) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "failed to open audio input");
                return;
            }
        };

        let encoder = if self.mode == SPICE_AUDIO_DATA_MODE_OPUS {
            match sound.opus_encoder(frequency, channels) {
                Ok(enc) => Some(enc),
                Err(e) => {
                    warn!(error = %e, "failed to initialize opus encoder");
                    return;
                }
            }
        } else {
            None
        };

        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(self.capture_loop(input, encoder, frame_samples));
    }

    /// Read, encode and ship microphone data until stopped.
    async fn capture_loop(
        self: Arc<Self>,
        mut input: Box<dyn SoundInput>,
        mut encoder: Option<Box<dyn OpusEncoder>>,
        frame_samples: usize,
    ) {
        let mut pcm = vec![0i16; frame_samples];
        let mut encoded = vec![0u8; 512];

        let mark = self.client.clock.time();
        if self
            .conn
            .send(SPICE_MSGC_RECORD_START_MARK, &mark.to_le_bytes())
            .await
            .is_err()
        {
            return;
        }

        loop {
            if let Err(e) = input.read(&mut pcm).await {
                warn!(error = %e, "audio capture read failed");
                return;
            }

            let payload: &[u8] = match encoder.as_mut() {
                Some(enc) => match enc.encode(&pcm, &mut encoded) {
                    Ok(n) => &encoded[..n],
                    Err(e) => {
                        warn!(error = %e, "opus encode failed");
                        return;
                    }
                },
                None => {
                    encoded.clear();
                    for s in &pcm {
                        encoded.extend_from_slice(&s.to_le_bytes());
                    }
                    &encoded
                }
            };

            let mut msg = Vec::with_capacity(4 + payload.len());
            msg.extend_from_slice(&self.client.clock.time().to_le_bytes());
            msg.extend_from_slice(payload);
            if self.conn.send(SPICE_MSGC_RECORD_DATA, &msg).await.is_err() {
                return;
            }

            if !self.running.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for RecordChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_RECORD_START => {
                if let Some(this) = self.me.upgrade() {
                    this.handle_start(data).await;
                }
            }
            SPICE_MSG_RECORD_STOP => {
                info!("record stop");
                self.running.store(false, Ordering::SeqCst);
            }
            SPICE_MSG_RECORD_VOLUME => {
                if let Some(volumes) = parse_volume(data) {
                    info!(?volumes, "record volume");
                }
            }
            SPICE_MSG_RECORD_MUTE => {
                if !data.is_empty() {
                    info!(mute = data[0], "record mute state from server");
                }
            }
            other => debug!(typ = other, "unhandled record message"),
        }
    }
}
