//! Time-aligned playback buffer.
//!
//! Incoming PCM fragments carry the server's media time; each one is
//! replayed once the local media clock reaches it. Single producer (the
//! channel reader), single consumer (the runner task), woken either by
//! a new fragment or by the scheduled time elapsing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::MediaClock;
use crate::error::SoundError;
use crate::sound::SoundOutput;

struct Fragment {
    time: u32,
    pcm: Vec<i16>,
}

pub struct TimeBuffer {
    clock: Arc<MediaClock>,
    frags: Mutex<VecDeque<Fragment>>,
    ping: Notify,
    cancel: CancellationToken,
}

enum Step {
    Play(Fragment),
    Sleep(Duration),
    Idle,
}

impl TimeBuffer {
    /// Create the buffer and start its runner task, which owns the
    /// output stream.
    pub fn spawn(
        clock: Arc<MediaClock>,
        output: Box<dyn SoundOutput>,
        frame_samples: usize,
    ) -> Arc<Self> {
        let buf = Arc::new(TimeBuffer {
            clock,
            frags: Mutex::new(VecDeque::new()),
            ping: Notify::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&buf).run(output, frame_samples));
        buf
    }

    /// Queue a decoded fragment stamped with its media time.
    pub fn append(&self, time: u32, pcm: Vec<i16>) {
        self.frags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Fragment { time, pcm });
        self.ping.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn next_step(&self) -> Step {
        let mut frags = self.frags.lock().unwrap_or_else(|e| e.into_inner());
        let Some(front_time) = frags.front().map(|f| f.time) else {
            return Step::Idle;
        };
        if self.clock.time() >= front_time {
            match frags.pop_front() {
                Some(frag) => Step::Play(frag),
                None => Step::Idle,
            }
        } else {
            Step::Sleep(self.clock.till(front_time))
        }
    }

    async fn run(self: Arc<Self>, mut output: Box<dyn SoundOutput>, frame_samples: usize) {
        // accumulate into one output frame, flushed when full
        let mut out_buf = vec![0i16; frame_samples.max(1)];
        let mut pos = 0usize;

        loop {
            match self.next_step() {
                Step::Play(frag) => {
                    if self
                        .consume(&mut output, &mut out_buf, &mut pos, &frag.pcm)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Step::Sleep(d) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.ping.notified() => {}
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                Step::Idle => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.ping.notified() => {}
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        output: &mut Box<dyn SoundOutput>,
        out_buf: &mut [i16],
        pos: &mut usize,
        mut pcm: &[i16],
    ) -> Result<(), SoundError> {
        loop {
            let n = (out_buf.len() - *pos).min(pcm.len());
            out_buf[*pos..*pos + n].copy_from_slice(&pcm[..n]);

            if *pos + n == out_buf.len() {
                // frame full, push it out; an under-run just retries
                loop {
                    match output.write(out_buf).await {
                        Ok(()) => break,
                        Err(SoundError::Underrun) => {
                            warn!("audio output underrun, retrying");
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "audio output failed");
                            return Err(e);
                        }
                    }
                }
                *pos = 0;
            } else {
                *pos += n;
            }

            if n == pcm.len() {
                return Ok(());
            }
            pcm = &pcm[n..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CollectingOutput {
        frames: Arc<Mutex<Vec<Vec<i16>>>>,
        underruns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SoundOutput for CollectingOutput {
        async fn write(&mut self, pcm: &[i16]) -> Result<(), SoundError> {
            if self.underruns.load(Ordering::SeqCst) > 0 {
                self.underruns.fetch_sub(1, Ordering::SeqCst);
                return Err(SoundError::Underrun);
            }
            self.frames
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(pcm.to_vec());
            Ok(())
        }
    }

    fn test_clock() -> Arc<MediaClock> {
        let clock = Arc::new(MediaClock::new());
        clock.update(1000);
        clock
    }

    async fn wait_for_frames(frames: &Arc<Mutex<Vec<Vec<i16>>>>, n: usize) {
        for _ in 0..200 {
            if frames.lock().unwrap_or_else(|e| e.into_inner()).len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} frames, got {:?}", frames.lock().unwrap().len());
    }

    #[tokio::test]
    async fn due_fragment_plays_immediately() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = CollectingOutput {
            frames: Arc::clone(&frames),
            underruns: Arc::new(AtomicUsize::new(0)),
        };
        let buf = TimeBuffer::spawn(test_clock(), Box::new(out), 4);

        buf.append(500, vec![1, 2, 3, 4]); // already in the past
        wait_for_frames(&frames, 1).await;
        assert_eq!(frames.lock().unwrap()[0], vec![1, 2, 3, 4]);
        buf.stop();
    }

    #[tokio::test]
    async fn fragments_accumulate_into_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = CollectingOutput {
            frames: Arc::clone(&frames),
            underruns: Arc::new(AtomicUsize::new(0)),
        };
        let buf = TimeBuffer::spawn(test_clock(), Box::new(out), 4);

        // two half-frame fragments → one output frame
        buf.append(0, vec![1, 2]);
        buf.append(0, vec![3, 4]);
        wait_for_frames(&frames, 1).await;
        assert_eq!(frames.lock().unwrap()[0], vec![1, 2, 3, 4]);
        buf.stop();
    }

    #[tokio::test]
    async fn underrun_retries_without_dropping() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let underruns = Arc::new(AtomicUsize::new(2));
        let out = CollectingOutput {
            frames: Arc::clone(&frames),
            underruns: Arc::clone(&underruns),
        };
        let buf = TimeBuffer::spawn(test_clock(), Box::new(out), 2);

        buf.append(0, vec![7, 8]);
        wait_for_frames(&frames, 1).await;
        assert_eq!(frames.lock().unwrap()[0], vec![7, 8]);
        assert_eq!(underruns.load(Ordering::SeqCst), 0);
        buf.stop();
    }

    #[tokio::test]
    async fn future_fragment_waits_for_media_time() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = CollectingOutput {
            frames: Arc::clone(&frames),
            underruns: Arc::new(AtomicUsize::new(0)),
        };
        let clock = test_clock();
        let buf = TimeBuffer::spawn(Arc::clone(&clock), Box::new(out), 2);

        // ~60 ms in the future relative to the media clock
        buf.append(1060, vec![9, 9]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(frames.lock().unwrap().is_empty());

        wait_for_frames(&frames, 1).await;
        buf.stop();
    }
}
