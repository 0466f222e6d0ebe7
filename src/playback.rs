//! Assistant audio output.
//!
//! Incoming chunks are base64 16-bit PCM at 24 kHz mono. They are decoded
//! to f32 and written to a PulseAudio playback stream in arrival order.
//! The output stream is opened lazily when the first chunk arrives and is
//! reused for the rest of the session.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use thiserror::Error;
use tracing::{debug, error};

use crate::pcm::{self, PcmError};

/// Sample rate of assistant audio, fixed by the upstream model.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("bad audio payload: {0}")]
    Pcm(#[from] PcmError),
    #[error("playback stage is closed")]
    StageClosed,
}

/// Where decoded samples go. The real implementation talks to PulseAudio;
/// tests substitute one that records calls.
pub trait OutputStage {
    /// Bring up the output context. Called at most once per player.
    fn start(&mut self) -> Result<(), PlaybackError>;
    /// Make sure the context is running before more audio is queued.
    fn resume(&mut self) -> Result<(), PlaybackError>;
    /// Queue samples behind everything already queued.
    fn push(&mut self, samples: Vec<f32>) -> Result<(), PlaybackError>;
}

/// Decodes assistant audio chunks and feeds them to an [`OutputStage`].
pub struct AudioPlayer<S: OutputStage> {
    stage: S,
    started: bool,
}

impl<S: OutputStage> AudioPlayer<S> {
    pub fn new(stage: S) -> Self {
        Self {
            stage,
            started: false,
        }
    }

    /// Decode one base64 PCM chunk and queue it for the speakers.
    ///
    /// The first successfully decoded chunk opens the output context;
    /// later calls reuse it. A chunk that fails to decode is rejected
    /// before the context is touched.
    pub fn enqueue(&mut self, chunk_b64: &str) -> Result<(), PlaybackError> {
        let samples = pcm::decode_chunk(chunk_b64)?;
        if !self.started {
            self.stage.start()?;
            self.started = true;
        }
        self.stage.resume()?;
        self.stage.push(samples)
    }
}

/// PulseAudio-backed output stage.
///
/// `start` spawns a writer thread that owns the `Simple` stream; `push`
/// hands it sample buffers over a channel, which preserves arrival order.
#[derive(Default)]
pub struct PulseStage {
    tx: Option<mpsc::Sender<Vec<f32>>>,
    writer: Option<JoinHandle<()>>,
}

impl PulseStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputStage for PulseStage {
    fn start(&mut self) -> Result<(), PlaybackError> {
        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        let writer = thread::spawn(move || {
            let spec = Spec {
                format: Format::F32le,
                channels: 1,
                rate: PLAYBACK_SAMPLE_RATE,
            };
            let simple = match Simple::new(
                None,
                "mirrorlive",
                Direction::Playback,
                None,
                "assistant audio",
                &spec,
                None,
                None,
            ) {
                Ok(s) => s,
                Err(err) => {
                    error!(%err, "failed to open playback stream; assistant audio disabled");
                    return;
                }
            };
            while let Ok(samples) = rx.recv() {
                let mut bytes = Vec::with_capacity(samples.len() * 4);
                for s in &samples {
                    bytes.extend_from_slice(&s.to_le_bytes());
                }
                if let Err(err) = simple.write(&bytes) {
                    error!(%err, "playback write failed; assistant audio disabled");
                    return;
                }
            }
            // Channel closed: session is over, let buffered audio finish.
            if let Err(err) = simple.drain() {
                debug!(%err, "drain at end of playback");
            }
        });
        self.tx = Some(tx);
        self.writer = Some(writer);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        // A Simple playback stream has no suspended state to leave.
        Ok(())
    }

    fn push(&mut self, samples: Vec<f32>) -> Result<(), PlaybackError> {
        let tx = self.tx.as_ref().ok_or(PlaybackError::StageClosed)?;
        tx.send(samples).map_err(|_| PlaybackError::StageClosed)
    }
}

impl Drop for PulseStage {
    fn drop(&mut self) {
        // Dropping the sender ends the writer loop after queued chunks drain.
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[derive(Default)]
    struct RecordingStage {
        starts: usize,
        resumes: usize,
        pushed: Vec<Vec<f32>>,
    }

    impl OutputStage for RecordingStage {
        fn start(&mut self) -> Result<(), PlaybackError> {
            self.starts += 1;
            Ok(())
        }

        fn resume(&mut self) -> Result<(), PlaybackError> {
            self.resumes += 1;
            Ok(())
        }

        fn push(&mut self, samples: Vec<f32>) -> Result<(), PlaybackError> {
            self.pushed.push(samples);
            Ok(())
        }
    }

    fn chunk_of(samples: &[i16]) -> String {
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        STANDARD.encode(bytes)
    }

    #[test]
    fn output_context_starts_exactly_once() {
        let mut player = AudioPlayer::new(RecordingStage::default());
        player.enqueue(&chunk_of(&[0, 1, -1])).unwrap();
        player.enqueue(&chunk_of(&[2, 3])).unwrap();
        player.enqueue(&chunk_of(&[4])).unwrap();
        assert_eq!(player.stage.starts, 1);
        assert_eq!(player.stage.resumes, 3);
    }

    #[test]
    fn chunks_reach_the_stage_in_arrival_order() {
        let mut player = AudioPlayer::new(RecordingStage::default());
        player.enqueue(&chunk_of(&[16384])).unwrap();
        player.enqueue(&chunk_of(&[-16384, 32767])).unwrap();
        assert_eq!(
            player.stage.pushed,
            vec![vec![0.5], vec![-0.5, 32767.0 / 32768.0]]
        );
    }

    #[test]
    fn malformed_chunk_leaves_the_stage_untouched() {
        let mut player = AudioPlayer::new(RecordingStage::default());
        assert!(player.enqueue("@@not base64@@").is_err());
        // Valid base64 but an odd byte count is not 16-bit PCM.
        let odd = STANDARD.encode([1u8, 2, 3]);
        assert!(player.enqueue(&odd).is_err());
        assert_eq!(player.stage.starts, 0);
        assert!(player.stage.pushed.is_empty());
    }
}
