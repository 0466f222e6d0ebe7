//! Optional on-disk capture of a session's audio.
//!
//! One timestamped directory per session: `mic.wav` holds everything the
//! microphone sent upstream (16 kHz), and each assistant turn lands in its
//! own `turn_NNN.wav` (24 kHz). Write failures are logged and stop the
//! affected track; they never take the session down.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audio_in::SAMPLE_RATE;
use crate::pcm::{self, PcmError};
use crate::playback::PLAYBACK_SAMPLE_RATE;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
}

type Track = WavWriter<BufWriter<File>>;

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn samples_from_b64(chunk_b64: &str) -> Result<Vec<i16>, PcmError> {
    let bytes = STANDARD.decode(chunk_b64)?;
    pcm::bytes_to_samples(&bytes)
}

/// Writes both directions of a session's audio to WAV files.
pub struct SessionRecorder {
    dir: PathBuf,
    mic: Option<Track>,
    turn: Option<Track>,
    turn_index: u32,
}

impl SessionRecorder {
    /// Create `<base>/<timestamp>/` and open the mic track.
    pub fn create(base: &Path) -> Result<Self, RecorderError> {
        let dir = base.join(Local::now().format("%Y%m%d_%H%M%S").to_string());
        fs::create_dir_all(&dir)?;
        let mic = WavWriter::create(dir.join("mic.wav"), wav_spec(SAMPLE_RATE))?;
        info!(dir = %dir.display(), "recording session audio");
        Ok(Self {
            dir,
            mic: Some(mic),
            turn: None,
            turn_index: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one outgoing mic chunk (base64 16-bit PCM) to `mic.wav`.
    pub fn record_mic_chunk(&mut self, chunk_b64: &str) {
        let samples = match samples_from_b64(chunk_b64) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "skipping unrecordable mic chunk");
                return;
            }
        };
        let Some(mut writer) = self.mic.take() else {
            return;
        };
        for s in samples {
            if let Err(err) = writer.write_sample(s) {
                error!(%err, "mic wav write failed; stopping mic track");
                return;
            }
        }
        self.mic = Some(writer);
    }

    /// Append one assistant audio chunk to the current turn track,
    /// opening `turn_NNN.wav` if this is the first chunk of the turn.
    pub fn record_assistant_audio(&mut self, chunk_b64: &str) {
        let samples = match samples_from_b64(chunk_b64) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "skipping unrecordable assistant chunk");
                return;
            }
        };
        if self.turn.is_none() {
            self.turn_index += 1;
            let path = self.dir.join(format!("turn_{:03}.wav", self.turn_index));
            match WavWriter::create(&path, wav_spec(PLAYBACK_SAMPLE_RATE)) {
                Ok(writer) => {
                    debug!(path = %path.display(), "opened assistant turn track");
                    self.turn = Some(writer);
                }
                Err(err) => {
                    error!(%err, "failed to open assistant turn track");
                    return;
                }
            }
        }
        let Some(mut writer) = self.turn.take() else {
            return;
        };
        for s in samples {
            if let Err(err) = writer.write_sample(s) {
                error!(%err, "turn wav write failed; stopping turn track");
                return;
            }
        }
        self.turn = Some(writer);
    }

    /// Close the current assistant turn track, if one is open.
    pub fn end_turn(&mut self) {
        if let Some(writer) = self.turn.take() {
            if let Err(err) = writer.finalize() {
                error!(%err, "failed to finalize turn wav");
            }
        }
    }

    /// Finalize every open track.
    pub fn finish(mut self) {
        self.end_turn();
        if let Some(writer) = self.mic.take() {
            if let Err(err) = writer.finalize() {
                error!(%err, "failed to finalize mic wav");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(samples: &[i16]) -> String {
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        STANDARD.encode(bytes)
    }

    fn read_samples(path: &Path) -> (WavSpec, Vec<i16>) {
        let mut reader = hound::WavReader::open(path).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn mic_track_round_trips_through_wav() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::create(tmp.path()).unwrap();
        rec.record_mic_chunk(&chunk_of(&[1, -2, 3]));
        rec.record_mic_chunk(&chunk_of(&[4]));
        let dir = rec.dir().to_path_buf();
        rec.finish();

        let (spec, samples) = read_samples(&dir.join("mic.wav"));
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        assert_eq!(spec.channels, 1);
        assert_eq!(samples, vec![1, -2, 3, 4]);
    }

    #[test]
    fn assistant_turns_get_numbered_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::create(tmp.path()).unwrap();
        rec.record_assistant_audio(&chunk_of(&[10, 20]));
        rec.end_turn();
        rec.record_assistant_audio(&chunk_of(&[30]));
        let dir = rec.dir().to_path_buf();
        rec.finish();

        let (spec, first) = read_samples(&dir.join("turn_001.wav"));
        assert_eq!(spec.sample_rate, PLAYBACK_SAMPLE_RATE);
        assert_eq!(first, vec![10, 20]);

        let (_, second) = read_samples(&dir.join("turn_002.wav"));
        assert_eq!(second, vec![30]);
    }

    #[test]
    fn bad_chunks_are_skipped_without_killing_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::create(tmp.path()).unwrap();
        rec.record_mic_chunk("@@not base64@@");
        rec.record_mic_chunk(&chunk_of(&[7]));
        let dir = rec.dir().to_path_buf();
        rec.finish();

        let (_, samples) = read_samples(&dir.join("mic.wav"));
        assert_eq!(samples, vec![7]);
    }
}
