//! Audio capture pipeline.
//!
//! A dedicated OS thread blocks on the microphone and feeds fixed-size f32
//! frames over a channel; an async task quantizes them into the sample
//! buffer and flushes the whole buffer as one base64 chunk on a fixed
//! cadence. The device thread never touches the buffer directly.

use crate::pcm;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capture sample rate in Hz, mono.
pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per input frame read from the device.
pub const FRAME_SAMPLES: usize = 4_096;
/// Cadence of buffer flushes toward the transport.
pub const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("PulseAudio error: {0}")]
    Pulse(#[from] libpulse_binding::error::PAErr),
}

/// Blocking microphone source producing one frame of f32 samples at a time.
pub trait SampleSource {
    fn next_frame(&mut self) -> Result<Vec<f32>, CaptureError>;
}

/// Microphone input over PulseAudio's simple API, F32LE at 16 kHz mono.
pub struct PulseSource {
    simple: Simple,
    frame_bytes: Vec<u8>,
}

impl PulseSource {
    /// Open the default source, or a specific device when given.
    pub fn new(app_name: &str, device: Option<&str>) -> Result<Self, CaptureError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: SAMPLE_RATE,
        };
        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Record,
            device,
            "microphone", // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        )?;
        if let Some(device) = device {
            info!("Capturing microphone from device {}", device);
        } else {
            info!("Capturing microphone from default device");
        }
        Ok(Self {
            simple,
            frame_bytes: vec![0u8; FRAME_SAMPLES * 4],
        })
    }
}

impl SampleSource for PulseSource {
    fn next_frame(&mut self) -> Result<Vec<f32>, CaptureError> {
        self.simple.read(&mut self.frame_bytes)?;
        Ok(pcm::floats_from_bytes(&self.frame_bytes))
    }
}

/// The sample buffer between flush ticks. Owned exclusively by the flush
/// task; growth between ticks is unbounded by design.
#[derive(Debug, Default)]
pub struct Accumulator {
    samples: Vec<i16>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantize one f32 frame and append it.
    pub fn append_frame(&mut self, frame: &[f32]) {
        self.samples.extend(pcm::quantize(frame));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Package the whole buffer as a transport chunk and clear it.
    /// An empty buffer yields nothing: zero-length sends are guarded out.
    pub fn flush(&mut self) -> Option<String> {
        if self.samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.samples);
        Some(pcm::encode_chunk(&samples))
    }
}

/// Running capture pipeline. Stopping sets the device thread's stop flag
/// first, then cancels the flush task, so a tick never runs against a
/// stopped source; whatever the buffer still holds is discarded.
pub struct AudioCapture {
    shutdown: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
    _thread: std::thread::JoinHandle<()>,
}

impl AudioCapture {
    /// Start the pipeline, emitting flushed chunks on `chunk_tx`. The source
    /// is built inside the device thread, so device handles never cross
    /// threads. If it cannot be acquired the failure is logged and the
    /// pipeline simply never produces data.
    pub fn start<S, F>(make_source: F, chunk_tx: mpsc::Sender<String>) -> Self
    where
        S: SampleSource,
        F: FnOnce() -> Result<S, CaptureError> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(32);

        let stop = shutdown.clone();
        let thread = std::thread::spawn(move || {
            let mut source = match make_source() {
                Ok(source) => source,
                Err(e) => {
                    error!("Microphone unavailable: {}", e);
                    return;
                }
            };
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match source.next_frame() {
                    Ok(frame) => {
                        if frame_tx.blocking_send(frame).is_err() {
                            // Pipeline gone, nothing left to feed.
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Microphone read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Microphone thread exiting");
        });

        let task = tokio::spawn(run_flush_loop(frame_rx, chunk_tx));

        Self {
            shutdown,
            task,
            _thread: thread,
        }
    }

    /// Tear the pipeline down: source first, flush timer second. Buffered
    /// samples are discarded, not flushed.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

/// Accumulate incoming frames and flush on the fixed cadence.
async fn run_flush_loop(mut frame_rx: mpsc::Receiver<Vec<f32>>, chunk_tx: mpsc::Sender<String>) {
    let mut buffer = Accumulator::new();
    let mut flush_timer = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => buffer.append_frame(&frame),
                    None => {
                        debug!("Frame channel closed, flush loop exiting");
                        break;
                    }
                }
            }
            _ = flush_timer.tick() => {
                if let Some(chunk) = buffer.flush() {
                    debug!("Flushing audio chunk ({} base64 chars)", chunk.len());
                    if let Err(e) = chunk_tx.try_send(chunk) {
                        // Transport is backed up or gone; drop, don't queue.
                        warn!("Dropping audio chunk: {}", e);
                    }
                }
            }
        }
    }
}
