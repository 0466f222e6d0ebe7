//! Screen capture sampler.
//!
//! On a fixed cadence, grab the primary monitor, scale to a fixed canvas,
//! JPEG-encode and publish the base64 payload into the shared frame slot.
//! The slot is a watch channel: readers always see the most recent
//! successful capture, and a failed or zero-dimension tick leaves the
//! previous frame in place.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use xcap::Monitor;

/// Cadence of capture ticks.
pub const CAPTURE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
/// Fixed canvas the frame is rendered into before encoding.
pub const TARGET_WIDTH: u32 = 640;
pub const TARGET_HEIGHT: u32 = 480;

/// Error type for screen capture operations.
#[derive(Debug, thiserror::Error)]
pub enum ScreenError {
    #[error("screen capture error: {0}")]
    Capture(#[from] xcap::XCapError),

    #[error("image encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("no monitor available")]
    NoMonitor,

    #[error("frame buffer does not match its dimensions")]
    BadFrame,
}

/// One raw RGBA frame as delivered by the display.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Source of raw display frames.
pub trait FrameGrabber {
    fn grab(&mut self) -> Result<RawFrame, ScreenError>;
}

/// Grabs the primary monitor via xcap.
pub struct MonitorGrabber {
    monitor: Monitor,
}

impl MonitorGrabber {
    pub fn new() -> Result<Self, ScreenError> {
        let monitors = Monitor::all()?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or(ScreenError::NoMonitor)?
            .clone();

        info!(
            "Sharing monitor {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0),
        );
        Ok(Self { monitor })
    }
}

impl FrameGrabber for MonitorGrabber {
    fn grab(&mut self) -> Result<RawFrame, ScreenError> {
        let image = self.monitor.capture_image()?;
        Ok(RawFrame {
            width: image.width(),
            height: image.height(),
            rgba: image.into_raw(),
        })
    }
}

/// Render a raw frame to the fixed canvas and encode it for transport.
pub fn encode_frame(frame: RawFrame) -> Result<String, ScreenError> {
    let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.rgba)
        .ok_or(ScreenError::BadFrame)?;
    let resized = image::imageops::resize(
        &image,
        TARGET_WIDTH,
        TARGET_HEIGHT,
        image::imageops::FilterType::Triangle,
    );
    let rgb = image::DynamicImage::ImageRgba8(resized).to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new(&mut jpeg);
    encoder.encode_image(&rgb)?;
    Ok(STANDARD.encode(jpeg))
}

/// Periodic sampler writing into the shared frame slot.
pub struct ScreenSampler<G> {
    grabber: G,
    slot: watch::Sender<Option<String>>,
}

impl<G: FrameGrabber> ScreenSampler<G> {
    pub fn new(grabber: G, slot: watch::Sender<Option<String>>) -> Self {
        Self { grabber, slot }
    }

    /// One capture tick. Any failure or zero-dimension frame skips the tick
    /// silently; the previous frame stays current.
    pub fn tick(&mut self) {
        let frame = match self.grabber.grab() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping capture tick: {}", e);
                return;
            }
        };
        if frame.width == 0 || frame.height == 0 {
            debug!("Skipping zero-dimension frame");
            return;
        }
        match encode_frame(frame) {
            Ok(encoded) => {
                self.slot.send_replace(Some(encoded));
            }
            Err(e) => {
                debug!("Skipping frame after encode failure: {}", e);
            }
        }
    }
}

/// Running sampler task over the primary monitor.
pub struct ScreenCapture {
    task: tokio::task::JoinHandle<()>,
}

impl ScreenCapture {
    /// Spawn the sampler loop. If no monitor can be acquired the failure is
    /// logged and the frame slot stays empty for the life of the session.
    pub fn start(slot: watch::Sender<Option<String>>) -> Self {
        let task = tokio::spawn(async move {
            let grabber = match MonitorGrabber::new() {
                Ok(grabber) => grabber,
                Err(e) => {
                    error!("Screen capture unavailable: {}", e);
                    return;
                }
            };
            run_sampler(ScreenSampler::new(grabber, slot)).await;
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn run_sampler<G: FrameGrabber>(mut sampler: ScreenSampler<G>) {
    let mut timer = interval_at(Instant::now() + CAPTURE_INTERVAL, CAPTURE_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        sampler.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedGrabber {
        frames: VecDeque<Result<RawFrame, ScreenError>>,
    }

    impl FrameGrabber for ScriptedGrabber {
        fn grab(&mut self) -> Result<RawFrame, ScreenError> {
            self.frames.pop_front().unwrap_or(Err(ScreenError::NoMonitor))
        }
    }

    fn solid_frame(width: u32, height: u32, value: u8) -> RawFrame {
        RawFrame {
            width,
            height,
            rgba: vec![value; (width * height * 4) as usize],
        }
    }

    #[test]
    fn encoded_frame_is_canvas_sized_jpeg() {
        let encoded = encode_frame(solid_frame(8, 8, 40)).unwrap();
        let jpeg = STANDARD.decode(encoded).unwrap();
        // JPEG SOI marker, no data-URL style prefix.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), TARGET_WIDTH);
        assert_eq!(decoded.height(), TARGET_HEIGHT);
    }

    #[test]
    fn slot_reflects_most_recent_successful_capture() {
        let (slot_tx, slot_rx) = watch::channel(None);
        let grabber = ScriptedGrabber {
            frames: VecDeque::from([
                Ok(solid_frame(8, 8, 10)),
                Ok(solid_frame(0, 0, 0)),
                Err(ScreenError::NoMonitor),
                Ok(solid_frame(8, 8, 200)),
            ]),
        };
        let mut sampler = ScreenSampler::new(grabber, slot_tx);

        assert!(slot_rx.borrow().is_none());

        sampler.tick();
        let first = slot_rx.borrow().clone().expect("first capture stored");

        // Zero-dimension and failed grabs leave the previous frame current.
        sampler.tick();
        assert_eq!(slot_rx.borrow().clone().unwrap(), first);
        sampler.tick();
        assert_eq!(slot_rx.borrow().clone().unwrap(), first);

        sampler.tick();
        let latest = slot_rx.borrow().clone().unwrap();
        assert_ne!(latest, first);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let frame = RawFrame {
            width: 16,
            height: 16,
            rgba: vec![0; 7],
        };
        assert!(matches!(encode_frame(frame), Err(ScreenError::BadFrame)));
    }
}
