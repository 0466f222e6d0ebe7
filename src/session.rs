//! Wires capture, the relay link and playback into one running session.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::audio_in::{AudioCapture, PulseSource};
use crate::bridge::{AssistantEvent, Bridge, BridgeConfig};
use crate::protocol::SessionSetup;
use crate::recorder::SessionRecorder;
use crate::screen::ScreenCapture;

/// Flushed audio chunks that may wait for the link before new ones are dropped.
const CHUNK_QUEUE: usize = 32;

/// How long a closing bridge gets to finish before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the relay.
    pub url: String,
    /// PulseAudio source name; `None` selects the server default.
    pub audio_device: Option<String>,
    /// Capture screen snapshots alongside the microphone.
    pub screen: bool,
    /// Base directory for WAV recordings, if any.
    pub record_to: Option<PathBuf>,
}

/// A running end-to-end session.
///
/// Dropping a `Session` leaks its capture threads; call [`Session::shutdown`]
/// to tear it down in order.
pub struct Session {
    audio: AudioCapture,
    screen: Option<ScreenCapture>,
    bridge: JoinHandle<()>,
    events: mpsc::Receiver<AssistantEvent>,
}

impl Session {
    /// Start the microphone, the screen sampler and the relay link.
    pub fn start(config: SessionConfig) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let (frame_tx, frame_rx) = watch::channel(None);
        let (event_tx, events) = mpsc::channel(CHUNK_QUEUE);

        let device = config.audio_device.clone();
        let audio = AudioCapture::start(
            move || PulseSource::new("mirrorlive", device.as_deref()),
            chunk_tx,
        );

        let screen = if config.screen {
            Some(ScreenCapture::start(frame_tx))
        } else {
            info!("screen capture disabled");
            None
        };

        let recorder = config
            .record_to
            .as_deref()
            .and_then(|base| match SessionRecorder::create(base) {
                Ok(recorder) => Some(recorder),
                Err(err) => {
                    warn!(error = %err, "recording disabled");
                    None
                }
            });

        let bridge = Bridge::new(
            BridgeConfig {
                url: config.url,
                setup: SessionSetup::audio_and_text(),
            },
            chunk_rx,
            frame_rx,
            recorder,
            event_tx,
        );
        let bridge = tokio::spawn(bridge.run());

        Self {
            audio,
            screen,
            bridge,
            events,
        }
    }

    /// Next assistant event; `None` once the link is down and drained.
    pub async fn next_event(&mut self) -> Option<AssistantEvent> {
        self.events.recv().await
    }

    /// Stop the sources, then let the bridge close the link.
    ///
    /// Stopping audio drops the chunk channel, which the bridge takes as its
    /// cue to close normally. A bridge stuck mid-dial or mid-retry is aborted
    /// instead.
    pub async fn shutdown(mut self) {
        self.audio.stop();
        if let Some(screen) = self.screen {
            screen.stop();
        }
        match timeout(SHUTDOWN_GRACE, &mut self.bridge).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "bridge task failed"),
            Err(_) => {
                warn!("bridge did not close in time, aborting it");
                self.bridge.abort();
            }
        }
    }
}
