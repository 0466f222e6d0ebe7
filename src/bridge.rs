//! Transport bridge between local capture and the relay.
//!
//! Owns the websocket for the life of the session: dials, sends the setup
//! handshake before anything else, then forwards media chunks up and
//! dispatches relay replies to playback and the display. Closure policy
//! (one delayed redial after a drop, none after a clean close) is decided
//! by [`LinkStateMachine`]; this module just executes its actions.

use futures_util::{SinkExt, StreamExt};
use smallvec::SmallVec;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::link::{LinkAction, LinkEvent, LinkState, LinkStateMachine};
use crate::playback::{AudioPlayer, OutputStage, PulseStage};
use crate::protocol::{ClientMessage, MediaChunk, RealtimeInput, ServerEvent, SessionSetup};
use crate::recorder::SessionRecorder;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the bridge surfaces to the rest of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    /// A line ready for display.
    Transcript(String),
    /// The model finished its turn.
    TurnComplete,
    /// The link is gone for good; the session is over.
    LinkDown,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub setup: SessionSetup,
}

pub struct Bridge {
    config: BridgeConfig,
    machine: LinkStateMachine,
    chunk_rx: mpsc::Receiver<String>,
    frame_rx: watch::Receiver<Option<String>>,
    player: AudioPlayer<PulseStage>,
    recorder: Option<SessionRecorder>,
    events: mpsc::Sender<AssistantEvent>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        chunk_rx: mpsc::Receiver<String>,
        frame_rx: watch::Receiver<Option<String>>,
        recorder: Option<SessionRecorder>,
        events: mpsc::Sender<AssistantEvent>,
    ) -> Self {
        Self {
            config,
            machine: LinkStateMachine::new(),
            chunk_rx,
            frame_rx,
            player: AudioPlayer::new(PulseStage::new()),
            recorder,
            events,
        }
    }

    /// Drive the link until it reaches a terminal state.
    pub async fn run(mut self) {
        self.machine.on_event(LinkEvent::DialStarted);
        while self.machine.state() == LinkState::Connecting {
            match connect_async(&self.config.url).await {
                Ok((mut socket, _resp)) => {
                    info!(url = %self.config.url, "link open");
                    self.machine.on_event(LinkEvent::Opened);
                    if self.send_setup(&mut socket).await {
                        self.discard_backlog();
                        self.drive_open(&mut socket).await;
                    }
                }
                Err(err) => {
                    error!(%err, "connect to relay failed");
                    self.machine.on_event(LinkEvent::ConnectFailed);
                }
            }
            self.maybe_retry().await;
        }
        if let Some(recorder) = self.recorder.take() {
            recorder.finish();
        }
        let _ = self.events.send(AssistantEvent::LinkDown).await;
    }

    /// Honor the actions queued by the open transition. The setup envelope
    /// goes out before any data envelope is even considered.
    async fn send_setup(&mut self, socket: &mut Socket) -> bool {
        for action in self.machine.drain_actions() {
            match action {
                LinkAction::SendSetup => {
                    let msg = ClientMessage::Setup {
                        setup: self.config.setup.clone(),
                    };
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(err) => {
                            error!(%err, "failed to encode setup envelope");
                            self.machine.on_event(LinkEvent::ClosedAbnormal);
                            return false;
                        }
                    };
                    if let Err(err) = socket.send(Message::text(json)).await {
                        warn!(%err, "setup send failed");
                        self.machine.on_event(LinkEvent::ClosedAbnormal);
                        return false;
                    }
                }
                other => debug!(?other, "unexpected action at open"),
            }
        }
        true
    }

    /// Chunks flushed while the dial was pending are stale by the time the
    /// link opens; the open link starts from live audio only.
    fn discard_backlog(&mut self) {
        while self.chunk_rx.try_recv().is_ok() {
            debug!("dropping media chunk flushed before the link opened");
        }
    }

    async fn drive_open(&mut self, socket: &mut Socket) {
        while self.machine.state() == LinkState::Open {
            tokio::select! {
                chunk = self.chunk_rx.recv() => match chunk {
                    Some(chunk) => self.send_chunk(socket, chunk).await,
                    None => {
                        info!("media channel closed, closing link");
                        let _ = socket.close(None).await;
                        self.machine.on_event(LinkEvent::ClosedNormal);
                    }
                },
                frame = socket.next() => self.on_socket_frame(frame).await,
            }
        }
    }

    /// Wrap one audio chunk, and the freshest screen frame if there is
    /// one, into a data envelope.
    async fn send_chunk(&mut self, socket: &mut Socket, chunk: String) {
        if !self.machine.can_send() {
            debug!("link not open, dropping media chunk");
            return;
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_mic_chunk(&chunk);
        }
        let mut media_chunks: SmallVec<[MediaChunk; 2]> = SmallVec::new();
        media_chunks.push(MediaChunk::audio(chunk));
        if let Some(frame) = self.frame_rx.borrow().clone() {
            media_chunks.push(MediaChunk::image(frame));
        }
        let msg = ClientMessage::Data {
            realtime_input: RealtimeInput { media_chunks },
        };
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to encode data envelope, dropping");
                return;
            }
        };
        if let Err(err) = socket.send(Message::text(json)).await {
            // The read side will observe the closure; here we only drop.
            warn!(%err, "send failed, dropping media envelope");
        }
    }

    async fn on_socket_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(raw))) => match ServerEvent::parse(&raw) {
                Ok(event) => {
                    apply_server_event(event, &mut self.player, &mut self.recorder, &self.events)
                        .await;
                }
                Err(err) => warn!(%err, "dropping malformed relay message"),
            },
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "relay closed the link");
                self.machine.on_event(LinkEvent::ClosedNormal);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(other)) => debug!(?other, "ignoring non-text frame"),
            Some(Err(err)) => {
                warn!(%err, "link error");
                self.machine.on_event(LinkEvent::ClosedAbnormal);
            }
            None => {
                warn!("link ended without a close frame");
                self.machine.on_event(LinkEvent::ClosedAbnormal);
            }
        }
    }

    /// After an abnormal closure the machine arms one timer; when it fires
    /// the machine asks for one redial. Everything else falls through and
    /// ends the run loop.
    async fn maybe_retry(&mut self) {
        for action in self.machine.drain_actions() {
            if let LinkAction::ScheduleRetry(delay) = action {
                info!(?delay, "reconnecting after abnormal closure");
                discard_chunks_until(&mut self.chunk_rx, Instant::now() + delay).await;
                self.machine.on_event(LinkEvent::RetryElapsed);
            }
        }
        for action in self.machine.drain_actions() {
            if matches!(action, LinkAction::Dial) {
                self.machine.on_event(LinkEvent::DialStarted);
            }
        }
    }
}

/// Chunks flushed while the link is down are dropped, not queued for the
/// next dial. Capture keeps running; only delivery pauses.
async fn discard_chunks_until(chunk_rx: &mut mpsc::Receiver<String>, deadline: Instant) {
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            chunk = chunk_rx.recv() => match chunk {
                Some(_) => debug!("link not open, dropping media chunk"),
                None => {
                    sleep_until(deadline).await;
                    break;
                }
            },
        }
    }
}

/// Route one relay message: text to the display, audio to playback and
/// the recorder, turn boundaries to both. Fields are independent, so a
/// single message may do several of these.
async fn apply_server_event<S: OutputStage>(
    event: ServerEvent,
    player: &mut AudioPlayer<S>,
    recorder: &mut Option<SessionRecorder>,
    events: &mpsc::Sender<AssistantEvent>,
) {
    if let Some(text) = event.text.filter(|t| !t.is_empty()) {
        let line = format!("GEMINI: {text}");
        if events.send(AssistantEvent::Transcript(line)).await.is_err() {
            debug!("no listener for transcript");
        }
    }
    if let Some(audio) = event.audio.filter(|a| !a.is_empty()) {
        if let Some(recorder) = recorder.as_mut() {
            recorder.record_assistant_audio(&audio);
        }
        if let Err(err) = player.enqueue(&audio) {
            warn!(%err, "dropping assistant audio");
        }
    }
    if event.turn_complete == Some(true) {
        if let Some(recorder) = recorder.as_mut() {
            recorder.end_turn();
        }
        if events.send(AssistantEvent::TurnComplete).await.is_err() {
            debug!("no listener for turn boundary");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackError;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Clone, Default)]
    struct SharedStage {
        starts: Arc<AtomicUsize>,
        pushed: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl OutputStage for SharedStage {
        fn start(&mut self) -> Result<(), PlaybackError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }

        fn push(&mut self, samples: Vec<f32>) -> Result<(), PlaybackError> {
            self.pushed.lock().unwrap().push(samples);
            Ok(())
        }
    }

    fn player_with_shared_stage() -> (AudioPlayer<SharedStage>, SharedStage) {
        let stage = SharedStage::default();
        (AudioPlayer::new(stage.clone()), stage)
    }

    #[tokio::test]
    async fn text_becomes_a_prefixed_transcript_line() {
        let (mut player, stage) = player_with_shared_stage();
        let mut recorder = None;
        let (tx, mut rx) = mpsc::channel(8);

        let event = ServerEvent::parse(r#"{"text":"hello"}"#).unwrap();
        apply_server_event(event, &mut player, &mut recorder, &tx).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            AssistantEvent::Transcript("GEMINI: hello".to_string())
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(stage.starts.load(Ordering::SeqCst), 0);

        // An empty text field is present but not displayable.
        let event = ServerEvent::parse(r#"{"text":""}"#).unwrap();
        apply_server_event(event, &mut player, &mut recorder, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn audio_goes_to_playback_and_never_to_the_display() {
        let (mut player, stage) = player_with_shared_stage();
        let mut recorder = None;
        let (tx, mut rx) = mpsc::channel(8);

        let chunk = STANDARD.encode(16384i16.to_le_bytes());
        let raw = format!(r#"{{"audio":"{chunk}"}}"#);
        let event = ServerEvent::parse(&raw).unwrap();
        apply_server_event(event, &mut player, &mut recorder, &tx).await;

        assert_eq!(*stage.pushed.lock().unwrap(), vec![vec![0.5]]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn turn_complete_notifies_the_listener() {
        let (mut player, _stage) = player_with_shared_stage();
        let mut recorder = None;
        let (tx, mut rx) = mpsc::channel(8);

        let event = ServerEvent::parse(r#"{"turn_complete":true}"#).unwrap();
        apply_server_event(event, &mut player, &mut recorder, &tx).await;

        assert_eq!(rx.try_recv().unwrap(), AssistantEvent::TurnComplete);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_flushed_during_the_retry_wait_are_discarded() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("b25l".to_string()).await.unwrap();
        tx.send("dHdv".to_string()).await.unwrap();

        let start = Instant::now();
        discard_chunks_until(&mut rx, start + Duration::from_secs(5)).await;

        assert_eq!(Instant::now() - start, Duration::from_secs(5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_wait_runs_full_length_after_capture_stops() {
        let (tx, mut rx) = mpsc::channel(8);
        drop(tx);

        let start = Instant::now();
        discard_chunks_until(&mut rx, start + Duration::from_secs(5)).await;

        assert_eq!(Instant::now() - start, Duration::from_secs(5));
    }

    /// Accepts one connection and consumes the setup envelope, which must be
    /// the first frame on the wire.
    async fn accept_and_take_setup(
        listener: tokio::net::TcpListener,
    ) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let first = ws.next().await.unwrap().unwrap();
        let first: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert!(first.get("setup").is_some(), "first frame was {first}");
        ws
    }

    fn test_bridge(
        addr: std::net::SocketAddr,
        chunk_rx: mpsc::Receiver<String>,
        frame_rx: watch::Receiver<Option<String>>,
        event_tx: mpsc::Sender<AssistantEvent>,
    ) -> Bridge {
        Bridge::new(
            BridgeConfig {
                url: format!("ws://{addr}"),
                setup: SessionSetup::audio_and_text(),
            },
            chunk_rx,
            frame_rx,
            None,
            event_tx,
        )
    }

    async fn wait_link_down(event_rx: &mut mpsc::Receiver<AssistantEvent>) {
        loop {
            match event_rx.recv().await {
                Some(AssistantEvent::LinkDown) | None => break,
                Some(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn setup_goes_out_before_any_data() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (opened_tx, opened_rx) = oneshot::channel();

        let relay = tokio::spawn(async move {
            let mut ws = accept_and_take_setup(listener).await;
            opened_tx.send(()).unwrap();

            let data = ws.next().await.unwrap().unwrap();
            let data: serde_json::Value = serde_json::from_str(data.to_text().unwrap()).unwrap();
            let chunks = data["realtime_input"]["media_chunks"].as_array().unwrap();
            assert_eq!(chunks.len(), 1, "no frame in the slot, audio only");
            assert_eq!(chunks[0]["mime_type"], "audio/pcm");

            ws.close(None).await.unwrap();
        });

        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (_frame_tx, frame_rx) = watch::channel(None);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let run = tokio::spawn(test_bridge(addr, chunk_rx, frame_rx, event_tx).run());

        opened_rx.await.unwrap();
        chunk_tx.send("cGNt".to_string()).await.unwrap();

        relay.await.unwrap();
        wait_link_down(&mut event_rx).await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn data_envelope_pairs_audio_with_the_newest_frame() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (opened_tx, opened_rx) = oneshot::channel();

        let relay = tokio::spawn(async move {
            let mut ws = accept_and_take_setup(listener).await;
            opened_tx.send(()).unwrap();

            let data = ws.next().await.unwrap().unwrap();
            let data: serde_json::Value = serde_json::from_str(data.to_text().unwrap()).unwrap();
            let chunks = data["realtime_input"]["media_chunks"].as_array().unwrap();
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0]["mime_type"], "audio/pcm");
            assert_eq!(chunks[0]["data"], "cGNt");
            assert_eq!(chunks[1]["mime_type"], "image/jpeg");
            assert_eq!(chunks[1]["data"], "ZnJhbWU=");

            ws.close(None).await.unwrap();
        });

        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, frame_rx) = watch::channel(None);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        frame_tx.send_replace(Some("b2xk".to_string()));
        frame_tx.send_replace(Some("ZnJhbWU=".to_string()));
        let run = tokio::spawn(test_bridge(addr, chunk_rx, frame_rx, event_tx).run());

        opened_rx.await.unwrap();
        chunk_tx.send("cGNt".to_string()).await.unwrap();

        relay.await.unwrap();
        wait_link_down(&mut event_rx).await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn chunks_flushed_before_open_are_not_replayed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (opened_tx, opened_rx) = oneshot::channel();

        let relay = tokio::spawn(async move {
            let mut ws = accept_and_take_setup(listener).await;
            opened_tx.send(()).unwrap();

            let data = ws.next().await.unwrap().unwrap();
            let data: serde_json::Value = serde_json::from_str(data.to_text().unwrap()).unwrap();
            assert_eq!(
                data["realtime_input"]["media_chunks"][0]["data"],
                "ZnJlc2g=",
                "stale chunk crossed the open boundary"
            );

            ws.close(None).await.unwrap();
        });

        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (_frame_tx, frame_rx) = watch::channel(None);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        chunk_tx.send("c3RhbGU=".to_string()).await.unwrap();
        let run = tokio::spawn(test_bridge(addr, chunk_rx, frame_rx, event_tx).run());

        opened_rx.await.unwrap();
        chunk_tx.send("ZnJlc2g=".to_string()).await.unwrap();

        relay.await.unwrap();
        wait_link_down(&mut event_rx).await;
        run.await.unwrap();
    }
}
