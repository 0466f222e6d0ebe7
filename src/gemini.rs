//! Upstream leg of the relay: a client for the Gemini Live API.
//!
//! Speaks the camelCase wire protocol of the `BidiGenerateContent`
//! endpoint. Incoming frames are parsed into typed [`UpstreamEvent`]s so
//! the relay session loop never touches raw JSON.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection ended before setup completed")]
    SetupIncomplete,
    #[error("timed out waiting for setup to complete")]
    SetupTimeout,
}

/// Session setup payload, camelCase on the wire.
#[derive(Debug, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<LiveGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveGenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
}

impl From<crate::protocol::GenerationConfig> for LiveGenerationConfig {
    fn from(cfg: crate::protocol::GenerationConfig) -> Self {
        Self {
            response_modalities: cfg.response_modalities,
            temperature: cfg.temperature,
            candidate_count: cfg.candidate_count,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveMediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveRealtimeInput {
    pub media_chunks: Vec<LiveMediaChunk>,
}

/// Messages we send upstream.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum LiveClientMessage {
    Setup {
        setup: LiveSetup,
    },
    RealtimeInput {
        #[serde(rename = "realtimeInput")]
        realtime_input: LiveRealtimeInput,
    },
}

/// Messages the Live API sends back. Anything we do not relay falls
/// into `Other` and is logged at debug.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LiveServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        #[allow(dead_code)]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: ServerContent,
    },
    Other(serde_json::Value),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    turn_complete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    data: Option<String>,
}

/// What the relay session loop consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Setup acknowledged, media may flow.
    Ready,
    /// One text part of the model's turn.
    Text(String),
    /// One audio part, still base64 as received.
    Audio(String),
    /// The model finished its turn.
    TurnComplete,
    /// The upstream connection ended.
    Closed,
}

/// Parse one upstream frame into the events it carries, in wire order.
pub fn parse_server_message(text: &str) -> Result<Vec<UpstreamEvent>, UpstreamError> {
    let msg: LiveServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();
    match msg {
        LiveServerMessage::SetupComplete { .. } => events.push(UpstreamEvent::Ready),
        LiveServerMessage::ServerContent { server_content } => {
            if let Some(turn) = server_content.model_turn {
                for part in turn.parts {
                    if let Some(text) = part.text {
                        events.push(UpstreamEvent::Text(text));
                    }
                    if let Some(data) = part.inline_data.and_then(|d| d.data) {
                        events.push(UpstreamEvent::Audio(data));
                    }
                }
            }
            if server_content.turn_complete == Some(true) {
                events.push(UpstreamEvent::TurnComplete);
            }
        }
        LiveServerMessage::Other(value) => {
            debug!(message = %value, "ignoring upstream message");
        }
    }
    Ok(events)
}

/// Where and as what to connect upstream.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: Option<String>,
}

impl UpstreamConfig {
    pub fn from_api_key(api_key: &str, model: &str, system_instruction: Option<String>) -> Self {
        Self {
            url: format!("{LIVE_ENDPOINT}?key={api_key}"),
            model: qualified_model(model),
            system_instruction,
        }
    }
}

fn qualified_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// A connected, set-up Live API session.
pub struct UpstreamClient {
    write: SplitSink<WsStream, Message>,
    events: mpsc::Receiver<UpstreamEvent>,
    reader: JoinHandle<()>,
}

/// The write half of a session, detached so the two relay loops can run
/// independently. Owns the reader task so closing tears both down.
pub struct UpstreamSender {
    write: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

impl UpstreamSender {
    /// Forward media chunks inside one realtimeInput envelope.
    pub async fn send_media(&mut self, chunks: Vec<LiveMediaChunk>) -> Result<(), UpstreamError> {
        let msg = LiveClientMessage::RealtimeInput {
            realtime_input: LiveRealtimeInput {
                media_chunks: chunks,
            },
        };
        self.write
            .send(Message::text(serde_json::to_string(&msg)?))
            .await?;
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        self.reader.abort();
    }
}

impl UpstreamClient {
    /// Connect, send the setup message, and wait for the acknowledgement.
    pub async fn connect(
        config: &UpstreamConfig,
        generation_config: LiveGenerationConfig,
    ) -> Result<Self, UpstreamError> {
        info!(model = %config.model, "connecting to Live API");
        let (ws, _resp) = connect_async(&config.url).await?;
        let (mut write, read) = ws.split();

        let setup = LiveClientMessage::Setup {
            setup: LiveSetup {
                model: config.model.clone(),
                generation_config: Some(generation_config),
                system_instruction: config.system_instruction.clone(),
            },
        };
        write
            .send(Message::text(serde_json::to_string(&setup)?))
            .await?;

        let (event_tx, events) = mpsc::channel(64);
        let reader = tokio::spawn(read_loop(read, event_tx));
        let mut client = Self {
            write,
            events,
            reader,
        };

        match tokio::time::timeout(SETUP_TIMEOUT, client.wait_for_ready()).await {
            Ok(true) => {
                info!("Live API session ready");
                Ok(client)
            }
            Ok(false) => Err(UpstreamError::SetupIncomplete),
            Err(_) => Err(UpstreamError::SetupTimeout),
        }
    }

    async fn wait_for_ready(&mut self) -> bool {
        while let Some(event) = self.events.recv().await {
            match event {
                UpstreamEvent::Ready => return true,
                UpstreamEvent::Closed => return false,
                other => debug!(?other, "event before setup completed"),
            }
        }
        false
    }

    /// Split into the write half and the event stream.
    pub fn into_parts(self) -> (UpstreamSender, mpsc::Receiver<UpstreamEvent>) {
        (
            UpstreamSender {
                write: self.write,
                reader: self.reader,
            },
            self.events,
        )
    }
}

async fn read_loop(mut read: SplitStream<WsStream>, tx: mpsc::Sender<UpstreamEvent>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !forward_events(&text, &tx).await {
                    return;
                }
            }
            // The Live API also delivers JSON in binary frames.
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if !forward_events(text, &tx).await {
                        return;
                    }
                }
                Err(_) => debug!(len = bytes.len(), "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(?frame, "upstream closed");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "upstream read failed");
                break;
            }
        }
    }
    let _ = tx.send(UpstreamEvent::Closed).await;
}

async fn forward_events(text: &str, tx: &mpsc::Sender<UpstreamEvent>) -> bool {
    match parse_server_message(text) {
        Ok(events) => {
            for event in events {
                if tx.send(event).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(err) => {
            warn!(%err, "ignoring unparseable upstream message");
            true
        }
    }
}
