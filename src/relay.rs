//! Backend relay: accepts client sessions and splices each onto its own
//! Gemini Live API connection.
//!
//! A session starts with the client's setup envelope. Its generation
//! config, or the relay defaults when it carries none, goes upstream in
//! the Live API handshake. After that, two loops run until either side
//! hangs up: client media chunks are filtered and forwarded up, model
//! output comes back down as flat `ServerEvent` objects. Per-message
//! failures are logged and skipped; they never end the session.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use smallvec::SmallVec;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gemini::{
    LiveGenerationConfig, LiveMediaChunk, UpstreamClient, UpstreamConfig, UpstreamError,
    UpstreamEvent, UpstreamSender,
};
use crate::protocol::{ClientMessage, MediaChunk, ServerEvent, SessionSetup, AUDIO_MIME, IMAGE_MIME};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("client sent an invalid setup message")]
    BadSetup,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub upstream: UpstreamConfig,
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: RelayConfig) -> Result<(), RelayError> {
    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "relay listening");
    serve_on(listener, config.upstream).await
}

/// Serve on a pre-bound listener. One task per client session; a failed
/// session never stops the accept loop.
pub async fn serve_on(listener: TcpListener, upstream: UpstreamConfig) -> Result<(), RelayError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let upstream = upstream.clone();
        tokio::spawn(async move {
            info!(%peer, "client connected");
            if let Err(err) = run_session(stream, upstream).await {
                error!(%peer, %err, "session ended with error");
            }
            info!(%peer, "session closed");
        });
    }
}

async fn run_session(stream: TcpStream, upstream: UpstreamConfig) -> Result<(), RelayError> {
    let mut ws = accept_async(stream).await?;

    let Some(generation_config) = read_setup(&mut ws).await? else {
        return Ok(());
    };
    let client = UpstreamClient::connect(&upstream, generation_config).await?;
    let (sender, events) = client.into_parts();
    let (to_client, from_client) = ws.split();

    let client_loop = tokio::spawn(client_to_upstream_loop(from_client, sender));
    let upstream_loop = tokio::spawn(upstream_to_client_loop(events, to_client));
    let (client_loop, upstream_loop) = tokio::join!(client_loop, upstream_loop);
    for result in [client_loop, upstream_loop] {
        if let Err(err) = result {
            error!(%err, "session loop panicked");
        }
    }
    Ok(())
}

/// Wait for the session's first text frame and derive the upstream
/// generation config from it. `None` means the client left first.
async fn read_setup(
    ws: &mut WebSocketStream<TcpStream>,
) -> Result<Option<LiveGenerationConfig>, RelayError> {
    loop {
        let Some(frame) = ws.next().await else {
            return Ok(None);
        };
        match frame? {
            Message::Text(raw) => {
                let config = match ClientMessage::parse(&raw) {
                    Ok(ClientMessage::Setup { setup }) => effective_generation_config(setup),
                    Ok(ClientMessage::Data { .. }) => {
                        warn!("first message was not a setup envelope, using defaults");
                        default_generation_config()
                    }
                    Err(err) => {
                        error!(%err, "invalid setup message");
                        return Err(RelayError::BadSetup);
                    }
                };
                return Ok(Some(config));
            }
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => debug!(?other, "ignoring non-text frame before setup"),
        }
    }
}

/// What a session gets when its setup names no generation config: audio
/// and text replies, mild temperature, one candidate.
fn default_generation_config() -> LiveGenerationConfig {
    LiveGenerationConfig {
        response_modalities: vec!["AUDIO".to_string(), "TEXT".to_string()],
        temperature: Some(0.7),
        candidate_count: Some(1),
    }
}

/// A client-provided generation config replaces the defaults wholesale;
/// only a missing one falls back.
fn effective_generation_config(setup: SessionSetup) -> LiveGenerationConfig {
    setup
        .generation_config
        .map(LiveGenerationConfig::from)
        .unwrap_or_else(default_generation_config)
}

async fn client_to_upstream_loop(
    mut from_client: SplitStream<WebSocketStream<TcpStream>>,
    mut upstream: UpstreamSender,
) {
    while let Some(frame) = from_client.next().await {
        match frame {
            Ok(Message::Text(raw)) => forward_media(&mut upstream, &raw).await,
            Ok(Message::Close(_)) => {
                info!("client closed the session");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "client read failed");
                break;
            }
        }
    }
    // Tears down the upstream reader too, which ends the other loop.
    upstream.close().await;
}

async fn upstream_to_client_loop(
    mut events: mpsc::Receiver<UpstreamEvent>,
    mut to_client: SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    while let Some(event) = events.recv().await {
        let Some(reply) = reply_for(event) else {
            continue;
        };
        match serde_json::to_string(&reply) {
            Ok(json) => {
                if let Err(err) = to_client.send(Message::text(json)).await {
                    warn!(%err, "client send failed");
                    break;
                }
            }
            Err(err) => error!(%err, "failed to encode reply"),
        }
    }
    let _ = to_client.send(Message::Close(None)).await;
}

async fn forward_media(upstream: &mut UpstreamSender, raw: &str) {
    match ClientMessage::parse(raw) {
        Ok(ClientMessage::Data { realtime_input }) => {
            let chunks = accepted_chunks(realtime_input.media_chunks);
            if chunks.is_empty() {
                return;
            }
            if let Err(err) = upstream.send_media(chunks).await {
                warn!(%err, "failed to forward media upstream");
            }
        }
        Ok(ClientMessage::Setup { .. }) => debug!("ignoring duplicate setup envelope"),
        Err(err) => warn!(%err, "dropping malformed client message"),
    }
}

/// Only PCM audio and JPEG frames go upstream; everything else is dropped.
fn accepted_chunks(chunks: SmallVec<[MediaChunk; 2]>) -> Vec<LiveMediaChunk> {
    chunks
        .into_iter()
        .filter(|chunk| chunk.mime_type == AUDIO_MIME || chunk.mime_type == IMAGE_MIME)
        .map(|chunk| LiveMediaChunk {
            mime_type: chunk.mime_type,
            data: chunk.data,
        })
        .collect()
}

/// Map a model event to the flat reply the client understands. Lifecycle
/// events produce no reply.
fn reply_for(event: UpstreamEvent) -> Option<ServerEvent> {
    match event {
        UpstreamEvent::Text(text) => Some(ServerEvent {
            text: Some(text),
            ..Default::default()
        }),
        UpstreamEvent::Audio(data) => Some(ServerEvent {
            audio: Some(data),
            ..Default::default()
        }),
        UpstreamEvent::TurnComplete => Some(ServerEvent {
            turn_complete: Some(true),
            ..Default::default()
        }),
        UpstreamEvent::Ready | UpstreamEvent::Closed => None,
    }
}
