//! MirrorLive client - mirrors the microphone and screen to the relay and
//! plays the assistant's replies.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

use mirrorlive::bridge::AssistantEvent;
use mirrorlive::config::{self, ClientArgs};
use mirrorlive::session::{Session, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    config::init_tracing();
    let args = ClientArgs::parse();

    info!(url = %args.url, "starting mirrorlive");
    let mut session = Session::start(SessionConfig {
        url: args.url,
        audio_device: args.audio_device,
        screen: !args.no_screen,
        record_to: args.record,
    });

    let reason = loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(AssistantEvent::Transcript(line)) => println!("{line}"),
                Some(AssistantEvent::TurnComplete) => debug!("assistant turn complete"),
                Some(AssistantEvent::LinkDown) | None => break "link closed",
            },
            _ = tokio::signal::ctrl_c() => break "interrupted",
        }
    };

    info!(reason, "shutting down");
    session.shutdown().await;
    Ok(())
}
