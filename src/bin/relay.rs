//! MirrorLive relay - bridges mirror clients to the Gemini Live API.

use anyhow::{Context, Result};
use clap::Parser;

use mirrorlive::config::{self, RelayArgs};
use mirrorlive::gemini::UpstreamConfig;
use mirrorlive::relay::{self, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    config::init_tracing();
    let args = RelayArgs::parse();

    let api_key = match args.api_key {
        Some(key) => key,
        None => std::env::var("GEMINI_API_KEY")
            .context("no --api-key flag and GEMINI_API_KEY is not set")?,
    };

    relay::serve(RelayConfig {
        listen: args.listen,
        upstream: UpstreamConfig::from_api_key(&api_key, &args.model, args.system_instruction),
    })
    .await?;
    Ok(())
}
