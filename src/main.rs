use std::sync::Arc;

use rtp_media_server::{Config, MediaSink};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// The AI pipeline that ultimately consumes inbound audio is an external
/// collaborator (spec §1) wired in by the embedding application; this
/// binary exists to prove out the media plane on its own, so it logs
/// frames instead of forwarding them anywhere.
struct LoggingSink;

impl MediaSink for LoggingSink {
    fn on_frame(&self, ssrc: u32, frame: &[u8]) -> bool {
        log::trace!("{} bytes of pcm16/16k for ssrc {ssrc:#010x}", frame.len());
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let server = rtp_media_server::startup(&config, Arc::new(LoggingSink)).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    server.stop().await?;

    Ok(())
}
