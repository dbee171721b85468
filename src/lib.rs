pub mod codec;
pub mod config;
pub mod error;
pub mod resampler;
pub mod server;
pub mod session;
pub mod statistics;

pub use config::Config;
pub use error::{MediaServerError, PacketError};
pub use server::{MediaServer, MediaServerOptions, MediaSink};

use std::sync::Arc;

/// Builds and starts a `MediaServer` from a loaded `Config`, the way the
/// teacher's own `startup(config)` wires its `Service` together from
/// `ServiceOptions` before calling into the transport layer.
pub async fn startup(
    config: &Config,
    sink: Arc<dyn MediaSink>,
) -> Result<Arc<MediaServer>, MediaServerError> {
    let options = MediaServerOptions::from_config(config);
    let server = Arc::new(MediaServer::new(options, sink));
    server.start().await?;
    Ok(server)
}
