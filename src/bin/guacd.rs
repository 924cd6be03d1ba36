// ABOUTME: Daemon entry point: binds a listener, runs the handshake then the steady-state loop per connection
// ABOUTME: Mirrors the teacher's thin-binary style (see its own small bin targets) — wiring only, no protocol logic

use guac_core::config::GuacdConfig;
use guac_core::connection::run_connection;
use guac_core::demo_backend::DemoBackend;
use guac_core::drawing::DynAsyncWrite;
use guac_core::handshake::run_handshake;
use guac_core::socket::{SocketReader, SocketWriter};
use guac_core::BackendRegistry;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GuacdConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_verbosity.clone()))
        .init();

    let mut registry = BackendRegistry::new();
    registry.register(guac_core::demo_backend::PROTOCOL_NAME, || {
        Box::new(DemoBackend::default())
    });
    let registry = std::sync::Arc::new(registry);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "guacd listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let registry = registry.clone();
        let config = config.clone();

        tokio::spawn(async move {
            info!(%peer_addr, "accepted connection");
            if let Err(err) = serve(stream, &registry, &config).await {
                warn!(%peer_addr, error = %err, "connection ended with error");
            }
        });
    }
}

async fn serve(
    stream: TcpStream,
    registry: &BackendRegistry,
    config: &GuacdConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = SocketReader::new(read_half);
    let boxed_write_half: DynAsyncWrite = Box::new(write_half);
    let mut writer = SocketWriter::new(boxed_write_half);

    let outcome = run_handshake(&mut reader, &mut writer, registry, config.handshake_timeout)
        .await
        .map_err(|e| {
            error!(error = %e, "handshake failed");
            e
        })?;

    run_connection(reader, writer, outcome.backend, outcome.connection_id, config).await?;

    Ok(())
}
