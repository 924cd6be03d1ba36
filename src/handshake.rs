// ABOUTME: Runs the fixed select/args/size/audio/video/image/connect/ready exchange
// ABOUTME: that precedes steady-state instruction dispatch on a freshly accepted socket

use crate::backend::{Backend, BackendRegistry};
use crate::drawing::DrawingSurface;
use crate::socket::{SocketReader, SocketWriter};
use crate::status::{GuacError, GuacResult, Status};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    AwaitSelect,
    AwaitSize,
    AwaitAudio,
    AwaitVideo,
    AwaitImage,
    AwaitConnect,
}

impl HandshakeState {
    fn expected_opcode(self) -> &'static str {
        match self {
            HandshakeState::AwaitSelect => "select",
            HandshakeState::AwaitSize => "size",
            HandshakeState::AwaitAudio => "audio",
            HandshakeState::AwaitVideo => "video",
            HandshakeState::AwaitImage => "image",
            HandshakeState::AwaitConnect => "connect",
        }
    }

    fn next(self) -> Option<HandshakeState> {
        match self {
            HandshakeState::AwaitSelect => Some(HandshakeState::AwaitSize),
            HandshakeState::AwaitSize => Some(HandshakeState::AwaitAudio),
            HandshakeState::AwaitAudio => Some(HandshakeState::AwaitVideo),
            HandshakeState::AwaitVideo => Some(HandshakeState::AwaitImage),
            HandshakeState::AwaitImage => Some(HandshakeState::AwaitConnect),
            HandshakeState::AwaitConnect => None,
        }
    }
}

/// What a completed handshake hands back to the connection loop (§4.7, §4.8).
pub struct HandshakeOutcome {
    pub backend: Box<dyn Backend>,
    pub connection_id: String,
}

/// Drives a freshly accepted socket through the handshake state machine,
/// resolving the requested protocol against `registry`, gathering client
/// capabilities, and initializing the chosen backend (§4.7).
///
/// Each state has its own `step_timeout`; an instruction whose opcode does
/// not match the state's expectation is a protocol error, matching §9's "any
/// non-matching opcode at a handshake state is an error" decision to not
/// special-case clients that skip `audio`/`video`/`image`.
pub async fn run_handshake<R, W>(
    reader: &mut SocketReader<R>,
    writer: &mut SocketWriter<W>,
    registry: &BackendRegistry,
    step_timeout: Duration,
) -> GuacResult<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match run_handshake_inner(reader, writer, registry, step_timeout).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            notify_client_of_handshake_failure(writer, &err).await;
            Err(err)
        }
    }
}

/// Emits a final `error` instruction before the caller closes the socket,
/// per §4.7/§7 — best-effort, since the write may itself fail on a socket
/// that is already gone.
async fn notify_client_of_handshake_failure<W>(writer: &mut SocketWriter<W>, err: &GuacError)
where
    W: AsyncWrite + Unpin,
{
    if !err.status.should_notify_client() {
        return;
    }
    let mut surface = DrawingSurface::new(writer);
    let _ = surface.send_error(&err.message, err.status.code()).await;
    let _ = writer.flush().await;
}

async fn run_handshake_inner<R, W>(
    reader: &mut SocketReader<R>,
    writer: &mut SocketWriter<W>,
    registry: &BackendRegistry,
    step_timeout: Duration,
) -> GuacResult<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = HandshakeState::AwaitSelect;
    let mut backend: Option<Box<dyn Backend>> = None;

    loop {
        let instr = reader.read_instruction(step_timeout).await?;
        let instr = instr.ok_or_else(|| {
            GuacError::new(Status::Closed, "connection closed during handshake")
        })?;

        if instr.opcode() != state.expected_opcode() {
            return Err(GuacError::new(
                Status::ProtocolError,
                format!(
                    "expected '{}' at this handshake step, got '{}'",
                    state.expected_opcode(),
                    instr.opcode()
                ),
            ));
        }

        match state {
            HandshakeState::AwaitSelect => {
                let protocol = instr.arg(0).ok_or_else(|| {
                    GuacError::new(Status::ProtocolError, "select: missing protocol name")
                })?;
                let resolved = registry.create(protocol).ok_or_else(|| {
                    GuacError::new(Status::NotFound, format!("unsupported protocol: {protocol}"))
                })?;
                debug!(protocol, "resolved backend for select");

                let mut surface = DrawingSurface::new(writer);
                surface.send_args(resolved.client_args()).await?;

                backend = Some(resolved);
            }

            HandshakeState::AwaitSize => {
                debug!(
                    width = ?instr.arg(0),
                    height = ?instr.arg(1),
                    dpi = ?instr.arg(2),
                    "handshake: size"
                );
            }

            HandshakeState::AwaitAudio => {
                debug!(mimetypes = ?instr.args(), "handshake: audio");
            }

            HandshakeState::AwaitVideo => {
                debug!(mimetypes = ?instr.args(), "handshake: video");
            }

            HandshakeState::AwaitImage => {
                debug!(mimetypes = ?instr.args(), "handshake: image");
            }

            HandshakeState::AwaitConnect => {
                let argv: Vec<String> = instr.args().to_vec();
                let backend_ref = backend
                    .as_mut()
                    .expect("select must have resolved a backend before connect");
                backend_ref.init(&argv).await?;

                let connection_id = generate_connection_id();
                let mut surface = DrawingSurface::new(writer);
                surface.send_ready(&connection_id).await?;
                writer.flush().await?;

                return Ok(HandshakeOutcome {
                    backend: backend.take().expect("backend resolved above"),
                    connection_id,
                });
            }
        }

        state = state.next().expect("AwaitConnect returns before reaching here");
    }
}

/// Mints an opaque, `$`-prefixed connection id. Each [`RandomState`] draws
/// fresh keys from the OS on construction, which is enough entropy for an
/// identifier that only needs to be unguessable-ish and unique per process —
/// not worth a dependency on a dedicated RNG crate for this alone.
fn generate_connection_id() -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    const LENGTH: usize = 12;

    let mut id = String::with_capacity(LENGTH + 1);
    id.push('$');
    for _ in 0..LENGTH {
        let bits = RandomState::new().build_hasher().finish();
        id.push(ALPHABET[(bits % ALPHABET.len() as u64) as usize] as char);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use async_trait::async_trait;
    use tokio::io::duplex;

    struct VncLikeBackend {
        received_argv: Vec<String>,
    }

    #[async_trait]
    impl Backend for VncLikeBackend {
        fn client_args(&self) -> &'static [&'static str] {
            &["hostname", "port", "password"]
        }

        async fn init(&mut self, argv: &[String]) -> GuacResult<()> {
            self.received_argv = argv.to_vec();
            Ok(())
        }
    }

    fn test_registry() -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register("vnc", || {
            Box::new(VncLikeBackend {
                received_argv: Vec::new(),
            })
        });
        registry
    }

    #[tokio::test]
    async fn full_handshake_resolves_backend_and_sends_ready() {
        // Scenario A from the spec.
        let (mut client, server) = duplex(64 * 1024);
        use tokio::io::AsyncWriteExt;

        tokio::spawn(async move {
            client
                .write_all(b"6.select,3.vnc;")
                .await
                .unwrap();
            client
                .write_all(b"4.size,4.1024,3.768,2.96;")
                .await
                .unwrap();
            client.write_all(b"5.audio;").await.unwrap();
            client.write_all(b"5.video;").await.unwrap();
            client.write_all(b"5.image,9.image/png;").await.unwrap();
            client
                .write_all(b"7.connect,9.localhost,4.5900,8.secret01;")
                .await
                .unwrap();
            client.flush().await.unwrap();
            // Keep the client half alive until the server has replied.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (read_half, write_half) = tokio::io::split(server);
        let mut reader = SocketReader::new(read_half);
        let mut writer = SocketWriter::new(write_half);
        let registry = test_registry();

        let outcome = run_handshake(&mut reader, &mut writer, &registry, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(outcome.connection_id.starts_with('$'));
    }

    #[tokio::test]
    async fn unknown_protocol_is_not_found_error() {
        let (mut client, server) = duplex(64 * 1024);
        use tokio::io::AsyncWriteExt;
        tokio::spawn(async move {
            client.write_all(b"6.select,3.rdp;").await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (read_half, write_half) = tokio::io::split(server);
        let mut reader = SocketReader::new(read_half);
        let mut writer = SocketWriter::new(write_half);
        let registry = test_registry();

        let result = run_handshake(&mut reader, &mut writer, &registry, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(e) if e.status == Status::NotFound));
    }

    #[tokio::test]
    async fn opcode_out_of_sequence_is_protocol_error() {
        let (mut client, server) = duplex(64 * 1024);
        use tokio::io::AsyncWriteExt;
        tokio::spawn(async move {
            client.write_all(b"6.select,3.vnc;").await.unwrap();
            // Skip straight to connect — size/audio/video/image expected next.
            client
                .write_all(b"7.connect,9.localhost,4.5900,8.secret01;")
                .await
                .unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (read_half, write_half) = tokio::io::split(server);
        let mut reader = SocketReader::new(read_half);
        let mut writer = SocketWriter::new(write_half);
        let registry = test_registry();

        let result = run_handshake(&mut reader, &mut writer, &registry, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(e) if e.status == Status::ProtocolError));
    }

    #[tokio::test]
    async fn handshake_failure_sends_error_instruction_before_returning() {
        let (client, server) = duplex(64 * 1024);
        use tokio::io::AsyncWriteExt;
        let (client_read, mut client_write) = tokio::io::split(client);
        tokio::spawn(async move {
            client_write.write_all(b"6.select,3.rdp;").await.unwrap();
            client_write.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (read_half, write_half) = tokio::io::split(server);
        let mut reader = SocketReader::new(read_half);
        let mut writer = SocketWriter::new(write_half);
        let registry = test_registry();

        let result = run_handshake(&mut reader, &mut writer, &registry, Duration::from_secs(1)).await;
        assert!(result.is_err());

        let mut client_reader = SocketReader::new(client_read);
        let error_instr = client_reader
            .read_instruction(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("server should send an error instruction before closing");
        assert_eq!(error_instr.opcode(), "error");
        assert_eq!(error_instr.arg(1), Some(Status::NotFound.code().to_string().as_str()));
    }
}
