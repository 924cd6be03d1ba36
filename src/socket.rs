// ABOUTME: Buffered, base64-capable byte channel sitting between the wire and the parser
// ABOUTME: Generic over any AsyncRead/AsyncWrite pair so file descriptors and in-memory doubles share one implementation

use crate::instruction::Instruction;
use crate::parser::Parser;
use crate::status::{GuacError, GuacResult, Status};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Size of the outbound byte buffer (§3 Socket, §4.3).
const WRITE_BUF_CAPACITY: usize = 8 * 1024;
/// Initial size of the inbound instruction buffer (§3 Socket).
const INBOUND_INITIAL_CAPACITY: usize = 1024;
/// Chunk size used for each underlying read call.
const READ_CHUNK_SIZE: usize = 4096;

const BASE64_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Decodes a base64 element's wire text back into the bytes the sender
/// encoded with [`SocketWriter::write_base64`] / the drawing surface's
/// inline encoder. Used for inbound `blob` payloads (§4.4, §3 Stream);
/// malformed characters are skipped rather than treated as an error, since a
/// stray character here is a wire bug the dispatcher already surfaces by
/// other means.
pub(crate) fn decode_base64(data: &[u8]) -> Vec<u8> {
    fn val(c: u8) -> Option<u8> {
        BASE64_CHARS.iter().position(|&x| x == c).map(|p| p as u8)
    }
    let mut out = Vec::with_capacity(data.len() / 4 * 3);
    let filtered: Vec<u8> = data.iter().copied().filter(|&b| b != b'=').collect();
    for quartet in filtered.chunks(4) {
        let vals: Vec<u8> = quartet.iter().filter_map(|&b| val(b)).collect();
        if vals.len() >= 2 {
            out.push((vals[0] << 2) | (vals[1] >> 4));
        }
        if vals.len() >= 3 {
            out.push((vals[1] << 4) | (vals[2] >> 2));
        }
        if vals.len() >= 4 {
            out.push((vals[2] << 6) | vals[3]);
        }
    }
    out
}

/// The read side of a Guacamole socket: an inbound buffer plus the embedded
/// parser that incrementally recognizes instructions from it (§3, §4.2).
///
/// Mirrors the read-then-parse loop in the teacher's `Connection::read_frame`:
/// try to make progress on already-buffered bytes before touching the
/// transport at all, which is exactly the "select" shortcut described in
/// §4.3 (no I/O needed when unparsed data is already buffered).
pub struct SocketReader<R> {
    stream: R,
    inbound: BytesMut,
    parser: Parser,
}

impl<R: AsyncRead + Unpin> SocketReader<R> {
    pub fn new(stream: R) -> Self {
        SocketReader {
            stream,
            inbound: BytesMut::with_capacity(INBOUND_INITIAL_CAPACITY),
            parser: Parser::new(),
        }
    }

    /// Reads the next complete instruction, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on a clean EOF (no partial instruction pending),
    /// `Err(Timeout)` if no instruction completes within `timeout`, and
    /// otherwise the parsed instruction. Partial state survives across calls
    /// and across timeouts (§4.2 "Read timeout").
    pub async fn read_instruction(&mut self, timeout: Duration) -> GuacResult<Option<Instruction>> {
        loop {
            if !self.inbound.is_empty() {
                let consumed = self.parser.append(&self.inbound);
                self.inbound.advance(consumed);
                if self.parser.is_complete() {
                    return Ok(Some(self.parser.take()));
                }
                if self.parser.is_error() {
                    return Err(self.parser.take_error());
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = tokio::time::timeout(timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| GuacError::new(Status::Timeout, "instruction read timed out"))??;

            if read == 0 {
                return if self.inbound.is_empty() {
                    Ok(None)
                } else {
                    Err(GuacError::new(
                        Status::Closed,
                        "connection closed mid-instruction",
                    ))
                };
            }

            // BytesMut::reserve compacts already-consumed space back to the
            // front when there's room, which is exactly the buffer
            // compaction §4.2 describes — with owned elements rather than
            // pointers, there's nothing left to patch afterward (§9).
            self.inbound.reserve(read);
            self.inbound.extend_from_slice(&chunk[..read]);
        }
    }
}

/// The write side of a Guacamole socket: the 8 KiB outbound buffer and the
/// base64 staging triplet (§3, §4.1, §4.3).
pub struct SocketWriter<W> {
    stream: W,
    write_buf: Box<[u8; WRITE_BUF_CAPACITY]>,
    write_len: usize,
    b64_triplet: [u8; 3],
    b64_len: usize,
    sticky_error: Option<Status>,
}

impl<W: AsyncWrite + Unpin> SocketWriter<W> {
    pub fn new(stream: W) -> Self {
        SocketWriter {
            stream,
            write_buf: Box::new([0u8; WRITE_BUF_CAPACITY]),
            write_len: 0,
            b64_triplet: [0u8; 3],
            b64_len: 0,
            sticky_error: None,
        }
    }

    fn check_sticky(&self) -> GuacResult<()> {
        if let Some(status) = self.sticky_error {
            return Err(GuacError::new(status, "socket write previously failed"));
        }
        Ok(())
    }

    /// Copies `bytes` into the output buffer, flushing whenever fewer than 4
    /// bytes remain free (§4.1 write-string, §4.3 write buffer policy).
    pub async fn write_string(&mut self, bytes: &[u8]) -> GuacResult<()> {
        self.check_sticky()?;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let free = WRITE_BUF_CAPACITY - self.write_len;
            if free < 4 {
                self.flush().await?;
                continue;
            }
            let take = remaining.len().min(free);
            self.write_buf[self.write_len..self.write_len + take]
                .copy_from_slice(&remaining[..take]);
            self.write_len += take;
            remaining = &remaining[take..];

            if WRITE_BUF_CAPACITY - self.write_len < 4 {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Formats `value` as ASCII decimal and writes it (§4.1 write-int).
    pub async fn write_int(&mut self, value: i64) -> GuacResult<()> {
        self.write_string(value.to_string().as_bytes()).await
    }

    /// Stages `data` three bytes at a time, emitting a base64 quartet for
    /// every full triplet (§4.1 write-base64, §4.3 base64 staging).
    pub async fn write_base64(&mut self, mut data: &[u8]) -> GuacResult<()> {
        self.check_sticky()?;
        while !data.is_empty() {
            let need = 3 - self.b64_len;
            let take = need.min(data.len());
            self.b64_triplet[self.b64_len..self.b64_len + take].copy_from_slice(&data[..take]);
            self.b64_len += take;
            data = &data[take..];

            if self.b64_len == 3 {
                self.emit_quartet(3).await?;
                self.b64_len = 0;
            }
        }
        Ok(())
    }

    /// Encodes any partial triplet and pads with `=` to a quartet boundary
    /// (§4.1 flush-base64). Must be called before any non-base64 write that
    /// follows base64 output, and implicitly before close.
    pub async fn flush_base64(&mut self) -> GuacResult<()> {
        if self.b64_len > 0 {
            let n = self.b64_len;
            self.emit_quartet(n).await?;
            self.b64_len = 0;
        }
        Ok(())
    }

    async fn emit_quartet(&mut self, n: usize) -> GuacResult<()> {
        let b0 = self.b64_triplet[0];
        let b1 = if n > 1 { self.b64_triplet[1] } else { 0 };
        let b2 = if n > 2 { self.b64_triplet[2] } else { 0 };

        let c0 = BASE64_CHARS[(b0 >> 2) as usize];
        let c1 = BASE64_CHARS[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize];
        let c2 = if n > 1 {
            BASE64_CHARS[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize]
        } else {
            b'='
        };
        let c3 = if n > 2 {
            BASE64_CHARS[(b2 & 0x3f) as usize]
        } else {
            b'='
        };

        self.write_string(&[c0, c1, c2, c3]).await
    }

    /// Delivers all buffered bytes through the underlying transport,
    /// retrying until every byte is accepted or an error is signaled.
    /// Write errors are sticky (§4.3): once recorded, all subsequent writes
    /// fail until the socket is replaced.
    pub async fn flush(&mut self) -> GuacResult<()> {
        if self.write_len == 0 {
            return Ok(());
        }

        let mut written = 0;
        while written < self.write_len {
            match self.stream.write(&self.write_buf[written..self.write_len]).await {
                Ok(0) => {
                    let err = GuacError::new(Status::SeeErrno, "write handler wrote zero bytes");
                    self.sticky_error = Some(err.status);
                    return Err(err);
                }
                Ok(n) => written += n,
                Err(e) => {
                    let err: GuacError = e.into();
                    self.sticky_error = Some(err.status);
                    return Err(err);
                }
            }
        }

        self.write_len = 0;
        Ok(())
    }

    /// Flushes any staged base64 remainder and the byte buffer, then shuts
    /// down the transport (§3 Socket lifecycle: freeing implicitly flushes).
    pub async fn close(&mut self) -> GuacResult<()> {
        self.flush_base64().await?;
        self.flush().await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// A bidirectional Guacamole socket, bundling a [`SocketReader`] and
/// [`SocketWriter`] over the same underlying stream (§3 Socket).
pub struct Socket<S> {
    pub reader: SocketReader<ReadHalf<S>>,
    pub writer: SocketWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Socket<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Socket {
            reader: SocketReader::new(read_half),
            writer: SocketWriter::new(write_half),
        }
    }

    /// Splits into independently ownable reader/writer halves so the input
    /// and output tasks of the connection loop (§4.8) can each hold one.
    pub fn into_parts(self) -> (SocketReader<ReadHalf<S>>, SocketWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_buffer_round_trips_through_flush() {
        let (client, mut server) = duplex(64 * 1024);
        let mut writer = SocketWriter::new(client);

        writer.write_string(b"5.mouse,").await.unwrap();
        writer.write_string(b"3.100;").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"5.mouse,3.100;");
    }

    #[tokio::test]
    async fn base64_round_trips_binary_data() {
        let (client, mut server) = duplex(64 * 1024);
        let mut writer = SocketWriter::new(client);

        let payload: Vec<u8> = (0..=255u8).collect();
        writer.write_base64(&payload).await.unwrap();
        writer.flush_base64().await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut encoded = Vec::new();
        use tokio::io::AsyncReadExt;
        server.read_to_end(&mut encoded).await.unwrap();

        let decoded = decode_base64(&encoded);
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn reader_parses_instruction_written_across_many_small_writes() {
        let (mut client, server) = duplex(64 * 1024);
        use tokio::io::AsyncWriteExt;
        tokio::spawn(async move {
            for chunk in [b"5.mo".as_slice(), b"use,3.100,3.200,1.1;"] {
                client.write_all(chunk).await.unwrap();
                client.flush().await.unwrap();
            }
        });

        let mut reader = SocketReader::new(server);
        let instr = reader
            .read_instruction(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("instruction");
        assert_eq!(instr.opcode(), "mouse");
        assert_eq!(instr.args(), &["100", "200", "1"]);
    }

    #[tokio::test]
    async fn reader_reports_timeout_on_stalled_peer() {
        let (_client, server) = duplex(64 * 1024);
        let mut reader = SocketReader::new(server);
        let result = reader.read_instruction(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(e) if e.status == Status::Timeout));
    }

    #[tokio::test]
    async fn reader_returns_none_on_clean_eof() {
        let (client, server) = duplex(64 * 1024);
        drop(client);
        let mut reader = SocketReader::new(server);
        let result = reader.read_instruction(Duration::from_secs(1)).await;
        assert!(matches!(result, Ok(None)));
    }
}
