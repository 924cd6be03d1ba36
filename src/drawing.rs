// ABOUTME: Stable drawing/streaming API backends use to emit protocol instructions
// ABOUTME: Every call here encodes exactly one wire instruction through the socket's writer

use crate::layer::Layer;
use crate::socket::SocketWriter;
use crate::status::GuacResult;
use tokio::io::AsyncWrite;

/// A write half boxed behind a trait object so the [`crate::backend::Backend`]
/// trait — which must remain object-safe to live in a registry keyed by
/// protocol name — can be written in terms of one concrete writer type
/// regardless of whether the connection runs over a `TcpStream` or an
/// in-memory test double.
pub type DynAsyncWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// The writer type backends actually see.
pub type BackendWriter = SocketWriter<DynAsyncWrite>;

/// The drawing surface type backends actually see.
pub type Surface<'a> = DrawingSurface<'a, DynAsyncWrite>;

/// Composite operation codes: the Porter-Duff set plus a few RDP-specific
/// raster ops, communicated to the client as small integers (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompositeOperation {
    Rout = 0,
    Atop = 1,
    Xor = 2,
    Rover = 3,
    Over = 4,
    Plus = 5,
    Multiply = 6,
    Src = 7,
    /// RDP raster operation: destination unchanged (ROP black-hole equivalent).
    RdpBlack = 8,
    /// RDP raster operation: destination fully replaced regardless of source alpha.
    RdpWhite = 9,
}

/// The stable drawing-command surface backends use to emit updates (§4.5).
///
/// Every method encodes one instruction and writes it through the supplied
/// writer; none of them flush on their own — the connection loop's output
/// task batches a backend's drawing calls and flushes once per message-pump
/// cycle (§4.8).
pub struct DrawingSurface<'a, W> {
    writer: &'a mut SocketWriter<W>,
}

impl<'a, W: AsyncWrite + Unpin> DrawingSurface<'a, W> {
    pub fn new(writer: &'a mut SocketWriter<W>) -> Self {
        DrawingSurface { writer }
    }

    async fn write_element(&mut self, text: &str) -> GuacResult<()> {
        self.writer
            .write_string(format!("{}.", text.chars().count()).as_bytes())
            .await?;
        self.writer.write_string(text.as_bytes()).await
    }

    async fn write_int_element(&mut self, value: i64) -> GuacResult<()> {
        self.write_element(&value.to_string()).await
    }

    async fn begin(&mut self, opcode: &str) -> GuacResult<()> {
        self.write_element(opcode).await
    }

    async fn arg(&mut self, value: i64) -> GuacResult<()> {
        self.writer.write_string(b",").await?;
        self.write_int_element(value).await
    }

    async fn arg_str(&mut self, value: &str) -> GuacResult<()> {
        self.writer.write_string(b",").await?;
        self.write_element(value).await
    }

    async fn end(&mut self) -> GuacResult<()> {
        self.writer.write_string(b";").await
    }

    /// `send_size(layer, w, h)` — sets a layer's dimensions.
    pub async fn send_size(&mut self, layer: Layer, width: i32, height: i32) -> GuacResult<()> {
        self.begin("size").await?;
        self.arg(layer.index() as i64).await?;
        self.arg(width as i64).await?;
        self.arg(height as i64).await?;
        self.end().await
    }

    /// `send_copy(src, sx, sy, w, h, op, dst, dx, dy)` — blits a rectangle
    /// between layers.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_copy(
        &mut self,
        src: Layer,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
        op: CompositeOperation,
        dst: Layer,
        dx: i32,
        dy: i32,
    ) -> GuacResult<()> {
        self.begin("copy").await?;
        self.arg(src.index() as i64).await?;
        self.arg(sx as i64).await?;
        self.arg(sy as i64).await?;
        self.arg(width as i64).await?;
        self.arg(height as i64).await?;
        self.arg(op as i64).await?;
        self.arg(dst.index() as i64).await?;
        self.arg(dx as i64).await?;
        self.arg(dy as i64).await?;
        self.end().await
    }

    /// `send_rect(layer, x, y, w, h)` — fills a rectangle using the color set
    /// by the most recently sent `cfill`.
    pub async fn send_rect(
        &mut self,
        layer: Layer,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> GuacResult<()> {
        self.begin("rect").await?;
        self.arg(layer.index() as i64).await?;
        self.arg(x as i64).await?;
        self.arg(y as i64).await?;
        self.arg(width as i64).await?;
        self.arg(height as i64).await?;
        self.end().await
    }

    /// `send_cfill(op, layer, r, g, b, a)` — sets the fill color for the next
    /// `rect`.
    pub async fn send_cfill(
        &mut self,
        op: CompositeOperation,
        layer: Layer,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) -> GuacResult<()> {
        self.begin("cfill").await?;
        self.arg(op as i64).await?;
        self.arg(layer.index() as i64).await?;
        self.arg(r as i64).await?;
        self.arg(g as i64).await?;
        self.arg(b as i64).await?;
        self.arg(a as i64).await?;
        self.end().await
    }

    /// `send_clip(layer, x, y, w, h)` — installs a clip region on a layer.
    pub async fn send_clip(
        &mut self,
        layer: Layer,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> GuacResult<()> {
        self.begin("clip").await?;
        self.arg(layer.index() as i64).await?;
        self.arg(x as i64).await?;
        self.arg(y as i64).await?;
        self.arg(width as i64).await?;
        self.arg(height as i64).await?;
        self.end().await
    }

    /// `send_png(op, layer, x, y, data)` — paints a PNG at a location, with
    /// the binary data base64-encoded inline.
    pub async fn send_png(
        &mut self,
        op: CompositeOperation,
        layer: Layer,
        x: i32,
        y: i32,
        data: &[u8],
    ) -> GuacResult<()> {
        self.begin("png").await?;
        self.arg(op as i64).await?;
        self.arg(layer.index() as i64).await?;
        self.arg(x as i64).await?;
        self.arg(y as i64).await?;
        self.write_binary_arg(data).await?;
        self.end().await
    }

    /// `send_cursor(hx, hy, src_layer, sx, sy, w, h)` — sets the client
    /// cursor to a rectangle of a layer, with the given hotspot.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_cursor(
        &mut self,
        hotspot_x: i32,
        hotspot_y: i32,
        src: Layer,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
    ) -> GuacResult<()> {
        self.begin("cursor").await?;
        self.arg(hotspot_x as i64).await?;
        self.arg(hotspot_y as i64).await?;
        self.arg(src.index() as i64).await?;
        self.arg(sx as i64).await?;
        self.arg(sy as i64).await?;
        self.arg(width as i64).await?;
        self.arg(height as i64).await?;
        self.end().await
    }

    /// `send_blob(stream, bytes)` — delivers a chunk on a stream, base64
    /// encoded inline.
    pub async fn send_blob(&mut self, stream: usize, data: &[u8]) -> GuacResult<()> {
        self.begin("blob").await?;
        self.arg(stream as i64).await?;
        self.write_binary_arg(data).await?;
        self.end().await
    }

    /// `send_end(stream)` — closes a stream.
    pub async fn send_end(&mut self, stream: usize) -> GuacResult<()> {
        self.begin("end").await?;
        self.arg(stream as i64).await?;
        self.end().await
    }

    /// `send_clipboard(text)` — server-to-client clipboard push.
    pub async fn send_clipboard(&mut self, text: &str) -> GuacResult<()> {
        self.begin("clipboard").await?;
        self.arg_str(text).await?;
        self.end().await
    }

    /// Emits a `sync` instruction carrying `timestamp_ms` (§4.5 Framing,
    /// §4.8 connection loop).
    pub async fn send_sync(&mut self, timestamp_ms: i64) -> GuacResult<()> {
        self.begin("sync").await?;
        self.arg(timestamp_ms).await?;
        self.end().await
    }

    /// Emits a terminal `error` instruction with a human-readable message and
    /// numeric status code (§7 "User-visible failures").
    pub async fn send_error(&mut self, message: &str, code: u8) -> GuacResult<()> {
        self.begin("error").await?;
        self.arg_str(message).await?;
        self.arg(code as i64).await?;
        self.end().await
    }

    /// Emits the `args` instruction listing a resolved backend's expected
    /// `connect` parameter names, in order (§4.7 `AwaitSelect`).
    pub async fn send_args(&mut self, param_names: &[&str]) -> GuacResult<()> {
        self.begin("args").await?;
        for name in param_names {
            self.arg_str(name).await?;
        }
        self.end().await
    }

    /// Emits the `ready` instruction carrying the connection id, the final
    /// step of the handshake (§4.7 `AwaitConnect`).
    pub async fn send_ready(&mut self, connection_id: &str) -> GuacResult<()> {
        self.begin("ready").await?;
        self.arg_str(connection_id).await?;
        self.end().await
    }

    /// Encodes a binary argument as a length-prefixed base64 element. Unlike
    /// string arguments, the length prefix here counts the base64 text's own
    /// codepoints (all ASCII), computed after staging completes, so the
    /// triplet must be flushed before the comma-delimited length can be
    /// known — this writes the base64 body first into a scratch buffer.
    async fn write_binary_arg(&mut self, data: &[u8]) -> GuacResult<()> {
        let encoded = encode_base64(data);
        self.arg_str(&encoded).await
    }
}

/// Standalone base64 encoder used when the full encoded text must be known
/// up front (to compute its element length) rather than streamed through the
/// writer's incremental staging triplet.
fn encode_base64(data: &[u8]) -> String {
    const CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);
        out.push(CHARS[(b0 >> 2) as usize] as char);
        out.push(CHARS[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            CHARS[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            CHARS[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerPool;
    use crate::socket::SocketWriter;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn send_rect_encodes_expected_instruction() {
        let (client, mut server) = duplex(64 * 1024);
        let mut writer = SocketWriter::new(client);
        let mut pool = LayerPool::new();
        let layer = pool.default_layer();

        {
            let mut surface = DrawingSurface::new(&mut writer);
            surface.send_rect(layer, 1, 2, 3, 4).await.unwrap();
        }
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "4.rect,1.0,1.1,1.2,1.3,1.4;"
        );
    }

    #[tokio::test]
    async fn send_png_base64_encodes_binary_payload() {
        let (client, mut server) = duplex(64 * 1024);
        let mut writer = SocketWriter::new(client);
        let mut pool = LayerPool::new();
        let layer = pool.default_layer();

        {
            let mut surface = DrawingSurface::new(&mut writer);
            surface
                .send_png(CompositeOperation::Over, layer, 0, 0, b"abc")
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("3.png,"));
        assert!(text.contains("YWJj")); // base64("abc")
    }

    #[tokio::test]
    async fn send_sync_carries_timestamp() {
        let (client, mut server) = duplex(64 * 1024);
        let mut writer = SocketWriter::new(client);
        {
            let mut surface = DrawingSurface::new(&mut writer);
            surface.send_sync(42).await.unwrap();
        }
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "4.sync,2.42;");
    }
}
