// ABOUTME: Minimal backend implementation used by the daemon's default registry and integration tests
// ABOUTME: Paints one static rectangle on init and otherwise never emits events — a stand-in for a real RDP/VNC/SSH backend

use crate::backend::Backend;
use crate::drawing::Surface;
use crate::status::GuacResult;
use async_trait::async_trait;
use tracing::debug;

/// Protocol name this backend registers under.
pub const PROTOCOL_NAME: &str = "demo";

/// A backend that draws a single colored rectangle and otherwise sits idle.
/// Stands in for the RDP/VNC/SSH backends named out of scope (§1), giving the
/// handshake, dispatcher, and connection loop something real to drive end to
/// end in tests and in the daemon's default configuration.
pub struct DemoBackend {
    width: i32,
    height: i32,
    painted: bool,
}

impl Default for DemoBackend {
    fn default() -> Self {
        DemoBackend {
            width: 1024,
            height: 768,
            painted: false,
        }
    }
}

#[async_trait]
impl Backend for DemoBackend {
    fn client_args(&self) -> &'static [&'static str] {
        &["width", "height"]
    }

    async fn init(&mut self, argv: &[String]) -> GuacResult<()> {
        if let Some(width) = argv.first().and_then(|s| s.parse().ok()) {
            self.width = width;
        }
        if let Some(height) = argv.get(1).and_then(|s| s.parse().ok()) {
            self.height = height;
        }
        debug!(width = self.width, height = self.height, "demo backend initialized");
        Ok(())
    }

    async fn mouse(&mut self, x: i32, y: i32, button_mask: u8) -> GuacResult<()> {
        debug!(x, y, button_mask, "demo backend observed mouse event");
        Ok(())
    }

    async fn key(&mut self, keysym: i64, pressed: bool) -> GuacResult<()> {
        debug!(keysym, pressed, "demo backend observed key event");
        Ok(())
    }

    async fn handle_messages(&mut self, surface: &mut Surface<'_>) -> GuacResult<bool> {
        if self.painted {
            return Ok(false);
        }

        let layer = crate::layer::Layer::root();
        surface.send_size(layer, self.width, self.height).await?;
        surface
            .send_cfill(
                crate::drawing::CompositeOperation::Over,
                layer,
                0x20,
                0x60,
                0xa0,
                0xff,
            )
            .await?;
        surface
            .send_rect(layer, 0, 0, self.width, self.height)
            .await?;

        self.painted = true;
        Ok(true)
    }

    fn free(&mut self) {
        debug!("demo backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketWriter;
    use tokio::io::duplex;

    #[tokio::test]
    async fn init_parses_dimensions_from_argv() {
        let mut backend = DemoBackend::default();
        backend
            .init(&["640".to_string(), "480".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.width, 640);
        assert_eq!(backend.height, 480);
    }

    #[tokio::test]
    async fn init_keeps_defaults_on_unparsable_argv() {
        let mut backend = DemoBackend::default();
        backend
            .init(&["not-a-number".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.width, 1024);
        assert_eq!(backend.height, 768);
    }

    #[tokio::test]
    async fn handle_messages_paints_exactly_once() {
        let (client, _server) = duplex(64 * 1024);
        let boxed: crate::drawing::DynAsyncWrite = Box::new(client);
        let mut writer = SocketWriter::new(boxed);
        let mut backend = DemoBackend::default();

        let mut surface = crate::drawing::DrawingSurface::new(&mut writer);
        let drew_first = backend.handle_messages(&mut surface).await.unwrap();
        let drew_second = backend.handle_messages(&mut surface).await.unwrap();

        assert!(drew_first);
        assert!(!drew_second);
    }
}
