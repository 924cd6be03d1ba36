// ABOUTME: The plugin contract protocol-specific backends (RDP, VNC, SSH, ...) implement
// ABOUTME: and the read-only registry the handshake consults to resolve a `select`ed protocol name

use crate::drawing::Surface;
use crate::status::GuacResult;
use async_trait::async_trait;
use std::collections::HashMap;

/// The functions a backend must or may implement (§6 "Backend plugin
/// interface"). `init` is mandatory; the rest default to no-ops, mirroring
/// the teacher's trait-with-default-bodies pattern (`SmppClient`/`SmppConnection`
/// in `client/traits.rs`) and the legacy C API's optional callback slots.
#[async_trait]
pub trait Backend: Send {
    /// Parameter names expected, in order, in the `connect` instruction's argv.
    fn client_args(&self) -> &'static [&'static str];

    /// Called once, after `connect`, with the client-supplied argv. A failure
    /// here aborts the handshake with an `error` instruction (§4.7).
    async fn init(&mut self, argv: &[String]) -> GuacResult<()>;

    /// Forwarded from the `mouse` opcode (§4.4).
    async fn mouse(&mut self, _x: i32, _y: i32, _button_mask: u8) -> GuacResult<()> {
        Ok(())
    }

    /// Forwarded from the `key` opcode (§4.4).
    async fn key(&mut self, _keysym: i64, _pressed: bool) -> GuacResult<()> {
        Ok(())
    }

    /// Forwarded from the `clipboard` opcode (§4.4).
    async fn clipboard(&mut self, _text: &str) -> GuacResult<()> {
        Ok(())
    }

    /// Forwarded from the `size` opcode (§4.4); optional because not every
    /// backend supports live resize.
    async fn size(&mut self, _width: i32, _height: i32, _dpi: Option<i32>) -> GuacResult<()> {
        Ok(())
    }

    /// Drains whatever events the backend has pending against the remote
    /// server, emitting drawing instructions through `surface`. Returns
    /// whether anything was drawn, which drives the output task's sync
    /// batching (§4.5 Framing, §4.8).
    async fn handle_messages(&mut self, _surface: &mut Surface<'_>) -> GuacResult<bool> {
        Ok(false)
    }

    /// Releases any backend-owned resources (remote connections, decoder
    /// state) at connection teardown (§3 Lifecycles).
    fn free(&mut self) {}
}

/// Constructs a fresh, uninitialized backend instance.
pub type BackendFactory = fn() -> Box<dyn Backend>;

/// Read-only-after-init map from protocol name (as sent in the `select`
/// instruction) to the factory that builds its backend (§4.7, §5 "the core
/// itself holds no cross-connection shared state except the backend-factory
/// registry").
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, protocol: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(protocol.into(), factory);
    }

    pub fn create(&self, protocol: &str) -> Option<Box<dyn Backend>> {
        self.factories.get(protocol).map(|factory| factory())
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBackend;

    #[async_trait]
    impl Backend for NoopBackend {
        fn client_args(&self) -> &'static [&'static str] {
            &["hostname", "port"]
        }

        async fn init(&mut self, _argv: &[String]) -> GuacResult<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_registered_protocol() {
        let mut registry = BackendRegistry::new();
        registry.register("demo", || Box::new(NoopBackend));
        assert!(registry.supports("demo"));
        let backend = registry.create("demo").expect("backend");
        assert_eq!(backend.client_args(), &["hostname", "port"]);
    }

    #[test]
    fn registry_rejects_unknown_protocol() {
        let registry = BackendRegistry::new();
        assert!(!registry.supports("vnc"));
        assert!(registry.create("vnc").is_none());
    }
}
