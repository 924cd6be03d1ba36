// ABOUTME: Per-connection shared state and the two-task steady-state connection loop
// ABOUTME: Input task dispatches inbound instructions; output task batches backend drawing into synced frames

use crate::backend::Backend;
use crate::config::GuacdConfig;
use crate::dispatcher::dispatch;
use crate::drawing::{DrawingSurface, DynAsyncWrite};
use crate::layer::LayerPool;
use crate::socket::{SocketReader, SocketWriter};
use crate::status::{GuacError, GuacResult, Status};
use crate::stream::{StreamSink, StreamTable};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Interval at which the output task polls the backend for pending drawing
/// events, and the batching delay once drawing is observed (§4.8).
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Shared per-connection state: the `Running`/`Stopping` latch and the two
/// timestamps driving the sync invariant and keepalive suppression (§3
/// "Connection state", §5 "Cancellation semantics").
pub struct ConnectionState {
    last_received_ts: AtomicI64,
    last_sent_ts: AtomicI64,
    running: AtomicBool,
    epoch: Instant,
    last_received_at_millis: AtomicU64,
    fresh_sync: Notify,
    streams: StdMutex<StreamTable>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        ConnectionState {
            last_received_ts: AtomicI64::new(0),
            last_sent_ts: AtomicI64::new(0),
            running: AtomicBool::new(true),
            epoch: Instant::now(),
            last_received_at_millis: AtomicU64::new(0),
            fresh_sync: Notify::new(),
            streams: StdMutex::new(StreamTable::new()),
        }
    }

    /// Allocates a stream index a backend can later `send_blob`/`send_end`
    /// against, attaching `sink` so inbound `blob`/`end` instructions
    /// against that index are delivered to it (§3 Stream).
    pub fn alloc_stream_with_sink(&self, sink: Option<Box<dyn StreamSink>>) -> Option<usize> {
        self.streams.lock().unwrap().alloc_with_sink(sink)
    }

    /// Allocates a stream index with no inbound sink — any `blob` data that
    /// arrives against it is silently discarded.
    pub fn alloc_stream(&self) -> Option<usize> {
        self.streams.lock().unwrap().alloc()
    }

    /// Routes an inbound `blob` instruction's payload to the stream's sink.
    /// Returns whether the index was actually open.
    pub fn dispatch_stream_blob(&self, index: usize, data: &[u8]) -> bool {
        self.streams.lock().unwrap().dispatch_blob(index, data)
    }

    /// Routes an inbound `end` instruction, notifying the sink and freeing
    /// the slot. Returns whether the index was actually open.
    pub fn dispatch_stream_end(&self, index: usize) -> bool {
        self.streams.lock().unwrap().dispatch_end(index)
    }

    pub fn last_received_ts(&self) -> i64 {
        self.last_received_ts.load(Ordering::SeqCst)
    }

    pub fn last_sent_ts(&self) -> i64 {
        self.last_sent_ts.load(Ordering::SeqCst)
    }

    /// Records a client `sync` timestamp and wakes any output task waiting
    /// on [`ConnectionState::wait_for_fresh_sync`].
    pub fn record_received(&self, ts: i64) {
        self.last_received_ts.store(ts, Ordering::SeqCst);
        self.last_received_at_millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
        self.fresh_sync.notify_waiters();
    }

    pub fn record_sent(&self, ts: i64) {
        self.last_sent_ts.store(ts, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the client's most recent acknowledgment is older than
    /// `threshold` (§4.8 keepalive-sync suppression).
    pub fn is_client_stale(&self, threshold: Duration) -> bool {
        let last = self.last_received_at_millis.load(Ordering::SeqCst);
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(last) > threshold.as_millis() as u64
    }

    /// Resolves as soon as a fresh client `sync` is recorded, letting the
    /// output task resume message-pumping immediately instead of waiting for
    /// its next poll tick (§9 open-question resolution).
    pub async fn wait_for_fresh_sync(&self) {
        self.fresh_sync.notified().await;
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as i64
}

/// Runs the steady-state connection loop for an already-handshaken socket
/// (§4.8). Returns once both tasks have exited; the caller is responsible for
/// nothing further — teardown (backend free, socket close, pool drain)
/// happens inside this function.
pub async fn run_connection<R>(
    reader: SocketReader<R>,
    writer: SocketWriter<DynAsyncWrite>,
    backend: Box<dyn Backend>,
    connection_id: String,
    config: &GuacdConfig,
) -> GuacResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = Arc::new(ConnectionState::new());
    let writer = Arc::new(Mutex::new(writer));
    let backend = Arc::new(Mutex::new(backend));
    let layers = Arc::new(Mutex::new(LayerPool::new()));
    let _ = layers.lock().await.default_layer();

    let span = tracing::info_span!("connection", connection_id = %connection_id);
    let _enter = span.enter();
    info!("entering steady-state connection loop");

    let input_task = tokio::spawn(input_loop(
        reader,
        writer.clone(),
        backend.clone(),
        state.clone(),
        config.instruction_timeout,
        connection_id.clone(),
    ));

    let output_task = tokio::spawn(output_loop(
        writer.clone(),
        backend.clone(),
        state.clone(),
        config.keepalive_interval,
        config.sync_staleness_threshold,
    ));

    let (input_result, output_result) = tokio::join!(input_task, output_task);

    state.stop();
    backend.lock().await.free();
    let _ = writer.lock().await.close().await;
    layers.lock().await.drain();
    info!("connection torn down");

    let input_result =
        input_result.map_err(|e| GuacError::new(Status::InternalError, format!("input task panicked: {e}")))?;
    let output_result =
        output_result.map_err(|e| GuacError::new(Status::InternalError, format!("output task panicked: {e}")))?;

    input_result?;
    output_result?;
    Ok(())
}

async fn input_loop<R>(
    mut reader: SocketReader<R>,
    writer: Arc<Mutex<SocketWriter<DynAsyncWrite>>>,
    backend: Arc<Mutex<Box<dyn Backend>>>,
    state: Arc<ConnectionState>,
    timeout: Duration,
    connection_id: String,
) -> GuacResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !state.is_running() {
            return Ok(());
        }

        let instr = match reader.read_instruction(timeout).await {
            Ok(Some(instr)) => instr,
            Ok(None) => {
                info!(connection_id = %connection_id, "client closed connection");
                state.stop();
                return Ok(());
            }
            // A read timeout just means the client has been quiet; it is not
            // connection-fatal (Status::is_connection_fatal agrees), so loop
            // and re-check the running latch rather than tearing down.
            Err(e) if e.status == Status::Timeout => continue,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "read error, stopping connection");
                state.stop();
                notify_client_of_error(&writer, &e).await;
                return Err(e);
            }
        };

        debug!(connection_id = %connection_id, opcode = instr.opcode(), "dispatching instruction");

        let dispatch_result = {
            let mut backend_guard = backend.lock().await;
            dispatch(&instr, backend_guard.as_mut(), &state).await
        };

        if let Err(e) = dispatch_result {
            warn!(
                connection_id = %connection_id,
                opcode = instr.opcode(),
                error = %e,
                "dispatch failed, stopping connection"
            );
            state.stop();
            notify_client_of_error(&writer, &e).await;
            return Err(e);
        }
    }
}

async fn output_loop(
    writer: Arc<Mutex<SocketWriter<DynAsyncWrite>>>,
    backend: Arc<Mutex<Box<dyn Backend>>>,
    state: Arc<ConnectionState>,
    keepalive_interval: Duration,
    sync_staleness_threshold: Duration,
) -> GuacResult<()> {
    let mut pump_ticker = tokio::time::interval(PUMP_INTERVAL);
    let mut keepalive_ticker = tokio::time::interval(keepalive_interval);
    pump_ticker.tick().await;
    keepalive_ticker.tick().await;

    loop {
        if !state.is_running() {
            return Ok(());
        }

        if state.is_client_stale(sync_staleness_threshold) {
            tokio::select! {
                _ = state.wait_for_fresh_sync() => {}
                _ = keepalive_ticker.tick() => {
                    send_sync(&writer, &state).await?;
                }
            }
            continue;
        }

        tokio::select! {
            _ = pump_ticker.tick() => {
                let drew = {
                    let mut backend_guard = backend.lock().await;
                    let mut writer_guard = writer.lock().await;
                    let mut surface = DrawingSurface::new(&mut writer_guard);
                    backend_guard.handle_messages(&mut surface).await
                };

                match drew {
                    Ok(true) => {
                        tokio::time::sleep(PUMP_INTERVAL).await;
                        send_sync(&writer, &state).await?;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "backend message pump failed, stopping connection");
                        state.stop();
                        notify_client_of_error(&writer, &e).await;
                        return Err(e);
                    }
                }
            }
            _ = keepalive_ticker.tick() => {
                send_sync(&writer, &state).await?;
            }
        }
    }
}

async fn send_sync(
    writer: &Arc<Mutex<SocketWriter<DynAsyncWrite>>>,
    state: &ConnectionState,
) -> GuacResult<()> {
    let ts = now_ms();
    {
        let mut guard = writer.lock().await;
        let mut surface = DrawingSurface::new(&mut guard);
        surface.send_sync(ts).await?;
        guard.flush().await?;
    }
    state.record_sent(ts);
    Ok(())
}

async fn notify_client_of_error(writer: &Arc<Mutex<SocketWriter<DynAsyncWrite>>>, err: &GuacError) {
    if !err.status.should_notify_client() {
        return;
    }
    let mut guard = writer.lock().await;
    let mut surface = DrawingSurface::new(&mut guard);
    let _ = surface.send_error(&err.message, err.status.code()).await;
    let _ = guard.flush().await;
}
