// ABOUTME: Fixed table of out-of-band blob channels used to transport clipboard/file/audio data
// ABOUTME: Streams are identified by table index and closed explicitly by either peer

/// Number of stream slots a connection can have open simultaneously.
pub const STREAM_TABLE_SIZE: usize = 64;

/// A pluggable per-stream consumer (§3 "a pluggable blob/end handler per
/// stream"). A backend opening an inbound transfer (clipboard push, file
/// upload, audio capture) hands the table a sink; the core calls it as
/// `blob`/`end` instructions arrive and never inspects the payload itself.
pub trait StreamSink: Send {
    fn on_blob(&mut self, data: &[u8]);
    fn on_end(&mut self);
}

/// One slot in a connection's stream table (§3 Stream).
#[derive(Default)]
struct StreamSlot {
    open: bool,
    sink: Option<Box<dyn StreamSink>>,
}

/// Fixed-size table minting and tracking stream indices for a connection,
/// and routing `blob`/`end` instructions to whatever sink was registered
/// when the stream was opened.
pub struct StreamTable {
    slots: Vec<StreamSlot>,
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable {
            slots: (0..STREAM_TABLE_SIZE).map(|_| StreamSlot::default()).collect(),
        }
    }

    /// Allocates the lowest-numbered free stream index with no sink attached
    /// — the core will track it as open but silently discard any `blob`
    /// data that arrives against it.
    pub fn alloc(&mut self) -> Option<usize> {
        self.alloc_with_sink(None)
    }

    /// Allocates the lowest-numbered free stream index, attaching `sink` so
    /// `dispatch_blob`/`dispatch_end` deliver the stream's payload to it.
    pub fn alloc_with_sink(&mut self, sink: Option<Box<dyn StreamSink>>) -> Option<usize> {
        let index = self.slots.iter().position(|slot| !slot.open)?;
        self.slots[index] = StreamSlot { open: true, sink };
        Some(index)
    }

    /// Marks `index` as closed, freeing it for reuse and dropping any sink.
    pub fn close(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = StreamSlot::default();
        }
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.open)
    }

    /// Routes a `blob` instruction's payload to `index`'s sink, if the
    /// stream is open and has one. Returns whether the stream was open, so
    /// callers can decide whether an unknown index deserves a log line.
    pub fn dispatch_blob(&mut self, index: usize, data: &[u8]) -> bool {
        let Some(slot) = self.slots.get_mut(index).filter(|slot| slot.open) else {
            return false;
        };
        if let Some(sink) = slot.sink.as_mut() {
            sink.on_blob(data);
        }
        true
    }

    /// Notifies `index`'s sink (if any) that the stream is closing, then
    /// frees the slot. Returns whether the stream was open.
    pub fn dispatch_end(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index).filter(|slot| slot.open) else {
            return false;
        };
        if let Some(sink) = slot.sink.as_mut() {
            sink.on_end();
        }
        self.close(index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn allocates_lowest_free_index() {
        let mut table = StreamTable::new();
        assert_eq!(table.alloc(), Some(0));
        assert_eq!(table.alloc(), Some(1));
        table.close(0);
        assert_eq!(table.alloc(), Some(0));
    }

    #[test]
    fn table_exhausts_after_all_slots_taken() {
        let mut table = StreamTable::new();
        for _ in 0..STREAM_TABLE_SIZE {
            assert!(table.alloc().is_some());
        }
        assert_eq!(table.alloc(), None);
    }

    #[test]
    fn closed_stream_is_not_open() {
        let mut table = StreamTable::new();
        let idx = table.alloc().unwrap();
        assert!(table.is_open(idx));
        table.close(idx);
        assert!(!table.is_open(idx));
    }

    #[derive(Default, Clone)]
    struct RecordingSink {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
        ended: Arc<Mutex<bool>>,
    }

    impl StreamSink for RecordingSink {
        fn on_blob(&mut self, data: &[u8]) {
            self.chunks.lock().unwrap().push(data.to_vec());
        }

        fn on_end(&mut self) {
            *self.ended.lock().unwrap() = true;
        }
    }

    #[test]
    fn dispatch_blob_and_end_reach_the_registered_sink() {
        let mut table = StreamTable::new();
        let sink = RecordingSink::default();
        let idx = table
            .alloc_with_sink(Some(Box::new(sink.clone())))
            .unwrap();

        assert!(table.dispatch_blob(idx, b"hello"));
        assert!(table.dispatch_blob(idx, b" world"));
        assert!(table.dispatch_end(idx));

        assert_eq!(
            *sink.chunks.lock().unwrap(),
            vec![b"hello".to_vec(), b" world".to_vec()]
        );
        assert!(*sink.ended.lock().unwrap());
        assert!(!table.is_open(idx));
    }

    #[test]
    fn dispatch_against_unopened_index_is_a_no_op() {
        let mut table = StreamTable::new();
        assert!(!table.dispatch_blob(5, b"data"));
        assert!(!table.dispatch_end(5));
    }
}
