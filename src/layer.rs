// ABOUTME: Arena-backed layer/buffer pool minting and recycling drawing-surface indices
// ABOUTME: Amortizes allocation to O(1) while keeping the client-visible buffer index space compact

/// An addressable drawing surface (§3 Layer). The core tracks only its
/// existence and index; pixel state lives entirely on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    index: i32,
}

impl Layer {
    /// The default layer (index 0), always valid without going through a pool.
    pub const fn root() -> Layer {
        Layer { index: 0 }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn is_default(&self) -> bool {
        self.index == 0
    }

    pub fn is_buffer(&self) -> bool {
        self.index < 0
    }
}

/// Opaque handle into the pool's arena. Stable for the lifetime of the slot,
/// even across free/reuse cycles (§9: "a rewrite should use an arena indexed
/// by layer id with separate free-list queues, avoiding the three-pointer
/// node" used by the legacy intrusive linked list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotId(usize);

/// Per-connection layer/buffer pool (§4.6).
///
/// `all_layers` is the arena of every layer ever allocated on this
/// connection; `available_layers` and `available_buffers` are free-lists of
/// slot ids pointing back into it.
#[derive(Debug, Default)]
pub struct LayerPool {
    all_layers: Vec<Layer>,
    available_layers: Vec<SlotId>,
    available_buffers: Vec<SlotId>,
    next_buffer_index: i32,
}

impl LayerPool {
    pub fn new() -> Self {
        LayerPool {
            all_layers: Vec::new(),
            available_layers: Vec::new(),
            available_buffers: Vec::new(),
            next_buffer_index: -1,
        }
    }

    /// Allocates a buffer (an anonymous layer with a negative index). Reuses
    /// a free buffer slot if one exists; otherwise mints a fresh, strictly
    /// decreasing index starting at -1 (§4.6 Buffer allocation).
    pub fn alloc_buffer(&mut self) -> Layer {
        if let Some(slot) = self.available_buffers.pop() {
            return self.all_layers[slot.0];
        }

        let index = self.next_buffer_index;
        self.next_buffer_index -= 1;
        let layer = Layer { index };
        self.all_layers.push(layer);
        layer
    }

    /// Returns `layer` to the buffer free-list. The index is preserved and
    /// will be re-exposed verbatim on the next allocation (§4.6 Buffer
    /// release) — safe because the client treats the index as opaque.
    pub fn release_buffer(&mut self, layer: Layer) {
        debug_assert!(layer.is_buffer(), "released layer is not a buffer");
        if let Some(slot) = self.find_slot(layer) {
            self.available_buffers.push(slot);
        }
    }

    /// Allocates a named layer at the caller-supplied positive `index`. Reuses
    /// a free named-layer slot (overwriting its index) if one exists;
    /// otherwise mints a fresh slot (§4.6 Named-layer allocation).
    pub fn alloc_named_layer(&mut self, index: i32) -> Layer {
        debug_assert!(index > 0, "named layers must have a positive index");

        if let Some(slot) = self.available_layers.pop() {
            self.all_layers[slot.0].index = index;
            return self.all_layers[slot.0];
        }

        let layer = Layer { index };
        self.all_layers.push(layer);
        layer
    }

    /// Returns `layer` to the named-layer free-list (§4.6).
    pub fn release_named_layer(&mut self, layer: Layer) {
        debug_assert!(layer.index() > 0, "released layer is not a named layer");
        if let Some(slot) = self.find_slot(layer) {
            self.available_layers.push(slot);
        }
    }

    /// The default layer (index 0): always valid, never allocated or freed.
    pub fn default_layer(&self) -> Layer {
        Layer::root()
    }

    /// All layers currently live on this connection (allocated and not
    /// present in either free-list) — used by tests to check the index
    /// uniqueness invariant (§8 property 4).
    pub fn live_layers(&self) -> Vec<Layer> {
        let free: std::collections::HashSet<i32> = self
            .available_layers
            .iter()
            .chain(self.available_buffers.iter())
            .map(|slot| self.all_layers[slot.0].index)
            .collect();
        self.all_layers
            .iter()
            .copied()
            .filter(|layer| !free.contains(&layer.index))
            .collect()
    }

    /// Releases every allocated layer at connection teardown (§3 Lifecycles,
    /// §4.6 Teardown). The free-lists don't own storage independently of
    /// `all_layers`, so this simply drops the arena.
    pub fn drain(&mut self) {
        self.all_layers.clear();
        self.available_layers.clear();
        self.available_buffers.clear();
        self.next_buffer_index = -1;
    }

    fn find_slot(&self, layer: Layer) -> Option<SlotId> {
        self.all_layers
            .iter()
            .position(|candidate| candidate.index == layer.index)
            .map(SlotId)
    }
}
