//! # llama-kv
//!
//! Cell-based KV cache for llama.rs.
//!
//! Supports:
//! - **Cells**: Each cell holds one token's K/V rows for every layer, a position,
//!   and the set of sequences that share it (shared prefixes alias, never copy)
//! - **Sequence ops**: remove, copy, keep, shift (`seq_add`), divide (`seq_div`)
//!   over half-open position ranges
//! - **Lazy updates**: position shifts and defragmentation are queued and only
//!   applied by [`KVCache::update`], so stored keys are re-encoded once
//! - **Slot search**: [`KVCache::find_slot`] places a micro-batch into a run of
//!   free cells or reports `SlotExhausted`
//! - **State payload**: cell metadata and raw rows for session snapshots

mod state;

pub use state::KVState;

use std::collections::BTreeSet;
use std::fmt;

use llama_engine::{LlamaError, Pos, SeqId};

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("no free slot for {n_tokens} tokens in a cache of {n_cells} cells")]
    SlotExhausted { n_tokens: usize, n_cells: usize },

    #[error("partial removal of sequence {seq_id} is not supported by this cache")]
    PartialRemoveUnsupported { seq_id: SeqId },

    #[error("cache has pending position shifts but keys cannot be re-encoded")]
    ShiftUnsupported,

    #[error("KV cache capacity exceeded: {requested} > {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("sequence id {seq_id} outside 0..{n_seq_max}")]
    InvalidSeq { seq_id: SeqId, n_seq_max: usize },

    #[error("position divisor must be >= 1, got {0}")]
    InvalidDivisor(i32),

    #[error("malformed cache state: {0}")]
    Malformed(String),
}

pub type KVResult<T> = Result<T, KVError>;

impl From<KVError> for LlamaError {
    fn from(err: KVError) -> Self {
        match err {
            KVError::SlotExhausted { n_tokens, n_cells } => {
                LlamaError::SlotExhausted { n_tokens, n_cells }
            }
            KVError::PartialRemoveUnsupported { seq_id } => {
                LlamaError::PartialRemoveUnsupported { seq_id }
            }
            KVError::CapacityExceeded {
                requested,
                capacity,
            } => LlamaError::CapacityExceeded {
                requested,
                capacity,
            },
            KVError::ShiftUnsupported => LlamaError::ComputeError(err.to_string()),
            KVError::InvalidSeq { .. } => LlamaError::InvalidBatch(err.to_string()),
            KVError::InvalidDivisor(_) => LlamaError::InvalidArgument(err.to_string()),
            KVError::ShapeMismatch { .. } | KVError::Malformed(_) => {
                LlamaError::MalformedState(err.to_string())
            }
        }
    }
}

/// What the cache topology can do.
///
/// Attention caches support everything. Recurrent/state-space layouts keep one
/// state per sequence, so they can only drop a sequence as a whole and have no
/// positional encoding to shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KVCapabilities {
    /// `seq_remove` may cut a sequence at an arbitrary position.
    pub partial_remove: bool,
    /// Stored keys can be re-encoded after `seq_add`/`seq_div`.
    pub shift: bool,
}

impl KVCapabilities {
    pub const ATTENTION: Self = Self {
        partial_remove: true,
        shift: true,
    };

    pub const RECURRENT: Self = Self {
        partial_remove: false,
        shift: false,
    };
}

impl Default for KVCapabilities {
    fn default() -> Self {
        Self::ATTENTION
    }
}

/// Geometry of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KVCacheConfig {
    /// Number of cells (the context size).
    pub n_cells: usize,
    pub n_layer: usize,
    /// Width of one key row (`n_kv_heads * head_dim`).
    pub n_embd_k: usize,
    /// Width of one value row.
    pub n_embd_v: usize,
    /// Sequence ids must be in `0..n_seq_max`.
    pub n_seq_max: usize,
    pub capabilities: KVCapabilities,
}

/// Work queued by `seq_add`/`seq_div`/`defrag` until the next update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// Re-encode keys of cells whose `delta` is non-zero.
    Shift,
    /// Compact occupied cells to the front of the cache.
    Defrag,
}

/// Re-encodes stored keys after a position shift (e.g. RoPE rotation by `delta`).
pub trait KeyShifter {
    fn shift_key(&self, layer: usize, k_row: &mut [f32], delta: Pos);
}

/// One cache cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCell {
    pos: Pos,
    /// Accumulated shift not yet applied to the stored key.
    delta: Pos,
    seq_id: BTreeSet<SeqId>,
}

impl KVCell {
    fn empty() -> Self {
        Self {
            pos: -1,
            delta: 0,
            seq_id: BTreeSet::new(),
        }
    }

    /// Position, or `None` for a free cell.
    pub fn pos(&self) -> Option<Pos> {
        (self.pos >= 0).then_some(self.pos)
    }

    pub fn delta(&self) -> Pos {
        self.delta
    }

    pub fn is_empty(&self) -> bool {
        self.pos < 0
    }

    pub fn has_seq(&self, seq_id: SeqId) -> bool {
        self.seq_id.contains(&seq_id)
    }

    pub fn seq_ids(&self) -> impl Iterator<Item = SeqId> + '_ {
        self.seq_id.iter().copied()
    }

    /// Occupied and owned by `seq_id` (negative matches any sequence).
    fn matches(&self, seq_id: SeqId) -> bool {
        self.pos >= 0 && (seq_id < 0 || self.seq_id.contains(&seq_id))
    }

    fn release(&mut self) {
        *self = Self::empty();
    }
}

/// One transformer layer's K and V rows, addressed by cell index.
///
/// # Invariants
/// - `k.len() == n_cells * n_embd_k` and `v.len() == n_cells * n_embd_v`
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// K rows, flattened `[n_cells, n_embd_k]`
    pub k: Vec<f32>,
    /// V rows, flattened `[n_cells, n_embd_v]`
    pub v: Vec<f32>,
    n_embd_k: usize,
    n_embd_v: usize,
}

impl LayerKVCache {
    pub fn new(n_cells: usize, n_embd_k: usize, n_embd_v: usize) -> Self {
        Self {
            k: vec![0.0; n_cells * n_embd_k],
            v: vec![0.0; n_cells * n_embd_v],
            n_embd_k,
            n_embd_v,
        }
    }

    pub fn k_row(&self, cell: usize) -> &[f32] {
        &self.k[cell * self.n_embd_k..(cell + 1) * self.n_embd_k]
    }

    pub fn v_row(&self, cell: usize) -> &[f32] {
        &self.v[cell * self.n_embd_v..(cell + 1) * self.n_embd_v]
    }

    pub fn k_row_mut(&mut self, cell: usize) -> &mut [f32] {
        &mut self.k[cell * self.n_embd_k..(cell + 1) * self.n_embd_k]
    }

    /// Write K and V for one cell.
    ///
    /// # Errors
    /// - `ShapeMismatch`: If a row width doesn't match the layer
    pub fn write(&mut self, cell: usize, k_row: &[f32], v_row: &[f32]) -> KVResult<()> {
        if k_row.len() != self.n_embd_k {
            return Err(KVError::ShapeMismatch {
                expected: self.n_embd_k,
                got: k_row.len(),
            });
        }
        if v_row.len() != self.n_embd_v {
            return Err(KVError::ShapeMismatch {
                expected: self.n_embd_v,
                got: v_row.len(),
            });
        }
        self.k[cell * self.n_embd_k..(cell + 1) * self.n_embd_k].copy_from_slice(k_row);
        self.v[cell * self.n_embd_v..(cell + 1) * self.n_embd_v].copy_from_slice(v_row);
        Ok(())
    }

    fn copy_row(&mut self, src: usize, dst: usize) {
        let (ek, ev) = (self.n_embd_k, self.n_embd_v);
        self.k.copy_within(src * ek..(src + 1) * ek, dst * ek);
        self.v.copy_within(src * ev..(src + 1) * ev, dst * ev);
    }

    fn zero(&mut self) {
        self.k.fill(0.0);
        self.v.fill(0.0);
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        (self.k.len() + self.v.len()) * std::mem::size_of::<f32>()
    }
}

/// Metadata snapshot used to roll back a failed multi-step mutation.
///
/// Only cell metadata is captured. Rolling back is sound as long as the rows of
/// cells occupied at checkpoint time were not rewritten in between, which holds
/// for slot placement: [`KVCache::find_slot`] only claims free cells.
#[derive(Debug, Clone)]
pub struct KVCheckpoint {
    cells: Vec<KVCell>,
    head: usize,
    used: usize,
    pending: Vec<PendingOp>,
}

/// Debug view of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheView {
    pub n_cells: usize,
    /// Sum over cells of the number of sequences in each cell.
    pub token_count: usize,
    pub used_cells: usize,
    /// Longest run of free cells.
    pub max_contiguous: usize,
    /// Start of that run; `None` when the cache is full.
    pub max_contiguous_idx: Option<usize>,
    pub cells: Vec<KVCellView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCellView {
    pub pos: Option<Pos>,
    pub seq_ids: Vec<SeqId>,
}

/// Per-context KV cache.
///
/// Single writer: every mutation happens synchronously inside these calls or
/// inside a decode that owns `&mut self`.
#[derive(Debug, Clone)]
pub struct KVCache {
    config: KVCacheConfig,
    cells: Vec<KVCell>,
    layers: Vec<LayerKVCache>,
    /// Where the next slot search starts.
    head: usize,
    /// Number of occupied cells.
    used: usize,
    pending: Vec<PendingOp>,
}

/// `p0 < 0` means "from 0", `p1 < 0` means "to infinity".
fn normalize_range(p0: Pos, p1: Pos) -> (Pos, Pos) {
    (p0.max(0), if p1 < 0 { Pos::MAX } else { p1 })
}

impl KVCache {
    /// Create an empty cache.
    ///
    /// # Panics
    /// If `n_cells`, `n_layer` or `n_seq_max` is zero.
    pub fn new(config: KVCacheConfig) -> Self {
        assert!(config.n_cells > 0, "KVCache requires n_cells > 0");
        assert!(config.n_layer > 0, "KVCache requires n_layer > 0");
        assert!(config.n_seq_max > 0, "KVCache requires n_seq_max > 0");

        let layers = (0..config.n_layer)
            .map(|_| LayerKVCache::new(config.n_cells, config.n_embd_k, config.n_embd_v))
            .collect();

        Self {
            config,
            cells: vec![KVCell::empty(); config.n_cells],
            layers,
            head: 0,
            used: 0,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &KVCacheConfig {
        &self.config
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn used_cells(&self) -> usize {
        self.used
    }

    /// Tokens in the cache; a cell shared by k sequences counts k times.
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|c| c.seq_id.len()).sum()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn cells(&self) -> &[KVCell] {
        &self.cells
    }

    pub fn cell(&self, i: usize) -> Option<&KVCell> {
        self.cells.get(i)
    }

    pub fn layer(&self, il: usize) -> Option<&LayerKVCache> {
        self.layers.get(il)
    }

    pub fn n_layer(&self) -> usize {
        self.layers.len()
    }

    /// Number of cells up to and including the last occupied one.
    ///
    /// Attention only needs to scan `0..n_active()`.
    pub fn n_active(&self) -> usize {
        self.cells
            .iter()
            .rposition(|c| !c.is_empty())
            .map_or(0, |i| i + 1)
    }

    /// Share of free cells inside the active window.
    pub fn fragmentation(&self) -> f32 {
        let n_kv = self.n_active();
        if n_kv == 0 {
            return 0.0;
        }
        1.0 - self.used as f32 / n_kv as f32
    }

    /// Whether cell `cell` is visible to a token of `seq_id` at `pos` (causal mask).
    pub fn attends(&self, cell: usize, seq_id: SeqId, pos: Pos) -> bool {
        self.cells
            .get(cell)
            .is_some_and(|c| c.has_seq(seq_id) && c.pos <= pos)
    }

    /// Write K/V rows of `cell` for layer `il`.
    pub fn write_kv(&mut self, il: usize, cell: usize, k_row: &[f32], v_row: &[f32]) -> KVResult<()> {
        let n_layer = self.layers.len();
        let layer = self.layers.get_mut(il).ok_or(KVError::ShapeMismatch {
            expected: n_layer,
            got: il,
        })?;
        layer.write(cell, k_row, v_row)
    }

    /// Drop all cells and zero the underlying storage.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.release();
        }
        for layer in &mut self.layers {
            layer.zero();
        }
        self.head = 0;
        self.used = 0;
        self.pending.clear();
    }

    /// Detach `seq_id` from cells with positions in `[p0, p1)`.
    ///
    /// # Errors
    /// - `PartialRemoveUnsupported`: The topology cannot cut this sequence at the
    ///   requested range. Nothing is modified. Removing a whole sequence never fails.
    pub fn seq_remove(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> KVResult<()> {
        let (p0, p1) = normalize_range(p0, p1);

        if !self.config.capabilities.partial_remove {
            let partial = self
                .cells
                .iter()
                .any(|c| c.matches(seq_id) && !(p0..p1).contains(&c.pos));
            let touched = self
                .cells
                .iter()
                .any(|c| c.matches(seq_id) && (p0..p1).contains(&c.pos));
            if partial && touched {
                return Err(KVError::PartialRemoveUnsupported { seq_id });
            }
        }

        let mut new_head = None;
        for (i, cell) in self.cells.iter_mut().enumerate() {
            if !cell.matches(seq_id) || !(p0..p1).contains(&cell.pos) {
                continue;
            }
            if seq_id < 0 {
                cell.seq_id.clear();
            } else {
                cell.seq_id.remove(&seq_id);
            }
            if cell.seq_id.is_empty() {
                cell.release();
                self.used -= 1;
                new_head.get_or_insert(i);
            }
        }

        // Start the next search at the first freed cell.
        if let Some(h) = new_head {
            if h < self.head {
                self.head = h;
            }
        }
        Ok(())
    }

    /// Tag cells of `src` in `[p0, p1)` as also belonging to `dst`.
    ///
    /// Storage is aliased, not duplicated.
    pub fn seq_copy(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) -> KVResult<()> {
        self.check_seq(dst)?;
        if src == dst {
            return Ok(());
        }
        let (p0, p1) = normalize_range(p0, p1);
        for cell in &mut self.cells {
            if cell.pos >= 0 && cell.has_seq(src) && (p0..p1).contains(&cell.pos) {
                cell.seq_id.insert(dst);
            }
        }
        Ok(())
    }

    /// Detach every other sequence from every cell.
    pub fn seq_keep(&mut self, seq_id: SeqId) {
        let mut new_head = None;
        for (i, cell) in self.cells.iter_mut().enumerate() {
            if cell.is_empty() {
                continue;
            }
            if cell.has_seq(seq_id) {
                cell.seq_id.retain(|&s| s == seq_id);
            } else {
                cell.release();
                self.used -= 1;
                new_head.get_or_insert(i);
            }
        }
        if let Some(h) = new_head {
            if h < self.head {
                self.head = h;
            }
        }
    }

    /// Add `delta` to positions of matching cells in `[p0, p1)`.
    ///
    /// Metadata moves now; keys are re-encoded at the next [`KVCache::update`].
    /// Cells pushed below position 0 are freed. `delta == 0` is a no-op.
    pub fn seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        if delta == 0 {
            return;
        }
        let (p0, p1) = normalize_range(p0, p1);

        let mut shifted = false;
        let mut new_head = None;
        for (i, cell) in self.cells.iter_mut().enumerate() {
            if !cell.matches(seq_id) || !(p0..p1).contains(&cell.pos) {
                continue;
            }
            shifted = true;
            cell.pos += delta;
            cell.delta += delta;
            if cell.pos < 0 {
                cell.release();
                self.used -= 1;
                new_head.get_or_insert(i);
            }
        }

        if shifted {
            self.request(PendingOp::Shift);
        }
        // Freed slots are the best place to search next; otherwise start over.
        self.head = new_head.unwrap_or(0);
    }

    /// Integer-divide positions of matching cells in `[p0, p1)` by `d`.
    ///
    /// Same lazy contract as [`KVCache::seq_add`]. `d == 1` is a no-op.
    pub fn seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) -> KVResult<()> {
        if d < 1 {
            return Err(KVError::InvalidDivisor(d));
        }
        if d == 1 {
            return Ok(());
        }
        let (p0, p1) = normalize_range(p0, p1);

        let mut shifted = false;
        for cell in &mut self.cells {
            if !cell.matches(seq_id) || !(p0..p1).contains(&cell.pos) {
                continue;
            }
            let old = cell.pos;
            cell.pos /= d;
            cell.delta += cell.pos - old;
            shifted |= cell.pos != old;
        }
        if shifted {
            self.request(PendingOp::Shift);
        }
        Ok(())
    }

    /// Largest position held by `seq_id`, or `None` if it owns no cells.
    pub fn seq_pos_max(&self, seq_id: SeqId) -> Option<Pos> {
        self.cells
            .iter()
            .filter(|c| c.matches(seq_id))
            .map(|c| c.pos)
            .max()
    }

    /// Smallest position held by `seq_id`, or `None` if it owns no cells.
    pub fn seq_pos_min(&self, seq_id: SeqId) -> Option<Pos> {
        self.cells
            .iter()
            .filter(|c| c.matches(seq_id))
            .map(|c| c.pos)
            .min()
    }

    /// Queue compaction of holes; applied at the next [`KVCache::update`].
    pub fn defrag(&mut self) {
        self.request(PendingOp::Defrag);
    }

    fn request(&mut self, op: PendingOp) {
        if !self.pending.contains(&op) {
            self.pending.push(op);
        }
    }

    pub fn pending(&self) -> &[PendingOp] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply queued shifts and defragmentation.
    ///
    /// Returns whether anything was applied.
    ///
    /// # Errors
    /// - `ShiftUnsupported`: Shifts are pending on a cache that cannot re-encode
    ///   keys. The queue is left intact.
    pub fn update(&mut self, shifter: &dyn KeyShifter) -> KVResult<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }

        if self.pending.contains(&PendingOp::Shift) {
            if !self.config.capabilities.shift {
                return Err(KVError::ShiftUnsupported);
            }
            let mut n_shifted = 0;
            for (i, cell) in self.cells.iter_mut().enumerate() {
                if cell.delta != 0 && cell.pos >= 0 {
                    for (il, layer) in self.layers.iter_mut().enumerate() {
                        shifter.shift_key(il, layer.k_row_mut(i), cell.delta);
                    }
                    n_shifted += 1;
                }
                cell.delta = 0;
            }
            tracing::debug!(n_shifted, "applied K-shift");
        }

        if self.pending.contains(&PendingOp::Defrag) {
            self.defrag_now();
        }

        self.pending.clear();
        Ok(true)
    }

    /// Move occupied cells from the tail of the active window into holes.
    fn defrag_now(&mut self) {
        let mut lo = 0;
        let mut hi = self.n_active();
        let mut moves = 0;

        loop {
            while lo < hi && !self.cells[lo].is_empty() {
                lo += 1;
            }
            while hi > lo && self.cells[hi - 1].is_empty() {
                hi -= 1;
            }
            if lo >= hi {
                break;
            }
            let src = hi - 1;
            self.cells.swap(lo, src);
            for layer in &mut self.layers {
                layer.copy_row(src, lo);
            }
            moves += 1;
        }

        self.head = if self.used >= self.cells.len() {
            0
        } else {
            self.used
        };
        tracing::debug!(moves, used = self.used, "defragmented KV cache");
    }

    fn check_seq(&self, seq_id: SeqId) -> KVResult<()> {
        if seq_id < 0 || seq_id as usize >= self.config.n_seq_max {
            return Err(KVError::InvalidSeq {
                seq_id,
                n_seq_max: self.config.n_seq_max,
            });
        }
        Ok(())
    }

    /// Claim a contiguous run of free cells for a micro-batch.
    ///
    /// `entries` holds `(pos, seq_ids)` per token. On success the cells are
    /// tagged, `head` moves past the run, and the first cell index is returned.
    ///
    /// # Errors
    /// - `SlotExhausted`: No free run is long enough; nothing is modified
    /// - `InvalidSeq`: A sequence id is outside `0..n_seq_max`
    pub fn find_slot(&mut self, entries: &[(Pos, &[SeqId])]) -> KVResult<usize> {
        let n_tokens = entries.len();
        let size = self.cells.len();

        for (_, seq_ids) in entries {
            for &s in *seq_ids {
                self.check_seq(s)?;
            }
        }
        if n_tokens == 0 {
            return Ok(self.head);
        }
        if n_tokens > size {
            return Err(KVError::SlotExhausted {
                n_tokens,
                n_cells: size,
            });
        }

        // Restart from the front when a lot of space was freed behind head.
        if self.head > self.used + 2 * n_tokens {
            self.head = 0;
        }

        let mut head = self.head;
        let mut n_tested = 0;
        loop {
            if n_tested >= size {
                return Err(KVError::SlotExhausted {
                    n_tokens,
                    n_cells: size,
                });
            }
            if head + n_tokens > size {
                n_tested += size - head;
                head = 0;
                continue;
            }
            match self.cells[head..head + n_tokens]
                .iter()
                .position(|c| !c.is_empty())
            {
                None => break,
                Some(i) => {
                    head += i + 1;
                    n_tested += i + 1;
                }
            }
        }

        for (i, (pos, seq_ids)) in entries.iter().enumerate() {
            let cell = &mut self.cells[head + i];
            cell.pos = *pos;
            cell.delta = 0;
            cell.seq_id.extend(seq_ids.iter().copied());
        }
        self.used += n_tokens;
        self.head = if head + n_tokens >= size {
            0
        } else {
            head + n_tokens
        };

        tracing::debug!(slot = head, n_tokens, used = self.used, "placed micro-batch");
        Ok(head)
    }

    pub fn checkpoint(&self) -> KVCheckpoint {
        KVCheckpoint {
            cells: self.cells.clone(),
            head: self.head,
            used: self.used,
            pending: self.pending.clone(),
        }
    }

    pub fn rollback(&mut self, checkpoint: KVCheckpoint) {
        self.cells = checkpoint.cells;
        self.head = checkpoint.head;
        self.used = checkpoint.used;
        self.pending = checkpoint.pending;
    }

    pub fn view(&self) -> KVCacheView {
        let mut max_contiguous = 0;
        let mut max_contiguous_idx = None;
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, cell) in self.cells.iter().enumerate() {
            if cell.is_empty() {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len > max_contiguous {
                    max_contiguous = run_len;
                    max_contiguous_idx = Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }

        KVCacheView {
            n_cells: self.cells.len(),
            token_count: self.token_count(),
            used_cells: self.used,
            max_contiguous,
            max_contiguous_idx,
            cells: self
                .cells
                .iter()
                .map(|c| KVCellView {
                    pos: c.pos(),
                    seq_ids: c.seq_ids().collect(),
                })
                .collect(),
        }
    }

    /// Total memory across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }
}

impl fmt::Display for KVCacheView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[cells:{}, used:{}, tokens:{}, max_free_run:{}]",
            self.n_cells, self.used_cells, self.token_count, self.max_contiguous
        )
    }
}
