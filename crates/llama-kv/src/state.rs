//! Binary payload of the cache for session snapshots.
//!
//! Layout (little-endian):
//!
//! ```text
//! u32 cell_count
//! cell_count x { i32 pos, i32 delta, u32 n_seq, n_seq x i32 seq_id }   // n_seq is 0 in sequence payloads
//! u32 n_layer, u32 n_embd_k, u32 n_embd_v
//! n_layer x { cell_count K rows, cell_count V rows }
//! ```
//!
//! Cells are written in index order, so a restored cache keeps its layout.
//! `delta` is the shift not yet applied to the stored key; a restored cell
//! with a non-zero `delta` queues a K-shift exactly like `seq_add` did.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use llama_engine::{Pos, SeqId};

use crate::{KVCache, KVCacheConfig, KVError, KVResult, PendingOp};

/// Cache contents parsed from a payload but not yet applied.
///
/// Reading fully validates geometry against the target cache, so applying a
/// `KVState` can only fail for lack of room.
#[derive(Debug, Clone, PartialEq)]
pub struct KVState {
    /// `(pos, delta, seq_ids)` per cell.
    cells: Vec<(Pos, Pos, Vec<SeqId>)>,
    /// Per layer, `cells.len()` K rows.
    k: Vec<Vec<f32>>,
    /// Per layer, `cells.len()` V rows.
    v: Vec<Vec<f32>>,
}

fn malformed(e: io::Error) -> KVError {
    KVError::Malformed(e.to_string())
}

impl KVState {
    /// Parse a payload for a cache with geometry `config`.
    ///
    /// `scoped` selects the per-sequence flavour, where cells carry no
    /// sequence list.
    ///
    /// # Errors
    /// - `CapacityExceeded`: More cells than the cache has
    /// - `ShapeMismatch`: Layer count or row widths differ
    /// - `Malformed`: Truncated data or out-of-range sequence ids
    pub fn read_from<R: Read>(r: &mut R, config: &KVCacheConfig, scoped: bool) -> KVResult<Self> {
        let cell_count = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        if cell_count > config.n_cells {
            return Err(KVError::CapacityExceeded {
                requested: cell_count,
                capacity: config.n_cells,
            });
        }

        let mut cells = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            let pos = r.read_i32::<LittleEndian>().map_err(malformed)?;
            let delta = r.read_i32::<LittleEndian>().map_err(malformed)?;
            let n_seq = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
            if pos < 0 {
                return Err(KVError::Malformed(format!("negative cell position {pos}")));
            }
            if scoped && n_seq != 0 {
                return Err(KVError::Malformed(
                    "sequence payload cell carries sequence ids".to_string(),
                ));
            }
            if !scoped && (n_seq == 0 || n_seq > config.n_seq_max) {
                return Err(KVError::Malformed(format!(
                    "cell has {n_seq} sequence ids (max {})",
                    config.n_seq_max
                )));
            }
            let mut seqs = Vec::with_capacity(n_seq);
            for _ in 0..n_seq {
                let s = r.read_i32::<LittleEndian>().map_err(malformed)?;
                if s < 0 || s as usize >= config.n_seq_max {
                    return Err(KVError::Malformed(format!("sequence id {s} out of range")));
                }
                seqs.push(s);
            }
            cells.push((pos, delta, seqs));
        }

        let n_layer = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        let n_embd_k = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        let n_embd_v = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        for (expected, got) in [
            (config.n_layer, n_layer),
            (config.n_embd_k, n_embd_k),
            (config.n_embd_v, n_embd_v),
        ] {
            if expected != got {
                return Err(KVError::ShapeMismatch { expected, got });
            }
        }

        let mut k = Vec::with_capacity(n_layer);
        let mut v = Vec::with_capacity(n_layer);
        for _ in 0..n_layer {
            let mut kl = vec![0.0; cell_count * n_embd_k];
            r.read_f32_into::<LittleEndian>(&mut kl).map_err(malformed)?;
            let mut vl = vec![0.0; cell_count * n_embd_v];
            r.read_f32_into::<LittleEndian>(&mut vl).map_err(malformed)?;
            k.push(kl);
            v.push(vl);
        }

        Ok(Self { cells, k, v })
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Largest position in the payload.
    pub fn pos_max(&self) -> Option<Pos> {
        self.cells.iter().map(|(p, _, _)| *p).max()
    }
}

impl KVCache {
    /// Cells included in a payload: all occupied cells, or those owned by `seq_id`.
    fn state_cells(&self, seq_id: Option<SeqId>) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| match seq_id {
                Some(s) => !c.is_empty() && c.has_seq(s),
                None => !c.is_empty(),
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Exact byte size of [`KVCache::state_write`] output.
    pub fn state_size(&self, seq_id: Option<SeqId>) -> usize {
        let cells = self.state_cells(seq_id);
        let meta: usize = cells
            .iter()
            .map(|&i| match seq_id {
                Some(_) => 12,
                None => 12 + 4 * self.cells[i].seq_id.len(),
            })
            .sum();
        let row = (self.config.n_embd_k + self.config.n_embd_v) * 4;
        4 + meta + 12 + self.layers.len() * cells.len() * row
    }

    /// Serialize the whole cache (`None`) or one sequence's cells.
    pub fn state_write<W: Write>(&self, w: &mut W, seq_id: Option<SeqId>) -> io::Result<()> {
        let cells = self.state_cells(seq_id);

        w.write_u32::<LittleEndian>(cells.len() as u32)?;
        for &i in &cells {
            let cell = &self.cells[i];
            w.write_i32::<LittleEndian>(cell.pos)?;
            w.write_i32::<LittleEndian>(cell.delta)?;
            if seq_id.is_some() {
                w.write_u32::<LittleEndian>(0)?;
            } else {
                w.write_u32::<LittleEndian>(cell.seq_id.len() as u32)?;
                for &s in &cell.seq_id {
                    w.write_i32::<LittleEndian>(s)?;
                }
            }
        }

        w.write_u32::<LittleEndian>(self.layers.len() as u32)?;
        w.write_u32::<LittleEndian>(self.config.n_embd_k as u32)?;
        w.write_u32::<LittleEndian>(self.config.n_embd_v as u32)?;
        for layer in &self.layers {
            for &i in &cells {
                for &x in layer.k_row(i) {
                    w.write_f32::<LittleEndian>(x)?;
                }
            }
            for &i in &cells {
                for &x in layer.v_row(i) {
                    w.write_f32::<LittleEndian>(x)?;
                }
            }
        }
        Ok(())
    }

    /// Install a parsed payload.
    ///
    /// With `dest == None` the cache is replaced wholesale. With `Some(dest)`
    /// the cells are placed into free slots tagged with `dest` after the
    /// sequence's previous cells are dropped; other sequences are untouched.
    ///
    /// # Errors
    /// - `SlotExhausted`: No room for the sequence; the cache is unchanged
    /// - `InvalidSeq`: `dest` outside `0..n_seq_max`
    pub fn state_apply(&mut self, state: KVState, dest: Option<SeqId>) -> KVResult<()> {
        let Some(dest) = dest else {
            self.clear();
            for (i, (pos, delta, seqs)) in state.cells.iter().enumerate() {
                let cell = &mut self.cells[i];
                cell.pos = *pos;
                cell.delta = *delta;
                cell.seq_id.extend(seqs.iter().copied());
            }
            self.used = state.cells.len();
            self.write_rows(0, &state);
            self.restore_pending_shift(&state);
            tracing::debug!(cells = self.used, "restored KV cache");
            return Ok(());
        };

        self.check_seq(dest)?;
        let checkpoint = self.checkpoint();
        self.seq_remove(dest, -1, -1)?;

        let dest_ids = [dest];
        let entries: Vec<(Pos, &[SeqId])> = state
            .cells
            .iter()
            .map(|(pos, _, _)| (*pos, &dest_ids[..]))
            .collect();
        let head = match self.find_slot(&entries) {
            Ok(head) => head,
            Err(e) => {
                self.rollback(checkpoint);
                return Err(e);
            }
        };
        for (j, (_, delta, _)) in state.cells.iter().enumerate() {
            self.cells[head + j].delta = *delta;
        }
        self.write_rows(head, &state);
        self.restore_pending_shift(&state);
        tracing::debug!(seq_id = dest, cells = entries.len(), "restored sequence");
        Ok(())
    }

    fn restore_pending_shift(&mut self, state: &KVState) {
        if state.cells.iter().any(|(_, delta, _)| *delta != 0) {
            self.request(PendingOp::Shift);
        }
    }

    fn write_rows(&mut self, first_cell: usize, state: &KVState) {
        let (ek, ev) = (self.config.n_embd_k, self.config.n_embd_v);
        for (il, layer) in self.layers.iter_mut().enumerate() {
            for j in 0..state.cells.len() {
                let dst = first_cell + j;
                layer.k[dst * ek..(dst + 1) * ek].copy_from_slice(&state.k[il][j * ek..(j + 1) * ek]);
                layer.v[dst * ev..(dst + 1) * ev].copy_from_slice(&state.v[il][j * ev..(j + 1) * ev]);
            }
        }
    }
}
