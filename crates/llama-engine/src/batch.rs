//! Fixed-capacity batch descriptor for decode/encode calls.

use crate::{LlamaError, Pos, Result, SeqId, TokenId};

/// One unit of forward-evaluation work.
///
/// Parallel arrays (token or embedding, position, sequence ids, output flag)
/// always have length `n_tokens`. Capacity is fixed at creation; storage is
/// kept across [`Batch::clear`] and released when the batch is dropped.
///
/// A batch is either token-mode (`n_embd == 0`) or embedding-mode; the mode
/// cannot be mixed per slot.
#[derive(Debug, Clone)]
pub struct Batch {
    capacity: usize,
    n_embd: usize,
    n_seq_max: usize,

    token: Vec<TokenId>,
    embd: Vec<f32>,
    pos: Vec<Pos>,
    /// Number of sequence ids in each slot.
    n_seq_id: Vec<usize>,
    /// Jagged sequence ids, stride `n_seq_max`: slot `i` lives at `i * n_seq_max`.
    seq_id: Vec<SeqId>,
    output: Vec<bool>,
}

/// Borrowed view of one batch slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSlot<'a> {
    pub token: Option<TokenId>,
    pub embd: Option<&'a [f32]>,
    pub pos: Pos,
    pub seq_ids: &'a [SeqId],
    pub output: bool,
}

impl Batch {
    /// Allocate a batch that holds at most `capacity` slots.
    ///
    /// # Arguments
    /// - `capacity`: Maximum number of slots
    /// - `n_embd`: Embedding width; 0 selects token mode
    /// - `n_seq_max`: Maximum number of sequence ids per slot
    pub fn new(capacity: usize, n_embd: usize, n_seq_max: usize) -> Self {
        assert!(capacity > 0, "Batch requires capacity > 0");
        assert!(n_seq_max > 0, "Batch requires n_seq_max > 0");

        let (token, embd) = if n_embd == 0 {
            (Vec::with_capacity(capacity), Vec::new())
        } else {
            (Vec::new(), Vec::with_capacity(capacity * n_embd))
        };

        Self {
            capacity,
            n_embd,
            n_seq_max,
            token,
            embd,
            pos: Vec::with_capacity(capacity),
            n_seq_id: Vec::with_capacity(capacity),
            seq_id: vec![0; capacity * n_seq_max],
            output: Vec::with_capacity(capacity),
        }
    }

    /// Single-sequence batch over `tokens` at consecutive positions from `pos0`.
    ///
    /// Only the last token requests output.
    pub fn get_one(tokens: &[TokenId], pos0: Pos, seq_id: SeqId) -> Result<Self> {
        let mut batch = Self::new(tokens.len().max(1), 0, 1);
        for (i, &tok) in tokens.iter().enumerate() {
            batch.add_token(tok, pos0 + i as Pos, &[seq_id], i + 1 == tokens.len())?;
        }
        Ok(batch)
    }

    /// Append a token slot.
    ///
    /// # Errors
    /// - `CapacityExceeded`: The batch is full; the batch is left unchanged
    /// - `InvalidBatch`: Embedding-mode batch, or bad sequence id list
    pub fn add_token(
        &mut self,
        token: TokenId,
        pos: Pos,
        seq_ids: &[SeqId],
        output: bool,
    ) -> Result<()> {
        if self.is_embeddings() {
            return Err(LlamaError::InvalidBatch(
                "token added to an embedding batch".to_string(),
            ));
        }
        self.check_slot(seq_ids)?;

        self.token.push(token);
        self.push_common(pos, seq_ids, output);
        Ok(())
    }

    /// Append an embedding slot of exactly `n_embd` values.
    pub fn add_embedding(
        &mut self,
        embd: &[f32],
        pos: Pos,
        seq_ids: &[SeqId],
        output: bool,
    ) -> Result<()> {
        if !self.is_embeddings() {
            return Err(LlamaError::InvalidBatch(
                "embedding added to a token batch".to_string(),
            ));
        }
        if embd.len() != self.n_embd {
            return Err(LlamaError::InvalidBatch(format!(
                "embedding width {} != {}",
                embd.len(),
                self.n_embd
            )));
        }
        self.check_slot(seq_ids)?;

        self.embd.extend_from_slice(embd);
        self.push_common(pos, seq_ids, output);
        Ok(())
    }

    fn check_slot(&self, seq_ids: &[SeqId]) -> Result<()> {
        if self.n_tokens() >= self.capacity {
            return Err(LlamaError::CapacityExceeded {
                requested: self.n_tokens() + 1,
                capacity: self.capacity,
            });
        }
        if seq_ids.is_empty() || seq_ids.len() > self.n_seq_max {
            return Err(LlamaError::InvalidBatch(format!(
                "slot needs 1..={} sequence ids, got {}",
                self.n_seq_max,
                seq_ids.len()
            )));
        }
        Ok(())
    }

    fn push_common(&mut self, pos: Pos, seq_ids: &[SeqId], output: bool) {
        let slot = self.pos.len();
        let base = slot * self.n_seq_max;
        self.seq_id[base..base + seq_ids.len()].copy_from_slice(seq_ids);
        self.n_seq_id.push(seq_ids.len());
        self.pos.push(pos);
        self.output.push(output);
    }

    /// Reset to zero slots without releasing storage.
    pub fn clear(&mut self) {
        self.token.clear();
        self.embd.clear();
        self.pos.clear();
        self.n_seq_id.clear();
        self.output.clear();
    }

    /// Change the output flag of an existing slot.
    pub fn set_output(&mut self, i: usize, want: bool) -> Result<()> {
        let n = self.n_tokens();
        let flag = self
            .output
            .get_mut(i)
            .ok_or_else(|| LlamaError::InvalidBatch(format!("slot {i} out of range ({n})")))?;
        *flag = want;
        Ok(())
    }

    pub fn n_tokens(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    pub fn is_embeddings(&self) -> bool {
        self.n_embd > 0
    }

    /// Token ids of a token-mode batch (empty for embedding batches).
    pub fn tokens(&self) -> &[TokenId] {
        &self.token
    }

    pub fn positions(&self) -> &[Pos] {
        &self.pos
    }

    pub fn outputs(&self) -> &[bool] {
        &self.output
    }

    /// Number of slots that request output.
    pub fn n_outputs(&self) -> usize {
        self.output.iter().filter(|&&o| o).count()
    }

    /// Sequence ids of slot `i`.
    ///
    /// # Panics
    /// If `i >= n_tokens()`.
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        let base = i * self.n_seq_max;
        &self.seq_id[base..base + self.n_seq_id[i]]
    }

    /// Embedding row of slot `i` in an embedding batch.
    pub fn embd(&self, i: usize) -> Option<&[f32]> {
        if !self.is_embeddings() || i >= self.n_tokens() {
            return None;
        }
        Some(&self.embd[i * self.n_embd..(i + 1) * self.n_embd])
    }

    pub fn slot(&self, i: usize) -> Option<BatchSlot<'_>> {
        if i >= self.n_tokens() {
            return None;
        }
        Some(BatchSlot {
            token: self.token.get(i).copied(),
            embd: self.embd(i),
            pos: self.pos[i],
            seq_ids: self.seq_ids(i),
            output: self.output[i],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = BatchSlot<'_>> + '_ {
        (0..self.n_tokens()).filter_map(move |i| self.slot(i))
    }
}
