//! Session state codec.
//!
//! Context payload (little-endian, no header):
//!
//! ```text
//! u32 n_ids,     n_ids x i32      // batch slot -> output row, -1 for none
//! u32 n_logits,  n_logits x f32   // n_outputs * n_vocab or 0
//! u32 n_embd,    n_embd x f32     // n_outputs * n_embd or 0
//! KV payload (see llama_kv::state)
//! ```
//!
//! Files prepend `u32 magic, u32 version, u32 n_tokens, n_tokens x i32`.
//! Whole-context files use `'ggsn'`/9, sequence files `'ggsq'`/2 and carry a
//! sequence-scoped KV payload only. Every load parses and validates the whole
//! input before touching the context, so a failed load leaves it unchanged.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use llama_engine::{LlamaError, Result, SeqId, TokenId};
use llama_kv::KVState;

use crate::context::{Context, Outputs};

/// `'ggsn'`
pub const SESSION_MAGIC: u32 = 0x6767_736e;
pub const SESSION_VERSION: u32 = 9;
/// `'ggsq'`
pub const SEQ_MAGIC: u32 = 0x6767_7371;
pub const SEQ_VERSION: u32 = 2;

fn truncated(e: io::Error) -> LlamaError {
    LlamaError::MalformedState(format!("truncated state: {e}"))
}

fn read_header<R: Read>(r: &mut R, magic: u32, version: u32) -> Result<()> {
    let got_magic = r.read_u32::<LittleEndian>().map_err(truncated)?;
    let got_version = r.read_u32::<LittleEndian>().map_err(truncated)?;
    if got_magic != magic || got_version != version {
        return Err(LlamaError::IncompatibleVersion {
            magic: got_magic,
            version: got_version,
        });
    }
    Ok(())
}

fn read_tokens<R: Read>(r: &mut R, capacity: usize) -> Result<Vec<TokenId>> {
    let n = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if n > capacity {
        return Err(LlamaError::CapacityExceeded {
            requested: n,
            capacity,
        });
    }
    let mut tokens = vec![0; n];
    r.read_i32_into::<LittleEndian>(&mut tokens).map_err(truncated)?;
    Ok(tokens)
}

fn write_tokens<W: Write>(w: &mut W, tokens: &[TokenId]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(tokens.len() as u32)?;
    for &t in tokens {
        w.write_i32::<LittleEndian>(t)?;
    }
    Ok(())
}

fn read_f32s<R: Read>(r: &mut R, allowed: usize, what: &str) -> Result<Vec<f32>> {
    let n = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if n != 0 && n != allowed {
        return Err(LlamaError::MalformedState(format!(
            "{what}: {n} values, expected 0 or {allowed}"
        )));
    }
    let mut v = vec![0.0; n];
    r.read_f32_into::<LittleEndian>(&mut v).map_err(truncated)?;
    Ok(v)
}

fn write_f32s<W: Write>(w: &mut W, v: &[f32]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(v.len() as u32)?;
    for &x in v {
        w.write_f32::<LittleEndian>(x)?;
    }
    Ok(())
}

fn ensure_consumed(cursor: &Cursor<&[u8]>) -> Result<()> {
    let extra = cursor.get_ref().len() as u64 - cursor.position();
    if extra != 0 {
        return Err(LlamaError::MalformedState(format!("{extra} trailing bytes")));
    }
    Ok(())
}

/// Parsed, validated context payload.
struct ContextState {
    outputs: Outputs,
    kv: KVState,
}

impl Context {
    fn read_outputs<R: Read>(&self, r: &mut R) -> Result<Outputs> {
        let n_ids = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if n_ids > self.n_batch() {
            return Err(LlamaError::MalformedState(format!(
                "{n_ids} output slots exceed n_batch {}",
                self.n_batch()
            )));
        }
        let mut ids = vec![0; n_ids];
        r.read_i32_into::<LittleEndian>(&mut ids).map_err(truncated)?;

        let n_outputs = ids.iter().filter(|&&id| id >= 0).count();
        let mut seen = vec![false; n_outputs];
        for &id in &ids {
            if id < -1 || id >= n_outputs as i32 {
                return Err(LlamaError::MalformedState(format!("output id {id} out of range")));
            }
            if id >= 0 {
                if seen[id as usize] {
                    return Err(LlamaError::MalformedState(format!("duplicate output id {id}")));
                }
                seen[id as usize] = true;
            }
        }

        let logits = read_f32s(r, n_outputs * self.n_vocab(), "logits")?;
        let embd = read_f32s(r, n_outputs * self.n_embd(), "embeddings")?;
        Ok(Outputs {
            ids,
            n_outputs,
            logits,
            embd,
        })
    }

    fn read_state<R: Read>(&self, r: &mut R) -> Result<ContextState> {
        let outputs = self.read_outputs(r)?;
        let kv = KVState::read_from(r, self.kv.config(), false)?;
        Ok(ContextState { outputs, kv })
    }

    fn apply_state(&mut self, state: ContextState) -> Result<()> {
        self.kv.state_apply(state.kv, None)?;
        self.outputs = state.outputs;
        self.clear_derived();
        Ok(())
    }

    fn write_state<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.outputs.ids.len() as u32)?;
        for &id in &self.outputs.ids {
            w.write_i32::<LittleEndian>(id)?;
        }
        write_f32s(w, &self.outputs.logits)?;
        write_f32s(w, &self.outputs.embd)?;
        self.kv.state_write(w, None)
    }

    /// Exact size of [`Context::state_get_data`]; stale once the context changes.
    pub fn state_size(&self) -> usize {
        4 + 4 * self.outputs.ids.len()
            + 4
            + 4 * self.outputs.logits.len()
            + 4
            + 4 * self.outputs.embd.len()
            + self.kv.state_size(None)
    }

    /// Serialize outputs and the whole cache.
    pub fn state_get_data(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.state_size());
        self.write_state(&mut buf)?;
        Ok(buf)
    }

    /// Restore from [`Context::state_get_data`] output; returns bytes read.
    ///
    /// # Errors
    /// - `CapacityExceeded`: More cells than this context holds
    /// - `MalformedState`: Truncated data or mismatched geometry
    pub fn state_set_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut cursor = Cursor::new(data);
        let state = self.read_state(&mut cursor)?;
        self.apply_state(state)?;
        Ok(cursor.position() as usize)
    }

    /// Write a session file: header, `tokens`, then the context payload.
    pub fn state_save_file(&self, path: impl AsRef<Path>, tokens: &[TokenId]) -> Result<()> {
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);
        w.write_u32::<LittleEndian>(SESSION_MAGIC)?;
        w.write_u32::<LittleEndian>(SESSION_VERSION)?;
        write_tokens(&mut w, tokens)?;
        self.write_state(&mut w)?;
        w.flush()?;
        tracing::info!(
            ctx = %self.id(),
            path = %path.display(),
            n_tokens = tokens.len(),
            cells = self.kv.used_cells(),
            "saved session"
        );
        Ok(())
    }

    /// Load a session file and return its token history.
    ///
    /// # Errors
    /// - `IncompatibleVersion`: Wrong magic or version
    /// - `CapacityExceeded`: More than `n_token_capacity` tokens, or more cells
    ///   than the context holds
    /// - `MalformedState`: Truncated file or mismatched geometry
    pub fn state_load_file(
        &mut self,
        path: impl AsRef<Path>,
        n_token_capacity: usize,
    ) -> Result<Vec<TokenId>> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut cursor = Cursor::new(data.as_slice());
        read_header(&mut cursor, SESSION_MAGIC, SESSION_VERSION)?;
        let tokens = read_tokens(&mut cursor, n_token_capacity)?;
        let state = self.read_state(&mut cursor)?;
        ensure_consumed(&cursor)?;

        self.apply_state(state)?;
        tracing::info!(
            ctx = %self.id(),
            path = %path.display(),
            n_tokens = tokens.len(),
            cells = self.kv.used_cells(),
            "loaded session"
        );
        Ok(tokens)
    }

    /// Exact size of [`Context::state_seq_get_data`] for `seq_id`.
    pub fn state_seq_size(&self, seq_id: SeqId) -> usize {
        self.kv.state_size(Some(seq_id))
    }

    /// Serialize the cells of one sequence.
    pub fn state_seq_get_data(&self, seq_id: SeqId) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.state_seq_size(seq_id));
        self.kv.state_write(&mut buf, Some(seq_id))?;
        Ok(buf)
    }

    /// Replace sequence `dest` with a sequence payload; returns bytes read.
    ///
    /// Other sequences are untouched.
    ///
    /// # Errors
    /// - `SlotExhausted`: No contiguous room; nothing is modified
    /// - `MalformedState` / `CapacityExceeded`: Bad payload
    pub fn state_seq_set_data(&mut self, data: &[u8], dest: SeqId) -> Result<usize> {
        let mut cursor = Cursor::new(data);
        let state = KVState::read_from(&mut cursor, self.kv.config(), true)?;
        self.kv.state_apply(state, Some(dest))?;
        Ok(cursor.position() as usize)
    }

    /// Write a sequence file: header, `tokens`, then the sequence payload.
    pub fn state_seq_save_file(
        &self,
        path: impl AsRef<Path>,
        seq_id: SeqId,
        tokens: &[TokenId],
    ) -> Result<()> {
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);
        w.write_u32::<LittleEndian>(SEQ_MAGIC)?;
        w.write_u32::<LittleEndian>(SEQ_VERSION)?;
        write_tokens(&mut w, tokens)?;
        self.kv.state_write(&mut w, Some(seq_id))?;
        w.flush()?;
        tracing::info!(ctx = %self.id(), path = %path.display(), seq_id, "saved sequence");
        Ok(())
    }

    /// Load a sequence file into `dest` and return its token history.
    pub fn state_seq_load_file(
        &mut self,
        path: impl AsRef<Path>,
        dest: SeqId,
        n_token_capacity: usize,
    ) -> Result<Vec<TokenId>> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut cursor = Cursor::new(data.as_slice());
        read_header(&mut cursor, SEQ_MAGIC, SEQ_VERSION)?;
        let tokens = read_tokens(&mut cursor, n_token_capacity)?;
        let state = KVState::read_from(&mut cursor, self.kv.config(), true)?;
        ensure_consumed(&cursor)?;

        self.kv.state_apply(state, Some(dest))?;
        tracing::info!(ctx = %self.id(), path = %path.display(), seq_id = dest, "loaded sequence");
        Ok(tokens)
    }
}
