//! Integration tests for llama-kv.
//!
//! Validates:
//! - Prefix sharing: copy then keep leaves only the kept sequence, storage aliased
//! - Slot search with wrap-around and reuse of freed holes
//! - Lazy shift: positions move immediately, keys move at update
//! - Context shift workflow (drop oldest half, shift the rest back)
//! - Defrag preserves every (pos, seq, K, V) tuple
//! - Error conversion into the engine taxonomy
//! - State payload round trip for whole cache

use llama_engine::{LlamaError, Pos, SeqId};
use llama_kv::*;

fn config(n_cells: usize) -> KVCacheConfig {
    KVCacheConfig {
        n_cells,
        n_layer: 2,
        n_embd_k: 4,
        n_embd_v: 4,
        n_seq_max: 4,
        capabilities: KVCapabilities::ATTENTION,
    }
}

/// Adds `delta` to every key element, so shifts are observable.
struct AddShifter;

impl KeyShifter for AddShifter {
    fn shift_key(&self, _layer: usize, k_row: &mut [f32], delta: Pos) {
        for x in k_row {
            *x += delta as f32;
        }
    }
}

fn place(cache: &mut KVCache, seq: SeqId, positions: impl Iterator<Item = Pos>) -> KVResult<usize> {
    let seqs = [seq];
    let entries: Vec<(Pos, &[SeqId])> = positions.map(|p| (p, &seqs[..])).collect();
    cache.find_slot(&entries)
}

fn write_pos_rows(cache: &mut KVCache, first: usize, n: usize) {
    for il in 0..cache.n_layer() {
        for cell in first..first + n {
            let pos = cache.cell(cell).and_then(|c| c.pos()).unwrap() as f32;
            cache.write_kv(il, cell, &[pos; 4], &[pos * 10.0; 4]).unwrap();
        }
    }
}

// ===========================================================================
// Prefix sharing
// ===========================================================================

#[test]
fn copy_then_keep_leaves_only_target() {
    let mut cache = KVCache::new(config(16));
    place(&mut cache, 0, 0..5).unwrap();

    cache.seq_copy(0, 1, -1, -1).unwrap();
    // Aliased: no new cells were claimed.
    assert_eq!(cache.used_cells(), 5);
    assert_eq!(cache.token_count(), 10);

    cache.seq_keep(1);
    for cell in cache.cells().iter().filter(|c| !c.is_empty()) {
        assert_eq!(cell.seq_ids().collect::<Vec<_>>(), vec![1]);
    }
    assert_eq!(cache.seq_pos_max(0), None);
    assert_eq!(cache.seq_pos_max(1), Some(4));
    assert_eq!(cache.token_count(), 5);
}

#[test]
fn partial_copy_respects_range() {
    let mut cache = KVCache::new(config(16));
    place(&mut cache, 0, 0..6).unwrap();
    cache.seq_copy(0, 2, 1, 3).unwrap();
    assert_eq!(cache.seq_pos_min(2), Some(1));
    assert_eq!(cache.seq_pos_max(2), Some(2));
}

#[test]
fn copy_to_invalid_sequence_fails() {
    let mut cache = KVCache::new(config(4));
    place(&mut cache, 0, 0..1).unwrap();
    assert!(matches!(
        cache.seq_copy(0, 4, -1, -1),
        Err(KVError::InvalidSeq { seq_id: 4, .. })
    ));
}

// ===========================================================================
// Slot search
// ===========================================================================

#[test]
fn freed_hole_is_reused() {
    let mut cache = KVCache::new(config(8));
    place(&mut cache, 0, 0..4).unwrap();
    place(&mut cache, 1, 0..4).unwrap();
    cache.seq_remove(0, -1, -1).unwrap();
    assert_eq!(cache.head(), 0);

    let slot = place(&mut cache, 2, 0..3).unwrap();
    assert_eq!(slot, 0);
    assert_eq!(cache.used_cells(), 7);
}

#[test]
fn slot_search_wraps_around() {
    let mut cache = KVCache::new(config(8));
    place(&mut cache, 0, 0..6).unwrap();
    assert_eq!(cache.head(), 6);

    // 3 tokens don't fit in the tail, and the front is full
    assert!(matches!(
        place(&mut cache, 1, 0..3),
        Err(KVError::SlotExhausted { n_tokens: 3, n_cells: 8 })
    ));
    assert_eq!(cache.used_cells(), 6);

    assert_eq!(place(&mut cache, 1, 0..2).unwrap(), 6);
    assert_eq!(cache.head(), 0);

    cache.seq_remove(0, 0, 2).unwrap();
    assert_eq!(place(&mut cache, 2, 0..2).unwrap(), 0);
    assert_eq!(cache.used_cells(), 8);
    assert!(matches!(
        place(&mut cache, 3, 0..1),
        Err(KVError::SlotExhausted { n_tokens: 1, n_cells: 8 })
    ));
}

#[test]
fn fragmented_cache_can_exhaust_despite_free_cells() {
    let mut cache = KVCache::new(config(6));
    for p in 0..6 {
        place(&mut cache, (p % 2) as SeqId, std::iter::once(p)).unwrap();
    }
    cache.seq_remove(0, -1, -1).unwrap();
    assert_eq!(cache.used_cells(), 3);
    // three free cells, none adjacent
    assert!(place(&mut cache, 2, 0..2).is_err());
    assert_eq!(cache.view().max_contiguous, 1);

    cache.defrag();
    cache.update(&AddShifter).unwrap();
    assert!(place(&mut cache, 2, 0..2).is_ok());
}

// ===========================================================================
// Lazy shift and context shifting
// ===========================================================================

#[test]
fn keys_shift_only_on_update() {
    let mut cache = KVCache::new(config(8));
    let first = place(&mut cache, 0, 0..4).unwrap();
    write_pos_rows(&mut cache, first, 4);

    cache.seq_add(0, -1, -1, 3);
    assert_eq!(cache.layer(0).unwrap().k_row(1), &[1.0; 4]);

    assert!(cache.update(&AddShifter).unwrap());
    for il in 0..2 {
        assert_eq!(cache.layer(il).unwrap().k_row(1), &[4.0; 4]);
        // values never move
        assert_eq!(cache.layer(il).unwrap().v_row(1), &[10.0; 4]);
    }
    assert!(!cache.update(&AddShifter).unwrap());
}

#[test]
fn context_shift_workflow() {
    let n_keep = 2;
    let mut cache = KVCache::new(config(10));
    place(&mut cache, 0, 0..10).unwrap();

    let n_past = cache.seq_pos_max(0).unwrap() + 1;
    let n_discard = (n_past - n_keep) / 2;
    cache.seq_remove(0, n_keep, n_keep + n_discard).unwrap();
    cache.seq_add(0, n_keep + n_discard, n_past, -n_discard);
    cache.update(&AddShifter).unwrap();

    assert_eq!(cache.used_cells(), 10 - n_discard as usize);
    assert_eq!(cache.seq_pos_max(0), Some(n_past - n_discard - 1));

    // continue generating into the freed cells
    let next = cache.seq_pos_max(0).unwrap() + 1;
    assert!(place(&mut cache, 0, next..next + n_discard).is_ok());
    assert_eq!(cache.used_cells(), 10);
}

#[test]
fn shift_then_divide_accumulates_delta() {
    let mut cache = KVCache::new(config(8));
    place(&mut cache, 0, 0..4).unwrap();
    cache.seq_add(0, -1, -1, 4);
    cache.seq_div(0, -1, -1, 2).unwrap();
    // cell 3: 3 -> 7 -> 3, net delta 0
    assert_eq!(cache.cell(3).unwrap().pos(), Some(3));
    assert_eq!(cache.cell(3).unwrap().delta(), 0);
    assert_eq!(cache.cell(0).unwrap().pos(), Some(2));
    assert_eq!(cache.cell(0).unwrap().delta(), 2);
}

// ===========================================================================
// Defrag
// ===========================================================================

#[test]
fn defrag_preserves_cell_contents() {
    let mut cache = KVCache::new(config(12));
    let a = place(&mut cache, 0, 0..6).unwrap();
    write_pos_rows(&mut cache, a, 6);
    let b = place(&mut cache, 1, 100..104).unwrap();
    write_pos_rows(&mut cache, b, 4);
    cache.seq_remove(0, 1, 5).unwrap();

    let mut before: Vec<(Pos, Vec<SeqId>, Vec<f32>)> = cache
        .cells()
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_empty())
        .map(|(i, c)| {
            (
                c.pos().unwrap(),
                c.seq_ids().collect(),
                cache.layer(1).unwrap().v_row(i).to_vec(),
            )
        })
        .collect();

    cache.defrag();
    cache.update(&AddShifter).unwrap();
    assert_eq!(cache.n_active(), cache.used_cells());

    let mut after: Vec<(Pos, Vec<SeqId>, Vec<f32>)> = cache
        .cells()
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_empty())
        .map(|(i, c)| {
            (
                c.pos().unwrap(),
                c.seq_ids().collect(),
                cache.layer(1).unwrap().v_row(i).to_vec(),
            )
        })
        .collect();

    before.sort_by_key(|t| (t.0, t.1.clone()));
    after.sort_by_key(|t| (t.0, t.1.clone()));
    assert_eq!(before, after);
}

// ===========================================================================
// Error conversion and state
// ===========================================================================

#[test]
fn errors_map_into_engine_taxonomy() {
    let err: LlamaError = KVError::SlotExhausted {
        n_tokens: 3,
        n_cells: 2,
    }
    .into();
    assert!(err.is_retriable());

    let err: LlamaError = KVError::PartialRemoveUnsupported { seq_id: 1 }.into();
    assert!(matches!(err, LlamaError::PartialRemoveUnsupported { seq_id: 1 }));

    let err: LlamaError = KVError::Malformed("x".into()).into();
    assert!(matches!(err, LlamaError::MalformedState(_)));
}

#[test]
fn whole_cache_state_round_trip() {
    let mut cache = KVCache::new(config(8));
    let a = place(&mut cache, 0, 0..3).unwrap();
    write_pos_rows(&mut cache, a, 3);
    cache.seq_copy(0, 1, 0, 2).unwrap();

    let mut buf = Vec::new();
    cache.state_write(&mut buf, None).unwrap();

    let mut restored = KVCache::new(config(8));
    let state = KVState::read_from(&mut buf.as_slice(), restored.config(), false).unwrap();
    assert_eq!(state.cell_count(), 3);
    assert_eq!(state.pos_max(), Some(2));
    restored.state_apply(state, None).unwrap();

    assert_eq!(restored.view(), cache.view());
    assert_eq!(
        restored.layer(1).unwrap().k_row(2),
        cache.layer(1).unwrap().k_row(2)
    );
}

#[test]
fn oversize_payload_rejected_before_allocation() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1_000_000u32.to_le_bytes());
    let err = KVState::read_from(&mut buf.as_slice(), &config(8), false).unwrap_err();
    assert!(matches!(
        err,
        KVError::CapacityExceeded {
            requested: 1_000_000,
            capacity: 8
        }
    ));
}
