//! Streaming detokenization tests.
//!
//! Validates:
//! - `detokenize(tokenize(x)) == x` for the byte vocabulary across ASCII and unicode
//! - Streaming output concatenates to the same text for every split point
//! - A character split over two tokens is withheld, then emitted whole
//! - End-of-generation handling via `is_eog` and `flush`

use llama_tokenizer::{ByteVocab, StreamingDetokenizer, Vocab};

const SAMPLES: &[&str] = &[
    "hello",
    "hello world",
    "  leading and trailing  ",
    "tabs\tand\nnewlines",
    "café",
    "naïve façade",
    "日本語のテキスト",
    "emoji 🦙🔥 mix",
    "",
];

#[test]
fn roundtrip_all_samples() {
    let vocab = ByteVocab::new();
    for text in SAMPLES {
        let ids = vocab.tokenize(text, false).unwrap();
        assert_eq!(&vocab.detokenize(&ids).unwrap(), text, "roundtrip failed for {text:?}");
    }
}

#[test]
fn streaming_matches_batch_decode() {
    let vocab = ByteVocab::new();
    for text in SAMPLES {
        let ids = vocab.tokenize(text, true).unwrap();
        let mut detok = StreamingDetokenizer::new();
        let mut out = String::new();
        for &id in &ids {
            let chunk = detok.push_token(&vocab, id).unwrap();
            // every emitted chunk is whole characters
            assert!(text.contains(chunk.as_str()));
            out.push_str(&chunk);
        }
        assert!(detok.pending().is_empty());
        assert_eq!(&out, text);
    }
}

#[test]
fn two_halves_then_whole() {
    let bytes = "ß".as_bytes();
    assert_eq!(bytes.len(), 2);

    let mut detok = StreamingDetokenizer::new();
    assert_eq!(detok.push(&bytes[..1]), "");
    assert_eq!(detok.push(&bytes[1..]), "ß");

    let mut detok = StreamingDetokenizer::new();
    assert_eq!(detok.push(bytes), "ß");
}

#[test]
fn four_byte_char_one_byte_at_a_time() {
    let vocab = ByteVocab::new();
    let ids = vocab.tokenize("🦙", false).unwrap();
    let mut detok = StreamingDetokenizer::new();
    let outputs: Vec<String> = ids
        .iter()
        .map(|&id| detok.push_token(&vocab, id).unwrap())
        .collect();
    assert_eq!(outputs, vec!["", "", "", "🦙"]);
}

#[test]
fn generation_stops_at_eog_and_flushes() {
    let vocab = ByteVocab::new();
    let mut ids = vocab.tokenize("ok", false).unwrap();
    ids.push(0xE2); // dangling lead byte before EOS
    ids.push(ByteVocab::EOS);
    ids.push(b'x' as i32);

    let mut detok = StreamingDetokenizer::new();
    let mut out = String::new();
    for &id in &ids {
        if vocab.is_eog(id) {
            out.push_str(&detok.flush());
            break;
        }
        out.push_str(&detok.push_token(&vocab, id).unwrap());
    }
    assert_eq!(out, "ok\u{FFFD}");
}

#[test]
fn unknown_token_propagates_error() {
    let vocab = ByteVocab::new();
    let mut detok = StreamingDetokenizer::new();
    assert!(detok.push_token(&vocab, 4096).is_err());
    assert!(detok.pending().is_empty());
}

#[test]
fn reset_discards_pending() {
    let mut detok = StreamingDetokenizer::new();
    detok.push(&[0xF0, 0x9F]);
    detok.reset();
    assert_eq!(detok.push(b"a"), "a");
}
