//! GBNF grammar constraints.
//!
//! Supported syntax: `name ::= alternatives` rules (one per line unless inside
//! parentheses), string literals, character classes with ranges and `^`
//! negation, `.`, grouping, `*` `+` `?`, rule references and `#` comments.
//! Left-recursive grammars are rejected at parse time.
//!
//! Matching keeps a set of parse stacks. Each stack's top points at the next
//! character element to match; an empty stack means the input so far is a
//! complete sentence.

use std::collections::HashMap;
use std::sync::Arc;

use llama_engine::TokenId;
use llama_tokenizer::Vocab;

use crate::{Sampler, SamplingError, SamplingResult, TokenDataArray};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CharSet {
    negated: bool,
    ranges: Vec<(u32, u32)>,
}

impl CharSet {
    fn single(c: u32) -> Self {
        Self {
            negated: false,
            ranges: vec![(c, c)],
        }
    }

    fn any() -> Self {
        Self {
            negated: true,
            ranges: Vec::new(),
        }
    }

    fn matches(&self, c: u32) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != self.negated
    }

    /// Whether some code point in `lo..=hi` may match.
    fn intersects(&self, lo: u32, hi: u32) -> bool {
        if self.negated {
            !self.ranges.iter().any(|&(a, b)| a <= lo && hi <= b)
        } else {
            self.ranges.iter().any(|&(a, b)| a <= hi && lo <= b)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Elem {
    Char(CharSet),
    Rule(usize),
}

type Alt = Vec<Elem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackPos {
    rule: usize,
    alt: usize,
    elem: usize,
}

type Stack = Vec<StackPos>;

/// A parsed grammar.
#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Vec<Vec<Alt>>,
    names: Vec<String>,
    root: usize,
}

struct Parser {
    src: Vec<char>,
    pos: usize,
    symbols: HashMap<String, usize>,
    names: Vec<String>,
    rules: Vec<Option<Vec<Alt>>>,
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            src: src.chars().collect(),
            pos: 0,
            symbols: HashMap::new(),
            names: Vec::new(),
            rules: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn err(&self, msg: &str) -> SamplingError {
        SamplingError::Grammar(format!("{msg} at offset {}", self.pos))
    }

    fn skip_space(&mut self, newline_ok: bool) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' => self.pos += 1,
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\r' | '\n' if newline_ok => self.pos += 1,
                _ => break,
            }
        }
    }

    fn parse_name(&mut self) -> SamplingResult<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_word) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expecting name"));
        }
        Ok(self.src[start..self.pos].iter().collect())
    }

    fn symbol(&mut self, name: &str) -> usize {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.rules.len();
        self.symbols.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.rules.push(None);
        id
    }

    fn synthetic(&mut self, base: &str) -> usize {
        let name = format!("{base}_{}", self.rules.len());
        self.symbol(&name)
    }

    fn parse_hex(&mut self, digits: usize) -> SamplingResult<u32> {
        let mut value = 0u32;
        for _ in 0..digits {
            let d = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.err("expecting hex digit"))?;
            value = value * 16 + d;
        }
        Ok(value)
    }

    fn parse_char(&mut self) -> SamplingResult<u32> {
        match self.bump() {
            Some('\\') => match self.bump() {
                Some('n') => Ok('\n' as u32),
                Some('t') => Ok('\t' as u32),
                Some('r') => Ok('\r' as u32),
                Some(c @ ('\\' | '"' | '[' | ']' | '-' | '^')) => Ok(c as u32),
                Some('x') => self.parse_hex(2),
                Some('u') => self.parse_hex(4),
                Some('U') => self.parse_hex(8),
                _ => Err(self.err("unknown escape")),
            },
            Some(c) => Ok(c as u32),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn parse_rule(&mut self) -> SamplingResult<()> {
        let name = self.parse_name()?;
        self.skip_space(false);
        for expected in [':', ':', '='] {
            if self.bump() != Some(expected) {
                return Err(self.err("expecting ::="));
            }
        }
        self.skip_space(true);

        let id = self.symbol(&name);
        let alts = self.parse_alternatives(&name, false)?;
        if self.rules[id].is_some() {
            return Err(self.err(&format!("rule {name} defined twice")));
        }
        self.rules[id] = Some(alts);

        match self.peek() {
            None => Ok(()),
            Some('\r' | '\n') => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.err("expecting newline or end")),
        }
    }

    fn parse_alternatives(&mut self, name: &str, nested: bool) -> SamplingResult<Vec<Alt>> {
        let mut alts = vec![self.parse_sequence(name, nested)?];
        while self.peek() == Some('|') {
            self.pos += 1;
            self.skip_space(true);
            alts.push(self.parse_sequence(name, nested)?);
        }
        Ok(alts)
    }

    fn parse_sequence(&mut self, name: &str, nested: bool) -> SamplingResult<Alt> {
        let mut seq = Vec::new();
        let mut last_start = None;

        loop {
            match self.peek() {
                Some('"') => {
                    self.pos += 1;
                    last_start = Some(seq.len());
                    loop {
                        match self.peek() {
                            None => return Err(self.err("unterminated string")),
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {
                                let c = self.parse_char()?;
                                seq.push(Elem::Char(CharSet::single(c)));
                            }
                        }
                    }
                }
                Some('[') => {
                    self.pos += 1;
                    last_start = Some(seq.len());
                    let negated = self.peek() == Some('^');
                    if negated {
                        self.pos += 1;
                    }
                    let mut ranges = Vec::new();
                    loop {
                        match self.peek() {
                            None => return Err(self.err("unterminated character class")),
                            Some(']') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {
                                let lo = self.parse_char()?;
                                let hi = if self.peek() == Some('-')
                                    && self.peek_at(1).is_some_and(|c| c != ']')
                                {
                                    self.pos += 1;
                                    self.parse_char()?
                                } else {
                                    lo
                                };
                                ranges.push((lo, hi));
                            }
                        }
                    }
                    seq.push(Elem::Char(CharSet { negated, ranges }));
                }
                Some('.') => {
                    self.pos += 1;
                    last_start = Some(seq.len());
                    seq.push(Elem::Char(CharSet::any()));
                }
                Some('(') => {
                    self.pos += 1;
                    self.skip_space(true);
                    let sub = self.synthetic(name);
                    let alts = self.parse_alternatives(name, true)?;
                    if self.bump() != Some(')') {
                        return Err(self.err("expecting )"));
                    }
                    self.rules[sub] = Some(alts);
                    last_start = Some(seq.len());
                    seq.push(Elem::Rule(sub));
                }
                Some(c) if is_word(c) => {
                    let ref_name = self.parse_name()?;
                    let id = self.symbol(&ref_name);
                    last_start = Some(seq.len());
                    seq.push(Elem::Rule(id));
                }
                Some(op @ ('*' | '+' | '?')) => {
                    let start = last_start
                        .take()
                        .ok_or_else(|| self.err("expecting preceding item"))?;
                    self.pos += 1;
                    let atom: Alt = seq.drain(start..).collect();
                    let sub = self.synthetic(name);
                    let rec = Elem::Rule(sub);
                    let alts = match op {
                        '?' => vec![atom, Vec::new()],
                        _ => {
                            let mut repeat = atom.clone();
                            repeat.push(rec.clone());
                            if op == '+' {
                                seq.extend(atom);
                            }
                            vec![repeat, Vec::new()]
                        }
                    };
                    self.rules[sub] = Some(alts);
                    seq.push(rec);
                }
                _ => break,
            }
            self.skip_space(nested);
        }
        Ok(seq)
    }

    fn finish(self, root: &str) -> SamplingResult<Grammar> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.into_iter().enumerate() {
            match rule {
                Some(alts) => rules.push(alts),
                None => {
                    return Err(SamplingError::Grammar(format!(
                        "undefined rule {}",
                        self.names[i]
                    )))
                }
            }
        }
        let root = *self
            .symbols
            .get(root)
            .ok_or_else(|| SamplingError::Grammar(format!("missing root rule {root}")))?;

        let grammar = Grammar {
            rules,
            names: self.names,
            root,
        };
        grammar.check_left_recursion()?;
        Ok(grammar)
    }
}

impl Grammar {
    /// Parse GBNF text with the given start rule.
    pub fn parse(src: &str, root: &str) -> SamplingResult<Self> {
        let mut parser = Parser::new(src);
        parser.skip_space(true);
        while parser.peek().is_some() {
            parser.parse_rule()?;
            parser.skip_space(true);
        }
        parser.finish(root)
    }

    pub fn n_rules(&self) -> usize {
        self.rules.len()
    }

    fn nullable(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.rules.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for (r, alts) in self.rules.iter().enumerate() {
                if nullable[r] {
                    continue;
                }
                let any = alts.iter().any(|alt| {
                    alt.iter()
                        .all(|e| matches!(e, Elem::Rule(s) if nullable[*s]))
                });
                if any {
                    nullable[r] = true;
                    changed = true;
                }
            }
        }
        nullable
    }

    fn check_left_recursion(&self) -> SamplingResult<()> {
        let nullable = self.nullable();
        let edges: Vec<Vec<usize>> = self
            .rules
            .iter()
            .map(|alts| {
                let mut out = Vec::new();
                for alt in alts {
                    for e in alt {
                        match e {
                            Elem::Rule(s) => {
                                out.push(*s);
                                if !nullable[*s] {
                                    break;
                                }
                            }
                            Elem::Char(_) => break,
                        }
                    }
                }
                out
            })
            .collect();

        // 0 = unvisited, 1 = on path, 2 = done
        fn visit(r: usize, edges: &[Vec<usize>], state: &mut [u8]) -> Option<usize> {
            state[r] = 1;
            for &s in &edges[r] {
                match state[s] {
                    1 => return Some(s),
                    0 => {
                        if let Some(found) = visit(s, edges, state) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            state[r] = 2;
            None
        }

        let mut state = vec![0u8; self.rules.len()];
        for r in 0..self.rules.len() {
            if state[r] == 0 {
                if let Some(rule) = visit(r, &edges, &mut state) {
                    return Err(SamplingError::Grammar(format!(
                        "left recursion in rule {}",
                        self.names[rule]
                    )));
                }
            }
        }
        Ok(())
    }

    fn elem(&self, p: StackPos) -> Option<&Elem> {
        self.rules[p.rule][p.alt].get(p.elem)
    }

    /// Expand until the top is a character element; empty stacks are complete.
    fn expand(&self, mut stack: Stack, out: &mut Vec<Stack>) {
        let Some(top) = stack.pop() else {
            if !out.contains(&stack) {
                out.push(stack);
            }
            return;
        };
        match self.elem(top) {
            None => self.expand(stack, out),
            Some(Elem::Char(_)) => {
                stack.push(top);
                if !out.contains(&stack) {
                    out.push(stack);
                }
            }
            Some(Elem::Rule(r)) => {
                for alt in 0..self.rules[*r].len() {
                    let mut next = stack.clone();
                    next.push(StackPos {
                        elem: top.elem + 1,
                        ..top
                    });
                    next.push(StackPos {
                        rule: *r,
                        alt,
                        elem: 0,
                    });
                    self.expand(next, out);
                }
            }
        }
    }

    fn initial_stacks(&self) -> Vec<Stack> {
        let mut out = Vec::new();
        for alt in 0..self.rules[self.root].len() {
            self.expand(
                vec![StackPos {
                    rule: self.root,
                    alt,
                    elem: 0,
                }],
                &mut out,
            );
        }
        out
    }

    fn advance(&self, stacks: &[Stack], c: u32) -> Vec<Stack> {
        let mut out = Vec::new();
        for stack in stacks {
            let Some(&top) = stack.last() else {
                continue;
            };
            if let Some(Elem::Char(set)) = self.elem(top) {
                if set.matches(c) {
                    let mut next = stack.clone();
                    next.pop();
                    next.push(StackPos {
                        elem: top.elem + 1,
                        ..top
                    });
                    self.expand(next, &mut out);
                }
            }
        }
        out
    }

    /// Whether `text` is a complete sentence of the grammar.
    pub fn accepts(&self, text: &str) -> bool {
        let mut stacks = self.initial_stacks();
        for c in text.chars() {
            stacks = self.advance(&stacks, c as u32);
        }
        stacks.iter().any(|s| s.is_empty())
    }
}

/// Split into the valid UTF-8 prefix and an incomplete tail; `None` if invalid.
fn split_utf8(bytes: &[u8]) -> Option<(&str, &[u8])> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Some((s, &[])),
        Err(e) if e.error_len().is_none() => {
            let (ok, tail) = bytes.split_at(e.valid_up_to());
            Some((std::str::from_utf8(ok).ok()?, tail))
        }
        Err(_) => None,
    }
}

/// Code points an incomplete sequence can still become.
fn partial_range(tail: &[u8]) -> (u32, u32) {
    let (len, bits) = match tail[0] {
        b if b & 0xE0 == 0xC0 => (2, b & 0x1F),
        b if b & 0xF0 == 0xE0 => (3, b & 0x0F),
        b => (4, b & 0x07),
    };
    let mut value = bits as u32;
    for &b in &tail[1..] {
        value = (value << 6) | (b & 0x3F) as u32;
    }
    let missing = 6 * (len - tail.len()) as u32;
    let lo = value << missing;
    (lo, lo | ((1 << missing) - 1))
}

/// Masks candidates that cannot continue the grammar.
#[derive(Debug, Clone)]
pub struct GrammarSampler {
    grammar: Arc<Grammar>,
    pieces: Arc<Vec<Vec<u8>>>,
    eog: Arc<Vec<bool>>,
    stacks: Vec<Stack>,
    /// Bytes of a character split across tokens.
    partial: Vec<u8>,
}

impl GrammarSampler {
    pub fn new(vocab: &dyn Vocab, src: &str, root: &str) -> SamplingResult<Self> {
        let grammar = Grammar::parse(src, root)?;
        let n_vocab = vocab.n_vocab();
        let pieces = (0..n_vocab)
            .map(|id| vocab.token_to_piece(id as TokenId).unwrap_or_default())
            .collect();
        let eog = (0..n_vocab).map(|id| vocab.is_eog(id as TokenId)).collect();
        let stacks = grammar.initial_stacks();
        tracing::debug!(rules = grammar.n_rules(), "grammar sampler ready");
        Ok(Self {
            grammar: Arc::new(grammar),
            pieces: Arc::new(pieces),
            eog: Arc::new(eog),
            stacks,
            partial: Vec::new(),
        })
    }

    /// Input so far forms a complete sentence.
    pub fn is_complete(&self) -> bool {
        self.partial.is_empty() && self.stacks.iter().any(|s| s.is_empty())
    }

    fn allows(&self, piece: &[u8]) -> bool {
        if piece.is_empty() {
            return false;
        }
        let mut bytes = self.partial.clone();
        bytes.extend_from_slice(piece);
        let Some((text, tail)) = split_utf8(&bytes) else {
            return false;
        };

        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = self.grammar.advance(&stacks, c as u32);
            if stacks.is_empty() {
                return false;
            }
        }
        if tail.is_empty() {
            return true;
        }
        let (lo, hi) = partial_range(tail);
        stacks.iter().any(|s| {
            matches!(
                s.last().and_then(|&p| self.grammar.elem(p)),
                Some(Elem::Char(set)) if set.intersects(lo, hi)
            )
        })
    }
}

impl Sampler for GrammarSampler {
    fn name(&self) -> &str {
        "grammar"
    }

    fn accept(&mut self, token: TokenId) {
        let idx = token as usize;
        if token < 0 || self.eog.get(idx).copied().unwrap_or(false) {
            return;
        }
        let Some(piece) = self.pieces.get(idx) else {
            return;
        };

        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(piece);
        let Some((text, tail)) = split_utf8(&bytes) else {
            tracing::warn!(token, "accepted token is not valid UTF-8 for the grammar");
            self.stacks.clear();
            return;
        };
        for c in text.chars() {
            self.stacks = self.grammar.advance(&self.stacks, c as u32);
        }
        self.partial = tail.to_vec();
        if self.stacks.is_empty() {
            tracing::warn!(token, "grammar has no parse left after accepted token");
        }
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        let allow_eog = self.is_complete();
        let mut any = false;
        for t in &mut cur.data {
            let idx = t.id as usize;
            let ok = if t.id < 0 || idx >= self.pieces.len() {
                false
            } else if self.eog[idx] {
                allow_eog
            } else {
                self.allows(&self.pieces[idx])
            };
            if ok {
                any = t.logit != f32::NEG_INFINITY || any;
            } else {
                t.logit = f32::NEG_INFINITY;
            }
        }
        if !any {
            return Err(SamplingError::Grammar(
                "no candidate token satisfies the grammar".to_string(),
            ));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.stacks = self.grammar.initial_stacks();
        self.partial.clear();
    }

    fn clone_box(&self) -> Box<dyn Sampler> {
        Box::new(self.clone())
    }
}
