//! # Streaming Text Substitution
//!
//! Applies the configured body rewrite rules to a response stream without
//! ever buffering the full body. Chunks are decoded as streaming UTF-8
//! (split code points carry over to the next chunk, invalid sequences
//! become U+FFFD), rules run in declared order over a carry buffer, and
//! everything except a fixed safety window is re-encoded and emitted. The
//! held-back window is already-rewritten text, so rules must be safe to
//! re-apply; literal rules whose replacement does not contain the pattern
//! always are.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::Stream;
use regex::{NoExpand, Regex};

use crate::config::TextReplacement;
use crate::error::{Result, TunnelError};

/// Chars held back between chunks so a match arriving split across chunk
/// boundaries is still seen whole.
const SAFETY_WINDOW: usize = 1024;

struct CompiledRule {
    regex: Regex,
    replacement: String,
    literal: bool,
}

/// The configured replacement rules, compiled once at startup.
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

impl CompiledRules {
    pub fn compile(replacements: &[TextReplacement]) -> Result<Self> {
        let mut rules = Vec::with_capacity(replacements.len());
        for replacement in replacements {
            let pattern = if replacement.regex {
                replacement.pattern.clone()
            } else {
                regex::escape(&replacement.pattern)
            };
            let regex = Regex::new(&pattern).map_err(|source| TunnelError::Pattern {
                pattern: replacement.pattern.clone(),
                source,
            })?;
            rules.push(CompiledRule {
                regex,
                replacement: replacement.replacement.clone(),
                literal: !replacement.regex,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in declared order. Literal replacements are
    /// inserted verbatim; regex replacements support `$n` group expansion.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            current = if rule.literal {
                rule.regex
                    .replace_all(&current, NoExpand(&rule.replacement))
                    .into_owned()
            } else {
                rule.regex
                    .replace_all(&current, rule.replacement.as_str())
                    .into_owned()
            };
        }
        current
    }
}

/// Chunk-by-chunk rewriter. Feed bytes with [`push`](Self::push), then
/// call [`finish`](Self::finish) exactly once to flush the window.
pub struct StreamRewriter {
    rules: Arc<CompiledRules>,
    carry: String,
    /// Trailing bytes of a code point split across chunks.
    partial: Vec<u8>,
}

impl StreamRewriter {
    pub fn new(rules: Arc<CompiledRules>) -> Self {
        Self {
            rules,
            carry: String::new(),
            partial: Vec::new(),
        }
    }

    /// Decodes `chunk`, rewrites the carry, and returns the bytes that are
    /// safely past the window. Often empty for small chunks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.decode(chunk);
        let rewritten = self.rules.apply(&self.carry);

        let char_count = rewritten.chars().count();
        if char_count <= SAFETY_WINDOW {
            self.carry = rewritten;
            return Vec::new();
        }

        let split_at = rewritten
            .char_indices()
            .nth(char_count - SAFETY_WINDOW)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.carry = rewritten[split_at..].to_string();
        rewritten[..split_at].as_bytes().to_vec()
    }

    /// Flushes the remaining buffer with the rules applied.
    pub fn finish(&mut self) -> Vec<u8> {
        if !self.partial.is_empty() {
            self.carry.push('\u{FFFD}');
            self.partial.clear();
        }
        let text = std::mem::take(&mut self.carry);
        if text.is_empty() {
            return Vec::new();
        }
        self.rules.apply(&text).into_bytes()
    }

    fn decode(&mut self, chunk: &[u8]) {
        if self.partial.is_empty() {
            self.decode_slice(chunk);
        } else {
            let mut data = std::mem::take(&mut self.partial);
            data.extend_from_slice(chunk);
            self.decode_slice(&data);
        }
    }

    fn decode_slice(&mut self, mut input: &[u8]) {
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    self.carry.push_str(text);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.carry
                        .push_str(&String::from_utf8_lossy(&input[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.carry.push('\u{FFFD}');
                            input = &input[valid + bad..];
                        }
                        None => {
                            // Incomplete trailing sequence; wait for the
                            // rest in the next chunk.
                            self.partial = input[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Wraps a body stream with the rewriter. Errors pass through untouched.
pub fn rewrite_stream<S, E>(
    input: S,
    rules: Arc<CompiledRules>,
) -> impl Stream<Item = std::result::Result<Bytes, E>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    stream! {
        let mut rewriter = StreamRewriter::new(rules);
        for await item in input {
            match item {
                Ok(chunk) => {
                    let out = rewriter.push(&chunk);
                    if !out.is_empty() {
                        yield Ok(Bytes::from(out));
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        let tail = rewriter.finish();
        if !tail.is_empty() {
            yield Ok(Bytes::from(tail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(pattern: &str, replacement: &str) -> TextReplacement {
        TextReplacement {
            pattern: pattern.to_string(),
            regex: false,
            replacement: replacement.to_string(),
        }
    }

    fn rules(replacements: &[TextReplacement]) -> Arc<CompiledRules> {
        Arc::new(CompiledRules::compile(replacements).unwrap())
    }

    fn run_chunked(rules: &Arc<CompiledRules>, input: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut rewriter = StreamRewriter::new(rules.clone());
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size) {
            out.extend(rewriter.push(chunk));
        }
        out.extend(rewriter.finish());
        out
    }

    #[test]
    fn bad_regex_pattern_is_a_startup_error() {
        let result = CompiledRules::compile(&[TextReplacement {
            pattern: "(unclosed".to_string(),
            regex: true,
            replacement: String::new(),
        }]);
        assert!(matches!(result, Err(TunnelError::Pattern { .. })));
        // The same text as a literal is fine.
        CompiledRules::compile(&[literal("(unclosed", "x")]).unwrap();
    }

    #[test]
    fn replacement_spans_chunk_boundary() {
        let rules = rules(&[literal("foo", "bar")]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = Vec::new();
        out.extend(rewriter.push(b"abc fo"));
        out.extend(rewriter.push(b"o xyz"));
        out.extend(rewriter.finish());
        assert_eq!(out, b"abc bar xyz");
    }

    #[test]
    fn rules_apply_in_declared_order() {
        let rules = rules(&[literal("foo", "bar"), literal("bar", "baz")]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = rewriter.push(b"foo and bar");
        out.extend(rewriter.finish());
        assert_eq!(out, b"baz and baz");
    }

    #[test]
    fn regex_rule_expands_groups() {
        let rules = rules(&[TextReplacement {
            pattern: "v([0-9]+)".to_string(),
            regex: true,
            replacement: "version $1".to_string(),
        }]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = rewriter.push(b"release v42 is out");
        out.extend(rewriter.finish());
        assert_eq!(out, b"release version 42 is out");
    }

    #[test]
    fn literal_dollar_is_not_expanded() {
        let rules = rules(&[literal("price", "$1")]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = rewriter.push(b"the price");
        out.extend(rewriter.finish());
        assert_eq!(out, b"the $1");
    }

    #[test]
    fn split_code_point_is_not_broken() {
        let rules = rules(&[literal("héllo", "hola")]);
        let input = "say héllo twice: héllo".as_bytes();
        // é is two bytes; chunk size 3 splits it repeatedly.
        let out = run_chunked(&rules, input, 3);
        assert_eq!(out, "say hola twice: hola".as_bytes());
    }

    #[test]
    fn invalid_utf8_becomes_replacement_char() {
        let rules = rules(&[literal("foo", "bar")]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = rewriter.push(&[b'f', b'o', b'o', 0xFF, b'!']);
        out.extend(rewriter.finish());
        assert_eq!(String::from_utf8(out).unwrap(), "bar\u{FFFD}!");
    }

    #[test]
    fn truncated_trailing_code_point_flushes_as_replacement_char() {
        let rules = rules(&[]);
        let mut rewriter = StreamRewriter::new(rules);
        let mut out = rewriter.push("ok ".as_bytes());
        out.extend(rewriter.push(&[0xC3])); // first byte of a 2-byte seq
        out.extend(rewriter.finish());
        assert_eq!(String::from_utf8(out).unwrap(), "ok \u{FFFD}");
    }

    #[test]
    fn output_is_independent_of_chunking() {
        let rules = rules(&[literal("foo", "bar"), literal("tunnel", "conduit")]);
        let body = "foo tunnel ".repeat(700); // well past the safety window
        let expected = run_chunked(&rules, body.as_bytes(), body.len());
        for chunk_size in [1, 7, 64, 1000, 4096] {
            let out = run_chunked(&rules, body.as_bytes(), chunk_size);
            assert_eq!(out, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn fully_substituted_content_is_a_fixed_point() {
        let rules = rules(&[literal("foo", "bar")]);
        let body = "foo says foo ".repeat(500);
        let once = run_chunked(&rules, body.as_bytes(), 97);
        let twice = run_chunked(&rules, &once, 97);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn stream_adapter_rewrites_and_flushes() {
        use futures::StreamExt;

        let rules = rules(&[literal("foo", "bar")]);
        let input = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc fo")),
            Ok(Bytes::from_static(b"o xyz")),
        ]);
        let out: Vec<u8> = rewrite_stream(input, rules)
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(out, b"abc bar xyz");
    }
}
