//! Troceado de documentos en chunks por tamaño en tokens.

use crate::error::{RagError, RagResult};

/// Cuenta tokens. El núcleo sólo necesita contar, no decodificar.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Tokenizador aproximado: cada palabra separada por espacios es un token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub tokens: usize,
    pub content: String,
    pub chunk_order_index: usize,
}

/// Colaborador externo de troceado.
pub trait Chunker: Send + Sync {
    fn chunk(&self, content: &str) -> RagResult<Vec<ChunkPiece>>;
}

/// Ventanas de `max_token_size` palabras con solape de `overlap_token_size`.
/// Si se indica `split_by_character`, el texto se parte antes por ese
/// separador y sólo las piezas demasiado grandes se trocean por ventanas.
#[derive(Debug, Clone)]
pub struct TokenSizeChunker {
    pub max_token_size: usize,
    pub overlap_token_size: usize,
    pub split_by_character: Option<String>,
}

impl Default for TokenSizeChunker {
    fn default() -> Self {
        Self {
            max_token_size: 1200,
            overlap_token_size: 100,
            split_by_character: None,
        }
    }
}

impl TokenSizeChunker {
    pub fn new(max_token_size: usize, overlap_token_size: usize) -> Self {
        Self {
            max_token_size,
            overlap_token_size,
            split_by_character: None,
        }
    }

    fn windows(&self, text: &str, out: &mut Vec<(usize, String)>) {
        let spans = word_spans(text);
        if spans.is_empty() {
            return;
        }
        let step = self.max_token_size - self.overlap_token_size;
        let mut start = 0;
        loop {
            let end = (start + self.max_token_size).min(spans.len());
            let slice = &text[spans[start].0..spans[end - 1].1];
            out.push((end - start, slice.trim().to_string()));
            if end == spans.len() {
                break;
            }
            start += step;
        }
    }
}

impl Chunker for TokenSizeChunker {
    fn chunk(&self, content: &str) -> RagResult<Vec<ChunkPiece>> {
        if self.max_token_size == 0 || self.overlap_token_size >= self.max_token_size {
            return Err(RagError::Validation(format!(
                "invalid chunk sizes: max={} overlap={}",
                self.max_token_size, self.overlap_token_size
            )));
        }
        let mut raw = Vec::new();
        match &self.split_by_character {
            Some(sep) if !sep.is_empty() => {
                for piece in content.split(sep.as_str()) {
                    let piece = piece.trim();
                    if piece.is_empty() {
                        continue;
                    }
                    let tokens = WhitespaceTokenizer.count_tokens(piece);
                    if tokens > self.max_token_size {
                        self.windows(piece, &mut raw);
                    } else {
                        raw.push((tokens, piece.to_string()));
                    }
                }
            }
            _ => self.windows(content, &mut raw),
        }
        Ok(raw
            .into_iter()
            .filter(|(_, text)| !text.is_empty())
            .enumerate()
            .map(|(idx, (tokens, content))| ChunkPiece {
                tokens,
                content,
                chunk_order_index: idx,
            })
            .collect())
    }
}

/// Posiciones en bytes (inicio, fin) de cada palabra.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, idx));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}
