//! Structure-aware text chunker with overlap.
//!
//! Normalized text is cut into *blocks* at paragraph breaks (soft cuts) and
//! at headings or caller-supplied boundaries such as code definitions (hard
//! cuts). Blocks are packed greedily into *cores* of at most
//! `target_size - overlap` bytes; a hard cut always starts a new core. A
//! block larger than a core is split at the last sentence end, then line
//! break, then space, and only then at a raw character boundary.
//!
//! Each chunk is its core prefixed with up to `overlap` bytes taken from the
//! end of the previous core:
//!
//! ```text
//! text:    [ core 0 ][ core 1 ][ core 2 ]
//! chunk 0: [ core 0 ]
//! chunk 1:     [ ov ][ core 1 ]
//! chunk 2:               [ ov ][ core 2 ]
//! ```
//!
//! Cores partition the text, so dropping each chunk's overlap prefix and
//! concatenating gives back the input exactly. Sizes are UTF-8 bytes and
//! cuts always fall on character boundaries.

/// A passage of the normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub position: usize,
    /// Byte offset where the chunk (including overlap) starts.
    pub start: usize,
    /// Byte offset where this chunk's own content starts.
    pub core_start: usize,
    pub end: usize,
    pub text: String,
}

impl TextChunk {
    pub fn overlap_len(&self) -> usize {
        self.core_start - self.start
    }

    /// The chunk without its overlap prefix.
    pub fn core(&self) -> &str {
        &self.text[self.overlap_len()..]
    }
}

/// Smallest honoured `target_size`: the widest UTF-8 character.
pub const MIN_TARGET_SIZE: usize = 4;

/// Split `text` into chunks of at most `target_size` bytes. A
/// `target_size` below [`MIN_TARGET_SIZE`] is raised to it.
pub fn chunk(text: &str, target_size: usize, overlap: usize) -> Vec<TextChunk> {
    chunk_with_boundaries(text, target_size, overlap, &[])
}

/// Like [`chunk`], additionally starting a new chunk at every offset in
/// `boundaries`.
pub fn chunk_with_boundaries(
    text: &str,
    target_size: usize,
    overlap: usize,
    boundaries: &[usize],
) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let target_size = target_size.max(MIN_TARGET_SIZE);
    let overlap = overlap
        .min(target_size / 2)
        .min(target_size - MIN_TARGET_SIZE);
    let core_limit = target_size - overlap;

    let cores = pack_cores(text, core_limit, &structural_cuts(text, boundaries));

    let mut chunks = Vec::with_capacity(cores.len());
    let mut prev_core_start = 0usize;
    for (position, (core_start, end)) in cores.into_iter().enumerate() {
        let start = if position == 0 || overlap == 0 {
            core_start
        } else {
            overlap_start(text, prev_core_start, core_start, overlap)
        };
        chunks.push(TextChunk {
            position,
            start,
            core_start,
            end,
            text: text[start..end].to_string(),
        });
        prev_core_start = core_start;
    }
    chunks
}

/// Concatenate chunk cores.
pub fn reconstruct(chunks: &[TextChunk]) -> String {
    chunks.iter().map(|c| c.core()).collect()
}

/// Block start offsets with whether each is a hard cut.
fn structural_cuts(text: &str, boundaries: &[usize]) -> Vec<(usize, bool)> {
    let mut cuts: Vec<(usize, bool)> = Vec::new();
    let bytes = text.as_bytes();
    let mut line_start = 0usize;
    while line_start < bytes.len() {
        let line_end = text[line_start..]
            .find('\n')
            .map(|i| line_start + i + 1)
            .unwrap_or(bytes.len());
        let line = &text[line_start..line_end];
        if line_start > 0 {
            if is_heading(line) {
                cuts.push((line_start, true));
            } else if line_start >= 2 && &bytes[line_start - 2..line_start] == b"\n\n" {
                cuts.push((line_start, false));
            }
        }
        line_start = line_end;
    }
    for &b in boundaries {
        if b > 0 && b < text.len() && text.is_char_boundary(b) {
            cuts.push((b, true));
        }
    }
    cuts.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    cuts.dedup_by_key(|c| c.0);
    cuts
}

fn is_heading(line: &str) -> bool {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn pack_cores(text: &str, limit: usize, cuts: &[(usize, bool)]) -> Vec<(usize, usize)> {
    let mut blocks: Vec<(usize, usize, bool)> = Vec::with_capacity(cuts.len() + 1);
    let mut prev = 0usize;
    let mut prev_hard = false;
    for &(at, hard) in cuts {
        blocks.push((prev, at, prev_hard));
        prev = at;
        prev_hard = hard;
    }
    blocks.push((prev, text.len(), prev_hard));

    let mut cores = Vec::new();
    let mut cur_start = 0usize;
    let mut cur_end = 0usize;
    for (bs, be, hard) in blocks {
        if cur_end > cur_start && (hard || be - cur_start > limit) {
            cores.push((cur_start, cur_end));
            cur_start = bs;
        }
        if be - cur_start > limit {
            // Oversized block: emit full windows, keep the tail open.
            let mut pos = cur_start;
            while be - pos > limit {
                let cut = window_cut(text, pos, limit);
                cores.push((pos, cut));
                pos = cut;
            }
            cur_start = pos;
        }
        cur_end = be;
    }
    if cur_end > cur_start {
        cores.push((cur_start, cur_end));
    }
    cores
}

/// End of a window of at most `limit` bytes starting at `pos`, preferring
/// sentence, line and word boundaries in the second half of the window.
fn window_cut(text: &str, pos: usize, limit: usize) -> usize {
    let mut hard = pos + limit;
    while !text.is_char_boundary(hard) {
        hard -= 1;
    }
    let window = &text[pos..hard];
    let half = limit / 2;

    let sentence = ['.', '!', '?']
        .iter()
        .filter_map(|p| {
            window
                .match_indices(*p)
                .map(|(i, _)| i + 1)
                .filter(|&i| i < window.len() && window.as_bytes()[i].is_ascii_whitespace())
                .last()
        })
        .max()
        .map(|i| i + 1);
    let line = window.rfind('\n').map(|i| i + 1);
    let word = window.rfind(' ').map(|i| i + 1);

    for candidate in [sentence, line, word].into_iter().flatten() {
        if candidate > half && candidate < window.len() + 1 {
            return pos + candidate;
        }
    }
    if hard > pos {
        hard
    } else {
        // A single character wider than the window.
        let mut next = pos + 1;
        while !text.is_char_boundary(next) {
            next += 1;
        }
        next
    }
}

/// Start of the overlap region for a core beginning at `core_start`,
/// within the previous core and aligned to a word when one is available.
fn overlap_start(text: &str, prev_core_start: usize, core_start: usize, overlap: usize) -> usize {
    let mut start = core_start.saturating_sub(overlap).max(prev_core_start);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let region = &text[start..core_start];
    if start > prev_core_start {
        if let Some(space) = region.find(char::is_whitespace) {
            let aligned = start + space + 1;
            if aligned < core_start && text.is_char_boundary(aligned) {
                return aligned;
            }
        }
    }
    start
}
