// Copyright 2024 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunked line tokenization of diff inputs.
//!
//! Files are read in [`CHUNK_SIZE`] chunks with one resident chunk per
//! source. Before tokenization, the byte-identical prefix and suffix shared
//! by all sources are located and excluded, which shrinks the problem handed
//! to the diff algorithm. Each remaining line becomes a token hashed by the
//! Adler-32 of its normalized form; equal hashes are confirmed by comparing
//! the actual bytes, re-reading and re-normalizing from disk when a token's
//! chunk is no longer resident.

use std::fs::File;
use std::io::Read;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use crate::adler32::adler32;
use crate::file_util::IoResultExt as _;

use super::DiffError;
use super::DiffOptions;
use super::IgnoreSpace;

/// Files are read in chunks of 128k. There is no support for this number
/// whatsoever; it just needs to be a power of two.
pub(crate) const CHUNK_SHIFT: u32 = 17;
pub(crate) const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

/// Token bytes are re-read from disk in windows of this size during
/// comparison.
const COMPARE_CHUNK_SIZE: usize = 4096;

/// How many lines of identical suffix stay in the token stream so that diff
/// hunks keep their trailing context.
const SUFFIX_LINES_TO_KEEP: u64 = 50;

fn chunk_to_offset(chunk: i64) -> u64 {
    (chunk as u64) << CHUNK_SHIFT
}

fn offset_to_chunk(offset: u64) -> i64 {
    (offset >> CHUNK_SHIFT) as i64
}

fn offset_in_chunk(offset: u64) -> usize {
    (offset & (CHUNK_SIZE as u64 - 1)) as usize
}

/// Carried normalization state; `\r\n` pairs and whitespace runs may span
/// chunk boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum NormalizeState {
    #[default]
    Normal,
    /// A run of ignored whitespace is pending.
    Whitespace,
    /// The previous byte was a `\r` already emitted as `\n`.
    Cr,
}

/// Normalizes `buf` in place according to `options`, returning the
/// normalized length. The normalized bytes land at the front of `buf`;
/// normalization never grows the data.
pub(crate) fn normalize_buffer(
    buf: &mut [u8],
    state: &mut NormalizeState,
    options: &DiffOptions,
) -> usize {
    let mut wpos = 0;
    for rpos in 0..buf.len() {
        let c = buf[rpos];
        match c {
            b' ' | b'\t' => match options.ignore_space {
                IgnoreSpace::All => {
                    *state = NormalizeState::Normal;
                }
                IgnoreSpace::Change => {
                    *state = NormalizeState::Whitespace;
                }
                IgnoreSpace::None => {
                    buf[wpos] = c;
                    wpos += 1;
                    *state = NormalizeState::Normal;
                }
            },
            b'\r' => {
                // Pending whitespace is trailing whitespace; drop it.
                if options.ignore_eol_style {
                    buf[wpos] = b'\n';
                    wpos += 1;
                    *state = NormalizeState::Cr;
                } else {
                    buf[wpos] = b'\r';
                    wpos += 1;
                    *state = NormalizeState::Normal;
                }
            }
            b'\n' => {
                if *state == NormalizeState::Cr && options.ignore_eol_style {
                    // Second half of a \r\n; the \r already emitted the \n.
                    *state = NormalizeState::Normal;
                } else {
                    buf[wpos] = b'\n';
                    wpos += 1;
                    *state = NormalizeState::Normal;
                }
            }
            _ => {
                if *state == NormalizeState::Whitespace {
                    buf[wpos] = b' ';
                    wpos += 1;
                }
                buf[wpos] = c;
                wpos += 1;
                *state = NormalizeState::Normal;
            }
        }
    }
    wpos
}

/// One tokenized line.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Token {
    /// Index of the owning source.
    source: usize,
    /// Raw start offset in the file.
    offset: u64,
    /// Start offset of the normalized bytes (equals `offset`; kept separate
    /// because the comparison paths address normalized data).
    norm_offset: u64,
    /// Length before normalization, terminator included.
    raw_length: u64,
    /// Length after normalization.
    length: u64,
}

/// One input file with its resident chunk.
pub(crate) struct FileSource {
    path: PathBuf,
    file: File,
    size: u64,
    /// Resident chunk index; -1 while a backward scan sits before the file.
    chunk: i64,
    buffer: Vec<u8>,
    /// Position in the resident chunk; `buffer.len()` in the last chunk
    /// means end of file.
    curp: usize,
    normalize_state: NormalizeState,
    suffix_start_chunk: i64,
    suffix_offset_in_chunk: usize,
    suffix_defined: bool,
}

impl FileSource {
    fn open(path: &Path) -> Result<Self, DiffError> {
        let file = File::open(path).context(path)?;
        let size = file.metadata().context(path)?.len();
        let mut source = Self {
            path: path.to_path_buf(),
            file,
            size,
            chunk: 0,
            buffer: Vec::new(),
            curp: 0,
            normalize_state: NormalizeState::Normal,
            suffix_start_chunk: 0,
            suffix_offset_in_chunk: 0,
            suffix_defined: false,
        };
        if size > 0 {
            source.read_chunk(0)?;
        }
        Ok(source)
    }

    fn last_chunk(&self) -> i64 {
        offset_to_chunk(self.size)
    }

    fn chunk_length(&self, chunk: i64) -> usize {
        if chunk == self.last_chunk() {
            offset_in_chunk(self.size)
        } else {
            CHUNK_SIZE
        }
    }

    fn read_chunk(&mut self, chunk: i64) -> Result<(), DiffError> {
        let length = self.chunk_length(chunk);
        self.buffer.resize(length, 0);
        self.file
            .seek(SeekFrom::Start(chunk_to_offset(chunk)))
            .context(&self.path)?;
        self.file
            .read_exact(&mut self.buffer)
            .context(&self.path)?;
        self.chunk = chunk;
        Ok(())
    }

    fn at_eof(&self) -> bool {
        self.curp == self.buffer.len()
    }

    fn byte(&self) -> u8 {
        self.buffer.get(self.curp).copied().unwrap_or(0)
    }

    fn at_suffix(&self) -> bool {
        self.suffix_defined
            && self.chunk == self.suffix_start_chunk
            && self.curp == self.suffix_offset_in_chunk
    }

    /// Extracts the next token, or `None` at end of file or at the start of
    /// the identical suffix. The consumed bytes are normalized in place so
    /// the resident chunk holds normalized data at the token's position.
    fn next_token(
        &mut self,
        source_index: usize,
        options: &DiffOptions,
    ) -> Result<Option<(Token, u32)>, DiffError> {
        if (self.at_eof() && self.chunk == self.last_chunk()) || self.at_suffix() {
            return Ok(None);
        }

        let offset = chunk_to_offset(self.chunk) + self.curp as u64;
        let mut raw_length: u64 = 0;
        let mut length: u64 = 0;
        let mut hash: u32 = 0;
        let mut had_cr = false;

        let token_end = loop {
            let remaining = &self.buffer[self.curp..];
            if let Some(eol) = remaining.iter().position(|&b| b == b'\n' || b == b'\r') {
                had_cr = remaining[eol] == b'\r';
                let mut eol_end = self.curp + eol + 1;
                // Unless the chunk ends in the middle of a possible \r\n
                // sequence, we have the whole terminator.
                if !(had_cr && eol_end == self.buffer.len()) {
                    if had_cr && self.buffer[eol_end] == b'\n' {
                        eol_end += 1;
                    }
                    break eol_end;
                }
            } else {
                had_cr = false;
            }

            if self.chunk == self.last_chunk() {
                break self.buffer.len();
            }

            // The token continues into the next chunk: fold the resident
            // part into the hash, then move on.
            raw_length += (self.buffer.len() - self.curp) as u64;
            let mut state = self.normalize_state;
            let norm_len = normalize_buffer(&mut self.buffer[self.curp..], &mut state, options);
            self.normalize_state = state;
            length += norm_len as u64;
            hash = adler32(hash, &self.buffer[self.curp..self.curp + norm_len]);

            let next_chunk = self.chunk + 1;
            self.read_chunk(next_chunk)?;
            self.curp = 0;

            if had_cr {
                // The previous chunk ended in \r; a leading \n belongs to it.
                break usize::from(self.buffer.first() == Some(&b'\n'));
            }
        };

        raw_length += (token_end - self.curp) as u64;
        // A file whose size is an exact multiple of the chunk size must not
        // produce a trailing empty token. The raw length decides: a line of
        // only ignored characters is still a line.
        if raw_length == 0 {
            return Ok(None);
        }

        let mut state = self.normalize_state;
        let norm_len = normalize_buffer(&mut self.buffer[self.curp..token_end], &mut state, options);
        self.normalize_state = state;
        length += norm_len as u64;
        hash = adler32(hash, &self.buffer[self.curp..self.curp + norm_len]);

        let token = Token {
            source: source_index,
            offset,
            norm_offset: offset,
            raw_length,
            length,
        };
        self.curp = token_end;
        Ok(Some((token, hash)))
    }
}

fn increment_pointers(sources: &mut [FileSource]) -> Result<(), DiffError> {
    for src in sources {
        if src.chunk == -1 {
            src.chunk = 0; // point at the first byte again
        } else if src.curp == src.buffer.len() - 1 {
            if src.chunk == src.last_chunk() {
                src.curp += 1; // curp == buffer length signals end of file
            } else {
                let next = src.chunk + 1;
                src.read_chunk(next)?;
                src.curp = 0;
            }
        } else {
            src.curp += 1;
        }
    }
    Ok(())
}

fn decrement_pointers(sources: &mut [FileSource]) -> Result<(), DiffError> {
    for src in sources {
        if src.curp == 0 {
            if src.chunk == 0 {
                src.chunk = -1; // signals beginning of file
            } else {
                let prev = src.chunk - 1;
                src.read_chunk(prev)?;
                src.curp = src.buffer.len() - 1;
            }
        } else {
            src.curp -= 1;
        }
    }
    Ok(())
}

fn is_one_at_bof(sources: &[FileSource]) -> bool {
    sources.iter().any(|src| src.chunk == -1)
}

fn is_one_at_eof(sources: &[FileSource]) -> bool {
    sources.iter().any(FileSource::at_eof)
}

fn all_match(sources: &[FileSource]) -> bool {
    let first = sources[0].byte();
    sources[1..].iter().all(|src| src.byte() == first)
}

/// Advances all sources past their common prefix, aligned to whole lines,
/// and counts the prefix lines. Returns `(reached_one_eof, prefix_lines)`.
fn find_identical_prefix(sources: &mut [FileSource]) -> Result<(bool, u64), DiffError> {
    let mut prefix_lines: u64 = 0;
    let mut had_cr = false;
    let mut reached_one_eof = false;

    while all_match(sources) {
        let byte = sources[0].byte();
        if byte == b'\r' {
            prefix_lines += 1;
            had_cr = true;
        } else if byte == b'\n' && !had_cr {
            prefix_lines += 1;
            had_cr = false;
        } else {
            had_cr = false;
        }

        increment_pointers(sources)?;
        reached_one_eof = is_one_at_eof(sources);
        if reached_one_eof {
            break;
        }
    }

    if sources.iter().all(FileSource::at_eof) {
        // Fully identical inputs.
        return Ok((reached_one_eof, prefix_lines));
    }

    if had_cr {
        // We may have stopped in the middle of a \r\n in one file while
        // another has a bare \r: back off the \r so the whole line is
        // rescanned, and take back its line count.
        let ended_at_nonmatching_newline = sources
            .iter()
            .any(|src| !src.at_eof() && src.byte() == b'\n');
        if ended_at_nonmatching_newline {
            prefix_lines -= 1;
            decrement_pointers(sources)?;
        }
    }

    // Back up to the last end-of-line so the prefix holds whole lines only.
    decrement_pointers(sources)?;
    while !is_one_at_bof(sources) && sources[0].byte() != b'\n' && sources[0].byte() != b'\r' {
        decrement_pointers(sources)?;
    }
    increment_pointers(sources)?;

    Ok((reached_one_eof, prefix_lines))
}

/// Finds the identical suffix, records where it starts in every source, and
/// returns the number of suffix lines (those beyond the kept overlap).
fn find_identical_suffix(sources: &mut [FileSource]) -> Result<u64, DiffError> {
    // Scan on separate states so the main positions stay at the prefix end.
    let mut suffix: Vec<FileSource> = Vec::with_capacity(sources.len());
    for src in &*sources {
        let mut chunk = src.last_chunk();
        if src.chunk_length(chunk) == 0 {
            chunk -= 1;
        }
        let mut state = FileSource {
            path: src.path.clone(),
            file: src.file.try_clone().context(&src.path)?,
            size: src.size,
            chunk,
            buffer: Vec::new(),
            curp: 0,
            normalize_state: NormalizeState::Normal,
            suffix_start_chunk: 0,
            suffix_offset_in_chunk: 0,
            suffix_defined: false,
        };
        state.read_chunk(chunk)?;
        state.curp = state.buffer.len() - 1;
        suffix.push(state);
    }

    // Where backward scanning must stop for source 0: at the prefix end,
    // compensated when other files are smaller.
    let mut suffix_min_chunk0 = sources[0].chunk;
    let mut suffix_min_offset0 = sources[0].curp as u64;
    let min_file_size = sources.iter().map(|src| src.size).min().unwrap();
    if sources[0].size > min_file_size {
        let excess = sources[0].size - min_file_size;
        suffix_min_chunk0 += (excess / CHUNK_SIZE as u64) as i64;
        suffix_min_offset0 += excess % CHUNK_SIZE as u64;
    }

    while all_match(&suffix) {
        decrement_pointers(&mut suffix)?;
        let reached_prefix = suffix[0].chunk == suffix_min_chunk0
            && suffix[0].curp as u64 == suffix_min_offset0;
        if reached_prefix || is_one_at_bof(&suffix) {
            break;
        }
    }

    // Step onto the first byte of the identical run.
    increment_pointers(&mut suffix)?;

    // Slide forward to the next end-of-line so the suffix holds whole lines,
    // then leave SUFFIX_LINES_TO_KEEP more lines in the token stream for
    // hunk context.
    let mut lines_to_keep = SUFFIX_LINES_TO_KEEP;
    loop {
        while !is_one_at_eof(&suffix) && suffix[0].byte() != b'\n' && suffix[0].byte() != b'\r' {
            increment_pointers(&mut suffix)?;
        }
        if !is_one_at_eof(&suffix) && suffix[0].byte() == b'\r' {
            increment_pointers(&mut suffix)?;
        }
        if !is_one_at_eof(&suffix) && suffix[0].byte() == b'\n' {
            increment_pointers(&mut suffix)?;
        }
        if is_one_at_eof(&suffix) || lines_to_keep == 0 {
            break;
        }
        lines_to_keep -= 1;
    }

    for (src, state) in sources.iter_mut().zip(&suffix) {
        src.suffix_start_chunk = state.chunk;
        src.suffix_offset_in_chunk = state.curp;
        src.suffix_defined = true;
    }

    let suffix_start = chunk_to_offset(suffix[0].chunk) + suffix[0].curp as u64;
    count_lines_from(&sources[0], suffix_start)
}

/// Counts the lines in `[start, EOF)`; an unterminated trailing line counts.
fn count_lines_from(src: &FileSource, start: u64) -> Result<u64, DiffError> {
    if start >= src.size {
        return Ok(0);
    }
    let mut file = src.file.try_clone().context(&src.path)?;
    file.seek(SeekFrom::Start(start)).context(&src.path)?;
    let mut lines = 0;
    let mut last = 0u8;
    let mut prev_cr = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).context(&src.path)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            match b {
                b'\n' => {
                    if !prev_cr {
                        lines += 1;
                    }
                    prev_cr = false;
                }
                b'\r' => {
                    lines += 1;
                    prev_cr = true;
                }
                _ => prev_cr = false,
            }
            last = b;
        }
    }
    if last != b'\n' && last != b'\r' {
        lines += 1;
    }
    Ok(lines)
}

/// Confirms the equality of two tokens whose normalized lengths and hashes
/// already agree. When both tokens start in their source's resident chunk
/// the (already normalized) buffers are compared directly; otherwise the
/// bytes are re-read from disk and re-normalized on the fly.
fn tokens_equal(
    sources: &[FileSource],
    a: &Token,
    b: &Token,
    options: &DiffOptions,
) -> Result<bool, DiffError> {
    debug_assert_eq!(a.length, b.length);
    let total_length = a.length;
    if total_length == 0 {
        return Ok(true);
    }

    struct Side<'s> {
        src: &'s FileSource,
        buf: Vec<u8>,
        /// Normalized bytes available for comparison.
        avail: std::ops::Range<usize>,
        in_memory: bool,
        offset: u64,
        raw_remaining: u64,
        state: NormalizeState,
    }

    let mut sides = [a, b].map(|token| {
        let src = &sources[token.source];
        let in_memory = offset_to_chunk(token.norm_offset) == src.chunk;
        Side {
            src,
            buf: Vec::new(),
            avail: 0..0,
            in_memory,
            offset: token.norm_offset,
            raw_remaining: if in_memory { 0 } else { token.raw_length },
            state: NormalizeState::Normal,
        }
    });

    for (side, token) in sides.iter_mut().zip([a, b]) {
        if side.in_memory {
            // The resident chunk holds the normalized token in place.
            let start = offset_in_chunk(token.norm_offset);
            side.avail = start..start + total_length as usize;
        }
    }

    fn visible<'a>(side: &'a Side<'_>, len: usize) -> &'a [u8] {
        let range = side.avail.start..side.avail.start + len;
        if side.in_memory {
            &side.src.buffer[range]
        } else {
            &side.buf[range]
        }
    }

    let mut remaining = total_length as usize;
    while remaining > 0 {
        for side in &mut sides {
            if side.avail.is_empty() && !side.in_memory {
                // An empty raw remainder here means the file shrank under
                // us; bail out rather than loop forever.
                if side.raw_remaining == 0 {
                    return Err(DiffError::DatasourceModified {
                        path: side.src.path.clone(),
                    });
                }
                let len = (side.raw_remaining as usize).min(COMPARE_CHUNK_SIZE);
                side.buf.resize(len, 0);
                let mut file = side.src.file.try_clone().context(&side.src.path)?;
                file.seek(SeekFrom::Start(side.offset)).context(&side.src.path)?;
                file.read_exact(&mut side.buf).context(&side.src.path)?;
                side.offset += len as u64;
                side.raw_remaining -= len as u64;
                let mut state = side.state;
                let norm_len = normalize_buffer(&mut side.buf, &mut state, options);
                side.state = state;
                side.avail = 0..norm_len;
            }
        }
        let len = sides
            .iter()
            .map(|side| side.avail.len())
            .min()
            .unwrap()
            .min(remaining);
        if len == 0 {
            // One side produced no normalized bytes this round; try again
            // with the next raw window.
            continue;
        }
        if visible(&sides[0], len) != visible(&sides[1], len) {
            return Ok(false);
        }
        for side in &mut sides {
            side.avail.start += len;
        }
        remaining -= len;
    }
    Ok(true)
}

/// The classified token streams of a set of input files.
pub(crate) struct TokenizedFiles {
    /// One class-id sequence per source, in input order.
    pub class_sequences: Vec<Vec<u32>>,
    pub prefix_lines: u64,
    pub suffix_lines: u64,
}

/// Opens and tokenizes 2-4 files, assigning equal lines the same class id.
pub(crate) fn tokenize_files(
    paths: &[&Path],
    options: &DiffOptions,
) -> Result<TokenizedFiles, DiffError> {
    let mut sources = paths
        .iter()
        .map(|path| FileSource::open(path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut prefix_lines = 0;
    let mut suffix_lines = 0;
    if sources.iter().all(|src| src.size > 0) {
        let (reached_one_eof, prefix) = find_identical_prefix(&mut sources)?;
        prefix_lines = prefix;
        if !reached_one_eof {
            suffix_lines = find_identical_suffix(&mut sources)?;
        }
    }

    // Classify tokens across all sources: equal hash and length nominate a
    // class, byte comparison confirms it.
    let mut classes: std::collections::HashMap<(u64, u32), Vec<(Token, u32)>> =
        std::collections::HashMap::new();
    let mut next_class = 0u32;
    let mut class_sequences = vec![Vec::new(); sources.len()];

    for index in 0..sources.len() {
        while let Some((token, hash)) = sources[index].next_token(index, options)? {
            let candidates = classes.entry((token.length, hash)).or_default();
            let mut class_id = None;
            for (candidate, id) in candidates.iter() {
                if tokens_equal(&sources, &token, candidate, options)? {
                    class_id = Some(*id);
                    break;
                }
            }
            let class_id = match class_id {
                Some(id) => id,
                None => {
                    let id = next_class;
                    next_class += 1;
                    classes.get_mut(&(token.length, hash)).unwrap().push((token, id));
                    id
                }
            };
            class_sequences[index].push(class_id);
        }
    }

    Ok(TokenizedFiles {
        class_sequences,
        prefix_lines,
        suffix_lines,
    })
}
