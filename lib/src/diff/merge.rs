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

//! Three-way merge rendering with conflict markers.
//!
//! Unchanged and cleanly merged regions are emitted from the *modified*
//! source; conflicts are wrapped in `<<<<<<<`/`|||||||`/`=======`/`>>>>>>>`
//! markers in one of several styles. The `only_conflicts` style suppresses
//! everything but the conflicts themselves plus a three-line context halo,
//! separating distant conflict groups with `@@` lines.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::file_util::IoResultExt as _;

use super::ChunkKind;
use super::Diff;
use super::DiffChunk;
use super::DiffError;
use super::LineRange;
use super::unified::CONTEXT_SIZE;

/// How conflicts are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictDisplayStyle {
    /// Modified and latest, separated by markers.
    #[default]
    ModifiedLatest,
    /// Like `ModifiedLatest`, with the original wedged in between.
    ModifiedOriginalLatest,
    /// Only the modified side, no markers.
    Modified,
    /// Only the latest side, no markers.
    Latest,
    /// Replay a conflict's resolution when a four-way diff found one; fall
    /// back to `ModifiedLatest` otherwise.
    ResolvedModifiedLatest,
    /// Just the conflicts with a three-line context halo.
    OnlyConflicts,
}

/// Options for [`write_merge`]. Marker labels default to
/// `<<<<<<< <modified path>` and friends.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOptions<'a> {
    pub style: ConflictDisplayStyle,
    pub conflict_original: Option<&'a str>,
    pub conflict_modified: Option<&'a str>,
    pub conflict_latest: Option<&'a str>,
    pub conflict_separator: Option<&'a str>,
}

/// Renders the merge described by a three-way `diff` of the given files.
pub fn write_merge<W: Write>(
    output: &mut W,
    diff: &Diff,
    original_path: &Path,
    modified_path: &Path,
    latest_path: &Path,
    options: &MergeOptions<'_>,
) -> Result<(), DiffError> {
    let buffers = [
        fs::read(original_path).context(original_path)?,
        fs::read(modified_path).context(modified_path)?,
        fs::read(latest_path).context(latest_path)?,
    ];

    // Conflict markers use the modified file's end-of-line style, falling
    // back to the platform default when it has no newlines at all.
    let marker_eol = detect_eol(&buffers[1]).unwrap_or(if cfg!(windows) { "\r\n" } else { "\n" });

    let default_modified = format!("<<<<<<< {}", modified_path.display());
    let default_original = format!("||||||| {}", original_path.display());
    let default_latest = format!(">>>>>>> {}", latest_path.display());
    let markers = Markers {
        modified: options.conflict_modified.unwrap_or(&default_modified),
        original: options.conflict_original.unwrap_or(&default_original),
        separator: options.conflict_separator.unwrap_or("======="),
        latest: options.conflict_latest.unwrap_or(&default_latest),
        eol: marker_eol,
    };

    let mut state = MergeOutput {
        output,
        buffers,
        curp: [0; 3],
        current_line: [0; 3],
        markers,
        style: options.style,
        sink: if options.style == ConflictDisplayStyle::OnlyConflicts {
            Sink::saving()
        } else {
            Sink::Direct
        },
    };
    state.output_chunks(diff.chunks())
}

fn detect_eol(buffer: &[u8]) -> Option<&'static str> {
    let pos = buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;
    Some(if buffer[pos] == b'\n' {
        "\n"
    } else if buffer.get(pos + 1) == Some(&b'\n') {
        "\r\n"
    } else {
        "\r"
    })
}

struct Markers<'a> {
    modified: &'a str,
    original: &'a str,
    separator: &'a str,
    latest: &'a str,
    eol: &'a str,
}

/// Where content lines currently go: straight out, into the leading-context
/// ring, or counted down as trailing context.
enum Sink {
    Direct,
    Saving {
        lines: VecDeque<Vec<u8>>,
        total_written: u64,
    },
    Trailing(u64),
}

impl Sink {
    fn saving() -> Self {
        Self::Saving {
            lines: VecDeque::new(),
            total_written: 0,
        }
    }
}

struct MergeOutput<'a, W> {
    output: &'a mut W,
    /// original, modified, latest.
    buffers: [Vec<u8>; 3],
    curp: [usize; 3],
    current_line: [u64; 3],
    markers: Markers<'a>,
    style: ConflictDisplayStyle,
    sink: Sink,
}

impl<W: Write> MergeOutput<'_, W> {
    fn output_chunks(&mut self, chunks: &[DiffChunk]) -> Result<(), DiffError> {
        for chunk in chunks {
            match chunk.kind {
                ChunkKind::Common | ChunkKind::DiffCommon | ChunkKind::Modified => {
                    self.output_hunk(1, chunk.modified, false)?;
                }
                ChunkKind::Latest => self.output_hunk(2, chunk.latest, false)?,
                ChunkKind::Conflict => self.output_conflict(chunk)?,
            }
        }
        Ok(())
    }

    /// Emits one line of `buffers[idx]`, or just advances past it when
    /// `skip` is set. The line counter advances even at end of data.
    fn output_line(&mut self, idx: usize, skip: bool) -> Result<(), DiffError> {
        self.current_line[idx] += 1;
        let buffer = &self.buffers[idx];
        let pos = self.curp[idx];
        if pos >= buffer.len() {
            return Ok(());
        }
        let end = match buffer[pos..].iter().position(|&b| b == b'\n' || b == b'\r') {
            None => buffer.len(),
            Some(eol) => {
                let mut end = pos + eol + 1;
                if buffer[pos + eol] == b'\r' && buffer.get(end) == Some(&b'\n') {
                    end += 1;
                }
                end
            }
        };
        self.curp[idx] = end;
        if !skip {
            let line = self.buffers[idx][pos..end].to_vec();
            self.write_line(&line)?;
        }
        Ok(())
    }

    fn output_hunk(&mut self, idx: usize, range: LineRange, skip: bool) -> Result<(), DiffError> {
        while self.current_line[idx] < range.start {
            self.output_line(idx, true)?;
        }
        while self.current_line[idx] < range.end() {
            self.output_line(idx, skip)?;
        }
        Ok(())
    }

    /// Routes one content line through the current sink.
    fn write_line(&mut self, line: &[u8]) -> Result<(), DiffError> {
        match &mut self.sink {
            Sink::Direct => self.output.write_all(line).map_err(DiffError::Output),
            Sink::Saving {
                lines,
                total_written,
            } => {
                lines.push_back(line.to_vec());
                if lines.len() > CONTEXT_SIZE as usize {
                    lines.pop_front();
                }
                *total_written += 1;
                Ok(())
            }
            Sink::Trailing(remaining) => {
                self.output.write_all(line).map_err(DiffError::Output)?;
                *remaining -= 1;
                if *remaining == 0 {
                    self.sink = Sink::saving();
                }
                Ok(())
            }
        }
    }

    fn write_marker(&mut self, text: &str) -> Result<(), DiffError> {
        self.output.write_all(text.as_bytes()).map_err(DiffError::Output)?;
        self.output
            .write_all(self.markers.eol.as_bytes())
            .map_err(DiffError::Output)
    }

    /// Marker plus the one-based `(line)` or `(line,count)` range used in
    /// conflicts-only output.
    fn write_marker_with_range(&mut self, text: &str, range: LineRange) -> Result<(), DiffError> {
        let annotated = if range.len == 1 {
            format!("{text} ({})", range.start + 1)
        } else {
            format!("{text} ({},{})", range.start + 1, range.len)
        };
        self.write_marker(&annotated)
    }

    fn output_conflict(&mut self, chunk: &DiffChunk) -> Result<(), DiffError> {
        let mut style = self.style;
        if style == ConflictDisplayStyle::OnlyConflicts {
            return self.output_conflict_with_context(chunk);
        }
        if style == ConflictDisplayStyle::ResolvedModifiedLatest {
            match &chunk.resolved {
                Some(resolved) => return self.output_chunks(resolved),
                None => style = ConflictDisplayStyle::ModifiedLatest,
            }
        }

        match style {
            ConflictDisplayStyle::ModifiedLatest
            | ConflictDisplayStyle::ModifiedOriginalLatest => {
                let markers = &self.markers;
                let (modified, original, separator, latest) = (
                    markers.modified,
                    markers.original,
                    markers.separator,
                    markers.latest,
                );
                self.write_marker(modified)?;
                self.output_hunk(1, chunk.modified, false)?;
                if style == ConflictDisplayStyle::ModifiedOriginalLatest {
                    self.write_marker(original)?;
                    self.output_hunk(0, chunk.original, false)?;
                }
                self.write_marker(separator)?;
                self.output_hunk(2, chunk.latest, false)?;
                self.write_marker(latest)?;
            }
            ConflictDisplayStyle::Modified => self.output_hunk(1, chunk.modified, false)?,
            ConflictDisplayStyle::Latest => self.output_hunk(2, chunk.latest, false)?,
            ConflictDisplayStyle::ResolvedModifiedLatest
            | ConflictDisplayStyle::OnlyConflicts => unreachable!("handled above"),
        }
        Ok(())
    }

    fn output_conflict_with_context(&mut self, chunk: &DiffChunk) -> Result<(), DiffError> {
        // If we are still saving leading context, flush it; an `@@` line
        // separates this conflict group from a distant previous one.
        if let Sink::Saving {
            lines,
            total_written,
        } = &mut self.sink
        {
            if *total_written > CONTEXT_SIZE {
                self.output.write_all(b"@@\n").map_err(DiffError::Output)?;
            }
            for line in std::mem::take(lines) {
                self.output.write_all(&line).map_err(DiffError::Output)?;
            }
        }
        self.sink = Sink::Direct;

        let markers = &self.markers;
        let (modified, original, separator, latest) = (
            markers.modified,
            markers.original,
            markers.separator,
            markers.latest,
        );
        self.write_marker_with_range(modified, chunk.modified)?;
        self.output_hunk(1, chunk.modified, false)?;
        self.write_marker_with_range(original, chunk.original)?;
        self.output_hunk(0, chunk.original, false)?;
        self.write_marker(separator)?;
        self.output_hunk(2, chunk.latest, false)?;
        self.write_marker_with_range(latest, chunk.latest)?;

        // Print three lines of trailing context, then go back to saving.
        self.sink = Sink::Trailing(CONTEXT_SIZE);
        Ok(())
    }
}
