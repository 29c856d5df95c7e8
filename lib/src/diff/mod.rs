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

//! Line-granular comparison of two, three or four text files.
//!
//! Inputs are tokenized into lines ([`source`]), reduced to class-id
//! sequences, and compared with an LCS pass ([`lcs`]). The result is a list
//! of [`DiffChunk`]s covering every line of every input: runs common to all
//! sources, runs changed on one side, runs changed identically on both
//! sides, and conflicts. [`unified`] renders two-way results as a unified
//! diff; [`merge`] renders three-way results with conflict markers.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::file_util::PathError;

pub mod merge;
mod lcs;
mod source;
pub mod unified;

use lcs::CommonRange;
use lcs::common_ranges;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Invalid argument '{0}' in diff options")]
    InvalidOption(String),
    #[error("The file '{}' changed unexpectedly during diff", path.display())]
    DatasourceModified { path: PathBuf },
    #[error("Path '{path}' must be an immediate child of the directory '{dir}'")]
    BadRelativePath { path: String, dir: String },
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Output(std::io::Error),
}

/// Whitespace treatment during comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IgnoreSpace {
    #[default]
    None,
    /// Runs of spaces and tabs compare as a single space; trailing
    /// whitespace is ignored. Presence is still distinguished from absence.
    Change,
    /// Spaces and tabs are ignored entirely.
    All,
}

/// Options accepted by the file diff functions.
#[derive(Clone, Debug, Default)]
pub struct DiffOptions {
    pub ignore_space: IgnoreSpace,
    /// Any of `\n`, `\r`, `\r\n` compare as the same line terminator.
    pub ignore_eol_style: bool,
    /// Annotate unified diff hunks with the enclosing C function.
    pub show_c_function: bool,
}

impl DiffOptions {
    /// Parses a GNU-diff-compatible argument list: `-b`/`--ignore-space-change`,
    /// `-w`/`--ignore-all-space`, `--ignore-eol-style`,
    /// `-p`/`--show-c-function`, and an accepted-but-ignored `-u`/`--unified`.
    /// Anything else is an invalid diff option.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, DiffError> {
        let mut options = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg {
                "--ignore-space-change" => options.apply_short_flag('b'),
                "--ignore-all-space" => options.apply_short_flag('w'),
                "--ignore-eol-style" => options.ignore_eol_style = true,
                "--show-c-function" => options.show_c_function = true,
                "--unified" => {}
                _ if arg.len() > 1 && arg.starts_with('-') && !arg.starts_with("--") => {
                    for flag in arg[1..].chars() {
                        if !matches!(flag, 'b' | 'w' | 'p' | 'u') {
                            return Err(DiffError::InvalidOption(arg.to_owned()));
                        }
                        options.apply_short_flag(flag);
                    }
                }
                _ => return Err(DiffError::InvalidOption(arg.to_owned())),
            }
        }
        Ok(options)
    }

    fn apply_short_flag(&mut self, flag: char) {
        match flag {
            // -w takes precedence over -b.
            'b' => {
                if self.ignore_space == IgnoreSpace::None {
                    self.ignore_space = IgnoreSpace::Change;
                }
            }
            'w' => self.ignore_space = IgnoreSpace::All,
            'p' => self.show_c_function = true,
            'u' => {}
            _ => unreachable!("caller validates flags"),
        }
    }
}

/// A run of lines, 0-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineRange {
    pub start: u64,
    pub len: u64,
}

impl LineRange {
    fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// How a chunk's sources relate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// All sources agree.
    Common,
    /// Only the modified source changed.
    Modified,
    /// Only the latest source changed.
    Latest,
    /// Modified and latest changed in the same way.
    DiffCommon,
    /// Modified and latest changed incompatibly.
    Conflict,
}

/// One contiguous region of the diff result. Every line of every input is
/// covered by exactly one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffChunk {
    pub kind: ChunkKind,
    pub original: LineRange,
    pub modified: LineRange,
    pub latest: LineRange,
    /// For four-way diffs: a conflict that turns out to be an ordinary merge
    /// when viewed against the ancestor carries its resolution here.
    pub resolved: Option<Vec<DiffChunk>>,
}

impl DiffChunk {
    fn plain(kind: ChunkKind, original: LineRange, modified: LineRange, latest: LineRange) -> Self {
        Self {
            kind,
            original,
            modified,
            latest,
            resolved: None,
        }
    }
}

/// The result of comparing 2-4 files.
#[derive(Clone, Debug, Default)]
pub struct Diff {
    chunks: Vec<DiffChunk>,
}

impl Diff {
    pub fn chunks(&self) -> &[DiffChunk] {
        &self.chunks
    }

    /// Whether anything differs at all.
    pub fn contains_diffs(&self) -> bool {
        self.chunks.iter().any(|c| c.kind != ChunkKind::Common)
    }

    pub fn contains_conflicts(&self) -> bool {
        self.chunks.iter().any(|c| c.kind == ChunkKind::Conflict)
    }

    fn push(&mut self, chunk: DiffChunk) {
        if chunk.original.len == 0 && chunk.modified.len == 0 && chunk.latest.len == 0 {
            return;
        }
        // Merge adjacent common runs.
        if chunk.kind == ChunkKind::Common
            && let Some(last) = self.chunks.last_mut()
            && last.kind == ChunkKind::Common
            && last.original.end() == chunk.original.start
            && last.modified.end() == chunk.modified.start
            && last.latest.end() == chunk.latest.start
        {
            last.original.len += chunk.original.len;
            last.modified.len += chunk.modified.len;
            last.latest.len += chunk.latest.len;
            return;
        }
        self.chunks.push(chunk);
    }
}

/// Compares two files, labeled *original* and *modified*.
pub fn file_diff(
    original: &Path,
    modified: &Path,
    options: &DiffOptions,
) -> Result<Diff, DiffError> {
    let tokens = source::tokenize_files(&[original, modified], options)?;
    let [o, m] = &tokens.class_sequences[..] else {
        unreachable!()
    };
    let matches = common_ranges(o, m);
    Ok(build_two_way(
        &matches,
        o.len(),
        m.len(),
        tokens.prefix_lines,
        tokens.suffix_lines,
    ))
}

fn build_two_way(
    matches: &[CommonRange],
    len_o: usize,
    len_m: usize,
    prefix: u64,
    suffix: u64,
) -> Diff {
    let mut diff = Diff::default();
    let common =
        |o: u64, m: u64, len: u64| DiffChunk::plain(
            ChunkKind::Common,
            LineRange::new(o, len),
            LineRange::new(m, len),
            LineRange::default(),
        );
    if prefix > 0 {
        diff.push(common(0, 0, prefix));
    }
    let mut o_pos = 0;
    let mut m_pos = 0;
    for range in matches {
        if range.a > o_pos || range.b > m_pos {
            diff.push(DiffChunk::plain(
                ChunkKind::Modified,
                LineRange::new(prefix + o_pos as u64, (range.a - o_pos) as u64),
                LineRange::new(prefix + m_pos as u64, (range.b - m_pos) as u64),
                LineRange::default(),
            ));
        }
        diff.push(common(
            prefix + range.a as u64,
            prefix + range.b as u64,
            range.len as u64,
        ));
        o_pos = range.a_end();
        m_pos = range.b_end();
    }
    if len_o > o_pos || len_m > m_pos {
        diff.push(DiffChunk::plain(
            ChunkKind::Modified,
            LineRange::new(prefix + o_pos as u64, (len_o - o_pos) as u64),
            LineRange::new(prefix + m_pos as u64, (len_m - m_pos) as u64),
            LineRange::default(),
        ));
    }
    if suffix > 0 {
        diff.push(common(prefix + len_o as u64, prefix + len_m as u64, suffix));
    }
    diff
}

/// A run of original tokens matched (identically placed) in both the
/// modified and latest sequences.
#[derive(Clone, Copy, Debug)]
struct StableRange {
    o: usize,
    m: usize,
    l: usize,
    len: usize,
}

fn intersect_commons(cm: &[CommonRange], cl: &[CommonRange]) -> Vec<StableRange> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut j = 0;
    while i < cm.len() && j < cl.len() {
        let lo = cm[i].a.max(cl[j].a);
        let hi = cm[i].a_end().min(cl[j].a_end());
        if lo < hi {
            out.push(StableRange {
                o: lo,
                m: cm[i].b + (lo - cm[i].a),
                l: cl[j].b + (lo - cl[j].a),
                len: hi - lo,
            });
        }
        // Advance whichever common run ends first.
        if cm[i].a_end() <= cl[j].a_end() {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// Compares three files: *original* against *modified* and *latest*.
pub fn file_diff3(
    original: &Path,
    modified: &Path,
    latest: &Path,
    options: &DiffOptions,
) -> Result<Diff, DiffError> {
    let tokens = source::tokenize_files(&[original, modified, latest], options)?;
    let [o, m, l] = &tokens.class_sequences[..] else {
        unreachable!()
    };
    Ok(build_three_way(
        o,
        m,
        l,
        tokens.prefix_lines,
        tokens.suffix_lines,
        0,
        0,
        0,
    ))
}

#[expect(clippy::too_many_arguments)]
fn build_three_way(
    o: &[u32],
    m: &[u32],
    l: &[u32],
    prefix: u64,
    suffix: u64,
    o_base: u64,
    m_base: u64,
    l_base: u64,
) -> Diff {
    let matches_om = common_ranges(o, m);
    let matches_ol = common_ranges(o, l);
    let stable = intersect_commons(&matches_om, &matches_ol);

    let mut diff = Diff::default();
    if prefix > 0 {
        diff.push(DiffChunk::plain(
            ChunkKind::Common,
            LineRange::new(o_base, prefix),
            LineRange::new(m_base, prefix),
            LineRange::new(l_base, prefix),
        ));
    }

    let mut o_pos = 0;
    let mut m_pos = 0;
    let mut l_pos = 0;
    let emit_region = |diff: &mut Diff,
                       (o_lo, o_hi): (usize, usize),
                       (m_lo, m_hi): (usize, usize),
                       (l_lo, l_hi): (usize, usize)| {
        if o_hi > o_lo || m_hi > m_lo || l_hi > l_lo {
            let o_tokens = &o[o_lo..o_hi];
            let m_tokens = &m[m_lo..m_hi];
            let l_tokens = &l[l_lo..l_hi];
            let m_changed = o_tokens != m_tokens;
            let l_changed = o_tokens != l_tokens;
            let kind = match (m_changed, l_changed) {
                (true, false) => ChunkKind::Modified,
                (false, true) => ChunkKind::Latest,
                (true, true) if m_tokens == l_tokens => ChunkKind::DiffCommon,
                (true, true) => ChunkKind::Conflict,
                (false, false) => ChunkKind::Common,
            };
            diff.push(DiffChunk::plain(
                kind,
                LineRange::new(o_base + prefix + o_lo as u64, (o_hi - o_lo) as u64),
                LineRange::new(m_base + prefix + m_lo as u64, (m_hi - m_lo) as u64),
                LineRange::new(l_base + prefix + l_lo as u64, (l_hi - l_lo) as u64),
            ));
        }
    };

    for range in &stable {
        emit_region(
            &mut diff,
            (o_pos, range.o),
            (m_pos, range.m),
            (l_pos, range.l),
        );
        diff.push(DiffChunk::plain(
            ChunkKind::Common,
            LineRange::new(o_base + prefix + range.o as u64, range.len as u64),
            LineRange::new(m_base + prefix + range.m as u64, range.len as u64),
            LineRange::new(l_base + prefix + range.l as u64, range.len as u64),
        ));
        o_pos = range.o + range.len;
        m_pos = range.m + range.len;
        l_pos = range.l + range.len;
    }
    emit_region(
        &mut diff,
        (o_pos, o.len()),
        (m_pos, m.len()),
        (l_pos, l.len()),
    );

    if suffix > 0 {
        diff.push(DiffChunk::plain(
            ChunkKind::Common,
            LineRange::new(o_base + prefix + o.len() as u64, suffix),
            LineRange::new(m_base + prefix + m.len() as u64, suffix),
            LineRange::new(l_base + prefix + l.len() as u64, suffix),
        ));
    }
    diff
}

/// Compares four files; conflicts between *modified* and *latest* that are
/// plain merges when viewed against *ancestor* carry their resolution.
pub fn file_diff4(
    original: &Path,
    modified: &Path,
    latest: &Path,
    ancestor: &Path,
    options: &DiffOptions,
) -> Result<Diff, DiffError> {
    let tokens = source::tokenize_files(&[original, modified, latest, ancestor], options)?;
    let [o, m, l, anc] = &tokens.class_sequences[..] else {
        unreachable!()
    };
    let mut diff = build_three_way(
        o,
        m,
        l,
        tokens.prefix_lines,
        tokens.suffix_lines,
        0,
        0,
        0,
    );

    let matches_oa = common_ranges(o, anc);
    let prefix = tokens.prefix_lines;
    for chunk in &mut diff.chunks {
        if chunk.kind != ChunkKind::Conflict {
            continue;
        }
        let o_lo = (chunk.original.start - prefix) as usize;
        let o_hi = o_lo + chunk.original.len as usize;
        let anc_lo = map_through(&matches_oa, o_lo);
        let anc_hi = map_through(&matches_oa, o_hi).max(anc_lo);
        let m_lo = (chunk.modified.start - prefix) as usize;
        let m_hi = m_lo + chunk.modified.len as usize;
        let l_lo = (chunk.latest.start - prefix) as usize;
        let l_hi = l_lo + chunk.latest.len as usize;

        let resolved = build_three_way(
            &anc[anc_lo..anc_hi],
            &m[m_lo..m_hi],
            &l[l_lo..l_hi],
            0,
            0,
            chunk.original.start,
            chunk.modified.start,
            chunk.latest.start,
        );
        if !resolved.contains_conflicts() {
            chunk.resolved = Some(resolved.chunks);
        }
    }
    Ok(diff)
}

/// Maps a position through a monotone match list: positions inside a match
/// map exactly, positions in a gap map to the gap's insertion point.
fn map_through(matches: &[CommonRange], pos: usize) -> usize {
    let mut mapped = 0;
    for range in matches {
        if pos < range.a {
            return mapped;
        }
        if pos < range.a_end() {
            return range.b + (pos - range.a);
        }
        mapped = range.b_end();
    }
    mapped
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;
    use crate::tests::new_temp_dir;

    #[test]
    fn test_parse_options() {
        let options = DiffOptions::parse(&["-b", "--ignore-eol-style"]).unwrap();
        assert_eq!(options.ignore_space, IgnoreSpace::Change);
        assert!(options.ignore_eol_style);
        assert!(!options.show_c_function);
    }

    #[test]
    fn test_parse_w_overrides_b() {
        for args in [&["-b", "-w"][..], &["-w", "-b"][..], &["-bw"][..]] {
            let options = DiffOptions::parse(args).unwrap();
            assert_eq!(options.ignore_space, IgnoreSpace::All);
        }
    }

    #[test]
    fn test_parse_accepts_ignored_unified() {
        let options = DiffOptions::parse(&["-u", "--unified", "-p"]).unwrap();
        assert!(options.show_c_function);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_matches!(
            DiffOptions::parse(&["--color"]),
            Err(DiffError::InvalidOption(_))
        );
        assert_matches!(
            DiffOptions::parse(&["-q"]),
            Err(DiffError::InvalidOption(_))
        );
        assert_matches!(
            DiffOptions::parse(&["stray"]),
            Err(DiffError::InvalidOption(_))
        );
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_diff_identical_has_no_diffs() {
        let temp_dir = new_temp_dir();
        let a = write_file(temp_dir.path(), "a", b"x\ny\n");
        let b = write_file(temp_dir.path(), "b", b"x\ny\n");
        let diff = file_diff(&a, &b, &DiffOptions::default()).unwrap();
        assert!(!diff.contains_diffs());
    }

    #[test]
    fn test_diff_single_change_covers_all_lines() {
        let temp_dir = new_temp_dir();
        let a = write_file(temp_dir.path(), "a", b"a\nb\nc\n");
        let b = write_file(temp_dir.path(), "b", b"a\nB\nc\n");
        let diff = file_diff(&a, &b, &DiffOptions::default()).unwrap();
        assert!(diff.contains_diffs());
        let changed: Vec<_> = diff
            .chunks()
            .iter()
            .filter(|c| c.kind == ChunkKind::Modified)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].original, LineRange::new(1, 1));
        assert_eq!(changed[0].modified, LineRange::new(1, 1));
        // Coverage is complete on both sides.
        let total_o: u64 = diff.chunks().iter().map(|c| c.original.len).sum();
        let total_m: u64 = diff.chunks().iter().map(|c| c.modified.len).sum();
        assert_eq!(total_o, 3);
        assert_eq!(total_m, 3);
    }

    #[test]
    fn test_diff_eol_styles_ignored() {
        let temp_dir = new_temp_dir();
        let a = write_file(temp_dir.path(), "a", b"x\r\ny\r\n");
        let b = write_file(temp_dir.path(), "b", b"x\ny\n");
        let options = DiffOptions::parse(&["--ignore-eol-style"]).unwrap();
        let diff = file_diff(&a, &b, &options).unwrap();
        assert!(!diff.contains_diffs());
        // Without the option the files differ.
        let diff = file_diff(&a, &b, &DiffOptions::default()).unwrap();
        assert!(diff.contains_diffs());
    }

    #[test]
    fn test_diff3_conflict_and_clean_merge() {
        let temp_dir = new_temp_dir();
        let o = write_file(temp_dir.path(), "o", b"a\nb\nc\nd\ne\n");
        let m = write_file(temp_dir.path(), "m", b"a\nB\nc\nd\ne\n");
        let l = write_file(temp_dir.path(), "l", b"a\nb\nc\nD\ne\n");
        let diff = file_diff3(&o, &m, &l, &DiffOptions::default()).unwrap();
        assert!(!diff.contains_conflicts());
        let kinds: Vec<_> = diff.chunks().iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ChunkKind::Modified));
        assert!(kinds.contains(&ChunkKind::Latest));
    }

    #[test]
    fn test_diff3_incompatible_edits_conflict() {
        let temp_dir = new_temp_dir();
        let o = write_file(temp_dir.path(), "o", b"a\nb\nc\n");
        let m = write_file(temp_dir.path(), "m", b"a\nB\nc\n");
        let l = write_file(temp_dir.path(), "l", b"a\nB'\nc\n");
        let diff = file_diff3(&o, &m, &l, &DiffOptions::default()).unwrap();
        assert!(diff.contains_conflicts());
        let conflict = diff
            .chunks()
            .iter()
            .find(|c| c.kind == ChunkKind::Conflict)
            .unwrap();
        assert_eq!(conflict.original, LineRange::new(1, 1));
        assert_eq!(conflict.modified, LineRange::new(1, 1));
        assert_eq!(conflict.latest, LineRange::new(1, 1));
    }

    #[test]
    fn test_diff3_same_change_both_sides() {
        let temp_dir = new_temp_dir();
        let o = write_file(temp_dir.path(), "o", b"a\nb\nc\n");
        let m = write_file(temp_dir.path(), "m", b"a\nX\nc\n");
        let l = write_file(temp_dir.path(), "l", b"a\nX\nc\n");
        let diff = file_diff3(&o, &m, &l, &DiffOptions::default()).unwrap();
        assert!(!diff.contains_conflicts());
        assert!(
            diff.chunks()
                .iter()
                .any(|c| c.kind == ChunkKind::DiffCommon)
        );
    }

    #[test]
    fn test_diff4_resolves_conflict_seen_in_ancestor() {
        let temp_dir = new_temp_dir();
        // "modified" and "latest" disagree, but the ancestor already holds
        // modified's version, so only latest really changed anything.
        let o = write_file(temp_dir.path(), "o", b"a\nx\nz\n");
        let m = write_file(temp_dir.path(), "m", b"a\nmine\nz\n");
        let l = write_file(temp_dir.path(), "l", b"a\ntheirs\nz\n");
        let anc = write_file(temp_dir.path(), "anc", b"a\nmine\nz\n");
        let diff = file_diff4(&o, &m, &l, &anc, &DiffOptions::default()).unwrap();
        let conflict = diff
            .chunks()
            .iter()
            .find(|c| c.kind == ChunkKind::Conflict)
            .unwrap();
        let resolved = conflict.resolved.as_ref().unwrap();
        assert!(resolved.iter().any(|c| c.kind == ChunkKind::Latest));

        // With an unrelated ancestor the conflict stays unresolved.
        let anc = write_file(temp_dir.path(), "anc2", b"a\nq\nz\n");
        let diff = file_diff4(&o, &m, &l, &anc, &DiffOptions::default()).unwrap();
        let conflict = diff
            .chunks()
            .iter()
            .find(|c| c.kind == ChunkKind::Conflict)
            .unwrap();
        assert!(conflict.resolved.is_none());
    }

    #[test]
    fn test_map_through() {
        let matches = vec![
            CommonRange { a: 2, b: 0, len: 3 },
            CommonRange { a: 8, b: 5, len: 2 },
        ];
        assert_eq!(map_through(&matches, 0), 0);
        assert_eq!(map_through(&matches, 2), 0);
        assert_eq!(map_through(&matches, 4), 2);
        assert_eq!(map_through(&matches, 6), 3);
        assert_eq!(map_through(&matches, 9), 6);
        assert_eq!(map_through(&matches, 20), 7);
    }
}
