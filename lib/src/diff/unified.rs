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

//! Unified diff rendering of a two-way comparison.
//!
//! The diff result only carries line ranges; the actual line content is
//! re-read from the two files while rendering. Hunks collect three lines of
//! context on both sides and merge when their context would touch.

use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::file_util::IoResultExt as _;

use super::ChunkKind;
use super::Diff;
use super::DiffError;
use super::DiffOptions;
use super::LineRange;

/// Hunks carry this many lines of leading and trailing context.
pub const CONTEXT_SIZE: u64 = 3;

/// Maximum length of the C-function annotation; GNU diff uses 40, we are
/// brave and use 50.
const EXTRA_CONTEXT_LENGTH: usize = 50;

/// Label lines that never name a function.
const EXTRA_SKIP_PREFIXES: [&str; 3] = ["public:", "private:", "protected:"];

const BUFFER_SIZE: usize = 4096;

/// Writes `diff` in unified format. Without explicit headers, each side's
/// header is `<path>\t<mtime>`; with `relative_to_dir`, displayed paths are
/// made relative to that directory and must lie beneath it.
#[expect(clippy::too_many_arguments)]
pub fn write_unified<W: Write>(
    output: &mut W,
    diff: &Diff,
    original_path: &Path,
    modified_path: &Path,
    original_header: Option<&str>,
    modified_header: Option<&str>,
    relative_to_dir: Option<&Path>,
    options: &DiffOptions,
) -> Result<(), DiffError> {
    if !diff.contains_diffs() {
        return Ok(());
    }

    let original_header = match original_header {
        Some(header) => header.to_owned(),
        None => default_header(original_path, relative_to_dir)?,
    };
    let modified_header = match modified_header {
        Some(header) => header.to_owned(),
        None => default_header(modified_path, relative_to_dir)?,
    };
    write!(output, "--- {original_header}\n+++ {modified_header}\n")
        .map_err(DiffError::Output)?;

    let mut state = UnifiedOutput {
        files: [
            LineSource::open(original_path)?,
            LineSource::open(modified_path)?,
        ],
        current_line: [0; 2],
        hunk: Vec::new(),
        hunk_start: [0; 2],
        hunk_length: [0; 2],
        show_c_function: options.show_c_function,
        extra_context: Vec::new(),
        hunk_extra_context: String::new(),
    };
    for chunk in diff.chunks() {
        if chunk.kind == ChunkKind::Modified {
            state.output_modified_chunk(output, chunk.original, chunk.modified)?;
        }
    }
    state.flush_hunk(output)
}

fn default_header(path: &Path, relative_to_dir: Option<&Path>) -> Result<String, DiffError> {
    let displayed = match relative_to_dir {
        Some(dir) => match path.strip_prefix(dir) {
            Ok(child) if !child.as_os_str().is_empty() => child.to_path_buf(),
            _ => {
                return Err(DiffError::BadRelativePath {
                    path: path.display().to_string(),
                    dir: dir.display().to_string(),
                });
            }
        },
        None => path.to_path_buf(),
    };
    let mtime = fs::metadata(path).context(path)?.modified().context(path)?;
    let mtime: chrono::DateTime<chrono::Local> = mtime.into();
    Ok(format!(
        "{}\t{}",
        displayed.display(),
        mtime.format("%a %b %e %H:%M:%S %Y")
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineType {
    Skip,
    Context,
    Delete,
    Insert,
}

struct LineSource {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl LineSource {
    fn open(path: &Path) -> Result<Self, DiffError> {
        let file = File::open(path).context(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    fn refill(&mut self) -> Result<(), DiffError> {
        self.buf.resize(BUFFER_SIZE, 0);
        let n = self.file.read(&mut self.buf).context(&self.path)?;
        self.buf.truncate(n);
        self.pos = 0;
        self.eof = n == 0;
        Ok(())
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

struct UnifiedOutput {
    files: [LineSource; 2],
    current_line: [u64; 2],
    hunk: Vec<u8>,
    hunk_start: [u64; 2],
    hunk_length: [u64; 2],
    show_c_function: bool,
    /// Latest candidate for the `@@` annotation, collected while skipping.
    extra_context: Vec<u8>,
    /// The annotation chosen for the hunk being assembled.
    hunk_extra_context: String,
}

impl UnifiedOutput {
    /// Consumes one line of `files[idx]`, appending it to the hunk with the
    /// prefix demanded by `line_type` (or nothing for skips). At end of
    /// file the line counter still advances, faking context.
    fn output_line(&mut self, line_type: LineType, idx: usize) -> Result<(), DiffError> {
        self.current_line[idx] += 1;
        if self.files[idx].available().is_empty() && self.files[idx].eof {
            return Ok(());
        }

        let mut bytes_processed = false;
        let mut had_cr = false;
        let mut collect_extra = false;
        loop {
            let avail_empty = self.files[idx].available().is_empty();
            if !avail_empty {
                if !bytes_processed {
                    match line_type {
                        LineType::Context => {
                            self.hunk.push(b' ');
                            self.hunk_length[0] += 1;
                            self.hunk_length[1] += 1;
                        }
                        LineType::Delete => {
                            self.hunk.push(b'-');
                            self.hunk_length[0] += 1;
                        }
                        LineType::Insert => {
                            self.hunk.push(b'+');
                            self.hunk_length[1] += 1;
                        }
                        LineType::Skip => {}
                    }
                    if self.show_c_function
                        && matches!(line_type, LineType::Skip | LineType::Context)
                    {
                        let rest = self.files[idx].available();
                        let first = rest[0];
                        if (first.is_ascii_alphabetic() || first == b'$' || first == b'_')
                            && !EXTRA_SKIP_PREFIXES
                                .iter()
                                .any(|prefix| rest.starts_with(prefix.as_bytes()))
                        {
                            self.extra_context.clear();
                            collect_extra = true;
                        }
                    }
                }

                let src = &mut self.files[idx];
                let rest = &src.buf[src.pos..];
                if let Some(eol) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
                    had_cr = rest[eol] == b'\r';
                    let mut end = src.pos + eol + 1;
                    if !had_cr || end < src.buf.len() {
                        if had_cr && src.buf[end] == b'\n' {
                            end += 1;
                        }
                        let line = &src.buf[src.pos..end];
                        if line_type != LineType::Skip {
                            self.hunk.extend_from_slice(line);
                        }
                        if collect_extra {
                            self.extra_context.extend_from_slice(line);
                        }
                        src.pos = end;
                        return Ok(());
                    }
                }
                // The line (or a trailing \r whose \n may follow) runs past
                // this buffer.
                let line = &src.buf[src.pos..];
                if line_type != LineType::Skip {
                    self.hunk.extend_from_slice(line);
                }
                if collect_extra {
                    self.extra_context.extend_from_slice(line);
                }
                src.pos = src.buf.len();
                bytes_processed = true;
            }

            self.files[idx].refill()?;
            let src = &mut self.files[idx];
            if !src.buf.is_empty() {
                if had_cr {
                    // The previous buffer ended with \r; absorb a leading \n.
                    if src.buf[0] == b'\n' {
                        if line_type != LineType::Skip {
                            self.hunk.push(b'\n');
                        }
                        // Not added to extra_context; it would be stripped.
                        src.pos = 1;
                    }
                    return Ok(());
                }
                continue;
            }
            // End of file while inside a changed or context range, without a
            // line terminator.
            if bytes_processed && line_type != LineType::Skip && !had_cr {
                self.hunk
                    .extend_from_slice(b"\n\\ No newline at end of file\n");
            }
            return Ok(());
        }
    }

    fn flush_hunk<W: Write>(&mut self, output: &mut W) -> Result<(), DiffError> {
        if self.hunk.is_empty() {
            return Ok(());
        }

        // Add trailing context.
        let target_line = self.hunk_start[0] + self.hunk_length[0] + CONTEXT_SIZE;
        while self.current_line[0] < target_line {
            self.output_line(LineType::Context, 0)?;
        }

        // Line numbers are one-based unless the side is empty.
        for i in 0..2 {
            if self.hunk_length[i] > 0 {
                self.hunk_start[i] += 1;
            }
        }

        // A range of exactly one line leaves out the length.
        write!(output, "@@ -{}", self.hunk_start[0]).map_err(DiffError::Output)?;
        if self.hunk_length[0] != 1 {
            write!(output, ",{}", self.hunk_length[0]).map_err(DiffError::Output)?;
        }
        write!(output, " +{}", self.hunk_start[1]).map_err(DiffError::Output)?;
        if self.hunk_length[1] != 1 {
            write!(output, ",{}", self.hunk_length[1]).map_err(DiffError::Output)?;
        }
        if self.hunk_extra_context.is_empty() {
            writeln!(output, " @@").map_err(DiffError::Output)?;
        } else {
            writeln!(output, " @@ {}", self.hunk_extra_context).map_err(DiffError::Output)?;
        }
        output.write_all(&self.hunk).map_err(DiffError::Output)?;

        self.hunk.clear();
        self.hunk_length = [0; 2];
        Ok(())
    }

    fn output_modified_chunk<W: Write>(
        &mut self,
        output: &mut W,
        original: LineRange,
        modified: LineRange,
    ) -> Result<(), DiffError> {
        let target0 = original.start.saturating_sub(CONTEXT_SIZE);
        let target1 = modified.start;

        // If the changed ranges are far enough apart that their context
        // doesn't touch or connect, flush the current hunk and start the
        // next one; also when this is the first hunk.
        if self.current_line[0] < target0
            && (self.hunk_start[0] + self.hunk_length[0] + CONTEXT_SIZE < target0
                || self.hunk_length[0] == 0)
        {
            self.flush_hunk(output)?;
            self.hunk_start[0] = target0;
            self.hunk_start[1] = target1 - (original.start - target0);

            while self.current_line[0] < target0 {
                self.output_line(LineType::Skip, 0)?;
            }

            if self.show_c_function {
                self.save_extra_context();
            }
        }

        while self.current_line[1] < target1 {
            self.output_line(LineType::Skip, 1)?;
        }
        while self.current_line[0] < original.start {
            self.output_line(LineType::Context, 0)?;
        }
        while self.current_line[0] < original.end() {
            self.output_line(LineType::Delete, 0)?;
        }
        while self.current_line[1] < modified.end() {
            self.output_line(LineType::Insert, 1)?;
        }
        Ok(())
    }

    /// Fixes the collected function context for the hunk being started:
    /// truncated to [`EXTRA_CONTEXT_LENGTH`] bytes, trailing whitespace
    /// stripped, cut back to a valid UTF-8 boundary.
    fn save_extra_context(&mut self) {
        let mut bytes = &self.extra_context[..self.extra_context.len().min(EXTRA_CONTEXT_LENGTH)];
        while let [head @ .., last] = bytes {
            if last.is_ascii_whitespace() {
                bytes = head;
            } else {
                break;
            }
        }
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap(),
        };
        self.hunk_extra_context = text.to_owned();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::super::DiffOptions;
    use super::super::file_diff;
    use super::*;
    use crate::tests::new_temp_dir;

    fn unified(a: &[u8], b: &[u8], options: &DiffOptions) -> String {
        let temp_dir = new_temp_dir();
        let a_path = temp_dir.path().join("a");
        let b_path = temp_dir.path().join("b");
        fs::write(&a_path, a).unwrap();
        fs::write(&b_path, b).unwrap();
        let diff = file_diff(&a_path, &b_path, options).unwrap();
        let mut out = Vec::new();
        write_unified(
            &mut out,
            &diff,
            &a_path,
            &b_path,
            Some("a"),
            Some("b"),
            None,
            options,
        )
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_single_line_change() {
        let output = unified(b"a\nb\nc\n", b"a\nB\nc\n", &DiffOptions::default());
        assert_eq!(
            output,
            indoc! {"
                --- a
                +++ b
                @@ -1,3 +1,3 @@
                 a
                -b
                +B
                 c
            "}
        );
    }

    #[test]
    fn test_identical_files_produce_nothing() {
        let output = unified(b"a\nb\n", b"a\nb\n", &DiffOptions::default());
        assert_eq!(output, "");
    }

    #[test]
    fn test_no_newline_at_end_of_file() {
        let output = unified(b"a\nb\nc", b"a\nb\nc\n", &DiffOptions::default());
        assert_eq!(
            output,
            indoc! {"
                --- a
                +++ b
                @@ -1,3 +1,3 @@
                 a
                 b
                -c
                \\ No newline at end of file
                +c
            "}
        );
    }

    #[test]
    fn test_eol_style_ignored_produces_nothing() {
        let options = DiffOptions::parse(&["--ignore-eol-style"]).unwrap();
        let output = unified(b"x\r\ny\r\n", b"x\ny\n", &options);
        assert_eq!(output, "");
    }

    #[test]
    fn test_whitespace_options() {
        let change = DiffOptions::parse(&["-b"]).unwrap();
        assert_eq!(unified(b"a  b\n", b"a b\n", &change), "");
        // -b distinguishes present from absent.
        assert_ne!(unified(b"ab\n", b"a b\n", &change), "");

        let all = DiffOptions::parse(&["-w"]).unwrap();
        assert_eq!(unified(b"ab\n", b"a \tb\n", &all), "");
    }

    #[test]
    fn test_distant_changes_make_two_hunks() {
        let mut a = String::new();
        let mut b = String::new();
        for i in 0..30 {
            a.push_str(&format!("line{i}\n"));
            if i == 5 || i == 25 {
                b.push_str(&format!("changed{i}\n"));
            } else {
                b.push_str(&format!("line{i}\n"));
            }
        }
        let output = unified(a.as_bytes(), b.as_bytes(), &DiffOptions::default());
        assert_eq!(output.matches("@@").count(), 2);
        assert!(output.contains("@@ -3,7 +3,7 @@"));
        assert!(output.contains("-line5\n+changed5\n"));
    }

    #[test]
    fn test_close_changes_merge_into_one_hunk() {
        let a = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let b = "a\nB\nc\nd\ne\nF\ng\nh\n";
        let output = unified(a.as_bytes(), b.as_bytes(), &DiffOptions::default());
        assert_eq!(output.matches("@@").count(), 1);
        assert_eq!(
            output,
            indoc! {"
                --- a
                +++ b
                @@ -1,8 +1,8 @@
                 a
                -b
                +B
                 c
                 d
                 e
                -f
                +F
                 g
                 h
            "}
        );
    }

    #[test]
    fn test_insert_at_start() {
        let output = unified(b"x\ny\n", b"new\nx\ny\n", &DiffOptions::default());
        assert_eq!(
            output,
            indoc! {"
                --- a
                +++ b
                @@ -1,2 +1,3 @@
                +new
                 x
                 y
            "}
        );
    }

    #[test]
    fn test_show_c_function() {
        let a = indoc! {"
            static int
            frobnicate(int x)
            {
              int a;
              int b;
              int c;
              int d;
              int e;
              return x;
            }
        "};
        let b = a.replace("return x;", "return x + 1;");
        let options = DiffOptions::parse(&["-p"]).unwrap();
        let output = unified(a.as_bytes(), b.as_bytes(), &options);
        assert!(
            output.contains("@@ frobnicate(int x)\n"),
            "got: {output}"
        );
    }

    #[test]
    fn test_crlf_line_output_preserved() {
        let output = unified(b"a\r\nb\r\n", b"a\r\nB\r\n", &DiffOptions::default());
        assert!(output.contains("-b\r\n"));
        assert!(output.contains("+B\r\n"));
    }
}
