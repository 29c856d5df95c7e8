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

//! The svndiff binary delta format: window reader/writer, instruction
//! application, window composition, and a block-matching encoder.
//!
//! A stream starts with the four bytes `S` `V` `N` `<version>` and is
//! followed by self-delimiting windows. Each window describes how to produce
//! `tview_len` output bytes from a source view `[sview_offset,
//! sview_offset + sview_len)` with three instruction kinds: copy from the
//! source view, copy from earlier output of the same window (offsets may
//! reach into bytes the instruction itself produces, which turns it into a
//! repeating pattern fill), and copy from the window's inline new data.
//!
//! Deltas computed against a base are windowed in lockstep: window `i` of
//! every layer covers the same `WINDOW_SIZE`-aligned region, which is what
//! makes chained windows composable index by index.

use std::io;
use std::io::Read;
use std::io::Write;

use thiserror::Error;

use crate::adler32::adler32;

/// Only version 0 streams are produced and understood.
pub const FORMAT_VERSION: u8 = 0;

/// Source and target are processed in lockstep windows of this many bytes.
pub const WINDOW_SIZE: usize = 102_400;

/// Granularity of source block matching in the encoder.
const MATCH_BLOCKSIZE: usize = 64;

const ACTION_COPY_SOURCE: u8 = 0;
const ACTION_COPY_TARGET: u8 = 1;
const ACTION_COPY_NEW: u8 = 2;

#[derive(Debug, Error)]
pub enum SvndiffError {
    #[error("Malformed svndiff data: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Copy `len` bytes from the source view, starting at `offset`.
    CopySource,
    /// Copy `len` bytes from the target view already produced. `offset` may
    /// reach into the bytes this very instruction produces (pattern fill).
    CopyTarget,
    /// Copy `len` bytes from the window's new data, starting at `offset`.
    CopyNew,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub offset: usize,
    pub len: usize,
}

/// One parsed (or to-be-written) delta window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub sview_offset: u64,
    pub sview_len: usize,
    pub tview_len: usize,
    /// Number of `CopySource` instructions. A window with `src_ops == 0` is
    /// self-contained and needs no source data at all.
    pub src_ops: usize,
    pub ops: Vec<Op>,
    pub new_data: Vec<u8>,
}

/// Writes the stream header.
pub fn write_stream_header<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[b'S', b'V', b'N', FORMAT_VERSION])
}

/// Parses the four stream header bytes, returning the version.
pub fn parse_stream_header(buf: [u8; 4]) -> Result<u8, SvndiffError> {
    if &buf[0..3] != b"SVN" {
        return Err(SvndiffError::Malformed("missing stream header"));
    }
    Ok(buf[3])
}

fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<()> {
    let mut bytes = [0u8; 10];
    let mut pos = bytes.len();
    pos -= 1;
    bytes[pos] = (value & 0x7f) as u8;
    value >>= 7;
    while value > 0 {
        pos -= 1;
        bytes[pos] = 0x80 | (value & 0x7f) as u8;
        value >>= 7;
    }
    writer.write_all(&bytes[pos..])
}

fn read_varint<R: Read>(reader: &mut R) -> Result<u64, SvndiffError> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let mut byte = [0u8];
        reader.read_exact(&mut byte)?;
        value = value
            .checked_shl(7)
            .ok_or(SvndiffError::Malformed("integer too large"))?
            | u64::from(byte[0] & 0x7f);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(SvndiffError::Malformed("integer too large"))
}

/// Reads one window from `reader`. `version` comes from the stream header.
pub fn read_window<R: Read>(reader: &mut R, version: u8) -> Result<Window, SvndiffError> {
    if version != FORMAT_VERSION {
        return Err(SvndiffError::Malformed("unsupported svndiff version"));
    }
    let sview_offset = read_varint(reader)?;
    let sview_len = usize::try_from(read_varint(reader)?)
        .map_err(|_| SvndiffError::Malformed("window too large"))?;
    let tview_len = usize::try_from(read_varint(reader)?)
        .map_err(|_| SvndiffError::Malformed("window too large"))?;
    let instr_len = read_varint(reader)?;
    let newdata_len = read_varint(reader)?;

    let instr_len = usize::try_from(instr_len)
        .map_err(|_| SvndiffError::Malformed("window too large"))?;
    let newdata_len = usize::try_from(newdata_len)
        .map_err(|_| SvndiffError::Malformed("window too large"))?;
    let mut instr = vec![0u8; instr_len];
    reader.read_exact(&mut instr)?;
    let mut new_data = vec![0u8; newdata_len];
    reader.read_exact(&mut new_data)?;

    let mut ops = Vec::new();
    let mut src_ops = 0;
    let mut tpos = 0usize;
    let mut npos = 0usize;
    let mut instr = instr.as_slice();
    while !instr.is_empty() {
        let byte = instr[0];
        instr = &instr[1..];
        let action = byte >> 6;
        let mut len = usize::from(byte & 0x3f);
        if len == 0 {
            len = usize::try_from(read_varint(&mut instr)?)
                .map_err(|_| SvndiffError::Malformed("instruction too large"))?;
        }
        if len == 0 {
            return Err(SvndiffError::Malformed("zero-length instruction"));
        }
        let op = match action {
            ACTION_COPY_SOURCE => {
                let offset = usize::try_from(read_varint(&mut instr)?)
                    .map_err(|_| SvndiffError::Malformed("instruction too large"))?;
                if offset + len > sview_len {
                    return Err(SvndiffError::Malformed("source copy outside source view"));
                }
                src_ops += 1;
                Op {
                    kind: OpKind::CopySource,
                    offset,
                    len,
                }
            }
            ACTION_COPY_TARGET => {
                let offset = usize::try_from(read_varint(&mut instr)?)
                    .map_err(|_| SvndiffError::Malformed("instruction too large"))?;
                if offset >= tpos {
                    return Err(SvndiffError::Malformed("target copy from future output"));
                }
                Op {
                    kind: OpKind::CopyTarget,
                    offset,
                    len,
                }
            }
            ACTION_COPY_NEW => {
                let op = Op {
                    kind: OpKind::CopyNew,
                    offset: npos,
                    len,
                };
                npos += len;
                if npos > new_data.len() {
                    return Err(SvndiffError::Malformed("new data overrun"));
                }
                op
            }
            _ => return Err(SvndiffError::Malformed("invalid instruction action")),
        };
        tpos += op.len;
        ops.push(op);
    }
    if tpos != tview_len {
        return Err(SvndiffError::Malformed("window length is corrupt"));
    }

    Ok(Window {
        sview_offset,
        sview_len,
        tview_len,
        src_ops,
        ops,
        new_data,
    })
}

/// Reads past one window without materializing it.
pub fn skip_window<R: Read>(reader: &mut R, version: u8) -> Result<(), SvndiffError> {
    if version != FORMAT_VERSION {
        return Err(SvndiffError::Malformed("unsupported svndiff version"));
    }
    let _sview_offset = read_varint(reader)?;
    let _sview_len = read_varint(reader)?;
    let _tview_len = read_varint(reader)?;
    let instr_len = read_varint(reader)?;
    let newdata_len = read_varint(reader)?;
    let to_skip = instr_len
        .checked_add(newdata_len)
        .ok_or(SvndiffError::Malformed("window too large"))?;
    let copied = io::copy(&mut reader.take(to_skip), &mut io::sink())?;
    if copied != to_skip {
        return Err(SvndiffError::Malformed("truncated window"));
    }
    Ok(())
}

/// Serializes one window.
pub fn write_window<W: Write>(writer: &mut W, window: &Window) -> io::Result<()> {
    let mut instr = Vec::new();
    for op in &window.ops {
        let action = match op.kind {
            OpKind::CopySource => ACTION_COPY_SOURCE,
            OpKind::CopyTarget => ACTION_COPY_TARGET,
            OpKind::CopyNew => ACTION_COPY_NEW,
        };
        if op.len > 0 && op.len < 0x40 {
            instr.push((action << 6) | op.len as u8);
        } else {
            instr.push(action << 6);
            write_varint(&mut instr, op.len as u64)?;
        }
        if op.kind != OpKind::CopyNew {
            write_varint(&mut instr, op.offset as u64)?;
        }
    }
    write_varint(writer, window.sview_offset)?;
    write_varint(writer, window.sview_len as u64)?;
    write_varint(writer, window.tview_len as u64)?;
    write_varint(writer, instr.len() as u64)?;
    write_varint(writer, window.new_data.len() as u64)?;
    writer.write_all(&instr)?;
    writer.write_all(&window.new_data)
}

/// Applies `window` to the bytes of its source view, producing the target
/// view. The output length always equals `window.tview_len`.
pub fn apply_window(window: &Window, source: &[u8]) -> Result<Vec<u8>, SvndiffError> {
    let mut target = Vec::with_capacity(window.tview_len);
    for op in &window.ops {
        match op.kind {
            OpKind::CopySource => {
                let end = op
                    .offset
                    .checked_add(op.len)
                    .filter(|&end| end <= source.len())
                    .ok_or(SvndiffError::Malformed("source copy outside source view"))?;
                target.extend_from_slice(&source[op.offset..end]);
            }
            OpKind::CopyTarget => {
                if op.offset >= target.len() {
                    return Err(SvndiffError::Malformed("target copy from future output"));
                }
                // Byte-at-a-time so overlapping copies repeat the pattern.
                for i in 0..op.len {
                    let byte = target[op.offset + i];
                    target.push(byte);
                }
            }
            OpKind::CopyNew => {
                let end = op
                    .offset
                    .checked_add(op.len)
                    .filter(|&end| end <= window.new_data.len())
                    .ok_or(SvndiffError::Malformed("new data overrun"))?;
                target.extend_from_slice(&window.new_data[op.offset..end]);
            }
        }
    }
    if target.len() != window.tview_len {
        return Err(SvndiffError::Malformed("window length is corrupt"));
    }
    Ok(target)
}

/// Composes two windows at the same chunk index into one.
///
/// `deeper` turns source bytes into an intermediate view; `shallower` turns
/// that intermediate view into the final target. The result reads straight
/// from `deeper`'s source view and produces `shallower`'s target view.
pub fn compose_windows(deeper: &Window, shallower: &Window) -> Result<Window, SvndiffError> {
    let mut composed = Window {
        sview_offset: deeper.sview_offset,
        sview_len: deeper.sview_len,
        tview_len: shallower.tview_len,
        ..Window::default()
    };
    let deeper_positions = op_target_positions(deeper);
    for op in &shallower.ops {
        match op.kind {
            OpKind::CopyNew => {
                push_new(&mut composed, &shallower.new_data[op.offset..op.offset + op.len]);
            }
            OpKind::CopyTarget => {
                // The composed window produces the same target view, so the
                // back reference remains valid as-is.
                composed.ops.push(*op);
            }
            OpKind::CopySource => {
                let end = op
                    .offset
                    .checked_add(op.len)
                    .filter(|&end| end <= deeper.tview_len)
                    .ok_or(SvndiffError::Malformed("source copy outside base window"))?;
                copy_source_ops(deeper, &deeper_positions, op.offset, end, &mut composed)?;
            }
        }
    }
    composed.src_ops = composed
        .ops
        .iter()
        .filter(|op| op.kind == OpKind::CopySource)
        .count();
    Ok(composed)
}

fn op_target_positions(window: &Window) -> Vec<usize> {
    let mut positions = Vec::with_capacity(window.ops.len());
    let mut tpos = 0;
    for op in &window.ops {
        positions.push(tpos);
        tpos += op.len;
    }
    positions
}

fn push_new(window: &mut Window, data: &[u8]) {
    let offset = window.new_data.len();
    window.new_data.extend_from_slice(data);
    if let Some(last) = window.ops.last_mut()
        && last.kind == OpKind::CopyNew
        && last.offset + last.len == offset
    {
        last.len += data.len();
        return;
    }
    window.ops.push(Op {
        kind: OpKind::CopyNew,
        offset,
        len: data.len(),
    });
}

/// Re-expresses target range `[from, to)` of `window`'s output in terms of
/// `window`'s own inputs, appending the translated ops to `out`.
fn copy_source_ops(
    window: &Window,
    positions: &[usize],
    from: usize,
    to: usize,
    out: &mut Window,
) -> Result<(), SvndiffError> {
    let mut idx = positions.partition_point(|&p| p <= from).saturating_sub(1);
    let mut from = from;
    while from < to {
        let op = window
            .ops
            .get(idx)
            .ok_or(SvndiffError::Malformed("window length is corrupt"))?;
        let tpos = positions[idx];
        let start = from.max(tpos);
        let end = to.min(tpos + op.len);
        if start >= end {
            idx += 1;
            continue;
        }
        match op.kind {
            OpKind::CopyNew => {
                let data_start = op.offset + (start - tpos);
                push_new(out, &window.new_data[data_start..data_start + (end - start)]);
            }
            OpKind::CopySource => {
                out.ops.push(Op {
                    kind: OpKind::CopySource,
                    offset: op.offset + (start - tpos),
                    len: end - start,
                });
            }
            OpKind::CopyTarget => {
                let sub_from = op.offset + (start - tpos);
                let sub_len = end - start;
                if sub_from + sub_len <= tpos {
                    copy_source_ops(window, positions, sub_from, sub_from + sub_len, out)?;
                } else {
                    // Overlapping copy: the output repeats the bytes between
                    // the copy offset and the instruction's own position.
                    let period = tpos
                        .checked_sub(op.offset)
                        .filter(|&p| p > 0)
                        .ok_or(SvndiffError::Malformed("target copy from future output"))?;
                    let mut produced = 0;
                    while produced < sub_len {
                        let phase = (sub_from - op.offset + produced) % period;
                        let run = (sub_len - produced).min(period - phase);
                        copy_source_ops(
                            window,
                            positions,
                            op.offset + phase,
                            op.offset + phase + run,
                            out,
                        )?;
                        produced += run;
                    }
                }
            }
        }
        from = end;
        idx += 1;
    }
    Ok(())
}

/// Computes a delta window turning `source` into `target`.
///
/// Source blocks of [`MATCH_BLOCKSIZE`] bytes are indexed by checksum; the
/// target is scanned with a rolling checksum and verified matches are
/// extended as far as the bytes agree. Unmatched target bytes become inline
/// new data.
pub fn build_window(sview_offset: u64, source: &[u8], target: &[u8]) -> Window {
    let mut window = Window {
        sview_offset,
        sview_len: source.len(),
        tview_len: target.len(),
        ..Window::default()
    };
    if source.len() < MATCH_BLOCKSIZE || target.len() < MATCH_BLOCKSIZE {
        push_new(&mut window, target);
        return window;
    }

    let mut blocks: std::collections::HashMap<u32, Vec<usize>> = std::collections::HashMap::new();
    for block_index in 0..source.len() / MATCH_BLOCKSIZE {
        let start = block_index * MATCH_BLOCKSIZE;
        let sum = adler32(0, &source[start..start + MATCH_BLOCKSIZE]);
        blocks.entry(sum).or_default().push(start);
    }

    let mut pending = 0; // start of not-yet-emitted target bytes
    let mut pos = 0;
    let mut rolling = RollingSum::new(&target[0..MATCH_BLOCKSIZE]);
    while pos + MATCH_BLOCKSIZE <= target.len() {
        let matched = blocks
            .get(&rolling.value())
            .into_iter()
            .flatten()
            .copied()
            .find(|&start| source[start..start + MATCH_BLOCKSIZE] == target[pos..pos + MATCH_BLOCKSIZE]);
        if let Some(source_start) = matched {
            let mut len = MATCH_BLOCKSIZE;
            while source_start + len < source.len()
                && pos + len < target.len()
                && source[source_start + len] == target[pos + len]
            {
                len += 1;
            }
            if pending < pos {
                push_new(&mut window, &target[pending..pos]);
            }
            window.ops.push(Op {
                kind: OpKind::CopySource,
                offset: source_start,
                len,
            });
            window.src_ops += 1;
            pending = pos + len;
            pos = pending;
            if pos + MATCH_BLOCKSIZE > target.len() {
                break;
            }
            rolling = RollingSum::new(&target[pos..pos + MATCH_BLOCKSIZE]);
        } else {
            if pos + MATCH_BLOCKSIZE == target.len() {
                break;
            }
            rolling.roll(target[pos], target[pos + MATCH_BLOCKSIZE]);
            pos += 1;
        }
    }
    if pending < target.len() {
        push_new(&mut window, &target[pending..]);
    }
    window
}

/// Rolling Adler-32 over a fixed [`MATCH_BLOCKSIZE`] window. The sums stay
/// exact (no modulus) while rolling; the final value is reduced on demand.
struct RollingSum {
    a: u32,
    b: u32,
}

impl RollingSum {
    fn new(block: &[u8]) -> Self {
        debug_assert_eq!(block.len(), MATCH_BLOCKSIZE);
        let mut sum = Self { a: 0, b: 0 };
        for &byte in block {
            sum.a += u32::from(byte);
            sum.b += sum.a;
        }
        sum
    }

    fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.a = self.a + u32::from(incoming) - u32::from(outgoing);
        self.b = self.b + self.a - MATCH_BLOCKSIZE as u32 * u32::from(outgoing);
    }

    fn value(&self) -> u32 {
        ((self.b % 65521) << 16) | (self.a % 65521)
    }
}
