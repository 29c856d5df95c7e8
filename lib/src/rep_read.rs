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

//! Reconstruction of representation contents through chained deltas.
//!
//! A representation is either stored `PLAIN` or as an svndiff against an
//! earlier representation, which may itself be a delta. Reading walks the
//! chain down to the plain base (or a delta against the empty stream), then
//! produces output chunk by chunk: window `i` of the newest delta is
//! composed with window `i` of each deeper delta, and the composed window's
//! source bytes are pulled straight from the plain base. Only one output
//! buffer plus a few windows of state are live at any time.
//!
//! Every byte handed out is fed into a running MD5; when the output reaches
//! the representation's expanded size the digest is finalized (exactly once,
//! even under short reads past EOF) and compared against the descriptor.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use digest::Digest as _;
use md5::Md5;

use crate::file_util::IoResultExt as _;
use crate::revfile::RepHeader;
use crate::revfile::RepLocation;
use crate::revfile::Representation;
use crate::store::RevStore;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::svndiff;
use crate::svndiff::SvndiffError;
use crate::svndiff::Window;

/// Where in its file each chain layer's raw data lives.
#[derive(Debug)]
struct LayerState {
    file: File,
    path: PathBuf,
    /// Start of the raw svndiff/plaintext data, past the representation
    /// header line.
    start: u64,
    /// Current read position.
    off: u64,
    /// End of the raw data (excluding `ENDREP`).
    end: u64,
    ver: u8,
    chunk_index: usize,
}

impl LayerState {
    fn svndiff_error(&self, err: SvndiffError) -> StoreError {
        match err {
            SvndiffError::Malformed(details) => corrupt(&self.path, details),
            SvndiffError::Io(source) => crate::file_util::PathError {
                path: self.path.clone(),
                source,
            }
            .into(),
        }
    }
}

/// Streaming reader over one representation's reconstructed bytes.
#[derive(Debug)]
pub struct RepReader {
    /// Delta layers, most recent first.
    layers: Vec<LayerState>,
    /// The plain base at the tail of the chain, if the deepest delta is not
    /// against the empty stream.
    plain: Option<LayerState>,
    /// Index of the next output chunk.
    chunk_index: usize,
    /// Reconstructed bytes of the current chunk not yet handed out.
    buf: Option<Vec<u8>>,
    buf_pos: usize,
    md5: Md5,
    finalized: bool,
    expected_md5: [u8; 16],
    expanded_size: u64,
    produced: u64,
}

impl RepReader {
    pub(crate) fn new(store: &RevStore, rep: &Representation) -> StoreResult<Self> {
        let (layers, plain) = build_rep_chain(store, rep)?;
        Ok(Self {
            layers,
            plain,
            chunk_index: 0,
            buf: None,
            buf_pos: 0,
            md5: Md5::new(),
            finalized: false,
            expected_md5: rep.md5,
            expanded_size: rep.expanded_size,
            produced: 0,
        })
    }

    /// Reads the next bytes, verifying the checksum at the end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        let n = self.read_reconstructed(buf)?;
        // Check the checksum as soon as the last byte has been read, in case
        // the caller never performs a short read, but never finalize twice.
        if !self.finalized {
            self.md5.update(&buf[..n]);
            self.produced += n as u64;
            if self.produced == self.expanded_size {
                self.finalized = true;
                let actual: [u8; 16] = self.md5.clone().finalize().into();
                if actual != self.expected_md5 {
                    return Err(StoreError::ChecksumMismatch {
                        path: self.data_path().to_path_buf(),
                        expected: hex::encode(self.expected_md5),
                        actual: hex::encode(actual),
                    });
                }
            }
        }
        Ok(n)
    }

    /// Reads the whole remaining stream.
    pub fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 16 << 10];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    fn data_path(&self) -> &Path {
        self.layers
            .first()
            .or(self.plain.as_ref())
            .map(|rs| rs.path.as_path())
            .expect("representation chain has at least one layer")
    }

    fn read_reconstructed(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        // No delta layers: stream the plaintext directly.
        if self.layers.is_empty() {
            let rs = self.plain.as_mut().expect("chain without layers has a base");
            let copy_len = (buf.len() as u64).min(rs.end - rs.off) as usize;
            rs.file
                .read_exact(&mut buf[..copy_len])
                .context(&rs.path)?;
            rs.off += copy_len as u64;
            return Ok(copy_len);
        }

        let mut written = 0;
        while written < buf.len() {
            if let Some(chunk) = &self.buf {
                let copy_len = (chunk.len() - self.buf_pos).min(buf.len() - written);
                buf[written..written + copy_len]
                    .copy_from_slice(&chunk[self.buf_pos..self.buf_pos + copy_len]);
                let exhausted = self.buf_pos + copy_len == chunk.len();
                self.buf_pos += copy_len;
                written += copy_len;
                if exhausted {
                    self.buf = None;
                }
            } else {
                if self.layers[0].off == self.layers[0].end {
                    break;
                }
                let window = self.next_combined_window()?;
                let source = self.read_window_source(&window)?;
                let target = svndiff::apply_window(&window, &source)
                    .map_err(|err| self.layers[0].svndiff_error(err))?;
                self.buf = Some(target);
                self.buf_pos = 0;
            }
        }
        Ok(written)
    }

    /// Produces the next window of the top layer with all deeper delta
    /// layers composed in.
    fn next_combined_window(&mut self) -> StoreResult<Window> {
        let this_chunk = self.chunk_index;
        self.chunk_index += 1;

        let mut window = read_layer_window(&mut self.layers[0])?;
        for i in 1..self.layers.len() {
            if window.src_ops == 0 {
                break;
            }
            let rs = &mut self.layers[i];
            // Skip windows to reach the current chunk if we aren't there yet.
            while rs.chunk_index < this_chunk {
                svndiff::skip_window(&mut rs.file, rs.ver)
                    .map_err(|err| rs.svndiff_error(err))?;
                rs.chunk_index += 1;
                rs.off = rs.file.stream_position().context(&rs.path)?;
                if rs.off >= rs.end {
                    return Err(corrupt(
                        &rs.path,
                        "Reading one svndiff window read beyond the end of the representation",
                    ));
                }
            }
            let deeper = read_layer_window(rs)?;
            window = svndiff::compose_windows(&deeper, &window)
                .map_err(|err| rs.svndiff_error(err))?;
        }
        Ok(window)
    }

    /// Pulls the composed window's source bytes out of the plain base.
    fn read_window_source(&mut self, window: &Window) -> StoreResult<Vec<u8>> {
        if window.src_ops == 0 {
            return Ok(Vec::new());
        }
        let rs = self
            .plain
            .as_mut()
            .ok_or_else(|| corrupt(self.layers[0].path.clone(), "svndiff data requested non-existent source"))?;
        if rs.start + window.sview_offset >= rs.end {
            return Err(corrupt(
                &rs.path,
                "svndiff requested position beyond end of stream",
            ));
        }
        if rs.start + window.sview_offset != rs.off {
            rs.off = rs.start + window.sview_offset;
            rs.file.seek(SeekFrom::Start(rs.off)).context(&rs.path)?;
        }
        let mut source = vec![0u8; window.sview_len];
        rs.file.read_exact(&mut source).context(&rs.path)?;
        rs.off += window.sview_len as u64;
        Ok(source)
    }
}

fn read_layer_window(rs: &mut LayerState) -> StoreResult<Window> {
    let window = svndiff::read_window(&mut rs.file, rs.ver).map_err(|err| rs.svndiff_error(err))?;
    rs.chunk_index += 1;
    rs.off = rs.file.stream_position().context(&rs.path)?;
    if rs.off > rs.end {
        return Err(corrupt(
            &rs.path,
            "Reading one svndiff window read beyond the end of the representation",
        ));
    }
    Ok(window)
}

/// Opens the file holding `rep`'s payload, positioned at the payload.
fn open_and_seek_representation(
    store: &RevStore,
    rep: &Representation,
) -> StoreResult<(File, PathBuf)> {
    let path = match &rep.location {
        RepLocation::Txn(txn_id) => store.txn_proto_rev_path(txn_id),
        RepLocation::Revision(rev) => {
            return store
                .open_and_seek_revision(*rev, rep.offset)
                .map(|file| (file, store.rev_path(*rev)));
        }
    };
    let mut file = File::open(&path).context(&path)?;
    file.seek(SeekFrom::Start(rep.offset)).context(&path)?;
    Ok((file, path))
}

/// Follows `DELTA` base references from `first_rep` down to a plain base or
/// a delta against the empty stream.
fn build_rep_chain(
    store: &RevStore,
    first_rep: &Representation,
) -> StoreResult<(Vec<LayerState>, Option<LayerState>)> {
    let mut layers = Vec::new();
    let mut rep = first_rep.clone();
    loop {
        let (mut file, path) = open_and_seek_representation(store, &rep)?;
        let header = {
            let line = read_short_line(&mut file).context(&path)?;
            RepHeader::read(&mut line.as_slice(), &path)?
        };
        let start = file.stream_position().context(&path)?;
        let mut rs = LayerState {
            file,
            path,
            start,
            off: start,
            end: start + rep.size,
            ver: 0,
            chunk_index: 0,
        };

        let delta_base = match header {
            RepHeader::Plain => {
                return Ok((layers, Some(rs)));
            }
            RepHeader::DeltaVsEmpty => None,
            RepHeader::Delta {
                base_rev,
                base_offset,
                base_len,
            } => Some((base_rev, base_offset, base_len)),
        };

        let mut magic = [0u8; 4];
        rs.file.read_exact(&mut magic).context(&rs.path)?;
        rs.ver = svndiff::parse_stream_header(magic).map_err(|err| rs.svndiff_error(err))?;
        if rs.ver != svndiff::FORMAT_VERSION {
            return Err(corrupt(&rs.path, "Malformed svndiff data in representation"));
        }
        rs.off += 4;
        layers.push(rs);

        match delta_base {
            None => return Ok((layers, None)),
            Some((base_rev, base_offset, base_len)) => {
                rep = Representation {
                    location: RepLocation::Revision(base_rev),
                    offset: base_offset,
                    size: base_len,
                    expanded_size: 0,
                    md5: [0; 16],
                };
            }
        }
    }
}

/// Reads one `\n`-terminated line byte by byte, so the file position ends up
/// exactly past the terminator. Representation headers are short.
fn read_short_line(file: &mut File) -> io::Result<Vec<u8>> {
    let mut line = Vec::with_capacity(32);
    loop {
        let mut byte = [0u8];
        file.read_exact(&mut byte)?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > 160 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "representation header line too long",
            ));
        }
    }
}

/// File contents stream handed out by the store; empty when a node has no
/// data representation.
#[derive(Debug)]
pub struct ContentsReader(Option<RepReader>);

impl ContentsReader {
    pub(crate) fn empty() -> Self {
        Self(None)
    }

    pub(crate) fn for_rep(store: &RevStore, rep: &Representation) -> StoreResult<Self> {
        Ok(Self(Some(RepReader::new(store, rep)?)))
    }

    /// Reads the whole stream, verifying the checksum.
    pub fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        match &mut self.0 {
            Some(reader) => reader.read_all(),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        match &mut self.0 {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Read for ContentsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(reader) => reader.read(buf).map_err(io::Error::other),
            None => Ok(0),
        }
    }
}
