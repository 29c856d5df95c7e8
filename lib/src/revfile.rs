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

//! Reader/writer for the on-disk revision file format.
//!
//! A revision file is a concatenation of representation payloads and
//! node-revision header blocks, followed by the changed-path log, and closed
//! by a one-line trailer carrying the offsets of the root node-revision and
//! of the changed-path log. Everything is line-oriented text except the
//! svndiff payload bytes between a representation's `DELTA` header and its
//! `ENDREP` footer.

use std::collections::HashMap;
use std::io;
use std::io::BufRead;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

use crate::node_id::NodeRevId;
use crate::node_id::Rev;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;

pub const HEADER_ID: &str = "id";
pub const HEADER_TYPE: &str = "type";
pub const HEADER_COUNT: &str = "count";
pub const HEADER_PROPS: &str = "props";
pub const HEADER_TEXT: &str = "text";
pub const HEADER_CPATH: &str = "cpath";
pub const HEADER_PRED: &str = "pred";
pub const HEADER_COPYFROM: &str = "copyfrom";
pub const HEADER_COPYROOT: &str = "copyroot";

/// Cosmetic framing line closing every representation payload.
pub const ENDREP: &[u8] = b"ENDREP\n";

/// What a node-revision describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

/// Where a representation's payload lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepLocation {
    Revision(Rev),
    Txn(String),
}

/// Descriptor of one stored byte string.
///
/// `size` is the on-disk payload length (between the representation header
/// and `ENDREP`), `expanded_size` the reconstructed length, and `md5` the
/// digest of the reconstructed bytes. Mutable property and directory
/// representations are written as the bare token `-1` and carry no byte
/// level fields until commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Representation {
    pub location: RepLocation,
    pub offset: u64,
    pub size: u64,
    pub expanded_size: u64,
    pub md5: [u8; 16],
}

impl Representation {
    /// A fresh mutable representation owned by `txn_id`.
    pub fn mutable(txn_id: impl Into<String>) -> Self {
        Self {
            location: RepLocation::Txn(txn_id.into()),
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
        }
    }

    pub fn txn_id(&self) -> Option<&str> {
        match &self.location {
            RepLocation::Txn(txn_id) => Some(txn_id),
            RepLocation::Revision(_) => None,
        }
    }

    pub fn revision(&self) -> Option<Rev> {
        match self.location {
            RepLocation::Revision(rev) => Some(rev),
            RepLocation::Txn(_) => None,
        }
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    /// Parses a descriptor line. `txn_id` supplies the owner for the mutable
    /// `-1` form; `truncated` permits the bare `-1` used for property and
    /// directory representations.
    pub fn parse(
        s: &str,
        txn_id: Option<&str>,
        truncated: bool,
        path: &Path,
    ) -> StoreResult<Self> {
        let malformed = || corrupt(path, "Malformed text rep offset line in node-rev");
        let mut tokens = s.split(' ');
        let first = tokens.next().ok_or_else(malformed)?;
        let location = if first == "-1" {
            let txn_id = txn_id.ok_or_else(malformed)?;
            RepLocation::Txn(txn_id.to_owned())
        } else {
            RepLocation::Revision(first.parse().map_err(|_| malformed())?)
        };
        if truncated && matches!(location, RepLocation::Txn(_)) {
            return Ok(Self {
                location,
                offset: 0,
                size: 0,
                expanded_size: 0,
                md5: [0; 16],
            });
        }
        let mut next_u64 = || -> StoreResult<u64> {
            tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(malformed)
        };
        let offset = next_u64()?;
        let size = next_u64()?;
        let expanded_size = next_u64()?;
        let md5_hex = tokens.next().ok_or_else(malformed)?;
        if md5_hex.len() != 32 {
            return Err(malformed());
        }
        let md5: [u8; 16] = hex::decode(md5_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(malformed)?;
        Ok(Self {
            location,
            offset,
            size,
            expanded_size,
            md5,
        })
    }

    /// Formats the descriptor for a node-revision header line.
    pub fn unparse(&self, truncated: bool) -> String {
        match &self.location {
            RepLocation::Txn(_) if truncated => "-1".to_owned(),
            RepLocation::Txn(_) => format!(
                "-1 {} {} {} {}",
                self.offset,
                self.size,
                self.expanded_size,
                self.md5_hex()
            ),
            RepLocation::Revision(rev) => format!(
                "{rev} {} {} {} {}",
                self.offset,
                self.size,
                self.expanded_size,
                self.md5_hex()
            ),
        }
    }
}

/// The immutable record for one node at one revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRev {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    pub predecessor_count: u32,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// The path at which this node was first introduced.
    pub created_path: String,
    pub copyfrom: Option<(Rev, String)>,
    /// `None` means the default of `(self revision, created_path)`.
    pub copyroot: Option<(Rev, String)>,
}

impl NodeRev {
    fn copyroot_is_default(&self) -> bool {
        match &self.copyroot {
            None => true,
            Some((rev, path)) => self.id.rev() == Some(*rev) && *path == self.created_path,
        }
    }
}

/// Reads a `name: value` header block terminated by a blank line. The reader
/// must be positioned at the block's first byte.
pub fn read_header_block<R: BufRead>(
    reader: &mut R,
    path: &Path,
) -> StoreResult<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        let line = read_text_line(reader, path)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| corrupt(path, "Found malformed header in revision file"))?;
        headers.insert(name.to_owned(), value.to_owned());
    }
}

/// Builds a node-revision from a parsed header block.
pub fn node_rev_from_headers(
    headers: &HashMap<String, String>,
    path: &Path,
) -> StoreResult<NodeRev> {
    let id_str = headers
        .get(HEADER_ID)
        .ok_or_else(|| corrupt(path, "Missing node-id in node-rev"))?;
    let id = NodeRevId::parse(id_str).ok_or_else(|| corrupt(path, "Corrupt node-id in node-rev"))?;

    let kind = headers
        .get(HEADER_TYPE)
        .and_then(|value| NodeKind::parse(value))
        .ok_or_else(|| corrupt(path, "Missing kind field in node-rev"))?;

    let predecessor_count = match headers.get(HEADER_COUNT) {
        Some(value) => value
            .parse()
            .map_err(|_| corrupt(path, "Corrupt count in node-rev"))?,
        None => 0,
    };

    let prop_rep = headers
        .get(HEADER_PROPS)
        .map(|value| Representation::parse(value, id.txn_id(), true, path))
        .transpose()?;
    let data_rep = headers
        .get(HEADER_TEXT)
        .map(|value| Representation::parse(value, id.txn_id(), kind == NodeKind::Dir, path))
        .transpose()?;

    let created_path = headers
        .get(HEADER_CPATH)
        .ok_or_else(|| corrupt(path, "Missing cpath in node-rev"))?
        .clone();

    let predecessor_id = headers
        .get(HEADER_PRED)
        .map(|value| {
            NodeRevId::parse(value).ok_or_else(|| corrupt(path, "Corrupt pred in node-rev"))
        })
        .transpose()?;

    let parse_rev_path = |value: &str, what: &'static str| -> StoreResult<(Rev, String)> {
        let (rev, rev_path) = value
            .split_once(' ')
            .ok_or_else(|| corrupt(path, what))?;
        let rev = rev.parse().map_err(|_| corrupt(path, what))?;
        Ok((rev, rev_path.to_owned()))
    };
    let copyroot = headers
        .get(HEADER_COPYROOT)
        .map(|value| parse_rev_path(value, "Malformed copyroot line in node-rev"))
        .transpose()?;
    let copyfrom = headers
        .get(HEADER_COPYFROM)
        .map(|value| parse_rev_path(value, "Malformed copyfrom line in node-rev"))
        .transpose()?;

    Ok(NodeRev {
        id,
        kind,
        predecessor_id,
        predecessor_count,
        data_rep,
        prop_rep,
        created_path,
        copyfrom,
        copyroot,
    })
}

/// Writes a node-revision header block, including the terminating blank line.
pub fn write_node_rev<W: Write>(writer: &mut W, noderev: &NodeRev) -> io::Result<()> {
    writeln!(writer, "{HEADER_ID}: {}", noderev.id)?;
    writeln!(writer, "{HEADER_TYPE}: {}", noderev.kind.as_str())?;
    if let Some(pred) = &noderev.predecessor_id {
        writeln!(writer, "{HEADER_PRED}: {pred}")?;
    }
    writeln!(writer, "{HEADER_COUNT}: {}", noderev.predecessor_count)?;
    if let Some(rep) = &noderev.data_rep {
        writeln!(
            writer,
            "{HEADER_TEXT}: {}",
            rep.unparse(noderev.kind == NodeKind::Dir)
        )?;
    }
    if let Some(rep) = &noderev.prop_rep {
        writeln!(writer, "{HEADER_PROPS}: {}", rep.unparse(true))?;
    }
    writeln!(writer, "{HEADER_CPATH}: {}", noderev.created_path)?;
    if let Some((rev, path)) = &noderev.copyfrom {
        writeln!(writer, "{HEADER_COPYFROM}: {rev} {path}")?;
    }
    if !noderev.copyroot_is_default()
        && let Some((rev, path)) = &noderev.copyroot
    {
        writeln!(writer, "{HEADER_COPYROOT}: {rev} {path}")?;
    }
    writeln!(writer)
}

/// The header line introducing a representation payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepHeader {
    Plain,
    DeltaVsEmpty,
    Delta {
        base_rev: Rev,
        base_offset: u64,
        base_len: u64,
    },
}

impl RepHeader {
    pub fn read<R: BufRead>(reader: &mut R, path: &Path) -> StoreResult<Self> {
        let line = read_text_line(reader, path)?;
        if line == "PLAIN" {
            return Ok(Self::Plain);
        }
        if line == "DELTA" {
            return Ok(Self::DeltaVsEmpty);
        }
        let malformed = || corrupt(path, "Malformed representation header");
        let rest = line.strip_prefix("DELTA ").ok_or_else(malformed)?;
        let mut tokens = rest.split(' ');
        let mut next_u64 = || -> StoreResult<u64> {
            tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(malformed)
        };
        let base_rev = next_u64()?;
        let base_offset = next_u64()?;
        let base_len = next_u64()?;
        Ok(Self::Delta {
            base_rev,
            base_offset,
            base_len,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Plain => writer.write_all(b"PLAIN\n"),
            Self::DeltaVsEmpty => writer.write_all(b"DELTA\n"),
            Self::Delta {
                base_rev,
                base_offset,
                base_len,
            } => writeln!(writer, "DELTA {base_rev} {base_offset} {base_len}"),
        }
    }
}

/// Kinds a changed-path entry can be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Replace,
    Reset,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modify => "modify",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Reset => "reset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "modify" => Some(Self::Modify),
            "add" => Some(Self::Add),
            "delete" => Some(Self::Delete),
            "replace" => Some(Self::Replace),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// One raw entry of a changes log, in log order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    /// `None` only for `reset` entries.
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<(Rev, String)>,
}

/// The folded, per-path summary of a revision's changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathChange {
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
}

/// Reads the next entry of a changes log, or `None` at the terminating blank
/// line or end of file.
pub fn read_change<R: BufRead>(reader: &mut R, path: &Path) -> StoreResult<Option<Change>> {
    let mut line = String::new();
    if reader
        .read_line(&mut line)
        .map_err(|err| read_error(err, path))?
        == 0
    {
        return Ok(None);
    }
    strip_eol(&mut line);
    if line.is_empty() {
        return Ok(None);
    }

    let malformed = || corrupt(path, "Invalid changes line in rev-file");
    let mut tokens = line.splitn(5, ' ');
    let id_str = tokens.next().ok_or_else(malformed)?;
    let noderev_id = if id_str == "reset" {
        None
    } else {
        Some(NodeRevId::parse(id_str).ok_or_else(malformed)?)
    };
    let kind = tokens
        .next()
        .and_then(ChangeKind::parse)
        .ok_or_else(|| corrupt(path, "Invalid change kind in rev file"))?;
    let parse_flag = |token: Option<&str>, what: &'static str| -> StoreResult<bool> {
        match token {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            _ => Err(corrupt(path, what)),
        }
    };
    let text_mod = parse_flag(tokens.next(), "Invalid text-mod flag in rev-file")?;
    let prop_mod = parse_flag(tokens.next(), "Invalid prop-mod flag in rev-file")?;
    let changed_path = tokens.next().ok_or_else(malformed)?.to_owned();

    // The copyfrom line follows every entry, possibly empty.
    let copyfrom_line = read_text_line(reader, path)?;
    let copyfrom = if copyfrom_line.is_empty() {
        None
    } else {
        let (rev, from_path) = copyfrom_line.split_once(' ').ok_or_else(malformed)?;
        let rev = rev.parse().map_err(|_| malformed())?;
        Some((rev, from_path.to_owned()))
    };

    Ok(Some(Change {
        path: changed_path,
        noderev_id,
        kind,
        text_mod,
        prop_mod,
        copyfrom,
    }))
}

/// Writes one changed-path entry in the two-line shape.
pub fn write_change_entry<W: Write>(
    writer: &mut W,
    path: &str,
    change: &PathChange,
    copyfrom: Option<&(Rev, String)>,
) -> io::Result<()> {
    let idstr = match &change.noderev_id {
        Some(id) => id.to_string(),
        None => "reset".to_owned(),
    };
    writeln!(
        writer,
        "{idstr} {} {} {} {path}",
        change.kind.as_str(),
        flag(change.text_mod),
        flag(change.prop_mod),
    )?;
    match copyfrom {
        Some((rev, from_path)) => writeln!(writer, "{rev} {from_path}"),
        None => writeln!(writer),
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Locates the trailer of an open revision file and returns
/// `(root_offset, changes_offset)`.
pub fn read_trailer<F: Read + Seek>(file: &mut F, path: &Path) -> StoreResult<(u64, u64)> {
    // The final line holding the two offsets is assumed to never be longer
    // than 64 characters.
    let size = file.seek(SeekFrom::End(0)).map_err(|err| read_error(err, path))?;
    if size == 0 {
        return Err(corrupt(path, "Revision file lacks trailing newline"));
    }
    let window = size.min(64);
    file.seek(SeekFrom::End(-(window as i64)))
        .map_err(|err| read_error(err, path))?;
    let mut buf = vec![0u8; window as usize];
    file.read_exact(&mut buf).map_err(|err| read_error(err, path))?;

    if buf[buf.len() - 1] != b'\n' {
        return Err(corrupt(path, "Revision file lacks trailing newline"));
    }
    let line_start = match buf[..buf.len() - 1].iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None if window < 64 => 0,
        None => {
            return Err(corrupt(
                path,
                "Final line in revision file longer than 64 characters",
            ));
        }
    };
    let line = std::str::from_utf8(&buf[line_start..buf.len() - 1])
        .map_err(|_| corrupt(path, "Final line in revision file missing space"))?;
    let (root, changes) = line
        .split_once(' ')
        .ok_or_else(|| corrupt(path, "Final line in revision file missing space"))?;
    let root_offset = root
        .parse()
        .map_err(|_| corrupt(path, "Final line in revision file missing space"))?;
    let changes_offset = changes
        .parse()
        .map_err(|_| corrupt(path, "Final line in revision file missing space"))?;
    Ok((root_offset, changes_offset))
}

/// Writes the trailer. The leading newline doubles as the changed-path log
/// terminator.
pub fn write_trailer<W: Write>(
    writer: &mut W,
    root_offset: u64,
    changes_offset: u64,
) -> io::Result<()> {
    write!(writer, "\n{root_offset} {changes_offset}\n")
}

fn read_text_line<R: BufRead>(reader: &mut R, path: &Path) -> StoreResult<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|err| read_error(err, path))?;
    if n == 0 {
        return Err(corrupt(path, "Unexpected end of file"));
    }
    strip_eol(&mut line);
    Ok(line)
}

fn strip_eol(line: &mut String) {
    if line.ends_with('\n') {
        line.pop();
    }
}

fn read_error(err: io::Error, path: &Path) -> StoreError {
    crate::file_util::PathError {
        path: path.to_path_buf(),
        source: err,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use indoc::indoc;

    use super::*;

    fn test_path() -> PathBuf {
        PathBuf::from("revs/3")
    }

    fn sample_noderev() -> NodeRev {
        NodeRev {
            id: NodeRevId::committed("5", "1", 3, 440),
            kind: NodeKind::File,
            predecessor_id: Some(NodeRevId::committed("5", "1", 2, 121)),
            predecessor_count: 2,
            data_rep: Some(Representation {
                location: RepLocation::Revision(3),
                offset: 0,
                size: 42,
                expanded_size: 80,
                md5: [0xab; 16],
            }),
            prop_rep: None,
            created_path: "/trunk/file.c".to_owned(),
            copyfrom: None,
            copyroot: None,
        }
    }

    #[test]
    fn test_node_rev_roundtrip() {
        let noderev = sample_noderev();
        let mut out = Vec::new();
        write_node_rev(&mut out, &noderev).unwrap();
        let mut reader = out.as_slice();
        let headers = read_header_block(&mut reader, &test_path()).unwrap();
        let parsed = node_rev_from_headers(&headers, &test_path()).unwrap();
        assert_eq!(parsed, noderev);
    }

    #[test]
    fn test_node_rev_copyfrom_and_copyroot() {
        let mut noderev = sample_noderev();
        noderev.copyfrom = Some((2, "/branches/b/file.c".to_owned()));
        noderev.copyroot = Some((1, "/branches/b".to_owned()));
        let mut out = Vec::new();
        write_node_rev(&mut out, &noderev).unwrap();
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("copyfrom: 2 /branches/b/file.c\n"));
        assert!(text.contains("copyroot: 1 /branches/b\n"));
        let mut reader = out.as_slice();
        let headers = read_header_block(&mut reader, &test_path()).unwrap();
        assert_eq!(node_rev_from_headers(&headers, &test_path()).unwrap(), noderev);
    }

    #[test]
    fn test_default_copyroot_not_written() {
        let mut noderev = sample_noderev();
        noderev.copyroot = Some((3, "/trunk/file.c".to_owned()));
        let mut out = Vec::new();
        write_node_rev(&mut out, &noderev).unwrap();
        assert!(!std::str::from_utf8(&out).unwrap().contains("copyroot"));
    }

    #[test]
    fn test_malformed_header_line() {
        let mut reader: &[u8] = b"id no colon separator\n\n";
        assert_matches!(
            read_header_block(&mut reader, &test_path()),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn test_rep_parse_mutable_forms() {
        let truncated =
            Representation::parse("-1", Some("3-1"), true, &test_path()).unwrap();
        assert_eq!(truncated, Representation::mutable("3-1"));

        let full = Representation::parse(
            "-1 17 10 6 11223344556677889900aabbccddeeff",
            Some("3-1"),
            false,
            &test_path(),
        )
        .unwrap();
        assert_eq!(full.txn_id(), Some("3-1"));
        assert_eq!((full.offset, full.size, full.expanded_size), (17, 10, 6));
        assert_eq!(full.unparse(false), "-1 17 10 6 11223344556677889900aabbccddeeff");
    }

    #[test]
    fn test_rep_parse_rejects_short_md5() {
        assert_matches!(
            Representation::parse("3 0 10 10 abcd", None, false, &test_path()),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn test_rep_header_roundtrip() {
        for header in [
            RepHeader::Plain,
            RepHeader::DeltaVsEmpty,
            RepHeader::Delta {
                base_rev: 7,
                base_offset: 123,
                base_len: 456,
            },
        ] {
            let mut out = Vec::new();
            header.write(&mut out).unwrap();
            let parsed = RepHeader::read(&mut out.as_slice(), &test_path()).unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn test_change_entry_roundtrip() {
        let mut out = Vec::new();
        write_change_entry(
            &mut out,
            "/trunk/with space.txt",
            &PathChange {
                noderev_id: Some(NodeRevId::committed("5", "1", 3, 440)),
                kind: ChangeKind::Replace,
                text_mod: true,
                prop_mod: false,
            },
            Some(&(2, "/trunk/old name.txt".to_owned())),
        )
        .unwrap();
        let mut reader = out.as_slice();
        let change = read_change(&mut reader, &test_path()).unwrap().unwrap();
        assert_eq!(change.path, "/trunk/with space.txt");
        assert_eq!(change.kind, ChangeKind::Replace);
        assert!(change.text_mod);
        assert!(!change.prop_mod);
        assert_eq!(change.copyfrom, Some((2, "/trunk/old name.txt".to_owned())));
        // The log ends at the blank line.
        assert_eq!(read_change(&mut reader, &test_path()).unwrap(), None);
    }

    #[test]
    fn test_reset_change_entry() {
        let mut input: &[u8] = b"reset reset false false /trunk\n\n";
        let change = read_change(&mut input, &test_path()).unwrap().unwrap();
        assert_eq!(change.noderev_id, None);
        assert_eq!(change.kind, ChangeKind::Reset);
    }

    #[test]
    fn test_trailer_roundtrip() {
        let mut data = b"lots of revision file content\n".to_vec();
        write_trailer(&mut data, 17, 107).unwrap();
        let mut cursor = Cursor::new(data);
        assert_eq!(read_trailer(&mut cursor, &test_path()).unwrap(), (17, 107));
    }

    #[test]
    fn test_trailer_in_tiny_file() {
        let mut cursor = Cursor::new(b"17 107\n".to_vec());
        assert_eq!(read_trailer(&mut cursor, &test_path()).unwrap(), (17, 107));
    }

    #[test]
    fn test_trailer_requires_final_newline() {
        let mut cursor = Cursor::new(b"some content\n17 107".to_vec());
        assert_matches!(
            read_trailer(&mut cursor, &test_path()),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn test_trailer_requires_space() {
        let mut cursor = Cursor::new(b"some content\n17107\n".to_vec());
        assert_matches!(
            read_trailer(&mut cursor, &test_path()),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn test_sample_rev_zero() {
        let content = indoc! {"
            PLAIN
            END
            ENDREP
            id: 0.0.r0/17
            type: dir
            count: 0
            text: 0 0 4 4 2d2977d1c96f487abe4a1e202dd03b4e
            cpath: /

            \n17 107
        "};
        let mut cursor = Cursor::new(content.as_bytes().to_vec());
        let (root_offset, changes_offset) = read_trailer(&mut cursor, &test_path()).unwrap();
        assert_eq!((root_offset, changes_offset), (17, 107));

        cursor.seek(SeekFrom::Start(root_offset)).unwrap();
        let mut reader = io::BufReader::new(cursor);
        let headers = read_header_block(&mut reader, &test_path()).unwrap();
        let root = node_rev_from_headers(&headers, &test_path()).unwrap();
        assert_eq!(root.id, NodeRevId::committed("0", "0", 0, 17));
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.created_path, "/");
    }
}
