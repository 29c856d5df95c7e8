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

//! Text serialization of string-keyed hashes.
//!
//! The on-disk framing is `K <len>\n<key>\nV <len>\n<value>\n` per pair,
//! terminated by `END\n`. Incremental edits appended after a terminated dump
//! reuse the `K`/`V` shape for inserts and `D <len>\n<key>\n` for deletions,
//! and run to end of file without a terminator of their own. Property lists,
//! directory entry tables and transaction properties are all stored this way.

use std::collections::BTreeMap;
use std::io;
use std::io::BufRead;
use std::io::Write;

use bstr::BString;
use thiserror::Error;

/// Hashes are serialized and parsed in key order; values are raw bytes.
pub type HashMapText = BTreeMap<String, BString>;

#[derive(Debug, Error)]
pub enum HashTextError {
    #[error("Malformed hash file: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes `hash` as a terminated dump.
pub fn write_hash<W: Write>(writer: &mut W, hash: &HashMapText) -> io::Result<()> {
    for (key, value) in hash {
        write_hash_entry(writer, key, value)?;
    }
    writer.write_all(b"END\n")
}

/// Writes one `K`/`V` record, as used both in full dumps and as an
/// incremental insert-or-replace edit.
pub fn write_hash_entry<W: Write>(writer: &mut W, key: &str, value: &[u8]) -> io::Result<()> {
    write!(writer, "K {}\n{key}\nV {}\n", key.len(), value.len())?;
    writer.write_all(value)?;
    writer.write_all(b"\n")
}

/// Writes one incremental `D` (delete) record.
pub fn write_hash_delete<W: Write>(writer: &mut W, key: &str) -> io::Result<()> {
    write!(writer, "D {}\n{key}\n", key.len())
}

/// Reads a terminated dump, consuming up to and including the `END` line.
pub fn read_hash<R: BufRead>(reader: &mut R) -> Result<HashMapText, HashTextError> {
    let mut hash = HashMapText::new();
    loop {
        match read_record(reader, true)? {
            Record::Insert(key, value) => {
                hash.insert(key, value);
            }
            Record::Delete(_) => return Err(HashTextError::Malformed("delete in full dump")),
            Record::End => return Ok(hash),
            Record::Eof => return Err(HashTextError::Malformed("missing END")),
        }
    }
}

/// Applies incremental edits to `hash` until end of input.
pub fn read_hash_incremental<R: BufRead>(
    reader: &mut R,
    hash: &mut HashMapText,
) -> Result<(), HashTextError> {
    loop {
        match read_record(reader, false)? {
            Record::Insert(key, value) => {
                hash.insert(key, value);
            }
            Record::Delete(key) => {
                hash.remove(&key);
            }
            Record::End | Record::Eof => return Ok(()),
        }
    }
}

enum Record {
    Insert(String, BString),
    Delete(String),
    End,
    Eof,
}

fn read_record<R: BufRead>(reader: &mut R, want_end: bool) -> Result<Record, HashTextError> {
    let header = match read_text_line(reader)? {
        Some(line) => line,
        None => return Ok(Record::Eof),
    };
    if header == "END" {
        return Ok(Record::End);
    }
    if let Some(len) = header.strip_prefix("K ") {
        let key = read_sized(reader, len)?;
        let value_header = read_text_line(reader)?
            .ok_or(HashTextError::Malformed("unexpected end of file after key"))?;
        let value_len = value_header
            .strip_prefix("V ")
            .ok_or(HashTextError::Malformed("expected value record"))?;
        let value = read_sized(reader, value_len)?;
        let key =
            String::from_utf8(key).map_err(|_| HashTextError::Malformed("non-UTF-8 key"))?;
        Ok(Record::Insert(key, value.into()))
    } else if let Some(len) = header.strip_prefix("D ") {
        if want_end {
            return Err(HashTextError::Malformed("delete in full dump"));
        }
        let key = read_sized(reader, len)?;
        let key =
            String::from_utf8(key).map_err(|_| HashTextError::Malformed("non-UTF-8 key"))?;
        Ok(Record::Delete(key))
    } else {
        Err(HashTextError::Malformed("unrecognized record header"))
    }
}

/// Reads one `\n`-terminated line as UTF-8 without the terminator. Returns
/// `None` at end of input.
fn read_text_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, HashTextError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(HashTextError::Malformed("unterminated line"));
    }
    line.pop();
    Ok(Some(line))
}

fn read_sized<R: BufRead>(reader: &mut R, len: &str) -> Result<Vec<u8>, HashTextError> {
    let len: usize = len
        .parse()
        .map_err(|_| HashTextError::Malformed("bad length"))?;
    let mut data = vec![0; len];
    reader.read_exact(&mut data)?;
    let mut newline = [0];
    reader.read_exact(&mut newline)?;
    if newline != *b"\n" {
        return Err(HashTextError::Malformed("missing newline after data"));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use indoc::indoc;

    use super::*;

    fn hash_of(pairs: &[(&str, &str)]) -> HashMapText {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), BString::from(v)))
            .collect()
    }

    #[test]
    fn test_write_format() {
        let mut out = Vec::new();
        write_hash(&mut out, &hash_of(&[("log", "fix"), ("author", "jane")])).unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            indoc! {"
                K 6
                author
                V 4
                jane
                K 3
                log
                V 3
                fix
                END
            "}
        );
    }

    #[test]
    fn test_roundtrip() {
        let hash = hash_of(&[("a", ""), ("name with spaces", "value\nwith\nnewlines")]);
        let mut out = Vec::new();
        write_hash(&mut out, &hash).unwrap();
        assert_eq!(read_hash(&mut out.as_slice()).unwrap(), hash);
    }

    #[test]
    fn test_read_stops_at_terminator() {
        let mut input: &[u8] = b"END\ntrailing garbage";
        assert!(read_hash(&mut input).unwrap().is_empty());
        assert_eq!(input, b"trailing garbage");
    }

    #[test]
    fn test_missing_terminator() {
        let mut input: &[u8] = b"K 1\na\nV 1\nb\n";
        assert_matches!(read_hash(&mut input), Err(HashTextError::Malformed(_)));
    }

    #[test]
    fn test_incremental_edits() {
        let mut serialized = Vec::new();
        write_hash(&mut serialized, &hash_of(&[("kept", "1"), ("dropped", "2")])).unwrap();
        write_hash_entry(&mut serialized, "added", b"3").unwrap();
        write_hash_delete(&mut serialized, "dropped").unwrap();
        write_hash_entry(&mut serialized, "kept", b"updated").unwrap();

        let mut reader = serialized.as_slice();
        let mut hash = read_hash(&mut reader).unwrap();
        read_hash_incremental(&mut reader, &mut hash).unwrap();
        assert_eq!(hash, hash_of(&[("kept", "updated"), ("added", "3")]));
    }

    #[test]
    fn test_binary_values() {
        let mut out = Vec::new();
        let mut hash = HashMapText::new();
        hash.insert("bin".to_owned(), BString::from(&b"\x00\xff\n\x01"[..]));
        write_hash(&mut out, &hash).unwrap();
        assert_eq!(read_hash(&mut out.as_slice()).unwrap(), hash);
    }
}
