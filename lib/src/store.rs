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

//! The repository store: layout, creation, and the concurrent read path.
//!
//! A store is a directory holding one file per committed revision plus a
//! `current` pointer naming the youngest revision. Readers only ever look at
//! files that `current` can reach, and `current` itself is replaced
//! atomically, so any number of reader processes may run while one writer
//! commits.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools as _;
use rand::Rng as _;
use thiserror::Error;
use tracing::debug;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::create_or_reuse_dir;
use crate::file_util::move_into_place;
use crate::hash_text;
use crate::hash_text::HashTextError;
use crate::node_id::NodeRevId;
use crate::node_id::Rev;
use crate::rep_read::ContentsReader;
use crate::revfile;
use crate::revfile::NodeKind;
use crate::revfile::NodeRev;
use crate::revfile::PathChange;
use crate::revfile::Representation;

const PATH_UUID: &str = "uuid";
const PATH_CURRENT: &str = "current";
const PATH_LOCK_FILE: &str = "write-lock";
const PATH_REVS_DIR: &str = "revs";
const PATH_REVPROPS_DIR: &str = "revprops";
const PATH_TXNS_DIR: &str = "transactions";

const PATH_CHANGES: &str = "changes";
const PATH_TXN_PROPS: &str = "props";
const PATH_NEXT_IDS: &str = "next-ids";
const PATH_REV: &str = "rev";
const PATH_EXT_TXN: &str = ".txn";

/// Byte-exact content of the revision 0 file: an empty root directory whose
/// data representation is the empty entries hash.
const REVISION_ZERO: &str = "PLAIN\nEND\nENDREP\n\
                             id: 0.0.r0/17\n\
                             type: dir\n\
                             count: 0\n\
                             text: 0 0 4 4 2d2977d1c96f487abe4a1e202dd03b4e\n\
                             cpath: /\n\
                             \n\n17 107\n";

/// Unversioned property lists (revision props, node props, txn props).
pub type Proplist = hash_text::HashMapText;

/// Error kinds surfaced by the store, the transaction engine and the
/// representation reader.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{details}, in '{}'", path.display())]
    Corrupt { path: PathBuf, details: String },
    #[error(
        "Checksum mismatch while reading representation from '{}': expected {expected}, actual {actual}",
        path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Transaction out of date")]
    TxnOutOfDate,
    #[error("No such revision {0}")]
    NoSuchRevision(Rev),
    #[error("No such transaction '{0}'")]
    NoSuchTransaction(String),
    #[error("Reference to non-existent node '{0}'")]
    DanglingId(String),
    #[error("Unable to create transaction directory in '{}' for revision {rev}", path.display())]
    UniqueNamesExhausted { path: PathBuf, rev: Rev },
    #[error("Can't set text contents of a directory")]
    NotFile,
    #[error("Attempted to write to non-transaction")]
    NotMutable,
    #[error(transparent)]
    Io(#[from] PathError),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn corrupt(path: impl AsRef<Path>, details: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.as_ref().to_path_buf(),
        details: details.into(),
    }
}

pub(crate) fn hash_text_error(err: HashTextError, path: &Path) -> StoreError {
    match err {
        HashTextError::Malformed(details) => corrupt(path, format!("Malformed hash file: {details}")),
        HashTextError::Io(source) => PathError {
            path: path.to_path_buf(),
            source,
        }
        .into(),
    }
}

/// One directory entry: entries map names to `<kind> <node-rev-id>` pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

pub type DirEntries = BTreeMap<String, DirEntry>;

/// An open repository store.
#[derive(Debug)]
pub struct RevStore {
    path: PathBuf,
    // Single-slot directory cache. Tree walks exhibit strong locality, so
    // one slot removes nearly all repeated directory parses.
    dir_cache: RefCell<Option<(NodeRevId, DirEntries)>>,
}

impl RevStore {
    /// Creates a new repository at `path` (the directory itself may already
    /// exist) and opens it. The new repository has revision 0 with a single
    /// empty root directory.
    pub fn init(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        debug!(path = %path.display(), "initializing revision store");
        create_or_reuse_dir(&path).context(&path)?;
        let store = Self {
            path,
            dir_cache: RefCell::new(None),
        };
        for dir in [
            store.revs_dir(),
            store.revprops_dir(),
            store.txns_dir(),
        ] {
            create_or_reuse_dir(&dir).context(&dir)?;
        }
        let current = store.current_path();
        fs::write(&current, "0 1 1\n").context(&current)?;
        let lock = store.lock_path();
        fs::write(&lock, "").context(&lock)?;
        store.set_uuid(&generate_uuid())?;

        let rev0 = store.rev_path(0);
        fs::write(&rev0, REVISION_ZERO).context(&rev0)?;
        let mut props = Proplist::new();
        props.insert("strata:date".to_owned(), now_timestamp().into_bytes().into());
        store.set_revision_proplist(0, &props)?;
        Ok(store)
    }

    /// Opens an existing repository, verifying that its `current` file is
    /// present and readable.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let store = Self {
            path,
            dir_cache: RefCell::new(None),
        };
        let current = store.current_path();
        File::open(&current).context(&current)?;
        debug!(path = %store.path.display(), "opened revision store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Layout.

    pub(crate) fn current_path(&self) -> PathBuf {
        self.path.join(PATH_CURRENT)
    }

    pub(crate) fn uuid_path(&self) -> PathBuf {
        self.path.join(PATH_UUID)
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.path.join(PATH_LOCK_FILE)
    }

    pub(crate) fn revs_dir(&self) -> PathBuf {
        self.path.join(PATH_REVS_DIR)
    }

    pub(crate) fn revprops_dir(&self) -> PathBuf {
        self.path.join(PATH_REVPROPS_DIR)
    }

    pub(crate) fn txns_dir(&self) -> PathBuf {
        self.path.join(PATH_TXNS_DIR)
    }

    pub(crate) fn rev_path(&self, rev: Rev) -> PathBuf {
        self.revs_dir().join(rev.to_string())
    }

    pub(crate) fn revprops_path(&self, rev: Rev) -> PathBuf {
        self.revprops_dir().join(rev.to_string())
    }

    pub(crate) fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.txns_dir().join(format!("{txn_id}{PATH_EXT_TXN}"))
    }

    pub(crate) fn txn_changes_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_CHANGES)
    }

    pub(crate) fn txn_props_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_TXN_PROPS)
    }

    pub(crate) fn txn_next_ids_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_NEXT_IDS)
    }

    pub(crate) fn txn_proto_rev_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_REV)
    }

    pub(crate) fn txn_node_rev_path(&self, id: &NodeRevId) -> PathBuf {
        let txn_id = id.txn_id().expect("node-rev path of a committed id");
        self.txn_dir(txn_id)
            .join(format!("node.{}.{}", id.node_id, id.copy_id))
    }

    pub(crate) fn txn_node_props_path(&self, id: &NodeRevId) -> PathBuf {
        let mut path = self.txn_node_rev_path(id).into_os_string();
        path.push(".props");
        path.into()
    }

    pub(crate) fn txn_node_children_path(&self, id: &NodeRevId) -> PathBuf {
        let mut path = self.txn_node_rev_path(id).into_os_string();
        path.push(".children");
        path.into()
    }

    // The `current` pointer.

    /// The youngest committed revision.
    pub fn youngest_rev(&self) -> StoreResult<Rev> {
        Ok(self.read_current()?.0)
    }

    /// Reads `current`: the youngest revision and the next available node
    /// and copy ids.
    pub(crate) fn read_current(&self) -> StoreResult<(Rev, String, String)> {
        let path = self.current_path();
        let content = fs::read_to_string(&path).context(&path)?;
        let line = content.lines().next().unwrap_or("");
        let mut tokens = line.split(' ');
        let corrupt_current = || corrupt(&path, "Corrupt current file");
        let rev = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(corrupt_current)?;
        let node_id = tokens.next().ok_or_else(corrupt_current)?;
        let copy_id = tokens.next().ok_or_else(corrupt_current)?;
        if !crate::node_id::is_valid_key(node_id) || !crate::node_id::is_valid_key(copy_id) {
            return Err(corrupt_current());
        }
        Ok((rev, node_id.to_owned(), copy_id.to_owned()))
    }

    /// Atomically replaces `current` via a synced temp file.
    pub(crate) fn write_current(
        &self,
        rev: Rev,
        next_node_id: &str,
        next_copy_id: &str,
    ) -> StoreResult<()> {
        let current = self.current_path();
        let mut temp_file =
            tempfile::NamedTempFile::new_in(&self.path).context(&self.path)?;
        writeln!(temp_file, "{rev} {next_node_id} {next_copy_id}").context(temp_file.path())?;
        temp_file
            .as_file()
            .sync_data()
            .context(temp_file.path())?;
        let (_file, temp_path) = temp_file.keep().map_err(|err| PathError {
            path: self.path.clone(),
            source: err.error,
        })?;
        move_into_place(&temp_path, &current, &current)?;
        Ok(())
    }

    // UUID.

    pub fn uuid(&self) -> StoreResult<String> {
        let path = self.uuid_path();
        let content = fs::read_to_string(&path).context(&path)?;
        Ok(content.lines().next().unwrap_or("").to_owned())
    }

    pub fn set_uuid(&self, uuid: &str) -> StoreResult<()> {
        let path = self.uuid_path();
        fs::write(&path, format!("{uuid}\n")).context(&path)?;
        Ok(())
    }

    // Revision properties.

    pub fn revision_proplist(&self, rev: Rev) -> StoreResult<Proplist> {
        let path = self.revprops_path(rev);
        let file = open_or_no_such_revision(&path, rev)?;
        let mut reader = BufReader::new(file);
        hash_text::read_hash(&mut reader).map_err(|err| hash_text_error(err, &path))
    }

    /// Replaces the unversioned properties of `rev`. The revision file is
    /// used as the permissions reference since a first-time revprop file
    /// can't serve as its own.
    pub fn set_revision_proplist(&self, rev: Rev, props: &Proplist) -> StoreResult<()> {
        let final_path = self.revprops_path(rev);
        let revprops_dir = self.revprops_dir();
        let mut temp_file = tempfile::NamedTempFile::new_in(&revprops_dir)
            .context(&revprops_dir)?;
        hash_text::write_hash(&mut temp_file, props).context(temp_file.path())?;
        temp_file.as_file().sync_data().context(temp_file.path())?;
        let (_file, temp_path) = temp_file.keep().map_err(|err| PathError {
            path: revprops_dir.clone(),
            source: err.error,
        })?;
        move_into_place(&temp_path, &final_path, &self.rev_path(rev))?;
        Ok(())
    }

    // Node-revisions.

    /// Opens the revision file of `rev`, positioned at `offset`.
    pub(crate) fn open_and_seek_revision(&self, rev: Rev, offset: u64) -> StoreResult<File> {
        let path = self.rev_path(rev);
        let mut file = open_or_no_such_revision(&path, rev)?;
        file.seek(SeekFrom::Start(offset)).context(&path)?;
        Ok(file)
    }

    /// Reads the node-revision addressed by `id`, whether committed or
    /// transaction-local.
    pub fn node_rev(&self, id: &NodeRevId) -> StoreResult<NodeRev> {
        let (file, path) = if id.txn_id().is_some() {
            let path = self.txn_node_rev_path(id);
            let file = File::open(&path).map_err(|err| dangling_on_enoent(err, &path, id))?;
            (file, path)
        } else {
            let rev = id.rev().unwrap();
            let path = self.rev_path(rev);
            let mut file = File::open(&path).map_err(|err| dangling_on_enoent(err, &path, id))?;
            file.seek(SeekFrom::Start(id.offset().unwrap())).context(&path)?;
            (file, path)
        };
        let mut reader = BufReader::new(file);
        let headers = revfile::read_header_block(&mut reader, &path)?;
        revfile::node_rev_from_headers(&headers, &path)
    }

    /// The id of the root directory of `rev`.
    pub fn rev_root_id(&self, rev: Rev) -> StoreResult<NodeRevId> {
        let path = self.rev_path(rev);
        let mut file = open_or_no_such_revision(&path, rev)?;
        let (root_offset, _changes_offset) = revfile::read_trailer(&mut file, &path)?;
        file.seek(SeekFrom::Start(root_offset)).context(&path)?;
        let mut reader = BufReader::new(file);
        let headers = revfile::read_header_block(&mut reader, &path)?;
        let id_str = headers
            .get(revfile::HEADER_ID)
            .ok_or_else(|| corrupt(&path, "Missing node-id in node-rev"))?;
        NodeRevId::parse(id_str).ok_or_else(|| corrupt(&path, "Corrupt node-id in node-rev"))
    }

    // Directory contents.

    /// The entries of the directory `noderev`, through the single-slot
    /// cache.
    pub fn dir_entries(&self, noderev: &NodeRev) -> StoreResult<DirEntries> {
        if let Some((cached_id, entries)) = &*self.dir_cache.borrow()
            && cached_id == &noderev.id
        {
            return Ok(entries.clone());
        }
        let entries = self.read_dir_entries(noderev)?;
        *self.dir_cache.borrow_mut() = Some((noderev.id.clone(), entries.clone()));
        Ok(entries)
    }

    fn read_dir_entries(&self, noderev: &NodeRev) -> StoreResult<DirEntries> {
        let hash = match &noderev.data_rep {
            Some(rep) if rep.txn_id().is_some() => {
                // Mutable directory: the dumped inherited hash followed by
                // this transaction's incremental edits.
                let path = self.txn_node_children_path(&noderev.id);
                let file = File::open(&path).context(&path)?;
                let mut reader = BufReader::new(file);
                let mut hash = hash_text::read_hash(&mut reader)
                    .map_err(|err| hash_text_error(err, &path))?;
                hash_text::read_hash_incremental(&mut reader, &mut hash)
                    .map_err(|err| hash_text_error(err, &path))?;
                hash
            }
            Some(rep) => {
                let path = self.rep_path(rep);
                let mut reader = BufReader::new(ContentsReader::for_rep(self, rep)?);
                hash_text::read_hash(&mut reader).map_err(|err| hash_text_error(err, &path))?
            }
            None => hash_text::HashMapText::new(),
        };

        let dir_path = self.rep_path_of_node(noderev);
        let mut entries = DirEntries::new();
        for (name, value) in hash {
            let value = String::from_utf8(value.into())
                .map_err(|_| corrupt(&dir_path, "Directory entry corrupt"))?;
            let (kind, id) = value
                .split_once(' ')
                .ok_or_else(|| corrupt(&dir_path, "Directory entry corrupt"))?;
            let kind = NodeKind::parse(kind)
                .ok_or_else(|| corrupt(&dir_path, "Directory entry corrupt"))?;
            let id = NodeRevId::parse(id)
                .ok_or_else(|| corrupt(&dir_path, "Directory entry corrupt"))?;
            entries.insert(name, DirEntry { kind, id });
        }
        Ok(entries)
    }

    pub(crate) fn invalidate_dir_cache(&self, id: &NodeRevId) {
        let mut cache = self.dir_cache.borrow_mut();
        if let Some((cached_id, _)) = &*cache
            && cached_id == id
        {
            *cache = None;
        }
    }

    /// Formats a directory entry value the way the entries hash stores it.
    pub(crate) fn unparse_dir_entry(kind: NodeKind, id: &NodeRevId) -> String {
        format!("{} {id}", kind.as_str())
    }

    fn rep_path(&self, rep: &Representation) -> PathBuf {
        match rep.txn_id() {
            Some(txn_id) => self.txn_proto_rev_path(txn_id),
            None => self.rev_path(rep.revision().unwrap()),
        }
    }

    fn rep_path_of_node(&self, noderev: &NodeRev) -> PathBuf {
        match &noderev.data_rep {
            Some(rep) => self.rep_path(rep),
            None => self.path.clone(),
        }
    }

    // Node properties and contents.

    /// The property list of a node-revision (committed or mutable).
    pub fn proplist(&self, noderev: &NodeRev) -> StoreResult<Proplist> {
        match &noderev.prop_rep {
            Some(rep) if rep.txn_id().is_some() => {
                let path = self.txn_node_props_path(&noderev.id);
                let file = File::open(&path).context(&path)?;
                let mut reader = BufReader::new(file);
                hash_text::read_hash(&mut reader).map_err(|err| hash_text_error(err, &path))
            }
            Some(rep) => {
                let path = self.rep_path(rep);
                let mut reader = BufReader::new(ContentsReader::for_rep(self, rep)?);
                hash_text::read_hash(&mut reader).map_err(|err| hash_text_error(err, &path))
            }
            None => Ok(Proplist::new()),
        }
    }

    /// A stream over the reconstructed file contents of `noderev`.
    pub fn contents(&self, noderev: &NodeRev) -> StoreResult<ContentsReader> {
        match &noderev.data_rep {
            Some(rep) => ContentsReader::for_rep(self, rep),
            None => Ok(ContentsReader::empty()),
        }
    }

    pub fn file_length(&self, noderev: &NodeRev) -> u64 {
        noderev
            .data_rep
            .as_ref()
            .map(|rep| rep.expanded_size)
            .unwrap_or(0)
    }

    pub fn file_md5(&self, noderev: &NodeRev) -> [u8; 16] {
        noderev
            .data_rep
            .as_ref()
            .map(|rep| rep.md5)
            .unwrap_or([0; 16])
    }

    /// Cheap equality of representation keys: two node-revisions share the
    /// same data when their representations point at the same location.
    pub fn same_rep_key(a: Option<&Representation>, b: Option<&Representation>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.offset == b.offset && a.location == b.location,
            _ => false,
        }
    }

    // Changed paths.

    /// The folded changed-path summary of a committed revision. The log is
    /// already folded at commit time, so entries may be in any order and
    /// descendant elision is not re-applied.
    pub fn paths_changed(&self, rev: Rev) -> StoreResult<BTreeMap<String, PathChange>> {
        let path = self.rev_path(rev);
        let mut file = open_or_no_such_revision(&path, rev)?;
        let (_root_offset, changes_offset) = revfile::read_trailer(&mut file, &path)?;
        file.seek(SeekFrom::Start(changes_offset)).context(&path)?;
        let mut reader = BufReader::new(file);
        let (changes, _copyfrom) =
            crate::commit::fetch_all_changes(&mut reader, &path, true)?;
        Ok(changes)
    }

    // Transactions on disk.

    /// Names of all uncommitted transactions, sorted.
    pub fn list_transactions(&self) -> StoreResult<Vec<String>> {
        let txn_dir = self.txns_dir();
        let mut names = Vec::new();
        for entry in fs::read_dir(&txn_dir).context(&txn_dir)? {
            let entry = entry.context(&txn_dir)?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|name| name.strip_suffix(PATH_EXT_TXN)) {
                names.push(id.to_owned());
            }
        }
        Ok(names.into_iter().sorted().collect())
    }

    // Hotcopy.

    /// Copies a quiescent repository into a fresh directory. In-progress
    /// transactions are not carried over.
    pub fn hotcopy(src_path: &Path, dst_path: &Path) -> StoreResult<Self> {
        create_or_reuse_dir(dst_path).context(dst_path)?;
        for name in [PATH_CURRENT, PATH_UUID] {
            let from = src_path.join(name);
            let to = dst_path.join(name);
            fs::copy(&from, &to).context(&from)?;
        }
        let lock = dst_path.join(PATH_LOCK_FILE);
        fs::write(&lock, "").context(&lock)?;

        let dst = Self::open(dst_path)?;
        let youngest = dst.youngest_rev()?;
        for dir in [PATH_REVS_DIR, PATH_REVPROPS_DIR] {
            let subdir = dst_path.join(dir);
            create_or_reuse_dir(&subdir).context(&subdir)?;
            for rev in 0..=youngest {
                let from = src_path.join(dir).join(rev.to_string());
                let to = subdir.join(rev.to_string());
                fs::copy(&from, &to).context(&from)?;
            }
        }
        let txns = dst.txns_dir();
        create_or_reuse_dir(&txns).context(&txns)?;
        Ok(dst)
    }
}

fn open_or_no_such_revision(path: &Path, rev: Rev) -> StoreResult<File> {
    File::open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::NoSuchRevision(rev)
        } else {
            PathError {
                path: path.to_path_buf(),
                source: err,
            }
            .into()
        }
    })
}

fn dangling_on_enoent(err: io::Error, path: &Path, id: &NodeRevId) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::DanglingId(id.to_string())
    } else {
        PathError {
            path: path.to_path_buf(),
            source: err,
        }
        .into()
    }
}

fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes[..]);
    // RFC 4122 version 4, variant 1.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tests::new_temp_dir;

    #[test]
    fn test_init_layout() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        assert!(store.path().join("current").is_file());
        assert!(store.path().join("uuid").is_file());
        assert!(store.path().join("write-lock").is_file());
        assert!(store.path().join("revs").join("0").is_file());
        assert!(store.path().join("revprops").join("0").is_file());
        assert!(store.path().join("transactions").is_dir());
        assert_eq!(store.youngest_rev().unwrap(), 0);
        assert_eq!(store.read_current().unwrap(), (0, "1".to_owned(), "1".to_owned()));
    }

    #[test]
    fn test_uuid_shape() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        let uuid = store.uuid().unwrap();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);
        // Stable across reads.
        assert_eq!(store.uuid().unwrap(), uuid);
    }

    #[test]
    fn test_revision_zero_root() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        let root_id = store.rev_root_id(0).unwrap();
        assert_eq!(root_id, NodeRevId::committed("0", "0", 0, 17));
        let root = store.node_rev(&root_id).unwrap();
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.predecessor_count, 0);
        assert!(store.dir_entries(&root).unwrap().is_empty());
        assert!(store.paths_changed(0).unwrap().is_empty());
    }

    #[test]
    fn test_no_such_revision() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        assert_matches!(store.rev_root_id(99), Err(StoreError::NoSuchRevision(99)));
        assert_matches!(
            store.revision_proplist(99),
            Err(StoreError::NoSuchRevision(99))
        );
    }

    #[test]
    fn test_dangling_node_id() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        let id = NodeRevId::in_txn("_0", "0", "0-1");
        assert_matches!(store.node_rev(&id), Err(StoreError::DanglingId(_)));
    }

    #[test]
    fn test_corrupt_current() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        fs::write(store.current_path(), "garbage\n").unwrap();
        assert_matches!(store.youngest_rev(), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_corrupt_trailer() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        fs::write(store.rev_path(0), "no trailing newline here").unwrap();
        assert_matches!(store.rev_root_id(0), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_revision_proplist_roundtrip() {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        let mut props = Proplist::new();
        props.insert("log".to_owned(), "initial import\n".into());
        store.set_revision_proplist(0, &props).unwrap();
        assert_eq!(store.revision_proplist(0).unwrap(), props);
    }

    #[test]
    fn test_hotcopy() {
        let temp_dir = new_temp_dir();
        let src = RevStore::init(temp_dir.path().join("src")).unwrap();
        let dst = RevStore::hotcopy(src.path(), &temp_dir.path().join("dst")).unwrap();
        assert_eq!(dst.youngest_rev().unwrap(), 0);
        assert_eq!(dst.uuid().unwrap(), src.uuid().unwrap());
        assert!(dst.list_transactions().unwrap().is_empty());
        assert_eq!(
            dst.rev_root_id(0).unwrap(),
            NodeRevId::committed("0", "0", 0, 17)
        );
    }

    #[test]
    fn test_generate_uuid_is_v4() {
        let uuid = generate_uuid();
        assert_eq!(uuid.as_bytes()[14], b'4');
        assert!(matches!(uuid.as_bytes()[19], b'8' | b'9' | b'a' | b'b'));
    }
}
