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

//! Mutable transactions: the scratch workspace a commit is built in.
//!
//! A transaction owns a directory under `transactions/` holding a proto
//! revision file (append-only), a `changes` log, a `props` hash, a
//! `next-ids` counter and one small file per mutable node-revision.
//! Everything in it is private to its creator until commit promotes it into
//! a numbered revision, or abort removes it.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufReader;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write;
use std::path::PathBuf;

use digest::Digest as _;
use md5::Md5;
use tracing::debug;

use crate::file_util::IoResultExt as _;
use crate::hash_text;
use crate::node_id::NodeRevId;
use crate::node_id::Rev;
use crate::node_id::next_key;
use crate::rep_read::ContentsReader;
use crate::revfile;
use crate::revfile::ChangeKind;
use crate::revfile::NodeKind;
use crate::revfile::NodeRev;
use crate::revfile::PathChange;
use crate::revfile::RepHeader;
use crate::revfile::Representation;
use crate::store::Proplist;
use crate::store::RevStore;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::store::hash_text_error;
use crate::svndiff;

/// An open transaction based on some revision of the store.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s RevStore,
    id: String,
    base_rev: Rev,
}

impl<'s> Transaction<'s> {
    /// Creates a fresh transaction based on revision `base_rev`: a new
    /// scratch directory seeded with a mutable copy of the base root.
    pub fn begin(store: &'s RevStore, base_rev: Rev) -> StoreResult<Self> {
        let id = create_txn_dir(store, base_rev)?;
        debug!(txn_id = %id, base_rev, "created transaction");
        let txn = Self {
            store,
            id,
            base_rev,
        };

        // Copy the base root in as the mutable transaction root.
        let root_id = store.rev_root_id(base_rev)?;
        let mut root = store.node_rev(&root_id)?;
        if root.id.txn_id().is_some() {
            return Err(corrupt(
                store.rev_path(base_rev),
                "Copying from transactions not allowed",
            ));
        }
        root.predecessor_id = Some(root.id.clone());
        root.predecessor_count += 1;
        root.copyfrom = None;
        // For the transaction root, the copyroot never changes.
        root.id = NodeRevId::in_txn(
            root.id.node_id.clone(),
            root.id.copy_id.clone(),
            txn.id.clone(),
        );
        txn.put_node_rev(&root)?;

        for (path, content) in [
            (store.txn_proto_rev_path(&txn.id), ""),
            (store.txn_changes_path(&txn.id), ""),
            (store.txn_props_path(&txn.id), "END\n"),
            (store.txn_next_ids_path(&txn.id), "0 0\n"),
        ] {
            fs::write(&path, content).context(&path)?;
        }
        Ok(txn)
    }

    /// Opens an existing transaction by id.
    pub fn open(store: &'s RevStore, txn_id: &str) -> StoreResult<Self> {
        let dir = store.txn_dir(txn_id);
        if !dir.is_dir() {
            return Err(StoreError::NoSuchTransaction(txn_id.to_owned()));
        }
        let txn = Self {
            store,
            id: txn_id.to_owned(),
            base_rev: 0,
        };
        let root = txn.root()?;
        let base_rev = root
            .predecessor_id
            .as_ref()
            .and_then(|id| id.rev())
            .ok_or_else(|| corrupt(dir, "Corrupt transaction root"))?;
        Ok(Self { base_rev, ..txn })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_rev(&self) -> Rev {
        self.base_rev
    }

    pub(crate) fn store(&self) -> &'s RevStore {
        self.store
    }

    /// The id of this transaction's mutable root directory.
    pub fn root_id(&self) -> NodeRevId {
        NodeRevId::in_txn("0", "0", self.id.clone())
    }

    /// The mutable root node-revision.
    pub fn root(&self) -> StoreResult<NodeRev> {
        self.store.node_rev(&self.root_id())
    }

    /// Writes a mutable node-revision record into the transaction.
    pub fn put_node_rev(&self, noderev: &NodeRev) -> StoreResult<()> {
        if noderev.id.txn_id() != Some(self.id.as_str()) {
            return Err(StoreError::NotMutable);
        }
        let path = self.store.txn_node_rev_path(&noderev.id);
        let mut file = File::create(&path).context(&path)?;
        revfile::write_node_rev(&mut file, noderev).context(&path)?;
        Ok(())
    }

    // Id minting.

    pub(crate) fn read_next_ids(&self) -> StoreResult<(String, String)> {
        let path = self.store.txn_next_ids_path(&self.id);
        let content = fs::read_to_string(&path).context(&path)?;
        let line = content.lines().next().unwrap_or("");
        let (node_id, copy_id) = line
            .split_once(' ')
            .ok_or_else(|| corrupt(&path, "next-id file corrupt"))?;
        if !crate::node_id::is_valid_key(node_id) || !crate::node_id::is_valid_key(copy_id) {
            return Err(corrupt(&path, "next-id file corrupt"));
        }
        Ok((node_id.to_owned(), copy_id.to_owned()))
    }

    fn write_next_ids(&self, node_id: &str, copy_id: &str) -> StoreResult<()> {
        let path = self.store.txn_next_ids_path(&self.id);
        fs::write(&path, format!("{node_id} {copy_id}\n")).context(&path)?;
        Ok(())
    }

    /// Mints a node id unique to this transaction, `_`-prefixed until commit
    /// turns it into a permanent key.
    fn new_node_id(&self) -> StoreResult<String> {
        let (node_id, copy_id) = self.read_next_ids()?;
        self.write_next_ids(&next_key(&node_id), &copy_id)?;
        Ok(format!("_{node_id}"))
    }

    /// Reserves a copy id for use by a copy made in this transaction.
    pub fn reserve_copy_id(&self) -> StoreResult<String> {
        let (node_id, copy_id) = self.read_next_ids()?;
        self.write_next_ids(&node_id, &next_key(&copy_id))?;
        Ok(format!("_{copy_id}"))
    }

    // Node creation.

    /// Creates a brand-new node (no predecessor) in this transaction.
    pub fn create_node(
        &self,
        kind: NodeKind,
        created_path: &str,
        copy_id: &str,
    ) -> StoreResult<NodeRev> {
        let node_id = self.new_node_id()?;
        let noderev = NodeRev {
            id: NodeRevId::in_txn(node_id, copy_id, self.id.clone()),
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: created_path.to_owned(),
            copyfrom: None,
            copyroot: None,
        };
        self.put_node_rev(&noderev)?;
        Ok(noderev)
    }

    /// Creates the mutable successor of a committed node, keeping its node
    /// id. A `copy_id` is only supplied when the successor is made for a
    /// copy.
    pub fn create_successor(
        &self,
        old: &NodeRev,
        copy_id: Option<&str>,
    ) -> StoreResult<NodeRev> {
        let mut noderev = old.clone();
        noderev.predecessor_id = Some(old.id.clone());
        noderev.predecessor_count = old.predecessor_count + 1;
        noderev.id = NodeRevId::in_txn(
            old.id.node_id.clone(),
            copy_id.unwrap_or(&old.id.copy_id),
            self.id.clone(),
        );
        self.put_node_rev(&noderev)?;
        Ok(noderev)
    }

    /// Removes a mutable node-revision and its side files.
    pub fn delete_node_rev(&self, id: &NodeRevId) -> StoreResult<()> {
        let noderev = self.store.node_rev(id)?;
        if let Some(rep) = &noderev.prop_rep
            && rep.txn_id().is_some()
        {
            let path = self.store.txn_node_props_path(id);
            fs::remove_file(&path).context(&path)?;
        }
        if noderev.kind == NodeKind::Dir
            && let Some(rep) = &noderev.data_rep
            && rep.txn_id().is_some()
        {
            let path = self.store.txn_node_children_path(id);
            fs::remove_file(&path).context(&path)?;
        }
        let path = self.store.txn_node_rev_path(id);
        fs::remove_file(&path).context(&path)?;
        Ok(())
    }

    // Directory mutation.

    /// Adds, replaces or (with `entry == None`) deletes one entry of the
    /// mutable directory `parent`.
    ///
    /// The first edit dumps the inherited entries as a terminated hash into
    /// the node's `.children` file and flips the node's data representation
    /// to mutable; later edits append incremental records.
    pub fn set_entry(
        &self,
        parent: &mut NodeRev,
        name: &str,
        entry: Option<(NodeRevId, NodeKind)>,
    ) -> StoreResult<()> {
        if parent.id.txn_id() != Some(self.id.as_str()) {
            return Err(StoreError::NotMutable);
        }
        let children_path = self.store.txn_node_children_path(&parent.id);
        let mut file = if parent
            .data_rep
            .as_ref()
            .is_none_or(|rep| rep.txn_id().is_none())
        {
            // Dump the inherited contents into a mutable representation
            // file before the first edit.
            let entries = self.store.dir_entries(parent)?;
            let mut hash = hash_text::HashMapText::new();
            for (entry_name, dir_entry) in entries {
                hash.insert(
                    entry_name,
                    RevStore::unparse_dir_entry(dir_entry.kind, &dir_entry.id)
                        .into_bytes()
                        .into(),
                );
            }
            let mut file = File::create(&children_path).context(&children_path)?;
            hash_text::write_hash(&mut file, &hash).context(&children_path)?;

            parent.data_rep = Some(Representation::mutable(self.id.clone()));
            self.put_node_rev(parent)?;
            file
        } else {
            OpenOptions::new()
                .append(true)
                .open(&children_path)
                .context(&children_path)?
        };

        match entry {
            Some((id, kind)) => {
                let value = RevStore::unparse_dir_entry(kind, &id);
                hash_text::write_hash_entry(&mut file, name, value.as_bytes())
                    .context(&children_path)?;
            }
            None => {
                hash_text::write_hash_delete(&mut file, name).context(&children_path)?;
            }
        }
        self.store.invalidate_dir_cache(&parent.id);
        Ok(())
    }

    // Node properties.

    /// Replaces the property list of a mutable node.
    pub fn set_proplist(&self, noderev: &mut NodeRev, props: &Proplist) -> StoreResult<()> {
        if noderev.id.txn_id() != Some(self.id.as_str()) {
            return Err(StoreError::NotMutable);
        }
        let path = self.store.txn_node_props_path(&noderev.id);
        let mut file = File::create(&path).context(&path)?;
        hash_text::write_hash(&mut file, props).context(&path)?;

        if noderev
            .prop_rep
            .as_ref()
            .is_none_or(|rep| rep.txn_id().is_none())
        {
            noderev.prop_rep = Some(Representation::mutable(self.id.clone()));
            self.put_node_rev(noderev)?;
        }
        Ok(())
    }

    // File contents.

    /// Opens a writer that replaces the file contents of a mutable node.
    /// The data is deltified against the skip-list base and appended to the
    /// proto revision file; `RepWriter::finish` records the new
    /// representation on the node.
    pub fn set_contents<'a>(&'a self, noderev: &'a mut NodeRev) -> StoreResult<RepWriter<'a, 's>> {
        if noderev.kind != NodeKind::File {
            return Err(StoreError::NotFile);
        }
        if noderev.id.txn_id() != Some(self.id.as_str()) {
            return Err(StoreError::NotMutable);
        }
        RepWriter::new(self, noderev)
    }

    // The changes log.

    /// Appends one raw entry to the transaction's changes log.
    pub fn add_change(
        &self,
        path: &str,
        id: Option<&NodeRevId>,
        kind: ChangeKind,
        text_mod: bool,
        prop_mod: bool,
        copyfrom: Option<(Rev, String)>,
    ) -> StoreResult<()> {
        let changes_path = self.store.txn_changes_path(&self.id);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&changes_path)
            .context(&changes_path)?;
        revfile::write_change_entry(
            &mut file,
            path,
            &PathChange {
                noderev_id: id.cloned(),
                kind,
                text_mod,
                prop_mod,
            },
            copyfrom.as_ref(),
        )
        .context(&changes_path)?;
        Ok(())
    }

    /// The folded per-path view of this transaction's changes so far.
    pub fn changes(&self) -> StoreResult<std::collections::BTreeMap<String, PathChange>> {
        let (changes, _copyfrom) = self.changes_with_copyfrom()?;
        Ok(changes)
    }

    pub(crate) fn changes_with_copyfrom(
        &self,
    ) -> StoreResult<(
        std::collections::BTreeMap<String, PathChange>,
        std::collections::BTreeMap<String, (Rev, String)>,
    )> {
        let path = self.store.txn_changes_path(&self.id);
        let file = File::open(&path).context(&path)?;
        let mut reader = BufReader::new(file);
        crate::commit::fetch_all_changes(&mut reader, &path, false)
    }

    // Transaction properties.

    /// The transaction's unversioned properties; they become the new
    /// revision's properties at commit.
    pub fn proplist(&self) -> StoreResult<Proplist> {
        let path = self.store.txn_props_path(&self.id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(crate::file_util::PathError {
                    path,
                    source: err,
                }
                .into());
            }
        };
        if content.is_empty() {
            return Ok(Proplist::new());
        }
        hash_text::read_hash(&mut content.as_slice()).map_err(|err| hash_text_error(err, &path))
    }

    /// Sets (or with `None` removes) one transaction property.
    pub fn change_prop(&self, name: &str, value: Option<&[u8]>) -> StoreResult<()> {
        let mut props = self.proplist()?;
        match value {
            Some(value) => {
                props.insert(name.to_owned(), value.into());
            }
            None => {
                props.remove(name);
            }
        }
        let path = self.store.txn_props_path(&self.id);
        let mut file = File::create(&path).context(&path)?;
        hash_text::write_hash(&mut file, &props).context(&path)?;
        Ok(())
    }

    // Lifecycle.

    /// Discards the transaction and everything in it.
    pub fn abort(self) -> StoreResult<()> {
        let dir = self.store.txn_dir(&self.id);
        debug!(txn_id = %self.id, "aborting transaction");
        fs::remove_dir_all(&dir).context(&dir)?;
        Ok(())
    }

    /// Promotes the transaction into a new revision. Fails with
    /// [`StoreError::TxnOutOfDate`] if the base revision is no longer the
    /// youngest.
    pub fn commit(self) -> StoreResult<Rev> {
        crate::commit::commit(self)
    }
}

/// Probes `<base>-<i>.txn` names until a directory creation succeeds.
fn create_txn_dir(store: &RevStore, rev: Rev) -> StoreResult<String> {
    for i in 1..=99999u32 {
        let id = format!("{rev}-{i}");
        match fs::create_dir(store.txn_dir(&id)) {
            Ok(()) => return Ok(id),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                let path = store.txn_dir(&id);
                return Err(crate::file_util::PathError { path, source: err }.into());
            }
        }
    }
    Err(StoreError::UniqueNamesExhausted {
        path: store.path().to_path_buf(),
        rev,
    })
}

/// Picks the delta base for new file contents: clear the lowest set bit of
/// the predecessor count and walk back to that ancestor. The resulting
/// chains are logarithmic in the node's history depth.
fn choose_delta_base(store: &RevStore, noderev: &NodeRev) -> StoreResult<Option<Representation>> {
    if noderev.predecessor_count == 0 {
        return Ok(None);
    }
    let target = noderev.predecessor_count & (noderev.predecessor_count - 1);
    let mut steps = noderev.predecessor_count - target;
    let mut base = noderev.clone();
    while steps > 0 {
        let pred = base.predecessor_id.clone().ok_or_else(|| {
            corrupt(store.path(), "Predecessor chain shorter than its count")
        })?;
        base = store.node_rev(&pred)?;
        steps -= 1;
    }
    Ok(base.data_rep)
}

/// Streams new file contents into the proto revision file as an svndiff
/// against the chosen base.
#[derive(Debug)]
pub struct RepWriter<'a, 's> {
    txn: &'a Transaction<'s>,
    noderev: &'a mut NodeRev,
    file: File,
    path: PathBuf,
    rep_offset: u64,
    delta_start: u64,
    source: ContentsReader,
    source_offset: u64,
    target_buf: Vec<u8>,
    md5: Md5,
    expanded_size: u64,
}

impl<'a, 's> RepWriter<'a, 's> {
    fn new(txn: &'a Transaction<'s>, noderev: &'a mut NodeRev) -> StoreResult<Self> {
        let store = txn.store;
        let path = store.txn_proto_rev_path(&txn.id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(&path)?;
        let rep_offset = file.seek(SeekFrom::End(0)).context(&path)?;

        let base_rep = choose_delta_base(store, noderev)?;
        let source = match &base_rep {
            Some(rep) => ContentsReader::for_rep(store, rep)?,
            None => ContentsReader::empty(),
        };
        let header = match &base_rep {
            Some(rep) => RepHeader::Delta {
                base_rev: rep.revision().ok_or_else(|| {
                    corrupt(&path, "Delta base inside a transaction")
                })?,
                base_offset: rep.offset,
                base_len: rep.size,
            },
            None => RepHeader::DeltaVsEmpty,
        };
        header.write(&mut file).context(&path)?;
        let delta_start = file.stream_position().context(&path)?;
        svndiff::write_stream_header(&mut file).context(&path)?;

        Ok(Self {
            txn,
            noderev,
            file,
            path,
            rep_offset,
            delta_start,
            source,
            source_offset: 0,
            target_buf: Vec::new(),
            md5: Md5::new(),
            expanded_size: 0,
        })
    }

    /// Appends file content bytes.
    pub fn write_contents(&mut self, data: &[u8]) -> StoreResult<()> {
        self.md5.update(data);
        self.expanded_size += data.len() as u64;
        self.target_buf.extend_from_slice(data);
        while self.target_buf.len() >= svndiff::WINDOW_SIZE {
            let target: Vec<u8> = self.target_buf.drain(..svndiff::WINDOW_SIZE).collect();
            self.emit_window(&target)?;
        }
        Ok(())
    }

    fn emit_window(&mut self, target: &[u8]) -> StoreResult<()> {
        let mut source_window = vec![0u8; svndiff::WINDOW_SIZE];
        let mut filled = 0;
        while filled < source_window.len() {
            let n = self.source.read_some(&mut source_window[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        source_window.truncate(filled);

        let window = svndiff::build_window(self.source_offset, &source_window, target);
        self.source_offset += filled as u64;
        svndiff::write_window(&mut self.file, &window).context(&self.path)?;
        Ok(())
    }

    /// Closes the payload with `ENDREP` and records the new representation
    /// descriptor on the node-revision.
    pub fn finish(mut self) -> StoreResult<()> {
        if !self.target_buf.is_empty() {
            let target = std::mem::take(&mut self.target_buf);
            self.emit_window(&target)?;
        }
        let end_offset = self.file.stream_position().context(&self.path)?;
        self.file.write_all(revfile::ENDREP).context(&self.path)?;

        self.noderev.data_rep = Some(Representation {
            location: crate::revfile::RepLocation::Txn(self.txn.id.clone()),
            offset: self.rep_offset,
            size: end_offset - self.delta_start,
            expanded_size: self.expanded_size,
            md5: self.md5.finalize().into(),
        });
        self.txn.put_node_rev(self.noderev)
    }
}

impl Write for RepWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_contents(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
