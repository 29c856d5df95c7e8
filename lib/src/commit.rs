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

//! Promotion of a transaction into a committed revision.
//!
//! The commit holder takes the exclusive write lock, re-checks that the
//! transaction is still based on the youngest revision, finishes the proto
//! revision file (permanent ids, serialized directory and property hashes,
//! the folded changed-path log, the trailer), and then makes the new
//! revision visible by promoting files into place; the `current` pointer
//! rename is the single atomic step that publishes everything.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;

use digest::Digest as _;
use md5::Md5;
use tracing::info;
use tracing::instrument;

use crate::file_util::IoResultExt as _;
use crate::file_util::move_into_place;
use crate::hash_text;
use crate::lock::FileLock;
use crate::node_id::NodeRevId;
use crate::node_id::Rev;
use crate::node_id::add_keys;
use crate::revfile;
use crate::revfile::Change;
use crate::revfile::ChangeKind;
use crate::revfile::NodeKind;
use crate::revfile::PathChange;
use crate::revfile::RepLocation;
use crate::revfile::Representation;
use crate::store::RevStore;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::transaction::Transaction;

/// Reads a changes log and folds it into one summary entry per path.
///
/// `prefolded` is set when reading the log of a committed revision: entries
/// were already folded at commit time and may be in any order, so the
/// descendant elision after deletes and replaces must not be re-applied.
pub(crate) fn fetch_all_changes<R: BufRead>(
    reader: &mut R,
    path: &Path,
    prefolded: bool,
) -> StoreResult<(
    BTreeMap<String, PathChange>,
    BTreeMap<String, (Rev, String)>,
)> {
    let mut changes = BTreeMap::new();
    let mut copyfrom_cache = BTreeMap::new();
    while let Some(change) = revfile::read_change(reader, path)? {
        fold_change(&mut changes, &mut copyfrom_cache, &change, path)?;

        // A deletion or replacement blows away any changes recorded so far
        // on paths below it.
        if matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) && !prefolded {
            changes.retain(|changed_path, _| !is_strict_child(&change.path, changed_path));
        }
    }
    Ok((changes, copyfrom_cache))
}

/// Folds one log entry into the per-path summary, enforcing the ordering
/// rules of the log.
fn fold_change(
    changes: &mut BTreeMap<String, PathChange>,
    copyfrom_cache: &mut BTreeMap<String, (Rev, String)>,
    change: &Change,
    path: &Path,
) -> StoreResult<()> {
    if change.noderev_id.is_none() && change.kind != ChangeKind::Reset {
        return Err(corrupt(path, "Missing required node revision ID"));
    }

    let Some(old_change) = changes.get_mut(&change.path) else {
        if change.kind == ChangeKind::Reset {
            return Ok(());
        }
        changes.insert(
            change.path.clone(),
            PathChange {
                noderev_id: change.noderev_id.clone(),
                kind: change.kind,
                text_mod: change.text_mod,
                prop_mod: change.prop_mod,
            },
        );
        match &change.copyfrom {
            Some(copyfrom) => {
                copyfrom_cache.insert(change.path.clone(), copyfrom.clone());
            }
            None => {
                copyfrom_cache.remove(&change.path);
            }
        }
        return Ok(());
    };

    // We should be talking about the same node-revision as the previous
    // change, except when that change was a deletion.
    if let Some(new_id) = &change.noderev_id
        && old_change.noderev_id.as_ref() != Some(new_id)
        && old_change.kind != ChangeKind::Delete
    {
        return Err(corrupt(
            path,
            "Invalid change ordering: new node revision ID without delete",
        ));
    }
    // An add, replacement, or reset must be the first thing to follow a
    // deletion.
    if old_change.kind == ChangeKind::Delete
        && !matches!(
            change.kind,
            ChangeKind::Replace | ChangeKind::Reset | ChangeKind::Add
        )
    {
        return Err(corrupt(
            path,
            "Invalid change ordering: non-add change on deleted path",
        ));
    }

    match change.kind {
        ChangeKind::Reset => {
            changes.remove(&change.path);
            copyfrom_cache.remove(&change.path);
        }
        ChangeKind::Delete => {
            if old_change.kind == ChangeKind::Add {
                // The path was introduced in this transaction; deleting it
                // removes it without trace.
                changes.remove(&change.path);
            } else {
                old_change.kind = ChangeKind::Delete;
                old_change.text_mod = change.text_mod;
                old_change.prop_mod = change.prop_mod;
            }
            copyfrom_cache.remove(&change.path);
        }
        ChangeKind::Add | ChangeKind::Replace => {
            // An add at this point follows a previous delete, so it reads
            // as a replacement.
            old_change.kind = ChangeKind::Replace;
            old_change.noderev_id = change.noderev_id.clone();
            old_change.text_mod = change.text_mod;
            old_change.prop_mod = change.prop_mod;
            match &change.copyfrom {
                Some(copyfrom) => {
                    copyfrom_cache.insert(change.path.clone(), copyfrom.clone());
                }
                None => {
                    copyfrom_cache.remove(&change.path);
                }
            }
        }
        ChangeKind::Modify => {
            if change.text_mod {
                old_change.text_mod = true;
            }
            if change.prop_mod {
                old_change.prop_mod = true;
            }
        }
    }
    Ok(())
}

fn is_strict_child(parent: &str, child: &str) -> bool {
    if parent == child {
        return false;
    }
    match parent {
        "/" => child.starts_with('/'),
        _ => child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/')),
    }
}

/// Serializes `hash` into `file` as a `PLAIN` representation, returning
/// `(size, md5)` of the dump itself (header and footer excluded).
fn write_hash_rep(file: &mut File, hash: &hash_text::HashMapText, path: &Path) -> StoreResult<(u64, [u8; 16])> {
    file.write_all(b"PLAIN\n").context(path)?;
    let mut dump = Vec::new();
    hash_text::write_hash(&mut dump, hash).context(path)?;
    let md5: [u8; 16] = Md5::digest(&dump).into();
    file.write_all(&dump).context(path)?;
    file.write_all(revfile::ENDREP).context(path)?;
    Ok((dump.len() as u64, md5))
}

/// Converts a transaction-scoped `_`-prefixed key into its permanent form by
/// adding the repository's next-key base.
fn permanent_key(key: &str, start_key: &str) -> String {
    match key.strip_prefix('_') {
        Some(suffix) => add_keys(start_key, suffix),
        None => key.to_owned(),
    }
}

/// Copies the node-revision `id` (and, for directories, all mutable
/// children first) from the transaction into the permanent revision file.
/// Returns the node's permanent id, or `None` if the node was already
/// committed.
fn write_final_rev(
    txn: &Transaction<'_>,
    file: &mut File,
    proto_path: &Path,
    rev: Rev,
    id: &NodeRevId,
    start_node_id: &str,
    start_copy_id: &str,
) -> StoreResult<Option<NodeRevId>> {
    if id.txn_id().is_none() {
        return Ok(None);
    }
    let store = txn.store();
    let mut noderev = store.node_rev(id)?;

    if noderev.kind == NodeKind::Dir {
        // Write out all the children first.
        let mut entries = store.dir_entries(&noderev)?;
        for entry in entries.values_mut() {
            let new_id = write_final_rev(
                txn,
                file,
                proto_path,
                rev,
                &entry.id,
                start_node_id,
                start_copy_id,
            )?;
            if let Some(new_id) = new_id
                && new_id.rev() == Some(rev)
            {
                entry.id = new_id;
            }
        }

        if let Some(rep) = &noderev.data_rep
            && rep.txn_id().is_some()
        {
            // Serialize this directory's entries as a plain text rep.
            let mut hash = hash_text::HashMapText::new();
            for (name, entry) in entries {
                hash.insert(
                    name,
                    RevStore::unparse_dir_entry(entry.kind, &entry.id)
                        .into_bytes()
                        .into(),
                );
            }
            let offset = file.stream_position().context(proto_path)?;
            let (size, md5) = write_hash_rep(file, &hash, proto_path)?;
            noderev.data_rep = Some(Representation {
                location: RepLocation::Revision(rev),
                offset,
                size,
                expanded_size: size,
                md5,
            });
        }
    } else if let Some(rep) = &mut noderev.data_rep
        && rep.txn_id().is_some()
    {
        // File contents were already deltified into the proto file; the
        // offsets stay valid, only the location moves to the new revision.
        rep.location = RepLocation::Revision(rev);
    }

    if noderev
        .prop_rep
        .as_ref()
        .is_some_and(|rep| rep.txn_id().is_some())
    {
        let props = store.proplist(&noderev)?;
        let offset = file.stream_position().context(proto_path)?;
        let (size, md5) = write_hash_rep(file, &props, proto_path)?;
        noderev.prop_rep = Some(Representation {
            location: RepLocation::Revision(rev),
            offset,
            size,
            expanded_size: size,
            md5,
        });
    }

    // Convert the temporary id into a permanent revision one.
    let my_offset = file.stream_position().context(proto_path)?;
    let node_id = permanent_key(&id.node_id, start_node_id);
    let copy_id = permanent_key(&id.copy_id, start_copy_id);
    let new_id = NodeRevId::committed(node_id, copy_id, rev, my_offset);
    noderev.id = new_id.clone();

    revfile::write_node_rev(file, &noderev).context(proto_path)?;

    // Rewrite the transaction's node file so changed-path processing can
    // map the temporary id to the permanent one.
    let node_path = store.txn_node_rev_path(id);
    let mut node_file = File::create(&node_path).context(&node_path)?;
    revfile::write_node_rev(&mut node_file, &noderev).context(&node_path)?;

    Ok(Some(new_id))
}

/// Emits the folded changed-path log into the revision file, rewriting any
/// remaining transaction-scoped ids, and returns the log's offset.
fn write_final_changed_path_info(
    txn: &Transaction<'_>,
    file: &mut File,
    proto_path: &Path,
) -> StoreResult<u64> {
    let store = txn.store();
    let offset = file.stream_position().context(proto_path)?;
    let (changes, copyfrom_cache) = txn.changes_with_copyfrom()?;

    for (path, mut change) in changes {
        // A delete of a mutable node may keep pointing at the temporary
        // node; it will never be dereferenced.
        if change.kind != ChangeKind::Delete
            && let Some(id) = &change.noderev_id
            && id.txn_id().is_some()
        {
            let noderev = store.node_rev(id)?;
            change.noderev_id = Some(noderev.id);
        }
        revfile::write_change_entry(file, &path, &change, copyfrom_cache.get(&path))
            .context(proto_path)?;
    }
    Ok(offset)
}

/// Commits `txn`, producing the next revision. See the module docs for the
/// protocol; on any failure before promotion the repository is unchanged.
#[instrument(skip_all, fields(txn_id = %txn.id()))]
pub(crate) fn commit(txn: Transaction<'_>) -> StoreResult<Rev> {
    let store = txn.store();
    let _lock = FileLock::lock(store.lock_path())?;

    // Somebody may have committed since this transaction started.
    let (old_rev, start_node_id, start_copy_id) = store.read_current()?;
    if txn.base_rev() != old_rev {
        return Err(StoreError::TxnOutOfDate);
    }
    let new_rev = old_rev + 1;

    let proto_path = store.txn_proto_rev_path(txn.id());
    let mut proto_file = OpenOptions::new()
        .write(true)
        .open(&proto_path)
        .context(&proto_path)?;
    proto_file.seek(SeekFrom::End(0)).context(&proto_path)?;

    let new_root_id = write_final_rev(
        &txn,
        &mut proto_file,
        &proto_path,
        new_rev,
        &txn.root_id(),
        &start_node_id,
        &start_copy_id,
    )?
    .expect("transaction root is always mutable");

    let changes_offset = write_final_changed_path_info(&txn, &mut proto_file, &proto_path)?;

    revfile::write_trailer(
        &mut proto_file,
        new_root_id.offset().expect("root id is committed"),
        changes_offset,
    )
    .context(&proto_path)?;
    proto_file.sync_all().context(&proto_path)?;
    drop(proto_file);

    // Promote the finished revision and its properties into place. The old
    // revision file serves as the permissions reference.
    let old_rev_path = store.rev_path(old_rev);
    move_into_place(&proto_path, &store.rev_path(new_rev), &old_rev_path)?;
    move_into_place(
        &store.txn_props_path(txn.id()),
        &store.revprops_path(new_rev),
        &old_rev_path,
    )?;

    // Publish: `current` must carry the next free ids past everything this
    // transaction allocated.
    let (txn_node_id, txn_copy_id) = txn.read_next_ids()?;
    let next_node_id = add_keys(&start_node_id, &txn_node_id);
    let next_copy_id = add_keys(&start_copy_id, &txn_copy_id);
    store.write_current(new_rev, &next_node_id, &next_copy_id)?;

    let txn_dir = store.txn_dir(txn.id());
    fs::remove_dir_all(&txn_dir).context(&txn_dir)?;

    info!(new_rev, "committed revision");
    Ok(new_rev)
}
