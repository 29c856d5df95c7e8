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

#![expect(missing_docs)]

use std::path::Path;

use strata_lib::node_id::Rev;
use strata_lib::revfile::ChangeKind;
use strata_lib::revfile::NodeKind;
use strata_lib::revfile::NodeRev;
use strata_lib::store::RevStore;
use strata_lib::transaction::Transaction;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("strata-test-")
        .tempdir()
        .unwrap()
}

/// A scratch repository that lives as long as its temp directory.
pub struct TestStore {
    _temp_dir: TempDir,
    pub store: RevStore,
}

impl TestStore {
    pub fn new() -> Self {
        let temp_dir = new_temp_dir();
        let store = RevStore::init(temp_dir.path().join("repo")).unwrap();
        Self {
            _temp_dir: temp_dir,
            store,
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Commits a new revision that creates or replaces the file at the root
/// entry `name` with `contents`. Returns the new revision.
pub fn commit_file(store: &RevStore, name: &str, contents: &[u8]) -> Rev {
    let base_rev = store.youngest_rev().unwrap();
    let txn = Transaction::begin(store, base_rev).unwrap();
    let mut root = txn.root().unwrap();
    let entries = store.dir_entries(&root).unwrap();
    let path = format!("/{name}");

    let (mut file_noderev, change_kind) = match entries.get(name) {
        Some(entry) => {
            let old = store.node_rev(&entry.id).unwrap();
            (txn.create_successor(&old, None).unwrap(), ChangeKind::Modify)
        }
        None => (
            txn.create_node(NodeKind::File, &path, &root.id.copy_id)
                .unwrap(),
            ChangeKind::Add,
        ),
    };

    let mut writer = txn.set_contents(&mut file_noderev).unwrap();
    writer.write_contents(contents).unwrap();
    writer.finish().unwrap();

    txn.set_entry(
        &mut root,
        name,
        Some((file_noderev.id.clone(), NodeKind::File)),
    )
    .unwrap();
    txn.add_change(
        &path,
        Some(&file_noderev.id),
        change_kind,
        true,
        false,
        None,
    )
    .unwrap();
    txn.commit().unwrap()
}

/// Looks up the node-revision of the root entry `name` at revision `rev`.
pub fn file_node_rev(store: &RevStore, rev: Rev, name: &str) -> NodeRev {
    let root_id = store.rev_root_id(rev).unwrap();
    let root = store.node_rev(&root_id).unwrap();
    let entries = store.dir_entries(&root).unwrap();
    store.node_rev(&entries[name].id).unwrap()
}

/// Reads back the contents of the root entry `name` at revision `rev`.
pub fn read_file(store: &RevStore, rev: Rev, name: &str) -> Vec<u8> {
    let noderev = file_node_rev(store, rev, name);
    store.contents(&noderev).unwrap().read_all().unwrap()
}

/// Writes `contents` to a file under `dir` and returns its path.
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
