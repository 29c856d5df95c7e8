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

use std::fs;

use assert_matches::assert_matches;
use strata_lib::node_id::NodeRevId;
use strata_lib::revfile::ChangeKind;
use strata_lib::revfile::NodeKind;
use strata_lib::store::RevStore;
use strata_lib::store::StoreError;
use strata_lib::transaction::Transaction;
use testutils::TestStore;
use testutils::commit_file;
use testutils::file_node_rev;
use testutils::read_file;

#[test]
fn test_commit_and_read_single_file() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let rev = commit_file(store, "f", b"hello\n");
    assert_eq!(rev, 1);
    assert_eq!(store.youngest_rev().unwrap(), 1);

    let noderev = file_node_rev(store, 1, "f");
    assert_eq!(noderev.kind, NodeKind::File);
    assert_eq!(noderev.created_path, "/f");
    assert_eq!(noderev.predecessor_count, 0);
    let rep = noderev.data_rep.as_ref().unwrap();
    assert_eq!(rep.expanded_size, 6);
    assert_eq!(store.file_length(&noderev), 6);

    // The stream verifies the stored MD5 as a side effect.
    assert_eq!(read_file(store, 1, "f"), b"hello\n");
}

#[test]
fn test_successor_is_deltified_against_predecessor() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"hello\n");
    let rev1_id = file_node_rev(store, 1, "f").id.clone();

    let rev = commit_file(store, "f", b"HELLO\n");
    assert_eq!(rev, 2);
    let noderev = file_node_rev(store, 2, "f");
    assert_eq!(noderev.predecessor_id, Some(rev1_id));
    assert_eq!(noderev.predecessor_count, 1);
    assert_eq!(read_file(store, 2, "f"), b"HELLO\n");
    // The old revision stays readable.
    assert_eq!(read_file(store, 1, "f"), b"hello\n");

    // A predecessor count of one picks the immediate predecessor in
    // revision 1 as the delta base.
    let rev_file = fs::read(store.path().join("revs").join("2")).unwrap();
    let text = String::from_utf8_lossy(&rev_file);
    assert!(text.contains("DELTA 1 "), "got: {text}");
}

#[test]
fn test_long_history_stays_readable() {
    // Every revision must reconstruct despite the skip-list delta bases.
    let test_store = TestStore::new();
    let store = &test_store.store;
    let mut contents = Vec::new();
    for i in 0..10u32 {
        let body: Vec<u8> = format!("contents of revision {i}\n").repeat(20).into_bytes();
        commit_file(store, "f", &body);
        contents.push(body);
    }
    for (i, body) in contents.iter().enumerate() {
        let rev = i as u64 + 1;
        assert_eq!(&read_file(store, rev, "f"), body, "revision {rev}");
        let noderev = file_node_rev(store, rev, "f");
        assert_eq!(noderev.predecessor_count, i as u32);
    }
}

#[test]
fn test_large_contents_cross_delta_windows() {
    // More than one 100k delta window per revision, so reconstruction has
    // to chain and compose windows across several layers.
    let test_store = TestStore::new();
    let store = &test_store.store;

    let base: Vec<u8> = (0..300_000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
        .collect();
    commit_file(store, "big", &base);

    let mut second = base.clone();
    second.splice(150_000..150_000, b"wedged into the middle".iter().copied());
    commit_file(store, "big", &second);

    let mut third = second.clone();
    third.truncate(250_000);
    third.extend_from_slice(b"and a new tail");
    commit_file(store, "big", &third);

    assert_eq!(read_file(store, 1, "big"), base);
    assert_eq!(read_file(store, 2, "big"), second);
    assert_eq!(read_file(store, 3, "big"), third);
}

#[test]
fn test_commit_out_of_date() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let txn1 = Transaction::begin(store, 0).unwrap();
    let txn2 = Transaction::begin(store, 0).unwrap();

    // Only one of two concurrent transactions on the same base wins.
    let mut root = txn1.root().unwrap();
    let mut f = txn1.create_node(NodeKind::File, "/f", "0").unwrap();
    let mut writer = txn1.set_contents(&mut f).unwrap();
    writer.write_contents(b"one\n").unwrap();
    writer.finish().unwrap();
    txn1.set_entry(&mut root, "f", Some((f.id.clone(), NodeKind::File)))
        .unwrap();
    txn1.add_change("/f", Some(&f.id), ChangeKind::Add, true, false, None)
        .unwrap();
    assert_eq!(txn1.commit().unwrap(), 1);

    assert_matches!(txn2.commit(), Err(StoreError::TxnOutOfDate));
    // The losing transaction changed nothing.
    assert_eq!(store.youngest_rev().unwrap(), 1);
}

#[test]
fn test_orphan_revision_file_is_invisible() {
    // A crash between the revision rename and the `current` rename leaves
    // an orphan revision file; youngest is derived from `current` alone,
    // and the next commit simply replaces the orphan.
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"v1\n");

    fs::write(store.path().join("revs").join("2"), b"orphan garbage").unwrap();
    assert_eq!(store.youngest_rev().unwrap(), 1);
    assert_eq!(read_file(store, 1, "f"), b"v1\n");

    let rev = commit_file(store, "f", b"v2\n");
    assert_eq!(rev, 2);
    assert_eq!(read_file(store, 2, "f"), b"v2\n");
}

#[test]
fn test_changed_paths_after_commit() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"hello\n");

    let changes = store.paths_changed(1).unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes["/f"];
    assert_eq!(change.kind, ChangeKind::Add);
    assert!(change.text_mod);
    assert!(!change.prop_mod);
    // Committed change entries reference permanent ids only.
    let id = change.noderev_id.as_ref().unwrap();
    assert_eq!(id.txn_id(), None);
    assert_eq!(id.rev(), Some(1));
}

#[test]
fn test_permanent_ids_assigned_in_commit_order() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "a", b"a\n");
    commit_file(store, "b", b"b\n");

    // `current` starts with next node id 1; the first created node gets it.
    assert_eq!(file_node_rev(store, 1, "a").id.node_id, "1");
    assert_eq!(file_node_rev(store, 2, "b").id.node_id, "2");
    // The root keeps its original identity and counts its successors.
    let root = store
        .node_rev(&store.rev_root_id(2).unwrap())
        .unwrap();
    assert_eq!(root.id.node_id, "0");
    assert_eq!(root.predecessor_count, 2);
}

#[test]
fn test_transaction_props_become_revision_props() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let txn = Transaction::begin(store, 0).unwrap();
    txn.change_prop("log", Some(b"first change")).unwrap();
    txn.change_prop("author", Some(b"jane")).unwrap();
    let mut root = txn.root().unwrap();
    let mut f = txn.create_node(NodeKind::File, "/f", "0").unwrap();
    let mut writer = txn.set_contents(&mut f).unwrap();
    writer.write_contents(b"x\n").unwrap();
    writer.finish().unwrap();
    txn.set_entry(&mut root, "f", Some((f.id.clone(), NodeKind::File)))
        .unwrap();
    txn.add_change("/f", Some(&f.id), ChangeKind::Add, true, false, None)
        .unwrap();
    let rev = txn.commit().unwrap();

    let props = store.revision_proplist(rev).unwrap();
    assert_eq!(props["log"].as_slice(), b"first change");
    assert_eq!(props["author"].as_slice(), b"jane");
}

#[test]
fn test_commit_subdirectory_tree() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let txn = Transaction::begin(store, 0).unwrap();
    let mut root = txn.root().unwrap();
    let mut dir = txn.create_node(NodeKind::Dir, "/d", "0").unwrap();
    let mut file = txn.create_node(NodeKind::File, "/d/f", "0").unwrap();
    let mut writer = txn.set_contents(&mut file).unwrap();
    writer.write_contents(b"nested\n").unwrap();
    writer.finish().unwrap();
    txn.set_entry(&mut dir, "f", Some((file.id.clone(), NodeKind::File)))
        .unwrap();
    txn.set_entry(&mut root, "d", Some((dir.id.clone(), NodeKind::Dir)))
        .unwrap();
    txn.add_change("/d", Some(&dir.id), ChangeKind::Add, false, false, None)
        .unwrap();
    txn.add_change("/d/f", Some(&file.id), ChangeKind::Add, true, false, None)
        .unwrap();
    let rev = txn.commit().unwrap();

    let root = store.node_rev(&store.rev_root_id(rev).unwrap()).unwrap();
    let entries = store.dir_entries(&root).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries["d"].kind, NodeKind::Dir);

    let dir = store.node_rev(&entries["d"].id).unwrap();
    let dir_entries = store.dir_entries(&dir).unwrap();
    assert_eq!(dir_entries["f"].kind, NodeKind::File);

    let file = store.node_rev(&dir_entries["f"].id).unwrap();
    assert_eq!(file.created_path, "/d/f");
    let contents = store.contents(&file).unwrap().read_all().unwrap();
    assert_eq!(contents, b"nested\n");
}

#[test]
fn test_copyfrom_roundtrip() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"original\n");

    // Copy /f to /g, reserving a fresh copy id.
    let txn = Transaction::begin(store, 1).unwrap();
    let mut root = txn.root().unwrap();
    let source = file_node_rev(store, 1, "f");
    let copy_id = txn.reserve_copy_id().unwrap();
    let mut copy = txn.create_successor(&source, Some(&copy_id)).unwrap();
    copy.created_path = "/g".to_owned();
    copy.copyfrom = Some((1, "/f".to_owned()));
    copy.copyroot = Some((1, "/f".to_owned()));
    txn.put_node_rev(&copy).unwrap();
    txn.set_entry(&mut root, "g", Some((copy.id.clone(), NodeKind::File)))
        .unwrap();
    txn.add_change(
        "/g",
        Some(&copy.id),
        ChangeKind::Add,
        false,
        false,
        Some((1, "/f".to_owned())),
    )
    .unwrap();
    let rev = txn.commit().unwrap();

    let copied = file_node_rev(store, rev, "g");
    assert_eq!(copied.copyfrom, Some((1, "/f".to_owned())));
    assert_eq!(copied.copyroot, Some((1, "/f".to_owned())));
    assert_eq!(copied.id.copy_id, "1");
    assert_eq!(read_file(store, rev, "g"), b"original\n");
}

#[test]
fn test_delete_entry() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"data\n");
    commit_file(store, "g", b"other\n");

    let txn = Transaction::begin(store, 2).unwrap();
    let mut root = txn.root().unwrap();
    let victim_id = store.dir_entries(&txn.root().unwrap()).unwrap()["f"]
        .id
        .clone();
    txn.set_entry(&mut root, "f", None).unwrap();
    txn.add_change(
        "/f",
        Some(&victim_id),
        ChangeKind::Delete,
        false,
        false,
        None,
    )
    .unwrap();
    let rev = txn.commit().unwrap();

    let root = store.node_rev(&store.rev_root_id(rev).unwrap()).unwrap();
    let entries = store.dir_entries(&root).unwrap();
    assert!(!entries.contains_key("f"));
    assert!(entries.contains_key("g"));
    assert_eq!(store.paths_changed(rev).unwrap()["/f"].kind, ChangeKind::Delete);
    // Older revisions keep the file.
    assert_eq!(read_file(store, 2, "f"), b"data\n");
}

#[test]
fn test_abort_discards_everything() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let txn = Transaction::begin(store, 0).unwrap();
    let mut f = txn.create_node(NodeKind::File, "/f", "0").unwrap();
    let mut writer = txn.set_contents(&mut f).unwrap();
    writer.write_contents(b"discarded\n").unwrap();
    writer.finish().unwrap();
    let id = txn.id().to_owned();
    txn.abort().unwrap();

    assert_eq!(store.youngest_rev().unwrap(), 0);
    assert!(store.list_transactions().unwrap().is_empty());
    assert_matches!(
        Transaction::open(store, &id),
        Err(StoreError::NoSuchTransaction(_))
    );
}

#[test]
fn test_open_store_and_reuse() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"persisted\n");

    let reopened = RevStore::open(store.path()).unwrap();
    assert_eq!(reopened.youngest_rev().unwrap(), 1);
    assert_eq!(read_file(&reopened, 1, "f"), b"persisted\n");
}

#[test]
fn test_hotcopy_carries_history() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"v1\n");
    commit_file(store, "f", b"v2\n");
    // A leftover transaction must not be carried over.
    let _stale = Transaction::begin(store, 2).unwrap();

    let temp_dir = testutils::new_temp_dir();
    let copy = RevStore::hotcopy(store.path(), &temp_dir.path().join("copy")).unwrap();
    assert_eq!(copy.youngest_rev().unwrap(), 2);
    assert_eq!(copy.uuid().unwrap(), store.uuid().unwrap());
    assert!(copy.list_transactions().unwrap().is_empty());
    assert_eq!(read_file(&copy, 1, "f"), b"v1\n");
    assert_eq!(read_file(&copy, 2, "f"), b"v2\n");
}

#[test]
fn test_checksum_mismatch_is_detected() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"hello\n");

    let mut noderev = file_node_rev(store, 1, "f");
    noderev.data_rep.as_mut().unwrap().md5 = [0; 16];
    let mut reader = store.contents(&noderev).unwrap();
    assert_matches!(
        reader.read_all(),
        Err(StoreError::ChecksumMismatch { .. })
    );
}

#[test]
fn test_dangling_id() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    let id = NodeRevId::committed("7", "0", 0, 999_999);
    // Offset beyond the revision file is a parse failure, not a crash.
    assert!(store.node_rev(&id).is_err());
    let missing_rev = NodeRevId::committed("7", "0", 42, 0);
    assert_matches!(store.node_rev(&missing_rev), Err(StoreError::DanglingId(_)));
}

#[test]
fn test_same_rep_key() {
    let test_store = TestStore::new();
    let store = &test_store.store;
    commit_file(store, "f", b"data\n");
    commit_file(store, "g", b"data\n");

    let f = file_node_rev(store, 2, "f");
    let g = file_node_rev(store, 2, "g");
    assert!(RevStore::same_rep_key(
        f.data_rep.as_ref(),
        f.data_rep.as_ref()
    ));
    assert!(!RevStore::same_rep_key(
        f.data_rep.as_ref(),
        g.data_rep.as_ref()
    ));
    assert!(RevStore::same_rep_key(None, None));
    assert!(!RevStore::same_rep_key(f.data_rep.as_ref(), None));
}

#[test]
fn test_node_props_roundtrip() {
    let test_store = TestStore::new();
    let store = &test_store.store;

    let txn = Transaction::begin(store, 0).unwrap();
    let mut root = txn.root().unwrap();
    let mut f = txn.create_node(NodeKind::File, "/f", "0").unwrap();
    let mut writer = txn.set_contents(&mut f).unwrap();
    writer.write_contents(b"body\n").unwrap();
    writer.finish().unwrap();
    let mut props = strata_lib::store::Proplist::new();
    props.insert("mime-type".to_owned(), "text/plain".into());
    txn.set_proplist(&mut f, &props).unwrap();
    txn.set_entry(&mut root, "f", Some((f.id.clone(), NodeKind::File)))
        .unwrap();
    txn.add_change("/f", Some(&f.id), ChangeKind::Add, true, true, None)
        .unwrap();
    let rev = txn.commit().unwrap();

    let noderev = file_node_rev(store, rev, "f");
    let read_props = store.proplist(&noderev).unwrap();
    assert_eq!(read_props, props);
    assert!(store.paths_changed(rev).unwrap()["/f"].prop_mod);
}
