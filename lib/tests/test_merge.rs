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

use indoc::indoc;
use pretty_assertions::assert_eq;
use strata_lib::diff::DiffOptions;
use strata_lib::diff::file_diff3;
use strata_lib::diff::file_diff4;
use strata_lib::diff::merge::ConflictDisplayStyle;
use strata_lib::diff::merge::MergeOptions;
use strata_lib::diff::merge::write_merge;
use testutils::new_temp_dir;
use testutils::write_file;

fn merge3(
    original: &[u8],
    modified: &[u8],
    latest: &[u8],
    options: &MergeOptions<'_>,
) -> String {
    let temp_dir = new_temp_dir();
    let o = write_file(temp_dir.path(), "original", original);
    let m = write_file(temp_dir.path(), "modified", modified);
    let l = write_file(temp_dir.path(), "latest", latest);
    let diff = file_diff3(&o, &m, &l, &DiffOptions::default()).unwrap();
    let mut out = Vec::new();
    write_merge(&mut out, &diff, &o, &m, &l, options).unwrap();
    String::from_utf8(out).unwrap()
}

fn labeled(style: ConflictDisplayStyle) -> MergeOptions<'static> {
    MergeOptions {
        style,
        conflict_original: Some("||||||| original"),
        conflict_modified: Some("<<<<<<< modified"),
        conflict_latest: Some(">>>>>>> latest"),
        conflict_separator: None,
    }
}

#[test]
fn test_non_overlapping_edits_merge_cleanly() {
    let output = merge3(
        b"one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\n",
        b"one\nTWO\nthree\nfour\nfive\nsix\nseven\neight\n",
        b"one\ntwo\nthree\nfour\nfive\nsix\nSEVEN\neight\n",
        &labeled(ConflictDisplayStyle::ModifiedLatest),
    );
    assert_eq!(
        output,
        "one\nTWO\nthree\nfour\nfive\nsix\nSEVEN\neight\n"
    );
}

#[test]
fn test_insertions_from_both_sides() {
    let output = merge3(
        b"alpha\nomega\n",
        b"intro\nalpha\nomega\n",
        b"alpha\nomega\noutro\n",
        &labeled(ConflictDisplayStyle::ModifiedLatest),
    );
    assert_eq!(output, "intro\nalpha\nomega\noutro\n");
}

#[test]
fn test_conflicting_line_change() {
    let output = merge3(
        b"a\nb\nc\nd\n",
        b"a\nb\nC\nd\n",
        b"a\nb\nC'\nd\n",
        &labeled(ConflictDisplayStyle::ModifiedLatest),
    );
    assert_eq!(
        output,
        indoc! {"
            a
            b
            <<<<<<< modified
            C
            =======
            C'
            >>>>>>> latest
            d
        "}
    );
}

#[test]
fn test_default_marker_labels_name_the_files() {
    let temp_dir = new_temp_dir();
    let o = write_file(temp_dir.path(), "base", b"x\n");
    let m = write_file(temp_dir.path(), "mine", b"y\n");
    let l = write_file(temp_dir.path(), "theirs", b"z\n");
    let diff = file_diff3(&o, &m, &l, &DiffOptions::default()).unwrap();
    let mut out = Vec::new();
    write_merge(
        &mut out,
        &diff,
        &o,
        &m,
        &l,
        &MergeOptions {
            style: ConflictDisplayStyle::ModifiedLatest,
            ..MergeOptions::default()
        },
    )
    .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains(&format!("<<<<<<< {}\n", m.display())));
    assert!(text.contains(&format!(">>>>>>> {}\n", l.display())));
}

#[test]
fn test_only_conflicts_separates_groups() {
    // Two conflicts more than six lines apart produce two context groups
    // with an @@ separator between them.
    let mut original = String::new();
    let mut modified = String::new();
    let mut latest = String::new();
    for i in 0..20 {
        if i == 4 || i == 15 {
            original.push_str(&format!("base{i}\n"));
            modified.push_str(&format!("mine{i}\n"));
            latest.push_str(&format!("theirs{i}\n"));
        } else {
            let line = format!("ctx{i}\n");
            original.push_str(&line);
            modified.push_str(&line);
            latest.push_str(&line);
        }
    }
    let output = merge3(
        original.as_bytes(),
        modified.as_bytes(),
        latest.as_bytes(),
        &labeled(ConflictDisplayStyle::OnlyConflicts),
    );
    assert_eq!(
        output,
        indoc! {"
            @@
            ctx1
            ctx2
            ctx3
            <<<<<<< modified (5)
            mine4
            ||||||| original (5)
            base4
            =======
            theirs4
            >>>>>>> latest (5)
            ctx5
            ctx6
            ctx7
            @@
            ctx12
            ctx13
            ctx14
            <<<<<<< modified (16)
            mine15
            ||||||| original (16)
            base15
            =======
            theirs15
            >>>>>>> latest (16)
            ctx16
            ctx17
            ctx18
        "}
    );
}

#[test]
fn test_resolved_style_uses_ancestor_resolution() {
    let temp_dir = new_temp_dir();
    let o = write_file(temp_dir.path(), "o", b"head\nx\ntail\n");
    let m = write_file(temp_dir.path(), "m", b"head\nmine\ntail\n");
    let l = write_file(temp_dir.path(), "l", b"head\ntheirs\ntail\n");
    // The ancestor already carries modified's version, so the conflict
    // resolves to latest's change.
    let anc = write_file(temp_dir.path(), "anc", b"head\nmine\ntail\n");
    let diff = file_diff4(&o, &m, &l, &anc, &DiffOptions::default()).unwrap();
    assert!(diff.contains_conflicts());

    let mut out = Vec::new();
    write_merge(
        &mut out,
        &diff,
        &o,
        &m,
        &l,
        &labeled(ConflictDisplayStyle::ResolvedModifiedLatest),
    )
    .unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "head\ntheirs\ntail\n");
}

#[test]
fn test_merge_without_trailing_newline() {
    let output = merge3(
        b"a\nend",
        b"a\nend",
        b"a\nEND",
        &labeled(ConflictDisplayStyle::ModifiedLatest),
    );
    assert_eq!(output, "a\nEND");
}

#[test]
fn test_crlf_marker_eol() {
    let output = merge3(
        b"a\r\nx\r\nz\r\n",
        b"a\r\nm\r\nz\r\n",
        b"a\r\nt\r\nz\r\n",
        &labeled(ConflictDisplayStyle::ModifiedLatest),
    );
    assert_eq!(
        output,
        "a\r\n<<<<<<< modified\r\nm\r\n=======\r\nt\r\n>>>>>>> latest\r\nz\r\n"
    );
}
