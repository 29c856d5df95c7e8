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

//! Node-revision identifiers and the base-36 key arithmetic behind them.
//!
//! A node-revision is addressed by `(node_id, copy_id, location)`. Node and
//! copy ids are short lower-case base-36 keys minted from per-repository
//! counters. The location is `(rev, offset)` once committed, or a
//! transaction id while the node is still in flight. Identifiers minted
//! inside a transaction use a `_` prefix on the key; commit rewrites them to
//! permanent keys by adding the repository's next-key base.

use std::fmt;
use std::fmt::Display;

/// Revision number. Revision 0 exists from repository creation.
pub type Rev = u64;

const BASE: u32 = 36;

fn digit_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some(u32::from(c - b'0')),
        b'a'..=b'z' => Some(u32::from(c - b'a') + 10),
        _ => None,
    }
}

fn digit_char(value: u32) -> u8 {
    debug_assert!(value < BASE);
    if value < 10 {
        b'0' + value as u8
    } else {
        b'a' + (value - 10) as u8
    }
}

/// Whether `key` is a well-formed base-36 key (without a `_` prefix).
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|c| digit_value(c).is_some())
}

/// Returns the key following `key` in counting order, e.g. `"9"` -> `"a"`,
/// `"z"` -> `"10"`.
pub fn next_key(key: &str) -> String {
    add_keys(key, "1")
}

/// Adds two base-36 keys.
pub fn add_keys(a: &str, b: &str) -> String {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut result = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0;
    for i in 0..a.len().max(b.len()) {
        let da = a
            .len()
            .checked_sub(i + 1)
            .and_then(|idx| digit_value(a[idx]))
            .unwrap_or(0);
        let db = b
            .len()
            .checked_sub(i + 1)
            .and_then(|idx| digit_value(b[idx]))
            .unwrap_or(0);
        let sum = da + db + carry;
        carry = sum / BASE;
        result.push(digit_char(sum % BASE));
    }
    if carry > 0 {
        result.push(digit_char(carry));
    }
    result.reverse();
    String::from_utf8(result).unwrap()
}

/// Location half of a node-revision identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdLocation {
    /// Committed node: the revision it appears in, and the byte offset of
    /// its header block within the revision file.
    Committed { rev: Rev, offset: u64 },
    /// In-flight node, owned by the named transaction.
    Txn(String),
}

/// Identifier of one node at one revision (or in one transaction).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    pub node_id: String,
    pub copy_id: String,
    pub location: IdLocation,
}

impl NodeRevId {
    pub fn committed(
        node_id: impl Into<String>,
        copy_id: impl Into<String>,
        rev: Rev,
        offset: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            location: IdLocation::Committed { rev, offset },
        }
    }

    pub fn in_txn(
        node_id: impl Into<String>,
        copy_id: impl Into<String>,
        txn_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            location: IdLocation::Txn(txn_id.into()),
        }
    }

    /// The owning transaction id, or `None` for a committed node.
    pub fn txn_id(&self) -> Option<&str> {
        match &self.location {
            IdLocation::Txn(txn_id) => Some(txn_id),
            IdLocation::Committed { .. } => None,
        }
    }

    pub fn rev(&self) -> Option<Rev> {
        match self.location {
            IdLocation::Committed { rev, .. } => Some(rev),
            IdLocation::Txn(_) => None,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self.location {
            IdLocation::Committed { offset, .. } => Some(offset),
            IdLocation::Txn(_) => None,
        }
    }

    /// Parses the string form: `<node>.<copy>.r<rev>/<offset>` for committed
    /// nodes, `<node>.<copy>.t<txn>` for transaction nodes.
    pub fn parse(s: &str) -> Option<Self> {
        let (node_id, rest) = s.split_once('.')?;
        let (copy_id, location) = rest.split_once('.')?;
        let valid_id = |id: &str| is_valid_key(id.strip_prefix('_').unwrap_or(id));
        if !valid_id(node_id) || !valid_id(copy_id) {
            return None;
        }
        let location = if let Some(rev_offset) = location.strip_prefix('r') {
            let (rev, offset) = rev_offset.split_once('/')?;
            IdLocation::Committed {
                rev: rev.parse().ok()?,
                offset: offset.parse().ok()?,
            }
        } else if let Some(txn_id) = location.strip_prefix('t') {
            if txn_id.is_empty() {
                return None;
            }
            IdLocation::Txn(txn_id.to_owned())
        } else {
            return None;
        };
        Some(Self {
            node_id: node_id.to_owned(),
            copy_id: copy_id.to_owned(),
            location,
        })
    }
}

impl Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            IdLocation::Committed { rev, offset } => {
                write!(f, "{}.{}.r{rev}/{offset}", self.node_id, self.copy_id)
            }
            IdLocation::Txn(txn_id) => {
                write!(f, "{}.{}.t{txn_id}", self.node_id, self.copy_id)
            }
        }
    }
}
