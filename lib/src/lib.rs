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

//! Append-only revision storage for a centralized version control server,
//! plus the line-oriented text diff/merge engine that serves it.
//!
//! The storage side persists an ordered history of immutable revisions on a
//! local filesystem. Readers may run concurrently; a single writer at a time
//! promotes a scratch transaction into a new numbered revision under an
//! advisory write lock. Historical file contents are reconstructed by
//! chaining binary delta windows back to a plain base.
//!
//! The diff side compares two to four line-tokenized text sources with
//! optional whitespace and end-of-line normalization, and renders the result
//! as a unified diff or as a three-way merge with conflict markers.

pub mod adler32;
mod commit;
pub mod diff;
pub mod file_util;
pub mod framed_pipe;
pub mod hash_text;
pub mod lock;
pub mod node_id;
pub mod rep_read;
pub mod revfile;
pub mod store;
pub mod svndiff;
pub mod transaction;

#[cfg(test)]
pub(crate) mod tests {
    use tempfile::TempDir;

    pub fn new_temp_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix("strata-test-")
            .tempdir()
            .unwrap()
    }
}
