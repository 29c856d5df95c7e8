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

use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Creates a directory or does nothing if the directory already exists.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persists the temporary file after synchronizing the content.
///
/// After a system crash, the persisted file has valid content if it exists at
/// all, but the directory entry itself may be lost. Synchronizing the parent
/// directory is up to the caller.
pub fn persist_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

/// Moves a finished file from a scratch location into its final name.
///
/// The permissions of `perms_reference` are copied onto `src` first so the
/// promoted file matches its committed siblings. Rename is used when
/// possible; if `src` and `dst` live on different devices the content is
/// copied instead and the copy is flushed to disk before returning.
pub fn move_into_place(src: &Path, dst: &Path, perms_reference: &Path) -> Result<(), PathError> {
    #[cfg(unix)]
    {
        let perms = fs::metadata(perms_reference)
            .context(perms_reference)?
            .permissions();
        fs::set_permissions(src, perms).context(src)?;
    }
    #[cfg(not(unix))]
    let _ = perms_reference;

    match fs::rename(src, dst) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            // Can't rename across devices; fall back to copying.
            fs::copy(src, dst).context(dst)?;
            let file = File::open(dst).context(dst)?;
            file.sync_all().context(dst)?;
            fs::remove_file(src).context(src)?;
        }
        Err(err) => return Err(err).context(src),
    }

    #[cfg(target_os = "linux")]
    {
        // fsync() on the file alone doesn't make its directory entry
        // durable on Linux; the parent directory needs one as well.
        if let Some(dirname) = dst.parent() {
            let dir = File::open(dirname).context(dirname)?;
            dir.sync_all().context(dirname)?;
        }
    }

    Ok(())
}
