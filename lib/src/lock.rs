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

//! Exclusive advisory file locking for the single-writer commit protocol.
//!
//! The lock is cooperative: readers never take it, and consistency for them
//! comes from the `current` pointer being replaced atomically as the last
//! step of a commit.

use std::path::Path;
use std::path::PathBuf;

use crate::file_util::PathError;

/// Held for the duration of a commit; released on drop.
pub struct FileLock {
    path: PathBuf,
    _impl: platform::FileLockImpl,
}

impl FileLock {
    /// Blocks until the exclusive lock on `path` is acquired. The lock file
    /// is created if it does not exist yet.
    pub fn lock(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        let inner = platform::lock_exclusive(&path)?;
        Ok(Self { path, _impl: inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::fs::OpenOptions;
    use std::path::Path;

    use rustix::fs::FlockOperation;
    use rustix::fs::flock;

    use crate::file_util::IoResultExt as _;
    use crate::file_util::PathError;

    pub struct FileLockImpl {
        file: File,
    }

    pub fn lock_exclusive(path: &Path) -> Result<FileLockImpl, PathError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .context(path)?;
        flock(&file, FlockOperation::LockExclusive)
            .map_err(std::io::Error::from)
            .context(path)?;
        Ok(FileLockImpl { file })
    }

    impl Drop for FileLockImpl {
        fn drop(&mut self) {
            // Closing the descriptor releases the lock, but do it explicitly
            // so the release is not tied to descriptor lifetime edge cases.
            let _ = flock(&self.file, FlockOperation::Unlock);
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::fs::OpenOptions;
    use std::path::Path;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::file_util::IoResultExt as _;
    use crate::file_util::PathError;

    pub struct FileLockImpl {
        sentinel_path: PathBuf,
    }

    pub fn lock_exclusive(path: &Path) -> Result<FileLockImpl, PathError> {
        let mut sentinel_path = path.as_os_str().to_owned();
        sentinel_path.push(".lock");
        let sentinel_path = PathBuf::from(sentinel_path);
        loop {
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&sentinel_path)
            {
                Ok(_) => return Ok(FileLockImpl { sentinel_path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err).context(&sentinel_path),
            }
        }
    }

    impl Drop for FileLockImpl {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.sentinel_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::tests::new_temp_dir;

    #[test]
    fn lock_basic() {
        let temp_dir = new_temp_dir();
        let lock_path = temp_dir.path().join("write-lock");
        let lock = FileLock::lock(&lock_path).unwrap();
        assert!(lock_path.exists());
        assert_eq!(lock.path(), lock_path);
        drop(lock);
        // Re-acquirable after release.
        let _lock = FileLock::lock(&lock_path).unwrap();
    }

    #[test]
    fn lock_is_exclusive_across_threads() {
        let temp_dir = new_temp_dir();
        let lock_path = temp_dir.path().join("write-lock");
        let data = Arc::new(Mutex::new(Vec::new()));
        let mut threads = vec![];
        for i in 0..4 {
            let lock_path = lock_path.clone();
            let data = data.clone();
            threads.push(thread::spawn(move || {
                let _lock = FileLock::lock(&lock_path).unwrap();
                data.lock().unwrap().push(i);
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(data.lock().unwrap().len(), 4);
    }
}
