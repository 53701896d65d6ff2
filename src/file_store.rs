// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! File Store Collaborator
//!
//! Opaque attachment blobs live behind this fixed interface. The relay
//! treats the backing store as an external collaborator: blobs go in, a
//! reference comes out, and nothing here inspects content. The bundled
//! implementation keeps blobs on local disk under the data directory.

use std::path::{Path, PathBuf};

/// Trait for attachment blob storage backends.
pub trait FileStore: Send + Sync {
    /// Stores a blob and returns its reference.
    fn put(&self, data: &[u8]) -> std::io::Result<String>;

    /// Retrieves a blob by reference. `None` when absent.
    fn get(&self, file_id: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Deletes a blob. Returns whether it existed.
    fn delete(&self, file_id: &str) -> std::io::Result<bool>;
}

/// File references are server-generated UUIDs; anything else is rejected
/// before it can touch a path.
fn valid_file_id(file_id: &str) -> bool {
    uuid::Uuid::parse_str(file_id).is_ok()
}

/// Local-disk blob store under `{root}/files`.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        let root = data_dir.join("files");
        std::fs::create_dir_all(&root)?;
        Ok(LocalFileStore { root })
    }

    fn path_for(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }
}

impl FileStore for LocalFileStore {
    fn put(&self, data: &[u8]) -> std::io::Result<String> {
        let file_id = uuid::Uuid::new_v4().to_string();
        std::fs::write(self.path_for(&file_id), data)?;
        Ok(file_id)
    }

    fn get(&self, file_id: &str) -> std::io::Result<Option<Vec<u8>>> {
        if !valid_file_id(file_id) {
            return Ok(None);
        }
        match std::fs::read(self.path_for(file_id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, file_id: &str) -> std::io::Result<bool> {
        if !valid_file_id(file_id) {
            return Ok(false);
        }
        match std::fs::remove_file(self.path_for(file_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
