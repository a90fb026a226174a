use crate::core::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";

/// Engine-default blob name for a key: hex SHA-256 of the key bytes
pub fn default_filename(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// A sibling of `name` for replacing a blob that the committed row still reads
pub fn generation_name(name: &str) -> String {
    format!("{}.{}", name, Uuid::new_v4().simple())
}

/// Reject names that would escape the blob directory or collide with temp files
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with(TEMP_PREFIX)
    {
        return Err(CacheError::InvalidArgument(format!(
            "invalid blob filename: {:?}",
            name
        )));
    }
    Ok(())
}

/// Whether `name` is an unfinished write left behind by a crash
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// Directory of standalone value files plus a trash area for bulk deletes
pub struct BlobStore {
    dir: PathBuf,
    trash: PathBuf,
}

impl BlobStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("blobs");
        let trash = root.join("trash");
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&trash)?;
        Ok(Self { dir, trash })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Write `data` under `filename`, replacing any previous file atomically
    ///
    /// The bytes land in a temp file first and are renamed into place only
    /// after a successful sync, so readers see either the old or new content.
    pub fn write(&self, filename: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));

        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp, self.path_of(filename))
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!("Blob written: {} ({} bytes)", filename, data.len());
        Ok(())
    }

    /// Read a blob; a missing file is `None`
    pub fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(filename)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_of(filename).is_file()
    }

    /// Remove a blob; a missing file is `Ok(false)`
    pub fn remove(&self, filename: &str) -> Result<bool> {
        match fs::remove_file(self.path_of(filename)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every regular file in the blob directory, temp files included
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Swap the whole blob directory into the trash and start over empty
    pub fn move_all_to_trash(&self) -> Result<()> {
        let target = self.trash.join(Uuid::new_v4().to_string());
        fs::rename(&self.dir, &target)?;
        fs::create_dir_all(&self.dir)?;
        debug!("Blob directory moved to {:?}", target);
        Ok(())
    }

    /// Delete trash contents on a detached thread
    pub fn empty_trash_in_background(&self) {
        let trash = self.trash.clone();
        let spawned = std::thread::Builder::new()
            .name("strata-trash".to_string())
            .spawn(move || {
                if let Err(e) = empty_dir(&trash) {
                    warn!("Failed to empty trash at {:?}: {}", trash, e);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn trash worker: {}", e);
        }
    }
}

fn empty_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
