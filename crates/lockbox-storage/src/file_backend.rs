use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use lockbox_core::{BackendError, RawBackend};
use tempfile::NamedTempFile;
use tracing::instrument;

/// File-per-key raw backend. File names are the URL-safe base64 of the key and
/// every write lands atomically through a temp file in the same directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(key))
    }
}

impl RawBackend for FileBackend {
    #[instrument(skip_all, fields(key = %key))]
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut file = match File::open(self.path_for(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(backend_err(err)),
        };

        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(backend_err)?;
        Ok(Some(buf))
    }

    #[instrument(skip_all, fields(key = %key))]
    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        fs::create_dir_all(&self.root).map_err(backend_err)?;
        let full = |err: std::io::Error| {
            if err.kind() == ErrorKind::StorageFull {
                BackendError::QuotaExceeded {
                    key: key.to_string(),
                }
            } else {
                backend_err(err)
            }
        };

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(backend_err)?;
        tmp.write_all(value.as_bytes()).map_err(full)?;
        tmp.flush().map_err(full)?;
        tmp.persist(self.path_for(key))
            .map_err(|e| backend_err(e.error))?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    fn remove(&self, key: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(backend_err(err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(backend_err(err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(backend_err)?;
            if !entry.file_type().map_err(backend_err)?.is_file() {
                continue;
            }
            // temp files and foreign files do not decode to a key
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(key) = URL_SAFE_NO_PAD
                .decode(&name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn backend_err<E: ToString>(err: E) -> BackendError {
    BackendError::Unavailable {
        reason: err.to_string(),
    }
}
