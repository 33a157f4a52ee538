//! Config persistence with optimistic concurrency.

use super::model::Config;
use crate::error::{BackrunError, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Storage for the declarative config.
pub trait ConfigStore: Send + Sync {
    /// Read the current config.
    fn get(&self) -> Result<Config>;

    /// Replace the config.
    ///
    /// `config.modno` must equal the stored modno, otherwise the write is rejected with
    /// [`BackrunError::StaleConfig`]. On success the stored modno is incremented by one and
    /// the stored config is returned.
    fn update(&self, config: Config) -> Result<Config>;
}

fn check_modno(stored: &Config, incoming: &Config) -> Result<()> {
    if stored.modno != incoming.modno {
        return Err(BackrunError::StaleConfig {
            expected: stored.modno,
            got: incoming.modno,
        });
    }
    Ok(())
}

/// In-memory config store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<Config>,
}

impl MemoryStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self) -> Result<Config> {
        Ok(self.config.lock().clone())
    }

    fn update(&self, mut config: Config) -> Result<Config> {
        let mut stored = self.config.lock();
        check_modno(&stored, &config)?;
        config.modno += 1;
        *stored = config.clone();
        Ok(config)
    }
}

/// Config store backed by a JSON file, written atomically.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store at `path`. A missing file reads as an empty config.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "Opened config store");
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn read(&self) -> Result<Config> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                BackrunError::Config(format!(
                    "Failed to parse {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, config: &Config) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, config)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), modno = config.modno, "Wrote config");
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self) -> Result<Config> {
        let _guard = self.lock.lock();
        self.read()
    }

    fn update(&self, mut config: Config) -> Result<Config> {
        let _guard = self.lock.lock();
        let stored = self.read()?;
        check_modno(&stored, &config)?;
        config.modno += 1;
        self.write(&config)?;
        Ok(config)
    }
}
