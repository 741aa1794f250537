//! Durable storage for the meter state.
//!
//! [`FileStore`] keeps two slot files and always overwrites the older one, so
//! a power cut in the middle of a save leaves the previous checkpoint intact.
//! Each slot carries a sequence number and a CRC-32 of its payload; recovery
//! picks the newest slot that verifies.

use crate::error::{AgentError, Result};
use crate::meter::MeterState;
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const SLOTS: [&str; 2] = ["meter.a.json", "meter.b.json"];
const RECORD_VERSION: u32 = 1;
const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Storage capability consumed by the accumulator.
pub trait StateStore: Send {
    /// Last persisted state, or `None` on first boot.
    fn load(&mut self) -> Result<Option<MeterState>>;

    /// Durably persist `state`.
    fn save(&mut self, state: &MeterState) -> Result<()>;
}

/// On-disk form of a [`MeterState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedRecord {
    pub version: u32,
    pub sequence: u64,
    pub state: MeterState,
    pub checksum: u32,
}

impl PersistedRecord {
    /// Build a record and compute its checksum.
    pub fn seal(sequence: u64, state: MeterState) -> Result<Self> {
        let checksum = Self::digest(RECORD_VERSION, sequence, &state)?;
        Ok(Self {
            version: RECORD_VERSION,
            sequence,
            state,
            checksum,
        })
    }

    /// Whether the record is intact and internally consistent.
    pub fn verify(&self) -> bool {
        self.version == RECORD_VERSION
            && self.state.is_consistent()
            && Self::digest(self.version, self.sequence, &self.state)
                .map(|sum| sum == self.checksum)
                .unwrap_or(false)
    }

    fn digest(version: u32, sequence: u64, state: &MeterState) -> Result<u32> {
        let payload = serde_json::to_vec(&(version, sequence, state))?;
        Ok(CHECKSUM.checksum(&payload))
    }
}

/// Two-slot file store.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    sequence: u64,
}

impl FileStore {
    /// Open (and create if needed) the data directory.
    ///
    /// Call [`StateStore::load`] before the first save so the slot sequence
    /// continues from what is on disk.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            AgentError::storage_error(format!(
                "Failed to create data directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir, sequence: 0 })
    }

    /// Directory holding the slots.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a slot file.
    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(SLOTS[slot % SLOTS.len()])
    }

    /// Outer `Err` is an I/O failure; inner `Err` names a slot that was read
    /// but does not hold a valid record.
    fn read_slot(
        &self,
        slot: usize,
    ) -> Result<Option<std::result::Result<PersistedRecord, String>>> {
        let path = self.slot_path(slot);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read {}: {}", path.display(), e),
                )))
            }
        };

        let record = match serde_json::from_slice::<PersistedRecord>(&raw) {
            Ok(record) => record,
            Err(e) => return Ok(Some(Err(format!("{}: {}", path.display(), e)))),
        };

        if record.verify() {
            Ok(Some(Ok(record)))
        } else {
            Ok(Some(Err(format!("{}: checksum mismatch", path.display()))))
        }
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        // Make the rename itself durable
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn load(&mut self) -> Result<Option<MeterState>> {
        let mut newest: Option<PersistedRecord> = None;
        let mut failures = Vec::new();

        // A slot that cannot be read may hold the newest record, so give up
        // rather than fall back to an older one
        for slot in 0..SLOTS.len() {
            match self.read_slot(slot)? {
                None => {}
                Some(Ok(record)) => {
                    if newest
                        .as_ref()
                        .map_or(true, |best| record.sequence > best.sequence)
                    {
                        newest = Some(record);
                    }
                }
                Some(Err(reason)) => {
                    warn!("Discarding unreadable meter state slot {}", reason);
                    failures.push(reason);
                }
            }
        }

        match newest {
            Some(record) => {
                self.sequence = record.sequence;
                debug!(
                    sequence = record.sequence,
                    total = record.state.total_pulses,
                    "Recovered meter state"
                );
                Ok(Some(record.state))
            }
            None if failures.is_empty() => Ok(None),
            None => Err(AgentError::corrupt_error(failures.join("; "))),
        }
    }

    fn save(&mut self, state: &MeterState) -> Result<()> {
        let sequence = self.sequence + 1;
        let record = PersistedRecord::seal(sequence, state.clone())?;
        let bytes = serde_json::to_vec_pretty(&record)?;
        let path = self.slot_path(sequence as usize);

        self.write_atomically(&path, &bytes).map_err(|e| {
            AgentError::storage_error(format!("Failed to write {}: {}", path.display(), e))
        })?;

        self.sequence = sequence;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    saved: Option<MeterState>,
    writes: usize,
    fail_writes: bool,
}

/// Volatile store shared between clones.
///
/// Used by `simulate` and by tests, where a clone kept outside the agent shows
/// what would have survived a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `state`.
    pub fn with_state(state: MeterState) -> Self {
        let store = Self::default();
        store.lock().saved = Some(state);
        store
    }

    /// Last successfully saved state.
    pub fn saved(&self) -> Option<MeterState> {
        self.lock().saved.clone()
    }

    /// Number of successful saves.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Make subsequent saves fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn load(&mut self) -> Result<Option<MeterState>> {
        Ok(self.lock().saved.clone())
    }

    fn save(&mut self, state: &MeterState) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(AgentError::storage_error("simulated write failure"));
        }
        inner.saved = Some(state.clone());
        inner.writes += 1;
        Ok(())
    }
}
