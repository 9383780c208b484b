//! Append-only CSV record store
//!
//! The CSV file is both the crawl output and the authoritative deduplication
//! ledger: on open, every persisted `unique_id` is read back into memory,
//! along with the highest page whose completion marker made it to disk.
//! Each record is written, flushed and `fsync`ed before `persist` returns.

use crate::storage::record::{Record, RECORD_COLUMNS};
use crate::storage::traits::{DeduplicationStore, PersistOutcome, StorageError, StorageResult};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// CSV-backed [`DeduplicationStore`]
pub struct CsvRecordStore {
    path: PathBuf,
    file: File,

    /// Ids of every record durably in the file
    seen: HashSet<String>,

    /// File length covering only complete rows
    committed_len: u64,

    /// Highest page with a durable `page_complete` row
    highest_complete_page: Option<u32>,

    /// Rows found in the file at open that repeated an earlier id
    duplicate_rows_at_open: usize,

    /// Set when a partial row could not be cut back; the file tail is unknown
    poisoned: bool,
}

impl CsvRecordStore {
    /// Opens the store, creating it with a header if missing or empty
    ///
    /// A trailing row without its final newline (a write torn by a crash) is
    /// truncated away with a warning.
    ///
    /// # Returns
    ///
    /// * `Ok(CsvRecordStore)` - Store ready for appends, ledger rebuilt
    /// * `Err(StorageError::SchemaMismatch)` - Header differs from the current columns
    /// * `Err(StorageError)` - I/O or CSV parse failure
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.is_empty() {
            let header = header_bytes()?;
            file.write_all(&header)?;
            file.sync_all()?;
            info!("Created record store at {}", path.display());

            return Ok(Self {
                path: path.to_path_buf(),
                file,
                seen: HashSet::new(),
                committed_len: header.len() as u64,
                highest_complete_page: None,
                duplicate_rows_at_open: 0,
                poisoned: false,
            });
        }

        let committed_len = match contents.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => last_newline as u64 + 1,
            None => 0,
        };
        if committed_len < contents.len() as u64 {
            warn!(
                "Truncating {} bytes of torn trailing row in {}",
                contents.len() as u64 - committed_len,
                path.display()
            );
            file.set_len(committed_len)?;
            file.sync_all()?;
            contents.truncate(committed_len as usize);
        }

        if contents.is_empty() {
            // Only a torn header was present
            let header = header_bytes()?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header)?;
            file.sync_all()?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                seen: HashSet::new(),
                committed_len: header.len() as u64,
                highest_complete_page: None,
                duplicate_rows_at_open: 0,
                poisoned: false,
            });
        }

        let LoadedLedger {
            seen,
            highest_complete_page,
            duplicate_rows_at_open,
        } = load_ledger(&contents)?;
        if duplicate_rows_at_open > 0 {
            warn!(
                "{} duplicate rows found in {}",
                duplicate_rows_at_open,
                path.display()
            );
        }
        info!(
            "Loaded {} existing record ids from {} (last complete page: {:?})",
            seen.len(),
            path.display(),
            highest_complete_page
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            seen,
            committed_len,
            highest_complete_page,
            duplicate_rows_at_open,
            poisoned: false,
        })
    }

    /// Deletes any existing store and creates an empty one
    pub fn create_fresh(path: &Path) -> StorageResult<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => info!("Removed existing record store {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows at open whose id had already appeared earlier in the file
    pub fn duplicate_rows_at_open(&self) -> usize {
        self.duplicate_rows_at_open
    }

    /// Reads every record back from a store file
    pub fn read_all(path: &Path) -> StorageResult<Vec<Record>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)?;
        let records = reader
            .deserialize::<Record>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Appends one serialized row and makes it durable
    ///
    /// On failure the file is cut back to the last complete row. If that cut
    /// fails too, the store is poisoned and refuses every later write.
    fn append_row(&mut self, row: &[u8]) -> StorageResult<()> {
        if self.poisoned {
            return Err(StorageError::Poisoned(self.path.display().to_string()));
        }

        let result = self
            .file
            .seek(SeekFrom::Start(self.committed_len))
            .and_then(|_| self.file.write_all(row))
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());

        if let Err(e) = result {
            if let Err(rollback) = self.file.set_len(self.committed_len) {
                error!(
                    "Failed to roll back partial row in {}: {}",
                    self.path.display(),
                    rollback
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }

        self.committed_len += row.len() as u64;
        Ok(())
    }
}

impl DeduplicationStore for CsvRecordStore {
    fn is_new(&self, unique_id: &str) -> bool {
        !self.seen.contains(unique_id)
    }

    fn persist(&mut self, record: &Record) -> StorageResult<PersistOutcome> {
        if self.seen.contains(&record.unique_id) {
            return Ok(PersistOutcome::Duplicate);
        }

        let row = serialize_row(record)?;
        self.append_row(&row)?;
        self.seen.insert(record.unique_id.clone());
        if record.page_complete {
            self.highest_complete_page = self.highest_complete_page.max(Some(record.page_number));
        }
        debug!(unique_id = %record.unique_id, "Persisted record");

        Ok(PersistOutcome::Written)
    }

    fn len(&self) -> usize {
        self.seen.len()
    }

    fn highest_complete_page(&self) -> Option<u32> {
        self.highest_complete_page
    }
}

fn header_bytes() -> StorageResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(RECORD_COLUMNS)?;
    writer
        .into_inner()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn serialize_row(record: &Record) -> StorageResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.serialize(record)?;
    writer
        .into_inner()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

struct LoadedLedger {
    seen: HashSet<String>,
    highest_complete_page: Option<u32>,
    duplicate_rows_at_open: usize,
}

/// Verifies the header and collects the ids of all rows
fn load_ledger(contents: &[u8]) -> StorageResult<LoadedLedger> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(contents);

    let header = reader.headers()?.clone();
    if header.iter().ne(RECORD_COLUMNS.iter().copied()) {
        return Err(StorageError::SchemaMismatch {
            expected: RECORD_COLUMNS.join(","),
            found: header.iter().collect::<Vec<_>>().join(","),
        });
    }
    let page_column = column_index("page_number");
    let complete_column = column_index("page_complete");

    let mut loaded = LoadedLedger {
        seen: HashSet::new(),
        highest_complete_page: None,
        duplicate_rows_at_open: 0,
    };
    for row in reader.records() {
        let row = row?;
        let id = row.get(0).unwrap_or_default();
        if id.is_empty() {
            continue;
        }
        if !loaded.seen.insert(id.to_string()) {
            loaded.duplicate_rows_at_open += 1;
        }

        if row.get(complete_column) == Some("true") {
            if let Some(page) = row.get(page_column).and_then(|p| p.parse::<u32>().ok()) {
                loaded.highest_complete_page = loaded.highest_complete_page.max(Some(page));
            }
        }
    }

    Ok(loaded)
}

fn column_index(name: &str) -> usize {
    RECORD_COLUMNS
        .iter()
        .position(|c| *c == name)
        .unwrap_or(RECORD_COLUMNS.len())
}
