//! Retrieve-list (LS-data) store (§4.C).
//!
//! A single retrieve worker owns its list file exclusively (`fs2` advisory
//! lock); the header carries `no_of_listed_files`/`version`/`creation_time`
//! and the body grows by `STEP`-sized chunks, never shrinking except in
//! `reset_ls()`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Entries are allocated in chunks of this size; see [`capacity_for`].
pub const STEP: usize = 100;

/// Current on-disk record version; anything else triggers migration.
pub const CURRENT_RL_VERSION: u8 = 2;

const LEGACY_RL_VERSION: u8 = 1;

const HEADER_LEN: usize = 16;
const FILE_NAME_LEN: usize = 256;
const ENTRY_LEN: usize = FILE_NAME_LEN + 8 + 8 + 8 + 1 + 7;
const LEGACY_ENTRY_LEN: usize = FILE_NAME_LEN + 14 + 8 + 1;

/// Retrieve-list errors.
#[derive(Debug, Error)]
pub enum LsDataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another worker already owns the list for {0:?}")]
    AlreadyOwned(String),

    #[error("corrupt retrieve-list file: {0}")]
    Corrupt(String),
}

/// One entry of the retrieve list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlEntry {
    pub file_name: String,
    pub file_mtime: i64,
    pub got_date: i64,
    pub size: i64,
    pub retrieved: bool,
    pub in_list: bool,
}

impl RlEntry {
    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), ENTRY_LEN);
        let name_bytes = self.file_name.as_bytes();
        let take = name_bytes.len().min(FILE_NAME_LEN - 1);
        buf[..take].copy_from_slice(&name_bytes[..take]);
        buf[take..FILE_NAME_LEN].fill(0);

        let mut off = FILE_NAME_LEN;
        buf[off..off + 8].copy_from_slice(&self.file_mtime.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.got_date.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.size.to_le_bytes());
        off += 8;
        let mut flags = 0u8;
        if self.retrieved {
            flags |= 0b01;
        }
        if self.in_list {
            flags |= 0b10;
        }
        buf[off] = flags;
    }

    fn decode(buf: &[u8]) -> Self {
        let name_end = buf[..FILE_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_LEN);
        let file_name = String::from_utf8_lossy(&buf[..name_end]).into_owned();

        let mut off = FILE_NAME_LEN;
        let file_mtime = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let got_date = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let size = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let flags = buf[off];

        Self {
            file_name,
            file_mtime,
            got_date,
            size,
            retrieved: flags & 0b01 != 0,
            in_list: flags & 0b10 != 0,
        }
    }
}

/// `capacity_steps = floor(n / STEP) + 1`: the number of entries a table
/// can hold always keeps at least one free slot beyond `n`, so an insert
/// that lands exactly on a step boundary (e.g. the 100th entry with
/// `STEP == 100`) forces growth to the *next* step rather than merely
/// filling the current one.
#[must_use]
pub fn capacity_for(n: usize) -> usize {
    (n / STEP + 1) * STEP
}

/// An attached, exclusively-locked retrieve list.
pub struct LsDataHandle {
    file: File,
    path: PathBuf,
    version: u8,
    creation_time: i64,
    entries: Vec<RlEntry>,
}

impl LsDataHandle {
    /// `attach_ls(dir_alias, create)`.
    #[instrument(skip(ls_data_dir))]
    pub fn attach(ls_data_dir: &Path, dir_alias: &str, create: bool) -> Result<Self, LsDataError> {
        std::fs::create_dir_all(ls_data_dir)?;
        let path = ls_data_dir.join(dir_alias);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| LsDataError::AlreadyOwned(dir_alias.to_string()))?;

        let len = file.metadata()?.len();
        let (version, creation_time, entries) = if len == 0 {
            (CURRENT_RL_VERSION, now(), Vec::new())
        } else {
            read_existing(&mut file, len)?
        };

        let mut handle = Self {
            file,
            path,
            version,
            creation_time,
            entries,
        };

        if handle.version != CURRENT_RL_VERSION {
            handle.migrate()?;
        }

        handle.persist()?;
        Ok(handle)
    }

    #[must_use]
    pub fn entries(&self) -> &[RlEntry] {
        &self.entries
    }

    #[must_use]
    pub fn no_of_listed_files(&self) -> usize {
        self.entries.len()
    }

    /// Appends one entry, growing the backing file by a step if needed.
    pub fn push(&mut self, entry: RlEntry) -> Result<(), LsDataError> {
        let before_capacity = capacity_for(self.entries.len());
        self.entries.push(entry);
        let after_capacity = capacity_for(self.entries.len());
        if after_capacity > before_capacity {
            debug!(
                from = before_capacity,
                to = after_capacity,
                "growing retrieve list"
            );
        }
        self.persist()
    }

    /// `reset_ls()`: truncates to exactly one step and clears all entries.
    pub fn reset(&mut self) -> Result<(), LsDataError> {
        self.entries.clear();
        self.persist()
    }

    fn persist(&mut self) -> Result<(), LsDataError> {
        let capacity = capacity_for(self.entries.len());
        let mut buf = vec![0u8; HEADER_LEN + capacity * ENTRY_LEN];

        buf[0..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[7] = self.version;
        buf[8..16].copy_from_slice(&self.creation_time.to_le_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let start = HEADER_LEN + i * ENTRY_LEN;
            entry.encode(&mut buf[start..start + ENTRY_LEN]);
        }

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    /// Converts a legacy-version file in place: writes a hidden sibling
    /// file and renames it over the original so a crash mid-migration
    /// leaves the original intact.
    fn migrate(&mut self) -> Result<(), LsDataError> {
        self.version = CURRENT_RL_VERSION;

        let sibling_name = format!(
            ".{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("ls_data")
        );
        let sibling_path = self.path.with_file_name(sibling_name);

        {
            let mut sibling = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&sibling_path)?;

            let capacity = capacity_for(self.entries.len());
            let mut buf = vec![0u8; HEADER_LEN + capacity * ENTRY_LEN];
            buf[0..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
            buf[7] = self.version;
            buf[8..16].copy_from_slice(&self.creation_time.to_le_bytes());
            for (i, entry) in self.entries.iter().enumerate() {
                let start = HEADER_LEN + i * ENTRY_LEN;
                entry.encode(&mut buf[start..start + ENTRY_LEN]);
            }
            sibling.write_all(&buf)?;
            sibling.flush()?;
        }

        std::fs::rename(&sibling_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file.try_lock_exclusive().ok();
        Ok(())
    }

    /// `detach_ls(remove)`.
    pub fn detach(self, remove: bool) -> Result<(), LsDataError> {
        let path = self.path.clone();
        drop(self.file);
        if remove {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn read_existing(file: &mut File, len: u64) -> Result<(u8, i64, Vec<RlEntry>), LsDataError> {
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    if buf.len() < HEADER_LEN {
        return Err(LsDataError::Corrupt("file shorter than header".into()));
    }

    let no_of_listed_files = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let version = buf[7];
    let creation_time = i64::from_le_bytes(buf[8..16].try_into().unwrap());

    if version == CURRENT_RL_VERSION {
        let body = &buf[HEADER_LEN..];
        if body.len() % ENTRY_LEN != 0 {
            return Err(LsDataError::Corrupt(format!(
                "body length {} not a multiple of entry size {ENTRY_LEN}",
                body.len()
            )));
        }
        let mut entries = Vec::with_capacity(no_of_listed_files);
        for i in 0..no_of_listed_files {
            let start = i * ENTRY_LEN;
            if start + ENTRY_LEN > body.len() {
                break;
            }
            entries.push(RlEntry::decode(&body[start..start + ENTRY_LEN]));
        }
        Ok((version, creation_time, entries))
    } else if version == LEGACY_RL_VERSION {
        warn!(no_of_listed_files, "migrating legacy retrieve-list format");
        let body = &buf[8..]; // legacy header was 8 bytes: count + version + pad
        let mut entries = Vec::with_capacity(no_of_listed_files);
        for i in 0..no_of_listed_files {
            let start = i * LEGACY_ENTRY_LEN;
            if start + LEGACY_ENTRY_LEN > body.len() {
                break;
            }
            entries.push(decode_legacy(&body[start..start + LEGACY_ENTRY_LEN]));
        }
        Ok((version, creation_time, entries))
    } else {
        Err(LsDataError::Corrupt(format!("unknown version byte {version}")))
    }
}

/// Decodes a legacy entry: name, a textual `YYYYMMDDhhmmss` mtime, size,
/// retrieved flag.
fn decode_legacy(buf: &[u8]) -> RlEntry {
    let name_end = buf[..FILE_NAME_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(FILE_NAME_LEN);
    let file_name = String::from_utf8_lossy(&buf[..name_end]).into_owned();

    let date_str = String::from_utf8_lossy(&buf[FILE_NAME_LEN..FILE_NAME_LEN + 14]).into_owned();
    let file_mtime = parse_legacy_date(&date_str).unwrap_or(0);

    let size_off = FILE_NAME_LEN + 14;
    let size = i64::from_le_bytes(buf[size_off..size_off + 8].try_into().unwrap());
    let retrieved = buf[size_off + 8] != 0;

    RlEntry {
        file_name,
        file_mtime,
        got_date: file_mtime,
        size,
        retrieved,
        in_list: true,
    }
}

/// Parses `YYYYMMDDhhmmss` into a Unix timestamp via broken-down-time
/// composition (no timezone database lookup; treated as UTC).
fn parse_legacy_date(s: &str) -> Option<i64> {
    if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i64 = s[0..4].parse().ok()?;
    let month: i64 = s[4..6].parse().ok()?;
    let day: i64 = s[6..8].parse().ok()?;
    let hour: i64 = s[8..10].parse().ok()?;
    let minute: i64 = s[10..12].parse().ok()?;
    let second: i64 = s[12..14].parse().ok()?;

    let days = days_from_civil(year, month, day);
    Some(days * 86_400 + hour * 3600 + minute * 60 + second)
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, days
/// since the Unix epoch).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capacity_grows_on_step_boundary() {
        assert_eq!(capacity_for(STEP - 1), STEP);
        assert_eq!(capacity_for(STEP), 2 * STEP);
        assert_eq!(capacity_for(0), STEP);
    }

    fn sample_entry(name: &str) -> RlEntry {
        RlEntry {
            file_name: name.to_string(),
            file_mtime: 1_700_000_000,
            got_date: 1_700_000_000,
            size: 1024,
            retrieved: false,
            in_list: true,
        }
    }

    #[test]
    fn attach_create_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut handle = LsDataHandle::attach(dir.path(), "dir-a", true).unwrap();
            handle.push(sample_entry("a.txt")).unwrap();
            handle.push(sample_entry("b.txt")).unwrap();
            handle.detach(false).unwrap();
        }

        let handle = LsDataHandle::attach(dir.path(), "dir-a", false).unwrap();
        assert_eq!(handle.no_of_listed_files(), 2);
        assert_eq!(handle.entries()[0].file_name, "a.txt");
        assert_eq!(handle.entries()[1].file_name, "b.txt");
    }

    #[test]
    fn detach_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LsDataHandle::attach(dir.path(), "dir-a", true).unwrap();
        handle.detach(true).unwrap();
        assert!(!dir.path().join("dir-a").exists());
    }

    #[test]
    fn reset_clears_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = LsDataHandle::attach(dir.path(), "dir-a", true).unwrap();
        handle.push(sample_entry("a.txt")).unwrap();
        handle.reset().unwrap();
        assert_eq!(handle.no_of_listed_files(), 0);
    }

    #[test]
    fn second_attach_without_detach_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _first = LsDataHandle::attach(dir.path(), "dir-a", true).unwrap();
        let second = LsDataHandle::attach(dir.path(), "dir-a", true);
        assert!(matches!(second, Err(LsDataError::AlreadyOwned(_))));
    }

    #[test]
    fn legacy_date_parses_to_unix_epoch_seconds() {
        // 1970-01-01T00:00:00Z
        assert_eq!(parse_legacy_date("19700101000000"), Some(0));
    }

    #[test]
    fn growth_by_one_past_a_full_step_doubles_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = LsDataHandle::attach(dir.path(), "dir-a", true).unwrap();
        for i in 0..STEP - 1 {
            handle.push(sample_entry(&format!("f{i}"))).unwrap();
        }
        assert_eq!(capacity_for(handle.no_of_listed_files()), STEP);

        handle.push(sample_entry("last")).unwrap();
        assert_eq!(handle.no_of_listed_files(), STEP);
        assert_eq!(capacity_for(handle.no_of_listed_files()), 2 * STEP);
    }
}
