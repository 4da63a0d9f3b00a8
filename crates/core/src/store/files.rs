//! Restores, files and download attempts.

use std::path::PathBuf;

use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::sqlite::{decode_err, now_text, parse_time};
use super::{
    AttemptStatus, DataFile, DownloadAttempt, FileStatus, NewDataFile, Restore, RestoreStatus,
    SqliteStore, StoreError,
};

const RESTORE_COLUMNS: &str = "id, guid, status, size, listed_at, details, created_at, updated_at";
const FILE_COLUMNS: &str =
    "id, restore_id, remote_name, local_path, size, status, details, created_at, updated_at";
const ATTEMPT_COLUMNS: &str = "id, file_id, status, details, created_at, updated_at";

fn row_to_restore(row: &Row) -> rusqlite::Result<Restore> {
    let status: String = row.get(2)?;
    let listed_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Restore {
        id: row.get(0)?,
        guid: row.get(1)?,
        status: status.parse().map_err(decode_err)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        listed_at: listed_at
            .as_deref()
            .map(parse_time)
            .transpose()
            .map_err(decode_err)?,
        details: row.get(5)?,
        created_at: parse_time(&created_at).map_err(decode_err)?,
        updated_at: parse_time(&updated_at).map_err(decode_err)?,
    })
}

pub(crate) fn row_to_file(row: &Row) -> rusqlite::Result<DataFile> {
    let local_path: String = row.get(3)?;
    let size: Option<i64> = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(DataFile {
        id: row.get(0)?,
        restore_id: row.get(1)?,
        remote_name: row.get(2)?,
        local_path: PathBuf::from(local_path),
        size: size.map(|s| s.max(0) as u64),
        status: status.parse().map_err(decode_err)?,
        details: row.get(6)?,
        created_at: parse_time(&created_at).map_err(decode_err)?,
        updated_at: parse_time(&updated_at).map_err(decode_err)?,
    })
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<DownloadAttempt> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(DownloadAttempt {
        id: row.get(0)?,
        file_id: row.get(1)?,
        status: status.parse().map_err(decode_err)?,
        details: row.get(3)?,
        created_at: parse_time(&created_at).map_err(decode_err)?,
        updated_at: parse_time(&updated_at).map_err(decode_err)?,
    })
}

fn load_restore(tx: &Transaction<'_>, id: i64) -> Result<Restore, StoreError> {
    tx.query_row(
        &format!("SELECT {} FROM restores WHERE id = ?", RESTORE_COLUMNS),
        params![id],
        row_to_restore,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "restore",
        id,
    })
}

fn load_file(tx: &Transaction<'_>, id: i64) -> Result<DataFile, StoreError> {
    tx.query_row(
        &format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS),
        params![id],
        row_to_file,
    )
    .optional()?
    .ok_or(StoreError::NotFound { entity: "file", id })
}

fn status_list<S: AsRef<str>>(statuses: &[S]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    // ------------------------------------------------------------------
    // Restores
    // ------------------------------------------------------------------

    /// Record a restore the archive accepted.
    pub fn insert_restore(&self, guid: &str) -> Result<Restore, StoreError> {
        self.transaction(|tx| {
            let now = now_text();
            tx.execute(
                "INSERT INTO restores (guid, status, size, details, created_at, updated_at) \
                 VALUES (?, ?, 0, 'Restore requested', ?, ?)",
                params![guid, RestoreStatus::Waiting.as_str(), now, now],
            )?;
            load_restore(tx, tx.last_insert_rowid())
        })
    }

    pub fn get_restore(&self, id: i64) -> Result<Option<Restore>, StoreError> {
        self.transaction(|tx| {
            Ok(tx
                .query_row(
                    &format!("SELECT {} FROM restores WHERE id = ?", RESTORE_COLUMNS),
                    params![id],
                    row_to_restore,
                )
                .optional()?)
        })
    }

    /// Restores in any of the given states, oldest first.
    pub fn restores_with_status(
        &self,
        statuses: &[RestoreStatus],
    ) -> Result<Vec<Restore>, StoreError> {
        let wanted: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let sql = format!(
            "SELECT {} FROM restores WHERE status IN ({}) ORDER BY id ASC",
            RESTORE_COLUMNS,
            status_list(&wanted)
        );
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_restore)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn update_restore_status(
        &self,
        id: i64,
        status: RestoreStatus,
        details: &str,
    ) -> Result<Restore, StoreError> {
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE restores SET status = ?, details = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), details, now_text(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "restore",
                    id,
                });
            }
            load_restore(tx, id)
        })
    }

    /// Store the file listing of a ready restore and its aggregate size in
    /// one transaction. Files already known by local path are left alone, so
    /// a repeated listing after a crash inserts nothing twice.
    pub fn record_restore_listing(
        &self,
        restore_id: i64,
        files: &[NewDataFile],
        details: &str,
    ) -> Result<Vec<DataFile>, StoreError> {
        self.transaction(|tx| {
            let now = now_text();
            let total: u64 = files.iter().filter_map(|f| f.size).sum();
            for file in files {
                tx.execute(
                    "INSERT OR IGNORE INTO files \
                     (restore_id, remote_name, local_path, size, status, details, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, 'Listed by archive', ?, ?)",
                    params![
                        restore_id,
                        file.remote_name,
                        file.local_path.to_string_lossy(),
                        file.size.map(|s| s as i64),
                        FileStatus::New.as_str(),
                        now,
                        now
                    ],
                )?;
            }
            let changed = tx.execute(
                "UPDATE restores SET size = ?, listed_at = ?, details = ?, updated_at = ? WHERE id = ?",
                params![total as i64, now, details, now, restore_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "restore",
                    id: restore_id,
                });
            }
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM files WHERE restore_id = ? ORDER BY id ASC",
                FILE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![restore_id], row_to_file)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Register a file that did not come through a restore listing.
    pub fn insert_file(
        &self,
        file: &NewDataFile,
        status: FileStatus,
    ) -> Result<DataFile, StoreError> {
        self.transaction(|tx| {
            let now = now_text();
            tx.execute(
                "INSERT INTO files (restore_id, remote_name, local_path, size, status, details, created_at, updated_at) \
                 VALUES (NULL, ?, ?, ?, ?, 'Registered', ?, ?)",
                params![
                    file.remote_name,
                    file.local_path.to_string_lossy(),
                    file.size.map(|s| s as i64),
                    status.as_str(),
                    now,
                    now
                ],
            )?;
            load_file(tx, tx.last_insert_rowid())
        })
    }

    pub fn get_file(&self, id: i64) -> Result<Option<DataFile>, StoreError> {
        self.transaction(|tx| {
            Ok(tx
                .query_row(
                    &format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS),
                    params![id],
                    row_to_file,
                )
                .optional()?)
        })
    }

    pub fn files_for_restore(&self, restore_id: i64) -> Result<Vec<DataFile>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM files WHERE restore_id = ? ORDER BY id ASC",
                FILE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![restore_id], row_to_file)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn files_with_status(&self, status: FileStatus) -> Result<Vec<DataFile>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM files WHERE status = ? ORDER BY id ASC",
                FILE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![status.as_str()], row_to_file)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Downloaded files not yet covered by any job.
    pub fn ungrouped_downloaded_files(&self) -> Result<Vec<DataFile>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM files WHERE status = ? \
                 AND id NOT IN (SELECT file_id FROM job_files) ORDER BY remote_name ASC",
                FILE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![FileStatus::Downloaded.as_str()], row_to_file)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Replace a file's details without changing its status.
    pub fn annotate_file(&self, id: i64, details: &str) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE files SET details = ?, updated_at = ? WHERE id = ?",
                params![details, now_text(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "file", id });
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Download attempts
    // ------------------------------------------------------------------

    /// Claim a file for download: open a new attempt and move the file to
    /// `downloading`. Fails with a conflict if the file is already being
    /// downloaded or has been downloaded.
    pub fn start_download_attempt(&self, file_id: i64) -> Result<DownloadAttempt, StoreError> {
        self.transaction(|tx| {
            let file = load_file(tx, file_id)?;
            if matches!(file.status, FileStatus::Downloading | FileStatus::Downloaded) {
                return Err(StoreError::Conflict(format!(
                    "file {} is already {}",
                    file_id, file.status
                )));
            }
            let now = now_text();
            tx.execute(
                "INSERT INTO download_attempts (file_id, status, details, created_at, updated_at) \
                 VALUES (?, ?, 'Download starting', ?, ?)",
                params![file_id, AttemptStatus::Downloading.as_str(), now, now],
            )?;
            let attempt_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE files SET status = ?, details = ?, updated_at = ? WHERE id = ?",
                params![
                    FileStatus::Downloading.as_str(),
                    format!("Download attempt {} started", attempt_id),
                    now,
                    file_id
                ],
            )?;
            Ok(tx.query_row(
                &format!("SELECT {} FROM download_attempts WHERE id = ?", ATTEMPT_COLUMNS),
                params![attempt_id],
                row_to_attempt,
            )?)
        })
    }

    /// Record progress text on an open attempt.
    pub fn update_attempt_progress(&self, attempt_id: i64, details: &str) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "UPDATE download_attempts SET details = ?, updated_at = ? WHERE id = ?",
                params![details, now_text(), attempt_id],
            )?;
            Ok(())
        })
    }

    /// Close an attempt and move its file to the matching terminal status.
    pub fn finish_download_attempt(
        &self,
        attempt_id: i64,
        succeeded: bool,
        details: &str,
    ) -> Result<DataFile, StoreError> {
        let (attempt_status, file_status) = if succeeded {
            (AttemptStatus::Downloaded, FileStatus::Downloaded)
        } else {
            (AttemptStatus::Failed, FileStatus::Failed)
        };
        self.transaction(|tx| {
            let file_id: i64 = tx
                .query_row(
                    "SELECT file_id FROM download_attempts WHERE id = ?",
                    params![attempt_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NotFound {
                    entity: "download attempt",
                    id: attempt_id,
                })?;
            let now = now_text();
            tx.execute(
                "UPDATE download_attempts SET status = ?, details = ?, updated_at = ? WHERE id = ?",
                params![attempt_status.as_str(), details, now, attempt_id],
            )?;
            tx.execute(
                "UPDATE files SET status = ?, details = ?, updated_at = ? WHERE id = ?",
                params![file_status.as_str(), details, now, file_id],
            )?;
            load_file(tx, file_id)
        })
    }

    /// Attempts still marked downloading for a file.
    pub fn open_download_attempts(&self, file_id: i64) -> Result<Vec<DownloadAttempt>, StoreError> {
        self.download_attempts_where(file_id, Some(AttemptStatus::Downloading))
    }

    /// All attempts for a file, oldest first.
    pub fn download_attempts(&self, file_id: i64) -> Result<Vec<DownloadAttempt>, StoreError> {
        self.download_attempts_where(file_id, None)
    }

    fn download_attempts_where(
        &self,
        file_id: i64,
        status: Option<AttemptStatus>,
    ) -> Result<Vec<DownloadAttempt>, StoreError> {
        self.transaction(|tx| {
            let attempts = match status {
                Some(status) => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM download_attempts WHERE file_id = ? AND status = ? ORDER BY id ASC",
                        ATTEMPT_COLUMNS
                    ))?;
                    let rows = stmt.query_map(params![file_id, status.as_str()], row_to_attempt)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM download_attempts WHERE file_id = ? ORDER BY id ASC",
                        ATTEMPT_COLUMNS
                    ))?;
                    let rows = stmt.query_map(params![file_id], row_to_attempt)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(attempts)
        })
    }

    pub fn count_download_attempts(&self, file_id: i64) -> Result<u32, StoreError> {
        self.transaction(|tx| {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM download_attempts WHERE file_id = ?",
                params![file_id],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file(name: &str, size: u64) -> NewDataFile {
        NewDataFile {
            remote_name: name.to_string(),
            local_path: PathBuf::from("/data/raw").join(name),
            size: Some(size),
        }
    }

    #[test]
    fn test_restore_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let restore = store.insert_restore("guid-1").unwrap();
        assert_eq!(restore.status, RestoreStatus::Waiting);
        assert!(restore.listed_at.is_none());

        let ready = store
            .update_restore_status(restore.id, RestoreStatus::Ready, "Staged")
            .unwrap();
        assert_eq!(ready.status, RestoreStatus::Ready);
        assert_eq!(ready.details, "Staged");

        let active = store
            .restores_with_status(&[RestoreStatus::Waiting, RestoreStatus::Ready])
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_update_missing_restore() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.update_restore_status(42, RestoreStatus::Ready, "x");
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_listing_sets_size_and_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let restore = store.insert_restore("guid-2").unwrap();
        let files = vec![new_file("a.fits", 100), new_file("b.fits", 250)];

        let listed = store
            .record_restore_listing(restore.id, &files, "2 files")
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|f| f.status == FileStatus::New));

        let again = store
            .record_restore_listing(restore.id, &files, "2 files")
            .unwrap();
        assert_eq!(again.len(), 2);

        let restore = store.get_restore(restore.id).unwrap().unwrap();
        assert_eq!(restore.size, 350);
        assert!(restore.listed_at.is_some());
    }

    #[test]
    fn test_download_attempt_success() {
        let store = SqliteStore::in_memory().unwrap();
        let file = store
            .insert_file(&new_file("c.fits", 10), FileStatus::New)
            .unwrap();

        let attempt = store.start_download_attempt(file.id).unwrap();
        assert_eq!(attempt.status, AttemptStatus::Downloading);
        assert_eq!(
            store.get_file(file.id).unwrap().unwrap().status,
            FileStatus::Downloading
        );

        store.update_attempt_progress(attempt.id, "50%").unwrap();
        let done = store
            .finish_download_attempt(attempt.id, true, "10 bytes")
            .unwrap();
        assert_eq!(done.status, FileStatus::Downloaded);
        assert_eq!(
            store.download_attempts(file.id).unwrap()[0].status,
            AttemptStatus::Downloaded
        );
    }

    #[test]
    fn test_cannot_claim_file_twice() {
        let store = SqliteStore::in_memory().unwrap();
        let file = store
            .insert_file(&new_file("d.fits", 10), FileStatus::New)
            .unwrap();
        store.start_download_attempt(file.id).unwrap();
        let second = store.start_download_attempt(file.id);
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_failed_file_can_be_retried() {
        let store = SqliteStore::in_memory().unwrap();
        let file = store
            .insert_file(&new_file("e.fits", 10), FileStatus::New)
            .unwrap();
        let first = store.start_download_attempt(file.id).unwrap();
        let failed = store
            .finish_download_attempt(first.id, false, "size mismatch")
            .unwrap();
        assert_eq!(failed.status, FileStatus::Failed);

        store.start_download_attempt(file.id).unwrap();
        assert_eq!(store.count_download_attempts(file.id).unwrap(), 2);
        assert_eq!(store.open_download_attempts(file.id).unwrap().len(), 1);
    }

    #[test]
    fn test_ungrouped_downloaded_files() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store
            .insert_file(&new_file("a.fits", 1), FileStatus::Downloaded)
            .unwrap();
        store
            .insert_file(&new_file("b.fits", 1), FileStatus::New)
            .unwrap();
        let c = store
            .insert_file(&new_file("c.fits", 1), FileStatus::Downloaded)
            .unwrap();

        assert_eq!(store.ungrouped_downloaded_files().unwrap().len(), 2);
        store.create_job_with_files(&[a.id], "job").unwrap();
        let left = store.ungrouped_downloaded_files().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, c.id);
    }
}
