use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use platewatch_common::config::SqliteRecorderConfig;
use platewatch_common::frame::Frame;
use rusqlite::{params, Connection, Result as SqlResult};
use serde::Serialize;
use tracing::{debug, info};

use super::RecorderError;
use crate::detect::Detection;

/// Plate reads stored in a local SQLite database.
///
/// Schema: a single `plates` table, one row per candidate, indexed by
/// (source, epoch_time). WAL mode lets other processes read the file while
/// the daemon writes to it.
pub struct SqliteRecorder {
    name: String,
    path: PathBuf,
    store_images: bool,
    conn: Mutex<Option<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateRow {
    pub id: i64,
    pub epoch_time: i64,
    pub source: String,
    pub plate: String,
    pub confidence: f64,
    pub roi_left: u32,
    pub roi_top: u32,
    pub roi_width: u32,
    pub roi_height: u32,
    pub has_image: bool,
}

impl SqliteRecorder {
    pub fn new(config: &SqliteRecorderConfig, data_path: &Path) -> Self {
        let path = if config.path.is_absolute() {
            config.path.clone()
        } else {
            data_path.join(&config.path)
        };
        Self {
            name: config.name.clone(),
            path,
            store_images: config.store_images,
            conn: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or create) the database. Creates the parent directory if needed.
    pub fn open(&self) -> Result<(), RecorderError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plates (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                epoch_time  INTEGER NOT NULL,
                source      TEXT    NOT NULL,
                plate       TEXT    NOT NULL,
                confidence  REAL    NOT NULL,
                roi_left    INTEGER NOT NULL,
                roi_top     INTEGER NOT NULL,
                roi_width   INTEGER NOT NULL,
                roi_height  INTEGER NOT NULL,
                coordinates TEXT    NOT NULL DEFAULT '[]',
                jpeg        BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_plates_source_time
                ON plates(source, epoch_time);",
        )?;

        info!(recorder = %self.name, path = %self.path.display(), "SQLite database opened");
        *self.lock() = Some(conn);
        Ok(())
    }

    pub fn close(&self) {
        if self.lock().take().is_some() {
            debug!(recorder = %self.name, "SQLite database closed");
        }
    }

    /// Insert one row per candidate in a single transaction.
    pub fn insert(
        &self,
        detection: &Detection,
        source: &str,
        filtered: &Frame,
    ) -> Result<usize, RecorderError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(RecorderError::Closed)?;
        let tx = conn.transaction()?;
        for candidate in &detection.candidates {
            let coordinates = serde_json::to_string(&candidate.coordinates)
                .map_err(|e| RecorderError::Encode(e.to_string()))?;
            let jpeg: Option<&[u8]> = self.store_images.then_some(&filtered.jpeg()[..]);
            tx.execute(
                "INSERT INTO plates
                 (epoch_time, source, plate, confidence, roi_left, roi_top, roi_width, roi_height, coordinates, jpeg)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    detection.epoch_time,
                    source,
                    candidate.plate,
                    candidate.confidence,
                    candidate.roi.left,
                    candidate.roi.top,
                    candidate.roi.width,
                    candidate.roi.height,
                    coordinates,
                    jpeg,
                ],
            )?;
        }
        tx.commit()?;
        debug!(
            recorder = %self.name,
            source,
            rows = detection.candidates.len(),
            "inserted plate rows"
        );
        Ok(detection.candidates.len())
    }

    /// Most recent reads first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PlateRow>, RecorderError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(RecorderError::Closed)?;
        let mut stmt = conn.prepare(
            "SELECT id, epoch_time, source, plate, confidence,
                    roi_left, roi_top, roi_width, roi_height, jpeg IS NOT NULL
             FROM plates ORDER BY epoch_time DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PlateRow {
                id: row.get(0)?,
                epoch_time: row.get(1)?,
                source: row.get(2)?,
                plate: row.get(3)?,
                confidence: row.get(4)?,
                roi_left: row.get(5)?,
                roi_top: row.get(6)?,
                roi_width: row.get(7)?,
                roi_height: row.get(8)?,
                has_image: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
