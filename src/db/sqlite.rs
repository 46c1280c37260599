//! SQLite access layer. One `SqliteDb` wraps one connection; the store keeps
//! a writer and a reader instance over the same file.

use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

use super::schema::SCHEMA;
use super::{Photo, Pin};
use crate::error::Result;

pub struct SqliteDb {
    pub(crate) conn: Connection,
}

fn pin_from_row(row: &Row) -> rusqlite::Result<Pin> {
    Ok(Pin {
        id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn photo_from_row(row: &Row) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        pin_id: row.get(1)?,
        title: row.get(2)?,
        source_url: row.get(3)?,
        image: row.get(4)?,
    })
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL lets the reader connection see the last committed state while
        // the writer holds an open transaction.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn begin(&self) -> Result<()> {
        if !self.in_transaction() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    // ========================================================================
    // Pins
    // ========================================================================

    pub fn insert_pin(&self, latitude: &str, longitude: &str, created_at: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pins (latitude, longitude, created_at) VALUES (?, ?, ?)",
            rusqlite::params![latitude, longitude, created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_pins(&self) -> Result<Vec<Pin>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, latitude, longitude, created_at FROM pins ORDER BY id ASC",
        )?;
        let pins = stmt
            .query_map([], pin_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pins)
    }

    pub fn find_pin(&self, latitude: &str, longitude: &str) -> Result<Option<Pin>> {
        let pin = self
            .conn
            .query_row(
                r#"
                SELECT id, latitude, longitude, created_at
                FROM pins
                WHERE latitude = ? AND longitude = ?
                ORDER BY id ASC
                LIMIT 1
                "#,
                rusqlite::params![latitude, longitude],
                pin_from_row,
            )
            .optional()?;
        Ok(pin)
    }

    pub fn get_pin(&self, pin_id: i64) -> Result<Option<Pin>> {
        let pin = self
            .conn
            .query_row(
                "SELECT id, latitude, longitude, created_at FROM pins WHERE id = ?",
                [pin_id],
                pin_from_row,
            )
            .optional()?;
        Ok(pin)
    }

    /// Delete a pin. Its photos go with it through the foreign key cascade.
    pub fn delete_pin(&self, pin_id: i64) -> Result<usize> {
        let deleted = self.conn.execute("DELETE FROM pins WHERE id = ?", [pin_id])?;
        Ok(deleted)
    }

    // ========================================================================
    // Photos
    // ========================================================================

    pub fn insert_photo(&self, pin_id: i64, title: &str, url: &str, created_at: &str) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO photos (pin_id, title, image_url, image, created_at)
            VALUES (?, ?, ?, NULL, ?)
            "#,
            rusqlite::params![pin_id, title, url, created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_photos_for_pin(&self, pin_id: i64) -> Result<Vec<Photo>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, pin_id, title, image_url, image
            FROM photos
            WHERE pin_id = ?
            ORDER BY id ASC
            "#,
        )?;
        let photos = stmt
            .query_map([pin_id], photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    pub fn get_photo_ids_for_pin(&self, pin_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM photos WHERE pin_id = ? ORDER BY id ASC")?;
        let ids = stmt
            .query_map([pin_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count_photos_for_pin(&self, pin_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE pin_id = ?",
            [pin_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .query_row(
                "SELECT id, pin_id, title, image_url, image FROM photos WHERE id = ?",
                [photo_id],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn delete_photo(&self, photo_id: i64) -> Result<usize> {
        let deleted = self.conn.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        Ok(deleted)
    }

    pub fn update_photo_image(&self, photo_id: i64, image: &[u8], downloaded_at: &str) -> Result<usize> {
        let updated = self.conn.execute(
            r#"
            UPDATE photos
            SET image = ?, downloaded_at = ?
            WHERE id = ?
            "#,
            rusqlite::params![image, downloaded_at, photo_id],
        )?;
        Ok(updated)
    }
}
