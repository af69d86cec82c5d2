use rusqlite::params;

use crate::database::Store;
use crate::error::StoreError;
use crate::models::{NameplateRow, NameplateSideRow};
use crate::Result;

impl Store {
    pub fn get_nameplate(&self, app_id: &str, name: &str) -> Result<Option<NameplateRow>> {
        let result = self.conn().query_row(
            "SELECT id, app_id, name, mailbox_id, request_id FROM nameplates
             WHERE app_id = ?1 AND name = ?2",
            params![app_id, name],
            row_to_nameplate,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Insert a nameplate and return its auto-assigned key.
    pub fn add_nameplate(&self, app_id: &str, name: &str, mailbox_id: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO nameplates (app_id, name, mailbox_id) VALUES (?1, ?2, ?3)",
            params![app_id, name, mailbox_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_nameplate(&self, nameplate_id: i64) -> Result<()> {
        self.conn().execute(
            "DELETE FROM nameplates WHERE id = ?1",
            params![nameplate_id],
        )?;
        Ok(())
    }

    /// Every nameplate name in use within an app.
    pub fn nameplate_names(&self, app_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT name FROM nameplates WHERE app_id = ?1")?;
        let rows = stmt.query_map(params![app_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Nameplate keys pointing at a mailbox; used when a reaped mailbox
    /// takes its aliases with it.
    pub fn nameplates_for_mailbox(&self, app_id: &str, mailbox_id: &str) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id FROM nameplates WHERE app_id = ?1 AND mailbox_id = ?2")?;
        let rows = stmt.query_map(params![app_id, mailbox_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_nameplate_side(
        &self,
        nameplate_id: i64,
        side: &str,
    ) -> Result<Option<NameplateSideRow>> {
        let result = self.conn().query_row(
            "SELECT nameplate_id, claimed, side, added FROM nameplate_sides
             WHERE nameplate_id = ?1 AND side = ?2",
            params![nameplate_id, side],
            row_to_nameplate_side,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn add_nameplate_side(&self, nameplate_id: i64, side: &str, now: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO nameplate_sides (nameplate_id, claimed, side, added)
             VALUES (?1, 1, ?2, ?3)",
            params![nameplate_id, side, now],
        )?;
        Ok(())
    }

    pub fn release_nameplate_side(&self, nameplate_id: i64, side: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE nameplate_sides SET claimed = 0 WHERE nameplate_id = ?1 AND side = ?2",
            params![nameplate_id, side],
        )?;
        Ok(())
    }

    pub fn delete_nameplate_sides(&self, nameplate_id: i64) -> Result<()> {
        self.conn().execute(
            "DELETE FROM nameplate_sides WHERE nameplate_id = ?1",
            params![nameplate_id],
        )?;
        Ok(())
    }

    pub fn count_nameplate_sides(&self, nameplate_id: i64) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM nameplate_sides WHERE nameplate_id = ?1",
            params![nameplate_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn any_nameplate_side_claimed(&self, nameplate_id: i64) -> Result<bool> {
        let claimed: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM nameplate_sides WHERE nameplate_id = ?1 AND claimed = 1",
            params![nameplate_id],
            |row| row.get(0),
        )?;
        Ok(claimed > 0)
    }
}

fn row_to_nameplate(row: &rusqlite::Row<'_>) -> rusqlite::Result<NameplateRow> {
    Ok(NameplateRow {
        id: row.get(0)?,
        app_id: row.get(1)?,
        name: row.get(2)?,
        mailbox_id: row.get(3)?,
        request_id: row.get(4)?,
    })
}

fn row_to_nameplate_side(row: &rusqlite::Row<'_>) -> rusqlite::Result<NameplateSideRow> {
    Ok(NameplateSideRow {
        nameplate_id: row.get(0)?,
        claimed: row.get(1)?,
        side: row.get(2)?,
        added: row.get(3)?,
    })
}
