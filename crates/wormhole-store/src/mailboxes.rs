use rusqlite::params;

use crate::database::Store;
use crate::error::StoreError;
use crate::models::{MailboxRow, MailboxSideRow};
use crate::Result;

impl Store {
    /// Insert a mailbox row if absent; idempotent.
    pub fn add_mailbox(
        &self,
        app_id: &str,
        mailbox_id: &str,
        for_nameplate: bool,
        now: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO mailboxes (id, app_id, updated, for_nameplate)
             VALUES (?1, ?2, ?3, ?4)",
            params![mailbox_id, app_id, now, for_nameplate],
        )?;
        Ok(())
    }

    pub fn get_mailbox(&self, app_id: &str, mailbox_id: &str) -> Result<MailboxRow> {
        self.conn()
            .query_row(
                "SELECT id, app_id, updated, for_nameplate FROM mailboxes
                 WHERE app_id = ?1 AND id = ?2",
                params![app_id, mailbox_id],
                row_to_mailbox,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn touch_mailbox(&self, mailbox_id: &str, now: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE mailboxes SET updated = ?2 WHERE id = ?1",
            params![mailbox_id, now],
        )?;
        Ok(())
    }

    /// Remove a mailbox together with its messages and sides.
    pub fn delete_mailbox(&self, mailbox_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM messages WHERE mailbox_id = ?1",
            params![mailbox_id],
        )?;
        conn.execute(
            "DELETE FROM mailbox_sides WHERE mailbox_id = ?1",
            params![mailbox_id],
        )?;
        conn.execute("DELETE FROM mailboxes WHERE id = ?1", params![mailbox_id])?;
        Ok(())
    }

    pub fn get_mailbox_side(
        &self,
        mailbox_id: &str,
        side: &str,
    ) -> Result<Option<MailboxSideRow>> {
        let result = self.conn().query_row(
            "SELECT mailbox_id, opened, side, added, mood FROM mailbox_sides
             WHERE mailbox_id = ?1 AND side = ?2",
            params![mailbox_id, side],
            row_to_mailbox_side,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn open_mailbox_side(&self, mailbox_id: &str, side: &str, now: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO mailbox_sides (mailbox_id, opened, side, added)
             VALUES (?1, 1, ?2, ?3)",
            params![mailbox_id, side, now],
        )?;
        Ok(())
    }

    pub fn close_mailbox_side(&self, mailbox_id: &str, side: &str, mood: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE mailbox_sides SET opened = 0, mood = ?3
             WHERE mailbox_id = ?1 AND side = ?2",
            params![mailbox_id, side, mood],
        )?;
        Ok(())
    }

    pub fn count_mailbox_sides(&self, mailbox_id: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM mailbox_sides WHERE mailbox_id = ?1",
            params![mailbox_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn any_mailbox_side_open(&self, mailbox_id: &str) -> Result<bool> {
        let open: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM mailbox_sides WHERE mailbox_id = ?1 AND opened = 1",
            params![mailbox_id],
            |row| row.get(0),
        )?;
        Ok(open > 0)
    }

    /// Mailboxes of this app whose `updated` is at or before the cutoff.
    pub fn stale_mailboxes(&self, app_id: &str, since: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM mailboxes WHERE app_id = ?1 AND updated <= ?2")?;
        let rows = stmt.query_map(params![app_id, since], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// True while any durable mailboxes or nameplates remain for the app.
    pub fn app_in_use(&self, app_id: &str) -> Result<bool> {
        let in_use: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM mailboxes WHERE app_id = ?1)
                 OR EXISTS(SELECT 1 FROM nameplates WHERE app_id = ?1)",
            params![app_id],
            |row| row.get(0),
        )?;
        Ok(in_use)
    }

    /// App ids present anywhere in the relay tables.
    pub fn all_app_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT app_id FROM nameplates
             UNION SELECT app_id FROM mailboxes
             UNION SELECT app_id FROM messages",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_mailbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxRow> {
    Ok(MailboxRow {
        id: row.get(0)?,
        app_id: row.get(1)?,
        updated: row.get(2)?,
        for_nameplate: row.get(3)?,
    })
}

fn row_to_mailbox_side(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxSideRow> {
    Ok(MailboxSideRow {
        mailbox_id: row.get(0)?,
        opened: row.get(1)?,
        side: row.get(2)?,
        added: row.get(3)?,
        mood: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(&dir.path().join("relay.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn add_mailbox_is_idempotent() {
        let (_dir, store) = open_store();

        store.add_mailbox("app", "mb1", true, 100).unwrap();
        store.add_mailbox("app", "mb1", false, 200).unwrap();

        let row = store.get_mailbox("app", "mb1").unwrap();
        assert_eq!(row.updated, 100, "second insert must not overwrite");
        assert!(row.for_nameplate);
    }

    #[test]
    fn sides_open_and_close() {
        let (_dir, store) = open_store();
        store.add_mailbox("app", "mb1", false, 1).unwrap();

        store.open_mailbox_side("mb1", "L", 2).unwrap();
        store.open_mailbox_side("mb1", "R", 3).unwrap();
        assert_eq!(store.count_mailbox_sides("mb1").unwrap(), 2);
        assert!(store.any_mailbox_side_open("mb1").unwrap());

        store.close_mailbox_side("mb1", "L", "happy").unwrap();
        assert!(store.any_mailbox_side_open("mb1").unwrap());

        store.close_mailbox_side("mb1", "R", "happy").unwrap();
        assert!(!store.any_mailbox_side_open("mb1").unwrap());

        let side = store.get_mailbox_side("mb1", "L").unwrap().unwrap();
        assert!(!side.opened);
        assert_eq!(side.mood.as_deref(), Some("happy"));
    }

    #[test]
    fn delete_mailbox_removes_everything() {
        let (_dir, store) = open_store();
        store.add_mailbox("app", "mb1", false, 1).unwrap();
        store.open_mailbox_side("mb1", "L", 1).unwrap();
        store
            .add_message(&crate::MessageRow {
                id: "m1".into(),
                app_id: "app".into(),
                mailbox_id: "mb1".into(),
                side: "L".into(),
                phase: "pake".into(),
                body: "deadbeef".into(),
                server_rx: 5,
            })
            .unwrap();

        store.delete_mailbox("mb1").unwrap();

        assert!(matches!(
            store.get_mailbox("app", "mb1"),
            Err(StoreError::NotFound)
        ));
        assert!(store.get_mailbox_side("mb1", "L").unwrap().is_none());
        assert!(store.get_messages("app", "mb1").unwrap().is_empty());
    }

    #[test]
    fn stale_selection_respects_cutoff() {
        let (_dir, store) = open_store();
        store.add_mailbox("app", "old", false, 10).unwrap();
        store.add_mailbox("app", "fresh", false, 100).unwrap();

        let stale = store.stale_mailboxes("app", 50).unwrap();
        assert_eq!(stale, vec!["old".to_string()]);

        store.touch_mailbox("old", 200).unwrap();
        assert!(store.stale_mailboxes("app", 50).unwrap().is_empty());
    }

    #[test]
    fn app_usage_union() {
        let (_dir, store) = open_store();
        assert!(!store.app_in_use("app").unwrap());
        assert!(store.all_app_ids().unwrap().is_empty());

        store.add_mailbox("app", "mb1", false, 1).unwrap();
        assert!(store.app_in_use("app").unwrap());
        assert_eq!(store.all_app_ids().unwrap(), vec!["app".to_string()]);
    }
}
