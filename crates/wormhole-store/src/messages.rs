use rusqlite::params;

use crate::database::Store;
use crate::error::StoreError;
use crate::models::MessageRow;
use crate::Result;

impl Store {
    /// Append one phase message. The log is append-only; rows are never
    /// rewritten.
    pub fn add_message(&self, message: &MessageRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, app_id, mailbox_id, side, phase, body, server_rx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.app_id,
                message.mailbox_id,
                message.side,
                message.phase,
                message.body,
                message.server_rx,
            ],
        )?;
        Ok(())
    }

    /// The full log for one mailbox, oldest first; `server_rx` ties break on
    /// insertion order.
    pub fn get_messages(&self, app_id: &str, mailbox_id: &str) -> Result<Vec<MessageRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, app_id, mailbox_id, side, phase, body, server_rx FROM messages
             WHERE app_id = ?1 AND mailbox_id = ?2
             ORDER BY server_rx ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![app_id, mailbox_id], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        app_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        side: row.get(3)?,
        phase: row.get(4)?,
        body: row.get(5)?,
        server_rx: row.get(6)?,
    })
}
