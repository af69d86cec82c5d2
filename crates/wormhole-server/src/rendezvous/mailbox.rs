//! A live mailbox: the in-memory fan-out layer over one durable channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use wormhole_store::{MessageRow, Store};

/// Receiver end of a mailbox subscription.
///
/// `on_message` runs synchronously under the mailbox lock and must not
/// block; implementations push into a bounded outbound queue and handle
/// overflow themselves. `on_stop` fires when the mailbox is torn down
/// underneath the subscriber.
pub trait MailboxListener: Send + Sync {
    fn on_message(&self, message: &MessageRow);
    fn on_stop(&self);
}

struct ListenerTable {
    next_handle: u64,
    entries: HashMap<u64, Box<dyn MailboxListener>>,
}

pub struct Mailbox {
    id: String,
    app_id: String,
    store: Arc<Store>,
    listeners: Mutex<ListenerTable>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .finish()
    }
}

impl Mailbox {
    pub fn new(id: &str, app_id: &str, store: Arc<Store>) -> Self {
        Self {
            id: id.to_string(),
            app_id: app_id.to_string(),
            store,
            listeners: Mutex::new(ListenerTable {
                next_handle: 1,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn table(&self) -> MutexGuard<'_, ListenerTable> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the durable `updated` timestamp to now.
    pub fn touch(&self) -> Result<(), wormhole_store::StoreError> {
        self.store.touch_mailbox(&self.id, Utc::now().timestamp())
    }

    /// Register an open side. Reopening the same side is a no-op; the
    /// two-side cap is enforced a layer up, keeping this policy-free.
    pub fn open(&self, side: &str) -> Result<(), wormhole_store::StoreError> {
        if self.store.get_mailbox_side(&self.id, side)?.is_none() {
            self.store
                .open_mailbox_side(&self.id, side, Utc::now().timestamp())?;
        }
        self.touch()
    }

    /// Close one side. When the last open side goes, the mailbox and all its
    /// durable state are deleted and every listener is stopped; the return
    /// value reports whether that happened.
    pub fn close(&self, side: &str, mood: &str) -> Result<bool, wormhole_store::StoreError> {
        match self.store.get_mailbox(&self.app_id, &self.id) {
            Ok(_) => {}
            Err(wormhole_store::StoreError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        }

        if self.store.get_mailbox_side(&self.id, side)?.is_none() {
            return Ok(false);
        }

        self.store.close_mailbox_side(&self.id, side, mood)?;

        if self.store.any_mailbox_side_open(&self.id)? {
            return Ok(false);
        }

        self.delete()?;
        Ok(true)
    }

    /// Drop the mailbox row, its sides, and its messages, then stop all
    /// listeners.
    pub fn delete(&self) -> Result<(), wormhole_store::StoreError> {
        self.store.delete_mailbox(&self.id)?;
        self.remove_all_listeners();
        Ok(())
    }

    /// The full durable log, oldest first.
    pub fn get_messages(&self) -> Result<Vec<MessageRow>, wormhole_store::StoreError> {
        self.store.get_messages(&self.app_id, &self.id)
    }

    /// Append a message, then fan it out to every listener.
    ///
    /// Insert and broadcast happen under the mailbox lock so the delivered
    /// sequence is exactly the durable insert sequence even against a
    /// concurrent `subscribe` replay. A failed insert broadcasts nothing.
    pub fn add_message(&self, message: MessageRow) -> Result<(), wormhole_store::StoreError> {
        {
            let table = self.table();
            self.store.add_message(&message)?;
            for listener in table.entries.values() {
                listener.on_message(&message);
            }
        }
        self.touch()
    }

    /// Register a listener and replay the existing log through it, atomically
    /// with respect to `add_message`. Returns the removal handle.
    pub fn subscribe(
        &self,
        listener: Box<dyn MailboxListener>,
    ) -> Result<u64, wormhole_store::StoreError> {
        let mut table = self.table();

        let history = self.store.get_messages(&self.app_id, &self.id)?;
        for message in &history {
            listener.on_message(message);
        }

        let handle = table.next_handle;
        table.next_handle += 1;
        table.entries.insert(handle, listener);
        Ok(handle)
    }

    pub fn remove_listener(&self, handle: u64) {
        self.table().entries.remove(&handle);
    }

    pub fn remove_all_listeners(&self) {
        let mut table = self.table();
        for listener in table.entries.values() {
            listener.on_stop();
        }
        table.entries.clear();
    }

    pub fn has_listeners(&self) -> bool {
        !self.table().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: StdMutex<Vec<String>>,
        stopped: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            })
        }
    }

    impl MailboxListener for Arc<Recorder> {
        fn on_message(&self, message: &MessageRow) {
            self.seen.lock().unwrap().push(message.id.clone());
        }

        fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn mailbox() -> (tempfile::TempDir, Arc<Store>, Mailbox) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_at(&dir.path().join("relay.db")).unwrap());
        store.add_mailbox("app", "mb1", false, 1).unwrap();
        let mbox = Mailbox::new("mb1", "app", store.clone());
        (dir, store, mbox)
    }

    fn msg(id: &str, rx: i64) -> MessageRow {
        MessageRow {
            id: id.into(),
            app_id: "app".into(),
            mailbox_id: "mb1".into(),
            side: "L".into(),
            phase: "pake".into(),
            body: "deadbeef".into(),
            server_rx: rx,
        }
    }

    #[test]
    fn broadcast_reaches_listeners_in_insert_order() {
        let (_dir, _store, mbox) = mailbox();
        let rec = Recorder::new();
        mbox.subscribe(Box::new(rec.clone())).unwrap();

        mbox.add_message(msg("a", 1)).unwrap();
        mbox.add_message(msg("b", 1)).unwrap();
        mbox.add_message(msg("c", 2)).unwrap();

        assert_eq!(*rec.seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn subscribe_replays_history_first() {
        let (_dir, _store, mbox) = mailbox();
        mbox.add_message(msg("a", 1)).unwrap();
        mbox.add_message(msg("b", 2)).unwrap();

        let late = Recorder::new();
        mbox.subscribe(Box::new(late.clone())).unwrap();
        mbox.add_message(msg("c", 3)).unwrap();

        assert_eq!(*late.seen.lock().unwrap(), vec!["a", "b", "c"]);

        let log: Vec<String> = mbox
            .get_messages()
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(log, vec!["a", "b", "c"]);
    }

    #[test]
    fn removed_listener_goes_quiet() {
        let (_dir, _store, mbox) = mailbox();
        let rec = Recorder::new();
        let handle = mbox.subscribe(Box::new(rec.clone())).unwrap();

        mbox.remove_listener(handle);
        mbox.add_message(msg("a", 1)).unwrap();

        assert!(rec.seen.lock().unwrap().is_empty());
        assert!(!mbox.has_listeners());
    }

    #[test]
    fn last_close_deletes_and_stops() {
        let (_dir, store, mbox) = mailbox();
        mbox.open("L").unwrap();
        mbox.open("R").unwrap();
        mbox.add_message(msg("a", 1)).unwrap();

        let rec = Recorder::new();
        mbox.subscribe(Box::new(rec.clone())).unwrap();

        assert!(!mbox.close("L", "happy").unwrap());
        assert!(!rec.stopped.load(Ordering::SeqCst));

        assert!(mbox.close("R", "happy").unwrap());
        assert!(rec.stopped.load(Ordering::SeqCst));

        assert!(matches!(
            store.get_mailbox("app", "mb1"),
            Err(wormhole_store::StoreError::NotFound)
        ));
        assert!(store.get_messages("app", "mb1").unwrap().is_empty());
        assert!(store.get_mailbox_side("mb1", "L").unwrap().is_none());
    }

    #[test]
    fn close_of_missing_mailbox_is_fine() {
        let (_dir, store, mbox) = mailbox();
        store.delete_mailbox("mb1").unwrap();
        assert!(!mbox.close("L", "lonely").unwrap());
    }

    #[test]
    fn reopen_same_side_is_noop() {
        let (_dir, store, mbox) = mailbox();
        mbox.open("L").unwrap();
        mbox.open("L").unwrap();
        assert_eq!(store.count_mailbox_sides("mb1").unwrap(), 1);
    }
}
