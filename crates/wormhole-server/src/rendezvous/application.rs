//! Per-`app_id` namespace: nameplate policy and mailbox lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use data_encoding::BASE32_NOPAD;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use tracing::info;

use wormhole_store::Store;
use wormhole_proto::ClientError;

use crate::error::RelayError;
use crate::rendezvous::mailbox::Mailbox;

pub struct Application {
    id: String,
    store: Arc<Store>,
    /// Live (subscribed) mailboxes only; durable state lives in the store.
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
}

impl Application {
    pub fn new(id: &str, store: Arc<Store>) -> Self {
        Self {
            id: id.to_string(),
            store,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Arc<Mailbox>>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every nameplate name currently in use, for the `list` command.
    pub fn get_nameplate_ids(&self) -> Result<Vec<String>, RelayError> {
        Ok(self.store.nameplate_names(&self.id)?)
    }

    /// Pick a short decimal identifier that is not in use. Short widths come
    /// first because the nameplate is meant to be dictated aloud.
    pub fn find_nameplate(&self) -> Result<String, RelayError> {
        let claimed: HashSet<String> =
            self.store.nameplate_names(&self.id)?.into_iter().collect();

        let mut rng = rand::thread_rng();

        for width in 1u32..=3 {
            let low = 10i64.pow(width - 1);
            let high = 10i64.pow(width);
            let available: Vec<String> = (low..high)
                .map(|n| n.to_string())
                .filter(|name| !claimed.contains(name))
                .collect();

            if let Some(pick) = available.choose(&mut rng) {
                return Ok(pick.clone());
            }
        }

        // All three short widths exhausted; fall back to a wide range.
        for _ in 0..1000 {
            let name = rng.gen_range(1000..1_000_000i64).to_string();
            if !claimed.contains(&name) {
                return Ok(name);
            }
        }

        Err(RelayError::NoAvailableNameplates)
    }

    /// Claim a nameplate for one side, creating it (and its mailbox) on
    /// first claim. Returns the mailbox id the nameplate refers to.
    pub fn claim_nameplate(&self, name: &str, side: &str) -> Result<String, RelayError> {
        let nameplate = match self.store.get_nameplate(&self.id, name)? {
            Some(row) => row,
            None => {
                info!(nameplate = %name, app = %self.id, "creating nameplate");

                let mailbox_id = generate_mailbox_id();
                self.add_mailbox(&mailbox_id, true)?;
                let key = self.store.add_nameplate(&self.id, name, &mailbox_id)?;

                wormhole_store::NameplateRow {
                    id: key,
                    app_id: self.id.clone(),
                    name: name.to_string(),
                    mailbox_id,
                    request_id: String::new(),
                }
            }
        };

        match self.store.get_nameplate_side(nameplate.id, side)? {
            None => {
                self.store
                    .add_nameplate_side(nameplate.id, side, Utc::now().timestamp())?;
            }
            Some(existing) if existing.claimed => {
                return Err(ClientError::ReclaimNameplate.into());
            }
            Some(_) => {}
        }

        self.open_mailbox(&nameplate.mailbox_id, side)?;

        if self.store.count_nameplate_sides(nameplate.id)? > 2 {
            return Err(ClientError::NameplateCrowded.into());
        }

        Ok(nameplate.mailbox_id)
    }

    /// Generate a fresh nameplate and claim it. Returns the nameplate name.
    pub fn allocate_nameplate(&self, side: &str) -> Result<String, RelayError> {
        let name = self.find_nameplate()?;
        self.claim_nameplate(&name, side)?;
        Ok(name)
    }

    /// The mailbox a nameplate refers to. Used when a session revisits its
    /// own allocation, which must not count as a re-claim.
    pub fn mailbox_for_nameplate(&self, name: &str) -> Result<String, RelayError> {
        match self.store.get_nameplate(&self.id, name)? {
            Some(row) => Ok(row.mailbox_id),
            None => Err(wormhole_store::StoreError::NotFound.into()),
        }
    }

    /// Release one side's claim. Unknown nameplates and sides succeed
    /// (idempotent). When the last claim goes, the nameplate and its sides
    /// are deleted; the mailbox survives and is cleaned via its own
    /// side-closure path.
    pub fn release_nameplate(&self, name: &str, side: &str) -> Result<(), RelayError> {
        let Some(nameplate) = self.store.get_nameplate(&self.id, name)? else {
            return Ok(());
        };
        if self.store.get_nameplate_side(nameplate.id, side)?.is_none() {
            return Ok(());
        }

        self.store.release_nameplate_side(nameplate.id, side)?;

        if !self.store.any_nameplate_side_claimed(nameplate.id)? {
            self.store.delete_nameplate_sides(nameplate.id)?;
            self.store.delete_nameplate(nameplate.id)?;
        }

        Ok(())
    }

    /// Ensure the durable mailbox row exists; idempotent.
    pub fn add_mailbox(&self, mailbox_id: &str, for_nameplate: bool) -> Result<(), RelayError> {
        self.store
            .add_mailbox(&self.id, mailbox_id, for_nameplate, Utc::now().timestamp())?;
        Ok(())
    }

    /// Open a mailbox for one side and hand back the live handle. The
    /// two-open-sides cap is enforced here, not in [`Mailbox`].
    pub fn open_mailbox(&self, mailbox_id: &str, side: &str) -> Result<Arc<Mailbox>, RelayError> {
        self.add_mailbox(mailbox_id, false)?;

        let mailbox = {
            let mut live = self.live();
            live.entry(mailbox_id.to_string())
                .or_insert_with(|| Arc::new(Mailbox::new(mailbox_id, &self.id, self.store.clone())))
                .clone()
        };

        mailbox.open(side)?;

        if self.store.count_mailbox_sides(mailbox_id)? > 2 {
            return Err(ClientError::MailboxCrowded.into());
        }

        Ok(mailbox)
    }

    /// Close one side of a mailbox; drops the live handle if that was the
    /// last open side.
    pub fn close_mailbox(
        &self,
        mailbox: &Mailbox,
        side: &str,
        mood: &str,
    ) -> Result<(), RelayError> {
        let deleted = mailbox.close(side, mood)?;
        if deleted {
            self.free_mailbox(mailbox.id());
        }
        Ok(())
    }

    /// Drop the in-memory handle; durable state is untouched.
    pub fn free_mailbox(&self, mailbox_id: &str) {
        self.live().remove(mailbox_id);
    }

    /// One cleaning pass: active conversations are touched so they survive,
    /// then everything idle since the cutoff is reaped, nameplate aliases
    /// included.
    pub fn cleanup(&self, since: i64) -> Result<(), RelayError> {
        let live: Vec<Arc<Mailbox>> = self.live().values().cloned().collect();
        for mailbox in live {
            if mailbox.has_listeners() {
                mailbox.touch()?;
            }
        }

        for mailbox_id in self.store.stale_mailboxes(&self.id, since)? {
            info!(mailbox = %mailbox_id, app = %self.id, "cleaning idle mailbox");

            let nameplates = self.store.nameplates_for_mailbox(&self.id, &mailbox_id)?;

            let handle = self.live().remove(&mailbox_id);
            match handle {
                Some(mailbox) => mailbox.delete()?,
                None => self.store.delete_mailbox(&mailbox_id)?,
            }

            for nameplate_id in nameplates {
                self.store.delete_nameplate_sides(nameplate_id)?;
                self.store.delete_nameplate(nameplate_id)?;
            }
        }

        Ok(())
    }

    pub fn still_in_use(&self) -> Result<bool, RelayError> {
        Ok(self.store.app_in_use(&self.id)?)
    }
}

/// 8 bytes from the system CSPRNG, base32, lowercased, padding stripped;
/// always 13 ASCII characters.
pub fn generate_mailbox_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> (tempfile::TempDir, Arc<Store>, Application) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_at(&dir.path().join("relay.db")).unwrap());
        let app = Application::new("app", store.clone());
        (dir, store, app)
    }

    #[test]
    fn mailbox_ids_are_13_lowercase_base32_chars() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let id = generate_mailbox_id();
            assert_eq!(id.len(), 13);
            assert!(id
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '2'..='7')));
            assert!(seen.insert(id), "collision in 64 draws");
        }
    }

    #[test]
    fn find_nameplate_avoids_taken_names() {
        let (_dir, store, app) = app();
        for n in 1..10 {
            if n != 7 {
                store
                    .add_nameplate("app", &n.to_string(), "mb")
                    .unwrap();
            }
        }

        // Only "7" is free in the single-digit width.
        assert_eq!(app.find_nameplate().unwrap(), "7");
    }

    #[test]
    fn claim_creates_nameplate_and_mailbox() {
        let (_dir, store, app) = app();

        let mailbox_id = app.claim_nameplate("4", "L").unwrap();
        assert_eq!(mailbox_id.len(), 13);

        let row = store.get_mailbox("app", &mailbox_id).unwrap();
        assert!(row.for_nameplate);

        let nameplate = store.get_nameplate("app", "4").unwrap().unwrap();
        assert_eq!(nameplate.mailbox_id, mailbox_id);

        let side = store
            .get_nameplate_side(nameplate.id, "L")
            .unwrap()
            .unwrap();
        assert!(side.claimed);

        // The claiming side is open on the mailbox.
        let mb_side = store.get_mailbox_side(&mailbox_id, "L").unwrap().unwrap();
        assert!(mb_side.opened);
    }

    #[test]
    fn second_side_gets_the_same_mailbox() {
        let (_dir, _store, app) = app();
        let first = app.claim_nameplate("4", "L").unwrap();
        let second = app.claim_nameplate("4", "R").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reclaim_from_same_side_fails() {
        let (_dir, _store, app) = app();
        app.claim_nameplate("4", "L").unwrap();

        match app.claim_nameplate("4", "L") {
            Err(RelayError::Client(ClientError::ReclaimNameplate)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn third_side_is_crowded() {
        let (_dir, _store, app) = app();
        app.claim_nameplate("4", "L").unwrap();
        app.claim_nameplate("4", "R").unwrap();

        // The mailbox cap trips first, but either way the wire text is the
        // same "crowded".
        match app.claim_nameplate("4", "X") {
            Err(RelayError::Client(e)) => assert_eq!(e.to_string(), "crowded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn allocate_claims_what_it_finds() {
        let (_dir, store, app) = app();
        let name = app.allocate_nameplate("L").unwrap();

        let nameplate = store.get_nameplate("app", &name).unwrap().unwrap();
        assert!(store
            .get_nameplate_side(nameplate.id, "L")
            .unwrap()
            .unwrap()
            .claimed);
    }

    #[test]
    fn release_is_idempotent_and_leaves_the_mailbox() {
        let (_dir, store, app) = app();
        let mailbox_id = app.claim_nameplate("4", "L").unwrap();

        app.release_nameplate("4", "L").unwrap();
        assert!(store.get_nameplate("app", "4").unwrap().is_none());

        // Second release of the same name succeeds quietly.
        app.release_nameplate("4", "L").unwrap();

        // The mailbox is not closed by release; its own side-closure path
        // drives deletion.
        assert!(store.get_mailbox("app", &mailbox_id).is_ok());
        assert!(store
            .get_mailbox_side(&mailbox_id, "L")
            .unwrap()
            .unwrap()
            .opened);
    }

    #[test]
    fn release_of_one_side_keeps_the_nameplate() {
        let (_dir, store, app) = app();
        app.claim_nameplate("4", "L").unwrap();
        app.claim_nameplate("4", "R").unwrap();

        app.release_nameplate("4", "L").unwrap();
        assert!(store.get_nameplate("app", "4").unwrap().is_some());

        app.release_nameplate("4", "R").unwrap();
        assert!(store.get_nameplate("app", "4").unwrap().is_none());
    }

    #[test]
    fn third_mailbox_side_is_crowded() {
        let (_dir, _store, app) = app();
        let id = generate_mailbox_id();
        app.open_mailbox(&id, "L").unwrap();
        app.open_mailbox(&id, "R").unwrap();

        match app.open_mailbox(&id, "X") {
            Err(RelayError::Client(ClientError::MailboxCrowded)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cleanup_reaps_idle_state() {
        let (_dir, store, app) = app();

        let mailbox_id = app.claim_nameplate("4", "L").unwrap();
        // Backdate the mailbox so it looks idle.
        store.touch_mailbox(&mailbox_id, 100).unwrap();

        app.cleanup(1_000_000_000).unwrap();

        assert!(matches!(
            store.get_mailbox("app", &mailbox_id),
            Err(wormhole_store::StoreError::NotFound)
        ));
        assert!(store.get_nameplate("app", "4").unwrap().is_none());
        assert!(!app.still_in_use().unwrap());
    }

    #[test]
    fn cleanup_touches_active_conversations() {
        use crate::rendezvous::mailbox::MailboxListener;
        use wormhole_store::MessageRow;

        struct Quiet;
        impl MailboxListener for Quiet {
            fn on_message(&self, _m: &MessageRow) {}
            fn on_stop(&self) {}
        }

        let (_dir, store, app) = app();
        let mailbox_id = app.claim_nameplate("4", "L").unwrap();
        let mailbox = app.open_mailbox(&mailbox_id, "L").unwrap();
        mailbox.subscribe(Box::new(Quiet)).unwrap();

        store.touch_mailbox(&mailbox_id, 100).unwrap();

        // A listener is attached, so the pass touches instead of reaping.
        app.cleanup(101).unwrap();
        assert!(store.get_mailbox("app", &mailbox_id).is_ok());
    }
}
