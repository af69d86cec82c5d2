//! The rendezvous service: registry of live applications plus the cleaning
//! loop that garbage-collects idle channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use wormhole_proto::WelcomeInfo;
use wormhole_store::Store;

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::rendezvous::application::Application;

/// Builds the welcome payload for each newly registered session, so no
/// session ever holds a reference into configuration.
#[derive(Debug, Clone, Default)]
pub struct WelcomeBuilder {
    motd: Option<String>,
    error: Option<String>,
    version: Option<String>,
}

impl WelcomeBuilder {
    pub fn from_config(config: &ServerConfig) -> Self {
        fn non_empty(s: &str) -> Option<String> {
            (!s.is_empty()).then(|| s.to_string())
        }

        Self {
            motd: non_empty(&config.welcome_motd),
            error: non_empty(&config.welcome_error),
            version: non_empty(&config.advertised_version),
        }
    }

    pub fn build(&self) -> WelcomeInfo {
        WelcomeInfo {
            motd: self.motd.clone(),
            error: self.error.clone(),
            current_cli_version: self.version.clone(),
        }
    }
}

pub struct RendezvousService {
    store: Arc<Store>,
    welcome: WelcomeBuilder,
    allow_list: bool,
    apps: Mutex<HashMap<String, Arc<Application>>>,
}

impl RendezvousService {
    pub fn new(store: Arc<Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            welcome: WelcomeBuilder::from_config(config),
            allow_list: config.allow_list,
            apps: Mutex::new(HashMap::new()),
        }
    }

    fn apps(&self) -> MutexGuard<'_, HashMap<String, Arc<Application>>> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the application container for an app id, building it lazily.
    pub fn get_app(&self, app_id: &str) -> Arc<Application> {
        let mut apps = self.apps();
        if let Some(app) = apps.get(app_id) {
            return app.clone();
        }

        info!(app = %app_id, "creating application container");
        let app = Arc::new(Application::new(app_id, self.store.clone()));
        apps.insert(app_id.to_string(), app.clone());
        app
    }

    /// App ids present anywhere in the store, whether or not a container is
    /// live for them.
    pub fn all_app_ids(&self) -> Result<Vec<String>, RelayError> {
        Ok(self.store.all_app_ids()?)
    }

    /// Run one cleaning pass over every known app, dropping containers that
    /// end up with no durable state.
    pub fn clean_apps(&self, since: i64) -> Result<(), RelayError> {
        for app_id in self.all_app_ids()? {
            let app = self.get_app(&app_id);
            app.cleanup(since)?;
            if !app.still_in_use()? {
                self.apps().remove(&app_id);
            }
        }
        Ok(())
    }

    /// One immediate pass with `now` as the cutoff; used by the standalone
    /// clean mode, which never starts a listener.
    pub fn clean_now(&self) -> Result<(), RelayError> {
        self.clean_apps(Utc::now().timestamp())
    }

    pub fn welcome(&self) -> WelcomeInfo {
        self.welcome.build()
    }

    pub fn allow_list(&self) -> bool {
        self.allow_list
    }
}

/// Periodic cleaning. Each tick passes the previous tick's time as the
/// cutoff; the first tick pretends one interval has already elapsed so it
/// does not run an empty pass.
pub fn spawn_cleaning(
    service: Arc<RendezvousService>,
    interval_minutes: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval_minutes == 0 {
            warn!("cleaning interval was too small, check configuration");
            return;
        }

        let period = Duration::from_secs(interval_minutes * 60);
        let mut last_pass = Utc::now().timestamp() - period.as_secs() as i64;
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    if let Err(e) = service.clean_apps(last_pass) {
                        error!(error = %e, "failed to clean relay channels");
                    }
                    last_pass = now;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, Arc<Store>, RendezvousService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_at(&dir.path().join("relay.db")).unwrap());
        let config = ServerConfig::default();
        let service = RendezvousService::new(store.clone(), &config);
        (dir, store, service)
    }

    #[test]
    fn get_app_builds_lazily_and_reuses() {
        let (_dir, _store, service) = service();
        let a = service.get_app("app-1");
        let b = service.get_app("app-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn clean_now_reaps_stale_state() {
        let (_dir, store, service) = service();

        let app = service.get_app("app-1");
        let mailbox_id = app.claim_nameplate("4", "L").unwrap();
        store.touch_mailbox(&mailbox_id, 100).unwrap();

        service.clean_now().unwrap();

        assert!(matches!(
            store.get_mailbox("app-1", &mailbox_id),
            Err(wormhole_store::StoreError::NotFound)
        ));
        assert!(store.get_nameplate("app-1", "4").unwrap().is_none());
        // The container itself was dropped with its durable state.
        assert!(service.apps().is_empty());
    }

    #[test]
    fn welcome_builder_skips_empty_knobs() {
        let mut config = ServerConfig::default();
        config.welcome_motd = "hi there".into();
        config.advertised_version = "0.9.0".into();

        let welcome = WelcomeBuilder::from_config(&config).build();
        assert_eq!(welcome.motd.as_deref(), Some("hi there"));
        assert_eq!(welcome.current_cli_version.as_deref(), Some("0.9.0"));
        assert!(welcome.error.is_none());
    }
}
