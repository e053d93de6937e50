//! Application state and initialization
//!
//! Opens the database, loads settings and wires every service together.
//! All services are reachable from the `App` value.

use crate::api::{ApiClient, HttpTransport, ReqwestTransport, RetryPolicy};
use crate::config::DATABASE_FILE_NAME;
use crate::database::{create_pool, IdMappings, Outbox, Repository};
use crate::error::Result;
use crate::services::{
    AppLifecycle, AppSettings, Dispatcher, ExpensesService, LocationService, SettingsService,
    SyncEngine, TrackerService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Central application state holding all services
#[derive(Clone)]
pub struct App {
    pub app_data_dir: PathBuf,
    pub settings: AppSettings,
    pub repo: Repository,
    pub ids: IdMappings,
    pub outbox: Outbox,
    pub api: ApiClient,
    pub sync: SyncEngine,
    pub location: LocationService,
    pub tracker: TrackerService,
    pub expenses: ExpensesService,
    pub settings_service: SettingsService,
    lifecycle: broadcast::Sender<AppLifecycle>,
}

impl App {
    /// Open the app in `app_data_dir` using the real HTTP transport
    pub async fn open(app_data_dir: &Path) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Self::open_with(app_data_dir, transport).await
    }

    /// Open the app with a custom transport and restore tracker state
    pub async fn open_with(app_data_dir: &Path, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        tracing::info!("Initializing application");
        tracing::info!("App data directory: {:?}", app_data_dir);

        std::fs::create_dir_all(app_data_dir)?;

        let pool = create_pool(&app_data_dir.join(DATABASE_FILE_NAME)).await?;
        let repo = Repository::new(pool.clone());
        let ids = IdMappings::new(pool.clone());
        let outbox = Outbox::new(pool);

        let settings_service = SettingsService::new(app_data_dir.to_path_buf(), repo.clone());
        let settings = settings_service.load().await?;

        let retry = RetryPolicy {
            max_attempts: settings.api.max_attempts,
            base_delay: Duration::from_millis(settings.api.base_backoff_ms),
        };
        let api = ApiClient::new(repo.clone(), transport, retry);
        let dispatcher = Dispatcher::new(repo.clone(), ids.clone(), outbox.clone(), api.clone());

        let (lifecycle, _) = broadcast::channel(16);
        let sync = SyncEngine::new(
            repo.clone(),
            ids.clone(),
            outbox.clone(),
            api.clone(),
            dispatcher.clone(),
            settings.sync.clone(),
            lifecycle.clone(),
        );
        let location = LocationService::new(repo.clone(), settings.tracking.clone());
        let tracker = TrackerService::new(
            repo.clone(),
            ids.clone(),
            dispatcher.clone(),
            sync.clone(),
            location.clone(),
            Duration::from_secs(settings.tracker.shift_summary_delay_secs),
        );
        let expenses = ExpensesService::new(repo.clone(), dispatcher);

        let state = tracker.restore().await?;
        tracing::info!("Application initialized in state {}", state);

        Ok(Self {
            app_data_dir: app_data_dir.to_path_buf(),
            settings,
            repo,
            ids,
            outbox,
            api,
            sync,
            location,
            tracker,
            expenses,
            settings_service,
            lifecycle,
        })
    }

    /// Forward a foreground/background change from the host
    pub fn publish_lifecycle(&self, event: AppLifecycle) {
        // No receivers just means sync is not running
        let _ = self.lifecycle.send(event);
    }

    /// Stop background work before exit
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.sync.stop().await;
        self.location.stop().await;
    }
}
