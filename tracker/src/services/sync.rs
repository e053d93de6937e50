//! Sync engine
//!
//! Drains the outbox and uploads location pings. Cycles run on a fixed
//! interval, when the app comes to the foreground, when nudged, and on
//! demand through `trigger`. At most one cycle runs at a time.

use super::dispatch::Dispatcher;
use super::rewrite::{self, Remap};
use super::settings::SyncSettings;
use crate::api::{ApiClient, BatchPing, Credentials, LocationBatch};
use crate::database::{
    IdMappings, LocationPing, Outbox, OutboxMeta, PendingRequest, Repository,
};
use crate::error::{AppError, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// App visibility changes published by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// What one sync cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Outbox entries confirmed by the server
    pub sent: usize,
    /// Outbox entries that failed and had their retry count bumped
    pub failed: usize,
    /// Outbox entries whose ids were rewritten before sending
    pub rewritten: usize,
    /// Outbox entries dropped because their create was already confirmed
    pub duplicates: usize,
    /// Outbox entries left for a later cycle because they reference an
    /// entity whose create is still queued
    pub deferred: usize,
    pub pings_uploaded: usize,
    pub requests_purged: u64,
    pub pings_purged: u64,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    repo: Repository,
    ids: IdMappings,
    outbox: Outbox,
    api: ApiClient,
    dispatcher: Dispatcher,
    settings: SyncSettings,
    lifecycle: broadcast::Sender<AppLifecycle>,
    cycle_lock: Mutex<()>,
    nudge: Notify,
    running: Mutex<Option<Running>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        repo: Repository,
        ids: IdMappings,
        outbox: Outbox,
        api: ApiClient,
        dispatcher: Dispatcher,
        settings: SyncSettings,
        lifecycle: broadcast::Sender<AppLifecycle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                ids,
                outbox,
                api,
                dispatcher,
                settings,
                lifecycle,
                cycle_lock: Mutex::new(()),
                nudge: Notify::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Start the background loop. Returns `false` if it was already running.
    ///
    /// The first cycle runs immediately.
    pub async fn start(&self) -> bool {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return false;
        }

        tracing::info!("Starting background sync service");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let lifecycle = self.inner.lifecycle.subscribe();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run(shutdown_rx, lifecycle).await;
        });

        *running = Some(Running { shutdown, handle });
        true
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// A cycle already in progress completes first.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        if let Err(e) = running.handle.await {
            tracing::error!("Sync loop ended abnormally: {}", e);
        }

        tracing::info!("Stopped background sync service");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Ask the background loop for a cycle soon. No-op when stopped.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    /// Run one cycle now, waiting for any cycle in progress to finish first
    pub async fn trigger(&self) -> Result<SyncReport> {
        tracing::debug!("Immediate sync triggered");
        let _guard = self.inner.cycle_lock.lock().await;
        self.inner.cycle().await
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        mut shutdown: oneshot::Receiver<()>,
        mut lifecycle: broadcast::Receiver<AppLifecycle>,
    ) {
        let mut ticker = interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut listening = true;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,
                _ = ticker.tick() => self.run_if_idle("periodic").await,
                // A fresh `Notified` each turn still sees a nudge sent while
                // no one was waiting: `notify_one` stores a permit.
                _ = self.nudge.notified() => self.run_if_idle("nudge").await,
                event = lifecycle.recv(), if listening => match event {
                    Ok(AppLifecycle::Foreground) => {
                        tracing::info!("App became active, triggering sync");
                        self.run_if_idle("foreground").await;
                    }
                    Ok(AppLifecycle::Background) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} lifecycle events", skipped);
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }
    }

    /// Run a cycle unless one is already in progress
    async fn run_if_idle(&self, reason: &str) {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            tracing::debug!("Skipping {} sync: a cycle is already running", reason);
            return;
        };

        match self.cycle().await {
            Ok(report) => tracing::debug!("Sync cycle ({}) finished: {:?}", reason, report),
            Err(e) => tracing::error!("Sync cycle ({}) failed: {}", reason, e),
        }
    }

    async fn cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        match self.api.credentials().await {
            Ok(credentials) => {
                let mut unconfirmed = self.unconfirmed_creates().await?;
                self.replay_outbox(&credentials, &mut unconfirmed, &mut report)
                    .await?;
                self.upload_pings(&credentials, &unconfirmed, &mut report)
                    .await?;
            }
            Err(AppError::Config(message)) => {
                tracing::warn!("Cannot sync: {}", message);
            }
            Err(e) => return Err(e),
        }

        report.requests_purged = self
            .outbox
            .purge_exhausted(self.settings.max_outbox_retries)
            .await?;
        if report.requests_purged > 0 {
            tracing::warn!(
                "Deleted {} failed requests exceeding max retries",
                report.requests_purged
            );
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.settings.ping_retention_days);
        report.pings_purged = self.repo.purge_synced_pings(cutoff).await?;

        Ok(report)
    }

    /// Local ids whose create is queued and not yet mapped to a server id
    async fn unconfirmed_creates(&self) -> Result<HashSet<String>> {
        let mut unconfirmed = HashSet::new();
        for local_id in self.outbox.queued_creates().await? {
            if self.ids.resolve(&local_id).await?.is_none() {
                unconfirmed.insert(local_id);
            }
        }
        Ok(unconfirmed)
    }

    async fn replay_outbox(
        &self,
        credentials: &Credentials,
        unconfirmed: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> Result<()> {
        // Creates that other entries wait on go first, whatever their retry
        // count, so deferred dependents cannot fill every batch.
        let mut entries: Vec<PendingRequest> = self
            .outbox
            .list_creates()
            .await?
            .into_iter()
            .filter(|entry| {
                entry
                    .parsed_meta()
                    .as_ref()
                    .and_then(created_local_id)
                    .is_some_and(|id| unconfirmed.contains(id))
            })
            .collect();
        let blocking: HashSet<i64> = entries.iter().map(|entry| entry.id).collect();
        entries.extend(
            self.outbox
                .list_pending(self.settings.outbox_batch_limit)
                .await?
                .into_iter()
                .filter(|entry| !blocking.contains(&entry.id)),
        );
        if entries.is_empty() {
            return Ok(());
        }

        tracing::info!("Processing {} pending requests", entries.len());

        for entry in entries {
            let meta = entry.parsed_meta();

            if let Some(server_id) = self.already_created(meta.as_ref()).await? {
                tracing::info!(
                    "Request {} creates an entity already confirmed as {}, dropping it",
                    entry.id,
                    server_id
                );
                self.outbox.mark_complete(entry.id).await?;
                report.duplicates += 1;
                continue;
            }

            if let Some(blocker) = meta.as_ref().and_then(|m| waits_on(m, &*unconfirmed)) {
                tracing::debug!(
                    "Deferring request {}: create of {} is still queued",
                    entry.id,
                    blocker
                );
                report.deferred += 1;
                continue;
            }

            let (url, body, meta) = self.rewrite_ids(&entry, meta, report).await?;

            match self
                .api
                .send_once(credentials, entry.method, &url, &body)
                .await
            {
                Ok(response) => {
                    if let Some(meta) = &meta {
                        if let Err(e) = self.dispatcher.confirm(meta, &response).await {
                            tracing::error!(
                                "Request {} succeeded but could not be applied locally: {}",
                                entry.id,
                                e
                            );
                            self.outbox.increment_retry(entry.id).await?;
                            report.failed += 1;
                            continue;
                        }
                    }
                    self.outbox.mark_complete(entry.id).await?;
                    if let Some(local_id) = meta.as_ref().and_then(created_local_id) {
                        unconfirmed.remove(local_id);
                    }
                    report.sent += 1;
                    tracing::info!("Request {} completed successfully", entry.id);
                }
                Err(e) => {
                    self.outbox.increment_retry(entry.id).await?;
                    report.failed += 1;
                    tracing::warn!(
                        "Request {} failed (retry {}): {}",
                        entry.id,
                        entry.retry_count + 1,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// Server id of the entity a create entry would create, if that create
    /// was already confirmed through another path
    async fn already_created(&self, meta: Option<&OutboxMeta>) -> Result<Option<String>> {
        let Some(meta) = meta else {
            return Ok(None);
        };
        if meta.kind.and_then(|kind| kind.created_entity()).is_none() {
            return Ok(None);
        }
        match meta.local_id.as_deref() {
            Some(local_id) => self.ids.resolve(local_id).await,
            None => Ok(None),
        }
    }

    /// Resolve every id the entry references and persist any rewrite
    async fn rewrite_ids(
        &self,
        entry: &PendingRequest,
        meta: Option<OutboxMeta>,
        report: &mut SyncReport,
    ) -> Result<(String, String, Option<OutboxMeta>)> {
        let Some(meta) = meta else {
            return Ok((entry.url.clone(), entry.body.clone(), None));
        };

        let mut remaps = Vec::new();
        for id in meta.referenced_ids() {
            if let Some(current) = self.ids.resolve(id).await? {
                if current != id {
                    remaps.push(Remap::new(id, current));
                }
            }
        }

        let Some(update) = rewrite::rewrite_entry(&entry.url, &entry.body, &meta, &remaps)? else {
            return Ok((entry.url.clone(), entry.body.clone(), Some(meta)));
        };

        self.outbox.update(entry.id, &update).await?;
        report.rewritten += 1;
        tracing::debug!("Rewrote ids in request {}", entry.id);

        let meta = match update.meta.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => meta,
        };
        Ok((
            update.url.unwrap_or_else(|| entry.url.clone()),
            update.body.unwrap_or_else(|| entry.body.clone()),
            Some(meta),
        ))
    }

    /// Upload pending pings, one request per (shift, ride) group.
    ///
    /// A group is marked synced only when its own request succeeds.
    async fn upload_pings(
        &self,
        credentials: &Credentials,
        unconfirmed: &HashSet<String>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let pings = self
            .repo
            .pending_pings(self.settings.ping_batch_limit)
            .await?;
        if pings.is_empty() {
            return Ok(());
        }

        tracing::info!("Uploading {} pending location pings", pings.len());

        for ((shift_id, ride_id), group) in self.group_pings(&pings).await? {
            if unconfirmed.contains(&shift_id)
                || ride_id.as_ref().is_some_and(|id| unconfirmed.contains(id))
            {
                tracing::debug!(
                    "Holding {} pings for shift {} until it is created on the server",
                    group.len(),
                    shift_id
                );
                continue;
            }

            let batch = LocationBatch {
                shift_id,
                ride_id,
                pings: group.iter().map(|ping| BatchPing::from(*ping)).collect(),
            };

            match self.api.upload_location(credentials, &batch).await {
                Ok(_) => {
                    let ids: Vec<i64> = group.iter().map(|ping| ping.id).collect();
                    self.repo.mark_pings_synced(&ids).await?;
                    report.pings_uploaded += ids.len();
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to upload {} pings for shift {}: {}",
                        batch.pings.len(),
                        batch.shift_id,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// Group pings by resolved (shift, ride), keeping first-seen order
    async fn group_pings<'a>(
        &self,
        pings: &'a [LocationPing],
    ) -> Result<Vec<((String, Option<String>), Vec<&'a LocationPing>)>> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut groups: Vec<((String, Option<String>), Vec<&'a LocationPing>)> = Vec::new();

        for ping in pings {
            let shift_id = self.resolve_cached(&mut resolved, &ping.shift_id).await?;
            let ride_id = match ping.ride_id.as_deref() {
                Some(ride_id) => Some(self.resolve_cached(&mut resolved, ride_id).await?),
                None => None,
            };
            let key = (shift_id, ride_id);

            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(ping),
                None => groups.push((key, vec![ping])),
            }
        }

        Ok(groups)
    }

    async fn resolve_cached(
        &self,
        cache: &mut HashMap<String, String>,
        id: &str,
    ) -> Result<String> {
        if let Some(current) = cache.get(id) {
            return Ok(current.clone());
        }
        let current = self.ids.current(id).await?;
        cache.insert(id.to_string(), current.clone());
        Ok(current)
    }
}

/// A still-queued create this entry depends on, other than its own
fn waits_on<'a>(meta: &'a OutboxMeta, unconfirmed: &HashSet<String>) -> Option<&'a str> {
    meta.referenced_ids()
        .into_iter()
        .find(|id| created_local_id(meta) != Some(*id) && unconfirmed.contains(*id))
}

/// Local id of the entity a create entry creates
fn created_local_id(meta: &OutboxMeta) -> Option<&str> {
    meta.kind?.created_entity()?;
    meta.local_id.as_deref()
}
