// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PollingSettings;
use crate::services::account_store::{
    AccountStatus, AccountStore, PollSettings, StorageError, POLLING_ENABLED_KEY,
    POLLING_INTERVAL_KEY,
};
use crate::services::dispatcher::Dispatcher;
use crate::services::reconciler::reconcile;

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Counts for one finished cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub loaded: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new_mail: usize,
    pub dropped: usize,
    pub applied: usize,
}

/// What a wake tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    NotDue,
    Completed(CycleReport),
}

/// Background polling loop.
///
/// Idle between wake ticks; each tick re-reads the stored polling settings
/// and runs a cycle when enabled and the interval has elapsed since the
/// previous cycle started. A cycle runs to completion before the next tick
/// is taken, so cycles never overlap.
pub struct Poller {
    store: Arc<dyn AccountStore>,
    dispatcher: Dispatcher,
    settings: PollingSettings,
    last_run: Option<Instant>,
}

impl Poller {
    pub fn new(
        store: Arc<dyn AccountStore>,
        dispatcher: Dispatcher,
        settings: PollingSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            last_run: None,
        }
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub async fn poll_settings(&self) -> Result<PollSettings, StorageError> {
        let enabled = self.store.read_setting(POLLING_ENABLED_KEY).await?;
        let interval = self.store.read_setting(POLLING_INTERVAL_KEY).await?;
        Ok(PollSettings::from_raw(
            enabled.as_deref(),
            interval.as_deref(),
            self.settings.default_interval_seconds,
        ))
    }

    /// One wake tick at time `now`.
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome, PollError> {
        let poll_settings = self.poll_settings().await?;
        if !poll_settings.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let interval = Duration::from_secs(poll_settings.interval_secs);
        if let Some(last) = self.last_run {
            if now.saturating_duration_since(last) < interval {
                return Ok(TickOutcome::NotDue);
            }
        }

        // Recorded before dispatching so a slow cycle cannot be re-entered
        self.last_run = Some(now);
        self.run_cycle().await.map(TickOutcome::Completed)
    }

    /// Load, fetch and reconcile every eligible account once, ignoring the
    /// enabled switch and the interval.
    pub async fn run_cycle(&self) -> Result<CycleReport, PollError> {
        let exclude = self.settings.skip_errored_accounts.then_some(AccountStatus::Error);
        let accounts = self.store.list_accounts(exclude).await?;
        info!("Starting poll cycle for {} account(s)", accounts.len());

        let mut report = CycleReport {
            loaded: accounts.len(),
            ..Default::default()
        };
        if accounts.is_empty() {
            return Ok(report);
        }

        let dispatched = self.dispatcher.dispatch(accounts).await;
        report.dropped = dispatched.dropped;
        for result in &dispatched.results {
            if result.is_success() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            if result.is_new() {
                report.new_mail += 1;
            }
        }

        report.applied = reconcile(self.store.as_ref(), &dispatched.results).await?;
        info!(
            "Poll cycle finished: {} ok, {} failed, {} new, {} dropped",
            report.succeeded, report.failed, report.new_mail, report.dropped
        );
        Ok(report)
    }

    /// Tick every `tick_seconds` until `shutdown` is cancelled. A failed
    /// cycle is logged and retried on a later tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = time::interval(Duration::from_secs(self.settings.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Poller started (tick every {}s)", self.settings.tick_seconds);

        loop {
            let now = tokio::select! {
                _ = shutdown.cancelled() => break,
                now = ticker.tick() => now,
            };

            match self.tick(now).await {
                Ok(TickOutcome::Completed(_)) => {}
                Ok(outcome) => debug!("Poll tick: {:?}", outcome),
                Err(e) => error!("Poll cycle failed: {}", e),
            }
        }

        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::imap::client::MockMailFetcher;
    use crate::imap::types::{FetchOutcome, LatestMail};
    use crate::services::account_store::{Account, AccountUpdate, SqliteAccountStore};

    fn polling_settings() -> PollingSettings {
        PollingSettings {
            tick_seconds: 5,
            worker_limit: 4,
            default_interval_seconds: 300,
            skip_errored_accounts: false,
        }
    }

    async fn setup(fetcher: MockMailFetcher) -> (Arc<SqliteAccountStore>, Poller) {
        let store = Arc::new(SqliteAccountStore::connect("sqlite::memory:").await.unwrap());
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 4);
        let poller = Poller::new(store.clone(), dispatcher, polling_settings());
        (store, poller)
    }

    fn welcome() -> FetchOutcome {
        FetchOutcome::Success(LatestMail::new("a@b.com".into(), "Welcome".into(), "hi".into()))
    }

    /// Store kept in memory so the paused clock never waits on a database
    /// thread. The first `failing_lists` listings fail.
    struct MemoryStore {
        accounts: Mutex<Vec<Account>>,
        settings: HashMap<String, String>,
        failing_lists: AtomicUsize,
        list_calls: AtomicUsize,
    }

    impl MemoryStore {
        fn new(addresses: &[&str], failing_lists: usize) -> Self {
            let accounts = addresses
                .iter()
                .zip(1..)
                .map(|(address, id)| Account {
                    id,
                    address: address.to_string(),
                    auth_token: "code".into(),
                    status: Some(AccountStatus::Unknown),
                    has_new_mail: false,
                    last_identifier: None,
                    last_polled_at: None,
                })
                .collect();
            let settings = HashMap::from([
                (POLLING_ENABLED_KEY.to_string(), "1".to_string()),
                (POLLING_INTERVAL_KEY.to_string(), "10".to_string()),
            ]);
            Self {
                accounts: Mutex::new(accounts),
                settings,
                failing_lists: AtomicUsize::new(failing_lists),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AccountStore for MemoryStore {
        async fn list_accounts(
            &self,
            _exclude: Option<AccountStatus>,
        ) -> Result<Vec<Account>, StorageError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_lists.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_lists.store(failing - 1, Ordering::SeqCst);
                return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(self.accounts.lock().unwrap().clone())
        }

        async fn get_account(&self, id: i64) -> Result<Option<Account>, StorageError> {
            Ok(self.accounts.lock().unwrap().iter().find(|a| a.id == id).cloned())
        }

        async fn read_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.settings.get(key).cloned())
        }

        async fn update_account(
            &self,
            id: i64,
            update: &AccountUpdate,
        ) -> Result<bool, StorageError> {
            let mut accounts = self.accounts.lock().unwrap();
            let Some(account) = accounts.iter_mut().find(|a| a.id == id) else {
                return Ok(false);
            };
            account.status = Some(update.status);
            if let Some(marker) = &update.marker {
                account.has_new_mail = marker.has_new_mail;
                account.last_identifier = marker.identifier.clone();
            }
            account.last_polled_at = Some(update.polled_at);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_disabled_polling_never_fetches() {
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().never();
        let (store, mut poller) = setup(fetcher).await;
        store.insert_account("a@b.com", "c").await.unwrap();
        store.write_setting(POLLING_ENABLED_KEY, "0").await.unwrap();

        for _ in 0..3 {
            assert_eq!(poller.tick(Instant::now()).await.unwrap(), TickOutcome::Disabled);
        }
        assert!(poller.last_run().is_none());
    }

    #[tokio::test]
    async fn test_missing_switch_means_disabled() {
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().never();
        let (_store, mut poller) = setup(fetcher).await;
        assert_eq!(poller.tick(Instant::now()).await.unwrap(), TickOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_interval_gates_cycles() {
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().times(2).returning(|_, _| welcome());
        let (store, mut poller) = setup(fetcher).await;
        store.insert_account("a@b.com", "c").await.unwrap();
        store.save_poll_settings(&PollSettings::new(true, 60).unwrap()).await.unwrap();

        let start = Instant::now();
        assert!(matches!(poller.tick(start).await.unwrap(), TickOutcome::Completed(_)));
        assert_eq!(poller.last_run(), Some(start));

        let early = start + Duration::from_secs(59);
        assert_eq!(poller.tick(early).await.unwrap(), TickOutcome::NotDue);
        assert_eq!(poller.last_run(), Some(start));

        let due = start + Duration::from_secs(60);
        match poller.tick(due).await.unwrap() {
            TickOutcome::Completed(report) => {
                assert_eq!(report.loaded, 1);
                assert_eq!(report.succeeded, 1);
                // Same identifier as the first cycle
                assert_eq!(report.new_mail, 0);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
        assert_eq!(poller.last_run(), Some(due));
    }

    #[tokio::test]
    async fn test_last_run_recorded_even_when_cycle_fails() {
        let fetcher = MockMailFetcher::new();
        let (store, mut poller) = setup(fetcher).await;
        store.save_poll_settings(&PollSettings::new(true, 60).unwrap()).await.unwrap();
        sqlx::query("DROP TABLE accounts").execute(store.pool()).await.unwrap();

        let now = Instant::now();
        assert!(poller.tick(now).await.is_err());
        assert_eq!(poller.last_run(), Some(now));
    }

    #[tokio::test]
    async fn test_skip_errored_accounts_option() {
        let mut fetcher = MockMailFetcher::new();
        fetcher
            .expect_fetch_latest()
            .withf(|address, _| address == "ok@b.com")
            .times(1)
            .returning(|_, _| welcome());
        let store = Arc::new(SqliteAccountStore::connect("sqlite::memory:").await.unwrap());
        store.insert_account("ok@b.com", "c").await.unwrap();
        let bad = store.insert_account("bad@b.com", "c").await.unwrap();
        let errored = AccountUpdate::status_only(AccountStatus::Error, chrono::Utc::now());
        store.update_account(bad, &errored).await.unwrap();

        let settings = PollingSettings {
            skip_errored_accounts: true,
            ..polling_settings()
        };
        let poller = Poller::new(store.clone(), Dispatcher::new(Arc::new(fetcher), 2), settings);
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.loaded, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().never();
        let (_store, poller) = setup(fetcher).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poller.run(shutdown.clone()));
        time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_ticking_after_failed_cycles() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            welcome()
        });

        // Interval 10s, tick 5s: cycles are due at 0s, 10s, 20s, 30s
        let store = Arc::new(MemoryStore::new(&["a@b.com"], 2));
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 2);
        let poller = Poller::new(store.clone(), dispatcher, polling_settings());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poller.run(shutdown.clone()));

        // 0s and 10s fail while listing accounts
        time::sleep(Duration::from_secs(12)).await;
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 0);

        // 20s succeeds
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        let account = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(account.status, Some(AccountStatus::Success));
        assert!(account.has_new_mail);

        // and the loop is still running at 30s
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_status_row_does_not_block_cycle() {
        let mut fetcher = MockMailFetcher::new();
        fetcher.expect_fetch_latest().times(3).returning(|_, _| welcome());
        let (store, poller) = setup(fetcher).await;
        store.insert_account("a@b.com", "c").await.unwrap();
        let odd = store.insert_account("odd@b.com", "c").await.unwrap();
        store.insert_account("c@b.com", "c").await.unwrap();

        sqlx::query("PRAGMA ignore_check_constraints = ON")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE accounts SET status = 'pending' WHERE id = ?")
            .bind(odd)
            .execute(store.pool())
            .await
            .unwrap();

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.applied, 3);

        let account = store.get_account(odd).await.unwrap().unwrap();
        assert_eq!(account.status, Some(AccountStatus::Success));
    }
}
