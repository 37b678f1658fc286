//! Integration Tests for Sync Module
//!
//! Full cycles against a scripted in-process server:
//! - First sync, local additions, edits and deletions
//! - Deletions reaching a second device
//! - Failure and retry without duplication
//! - Single-flight coalescing and edits made mid-cycle
//! - One end-to-end cycle over HTTP (with mockito)

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::{self, AccountUpdate, Database, NewAccount, SyncAccount};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Notify;

    // ========================================================================
    // Scripted server
    // ========================================================================

    type Hook = Box<dyn FnOnce() + Send>;

    #[derive(Default)]
    struct FakeRemote {
        snapshot: StdMutex<RemoteSnapshot>,
        fetch_failures: AtomicUsize,
        replace_failures: AtomicUsize,
        reject_replace: AtomicBool,
        /// Apply the write, then report a failure to the client
        lose_ack: AtomicBool,
        replace_calls: AtomicUsize,
        before_replace: StdMutex<Option<Hook>>,
        /// (entered, release) pair that parks `fetch`
        hold_fetch: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeRemote {
        fn with_accounts(accounts: Vec<SyncAccount>, updated: DateTime<Utc>) -> Self {
            Self {
                snapshot: StdMutex::new(RemoteSnapshot {
                    snapshot_time: Some(updated),
                    accounts,
                }),
                ..Self::default()
            }
        }

        fn accounts(&self) -> Vec<SyncAccount> {
            self.snapshot.lock().unwrap().accounts.clone()
        }

        fn replace_calls(&self) -> usize {
            self.replace_calls.load(Ordering::SeqCst)
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl RemoteAccountService for FakeRemote {
        async fn fetch(&self) -> Result<RemoteSnapshot, SyncApiError> {
            if let Some((entered, release)) = &self.hold_fetch {
                entered.notify_one();
                release.notified().await;
            }

            if take_failure(&self.fetch_failures) {
                return Err(SyncApiError::ServerError("connection reset".to_string()));
            }

            let snapshot = self.snapshot.lock().unwrap().clone();
            Ok(snapshot)
        }

        async fn replace(&self, accounts: &[SyncAccount]) -> Result<(), SyncApiError> {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);

            let hook = self.before_replace.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }

            if take_failure(&self.replace_failures) {
                return Err(SyncApiError::ServerError("timeout".to_string()));
            }
            if self.reject_replace.load(Ordering::SeqCst) {
                return Err(SyncApiError::Rejected("quota exceeded".to_string()));
            }

            {
                let mut snapshot = self.snapshot.lock().unwrap();
                snapshot.accounts = accounts.to_vec();
                snapshot.snapshot_time = Some(db::now());
            }

            if self.lose_ack.swap(false, Ordering::SeqCst) {
                return Err(SyncApiError::ServerError("connection reset after write".to_string()));
            }
            Ok(())
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn test_db() -> Arc<Database> {
        Arc::new(Database::in_memory().expect("Failed to create test database"))
    }

    fn device(db: &Arc<Database>, remote: &Arc<FakeRemote>) -> SyncManager {
        let manager = SyncManager::new(db.clone(), remote.clone());
        manager.set_can_sync(true);
        manager
    }

    fn an_hour_ago() -> DateTime<Utc> {
        db::now() - Duration::hours(1)
    }

    fn account(issuer: &str, name: &str, secret: &str) -> SyncAccount {
        SyncAccount::new(Some(issuer), name, secret)
    }

    fn active(db: &Database) -> Vec<SyncAccount> {
        db.get_active_accounts()
            .expect("Failed to list accounts")
            .iter()
            .map(|a| a.to_sync_account())
            .collect()
    }

    fn sorted(mut accounts: Vec<SyncAccount>) -> Vec<SyncAccount> {
        accounts.sort_by(|a, b| a.key().to_string().cmp(&b.key().to_string()));
        accounts
    }

    // ========================================================================
    // Cycle flows
    // ========================================================================

    #[tokio::test]
    async fn test_first_sync_pulls_server_accounts() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0"), account("Google", "bob", "S1")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);

        let outcome = manager.sync_now().await.expect("Sync should succeed");
        let report = outcome.report().expect("Cycle should complete");

        assert!(!report.pushed);
        assert_eq!(report.inserted, 2);
        assert_eq!(remote.replace_calls(), 0);
        assert_eq!(active(&db), remote.accounts());
        assert!(db.get_dirty_accounts().unwrap().is_empty());

        let history = manager.history().get_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, SyncOperation::Pull);
    }

    #[tokio::test]
    async fn test_local_addition_is_pushed() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);

        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();
        manager.sync_now().await.expect("Sync should succeed");

        assert_eq!(
            remote.accounts(),
            vec![account("GitLab", "carol", "S2"), account("GitHub", "alice", "S0")]
        );
        assert_eq!(sorted(active(&db)), sorted(remote.accounts()));
        assert!(db.get_dirty_accounts().unwrap().is_empty());
        assert_eq!(manager.status().await.unwrap().pending_changes, 0);
    }

    #[tokio::test]
    async fn test_local_edit_newer_than_snapshot_wins() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);
        manager.sync_now().await.unwrap();

        let id = db.get_active_accounts().unwrap()[0].id;
        db.update_account(id, &AccountUpdate { secret: Some("S1".to_string()), ..Default::default() })
            .unwrap();
        manager.sync_now().await.unwrap();

        assert_eq!(remote.accounts(), vec![account("GitHub", "alice", "S1")]);
        assert_eq!(active(&db), vec![account("GitHub", "alice", "S1")]);
    }

    #[tokio::test]
    async fn test_server_newer_than_local_edit_wins() {
        let db = test_db();
        db.create_account(&NewAccount::new(Some("GitHub"), "alice", "S1")).unwrap();

        // Another device wrote after our local edit
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S2")],
            db::now() + Duration::hours(1),
        ));
        let manager = device(&db, &remote);

        manager.sync_now().await.unwrap();

        assert_eq!(remote.accounts(), vec![account("GitHub", "alice", "S2")]);
        assert_eq!(active(&db), vec![account("GitHub", "alice", "S2")]);
        assert!(db.get_dirty_accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_reaches_other_device() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0"), account("Google", "bob", "S1")],
            an_hour_ago(),
        ));
        let db_a = test_db();
        let db_b = test_db();
        let device_a = device(&db_a, &remote);
        let device_b = device(&db_b, &remote);

        device_a.sync_now().await.unwrap();
        device_b.sync_now().await.unwrap();

        let alice = db_a
            .get_active_accounts()
            .unwrap()
            .into_iter()
            .find(|a| a.account_name == "alice")
            .expect("alice should be synced");
        db_a.soft_delete_account(alice.id).unwrap();

        device_a.sync_now().await.unwrap();
        assert_eq!(remote.accounts(), vec![account("Google", "bob", "S1")]);

        let report = device_b.sync_now().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(active(&db_b), vec![account("Google", "bob", "S1")]);
        assert!(db_b.get_dirty_accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_reaches_server() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);
        manager.sync_now().await.unwrap();

        let id = db.get_active_accounts().unwrap()[0].id;
        db.update_account(id, &AccountUpdate { account_name: Some("alice@work".to_string()), ..Default::default() })
            .unwrap();
        manager.sync_now().await.unwrap();

        assert_eq!(remote.accounts(), vec![account("GitHub", "alice@work", "S0")]);
        assert_eq!(active(&db), remote.accounts());
    }

    #[tokio::test]
    async fn test_server_change_without_local_changes_skips_push() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);
        manager.sync_now().await.unwrap();

        remote.snapshot.lock().unwrap().accounts = vec![account("GitHub", "alice", "S5")];
        manager.sync_now().await.unwrap();

        assert_eq!(remote.replace_calls(), 0);
        assert_eq!(active(&db), vec![account("GitHub", "alice", "S5")]);
    }

    // ========================================================================
    // Failures & retry
    // ========================================================================

    #[tokio::test]
    async fn test_fetch_failure_keeps_local_changes() {
        let remote = Arc::new(FakeRemote::with_accounts(vec![], an_hour_ago()));
        remote.fetch_failures.store(1, Ordering::SeqCst);
        let db = test_db();
        let manager = device(&db, &remote);

        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        let result = manager.sync_now().await;
        assert!(matches!(result, Err(SyncManagerError::Transport(_))));

        let status = manager.status().await.unwrap();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(status.last_error.is_some());
        assert_eq!(status.pending_changes, 1);

        manager.sync_now().await.expect("Retry should succeed");
        let status = manager.status().await.unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(status.pending_changes, 0);
        assert_eq!(remote.accounts(), vec![account("GitLab", "carol", "S2")]);

        let history = manager.history().get_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sync_status, HistoryStatus::Success);
        assert_eq!(history[1].sync_status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn test_push_failure_keeps_local_changes() {
        let remote = Arc::new(FakeRemote::with_accounts(vec![], an_hour_ago()));
        remote.replace_failures.store(1, Ordering::SeqCst);
        let db = test_db();
        let manager = device(&db, &remote);

        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        assert!(manager.sync_now().await.is_err());
        assert!(remote.accounts().is_empty());
        assert_eq!(db.get_dirty_accounts().unwrap().len(), 1);
        assert!(db.get_active_accounts().unwrap()[0].last_sync_time.is_none());
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_retry_does_not_duplicate() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        remote.lose_ack.store(true, Ordering::SeqCst);
        let db = test_db();
        let manager = device(&db, &remote);

        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        assert!(manager.sync_now().await.is_err());
        assert_eq!(remote.accounts().len(), 2);
        assert_eq!(db.get_dirty_accounts().unwrap().len(), 1);

        manager.sync_now().await.expect("Retry should succeed");

        assert_eq!(
            sorted(remote.accounts()),
            sorted(vec![account("GitHub", "alice", "S0"), account("GitLab", "carol", "S2")])
        );
        assert_eq!(sorted(active(&db)), sorted(remote.accounts()));
        assert!(db.get_dirty_accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let remote = Arc::new(FakeRemote::with_accounts(vec![], an_hour_ago()));
        remote.reject_replace.store(true, Ordering::SeqCst);
        let db = test_db();
        let manager = device(&db, &remote);

        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        match manager.sync_now().await {
            Err(SyncManagerError::ServerRejection(msg)) => assert_eq!(msg, "quota exceeded"),
            other => panic!("Expected rejection, got {:?}", other.map(|o| o.report().cloned())),
        }
        assert_eq!(db.get_dirty_accounts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_touches_nothing() {
        let remote = Arc::new(FakeRemote::with_accounts(vec![account("GitHub", "alice", "S0")], an_hour_ago()));
        let db = test_db();
        let manager = device(&db, &remote);
        manager.set_can_sync(false);

        assert!(matches!(manager.sync_now().await, Err(SyncManagerError::Connectivity(_))));
        assert!(db.get_active_accounts().unwrap().is_empty());
        assert_eq!(remote.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_migrated_account_takes_server_secret() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("legacy.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(r#"
                CREATE TABLE accounts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issuer TEXT,
                    account_name TEXT
                );
                INSERT INTO accounts (issuer, account_name) VALUES ('GitLab', 'bob');
            "#).unwrap();
        }

        let db = Arc::new(Database::new(path).expect("Failed to migrate legacy database"));
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitLab", "bob", "REALSECRET")],
            an_hour_ago(),
        ));
        let manager = device(&db, &remote);
        db.create_account(&NewAccount::new(Some("GitHub"), "alice", "S0")).unwrap();

        manager.sync_now().await.expect("Sync should succeed");

        assert_eq!(remote.replace_calls(), 1);
        assert!(remote.accounts().iter().all(|a| !a.secret.is_empty()));
        assert!(remote.accounts().contains(&account("GitLab", "bob", "REALSECRET")));
        assert_eq!(sorted(active(&db)), sorted(remote.accounts()));
        assert!(db.get_dirty_accounts().unwrap().is_empty());
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[tokio::test]
    async fn test_trigger_during_cycle_is_coalesced() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Arc::new(FakeRemote {
            hold_fetch: Some((entered.clone(), release.clone())),
            ..FakeRemote::default()
        });
        let db = test_db();
        let manager = device(&db, &remote);

        let background = manager.clone();
        let first = tokio::spawn(async move { background.sync_now().await });

        entered.notified().await;
        assert_eq!(manager.status().await.unwrap().phase, SyncPhase::Fetching);

        let second = manager.sync_now().await.expect("Coalesced trigger is not an error");
        assert!(matches!(second, SyncOutcome::Coalesced));

        release.notify_one();
        let first = first.await.expect("Sync task panicked").expect("Sync should succeed");
        assert!(matches!(first, SyncOutcome::Completed(_)));

        assert_eq!(manager.history().get_history(10).unwrap().len(), 1);
        assert_eq!(manager.status().await.unwrap().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_edit_during_cycle_survives_and_syncs_next() {
        let remote = Arc::new(FakeRemote::with_accounts(
            vec![account("GitHub", "alice", "S0")],
            an_hour_ago(),
        ));
        let db = test_db();
        let manager = device(&db, &remote);
        manager.sync_now().await.unwrap();

        let id = db.get_active_accounts().unwrap()[0].id;
        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        // User edits alice while the push is in flight
        let hook_db = db.clone();
        *remote.before_replace.lock().unwrap() = Some(Box::new(move || {
            hook_db
                .update_account(id, &AccountUpdate { secret: Some("S9".to_string()), ..Default::default() })
                .expect("Failed to edit during cycle");
        }));

        let report = manager.sync_now().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.skipped, 1);

        let alice = db.get_account(id).unwrap().unwrap();
        assert_eq!(alice.secret, "S9");
        assert!(alice.is_dirty());

        manager.sync_now().await.unwrap();
        assert!(remote.accounts().contains(&account("GitHub", "alice", "S9")));
        assert!(db.get_dirty_accounts().unwrap().is_empty());
    }

    // ========================================================================
    // End-to-end over HTTP (with mockito)
    // ========================================================================

    #[tokio::test]
    async fn test_cycle_against_http_server() {
        use mockito::Matcher;
        use serde_json::json;

        let mut server = mockito::Server::new_async().await;
        let user = json!({
            "status": "ok",
            "data": {
                "owner": "casbin",
                "name": "alice",
                "updatedTime": "2020-01-01T00:00:00Z",
                "mfaAccounts": [{"accountName": "alice", "issuer": "GitHub", "secretKey": "S0"}]
            }
        });
        let get_user = server
            .mock("GET", "/api/get-user")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(user.to_string())
            .expect(2)
            .create_async()
            .await;
        let update_user = server
            .mock("POST", "/api/update-user")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "mfaAccounts": [
                    {"accountName": "carol", "issuer": "GitLab", "secretKey": "S2"},
                    {"accountName": "alice", "issuer": "GitHub", "secretKey": "S0"}
                ]
            })))
            .with_status(200)
            .with_body(json!({"status": "ok"}).to_string())
            .create_async()
            .await;

        let config = ServerConfig {
            server_url: server.url(),
            client_id: "client".to_string(),
            ..ServerConfig::default()
        };
        let client = SyncApiClient::new(config, std::time::Duration::from_secs(5)).unwrap();
        client
            .set_session(UserSession {
                owner: "casbin".to_string(),
                name: "alice".to_string(),
                access_token: "token".to_string(),
            })
            .await;

        let db = test_db();
        db.create_account(&NewAccount::new(Some("GitLab"), "carol", "S2")).unwrap();

        let manager = SyncManager::new(db.clone(), Arc::new(client));
        manager.set_can_sync(true);
        manager.sync_now().await.expect("Sync should succeed");

        get_user.assert_async().await;
        update_user.assert_async().await;
        assert_eq!(db.get_active_accounts().unwrap().len(), 2);
        assert!(db.get_dirty_accounts().unwrap().is_empty());
    }
}
