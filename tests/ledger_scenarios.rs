//! End-to-end ledger scenarios against a real sled database and mirror

use chrono::{Duration, TimeZone, Utc};
use rewards_ledger::replication::{MirrorKey, MirrorSink};
use rewards_ledger::{
    Action, Clock, Config, FsMirror, Ledger, LedgerDb, LedgerError, ManualClock, PlanName, Rejection,
    Replicator, Reward, Task, UserRecord,
};
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().join("data"),
        mirror_dir: Some(dir.path().join("mirror")),
        ..Config::default()
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()))
}

#[tokio::test]
async fn test_new_user_redeems_code() {
    let temp_dir = TempDir::new().unwrap();
    let clock = clock();
    let ledger = Ledger::open(&test_config(&temp_dir), Replicator::disabled(), clock.clone())
        .await
        .unwrap();

    ledger
        .add_code("AB12CD34EF56GH78", Reward::credits(50).with_plan(PlanName::Premium, 30))
        .await
        .unwrap();

    let registration = ledger.register_if_absent(42, "Alice").await.unwrap();
    assert!(registration.created);
    assert_eq!(registration.record.plan.name, PlanName::Free);
    assert_eq!(registration.record.credits, 0);

    let change = ledger.adjust_credits(42, 3, "free-refill").await.unwrap();
    assert_eq!(change.new_balance, 3);

    let outcome = ledger.redeem_code(42, "AB12CD34EF56GH78").await.unwrap();
    assert_eq!(outcome.new_balance, 53);

    let profile = ledger.get_profile(42).await.unwrap();
    assert_eq!(profile.plan.name, PlanName::Premium);
    assert_eq!(profile.plan.expires_at, Some(clock.now() + Duration::days(30)));
    assert!(profile.redeemed_codes.contains("AB12CD34EF56GH78"));

    let err = ledger.redeem_code(42, "AB12CD34EF56GH78").await.unwrap_err();
    assert!(matches!(err, LedgerError::Rejected(Rejection::AlreadyUsedByThisUser)));
    assert_eq!(ledger.get_profile(42).await.unwrap().credits, 53);

    let code = ledger.get_code("ab12cd34ef56gh78").unwrap().unwrap();
    assert_eq!(code.used_by, Some(42));
}

#[tokio::test]
async fn test_referral_flow() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(&test_config(&temp_dir), Replicator::disabled(), clock())
        .await
        .unwrap();

    ledger.record_referral_intent(1, 2).await.unwrap();
    let inviter = ledger.get_profile(1).await.unwrap();
    assert!(inviter.referrals.pending.contains(&2));
    assert_eq!(inviter.referrals.total_count, 1);

    let verification = ledger.verify_sponsor(2).await.unwrap();
    assert!(verification.newly_verified);
    let completion = verification.referral.unwrap();
    assert_eq!(completion.inviter_balance, 2);
    assert_eq!(completion.new_badges, vec!["Referrer Lv1".to_string()]);

    let inviter = ledger.get_profile(1).await.unwrap();
    assert!(!inviter.referrals.pending.contains(&2));
    assert!(inviter.referrals.completed.contains(&2));
    assert_eq!(inviter.credits, 2);
    assert!(inviter.badges.contains("Referrer Lv1"));

    let err = ledger.complete_referral(2).await.unwrap_err();
    assert!(matches!(err, LedgerError::Rejected(Rejection::ReferralAlreadyCompleted)));
    assert_eq!(ledger.get_profile(1).await.unwrap().credits, 2);
}

#[tokio::test]
async fn test_plan_lifecycle_with_consumption() {
    let temp_dir = TempDir::new().unwrap();
    let clock = clock();
    let ledger = Ledger::open(&test_config(&temp_dir), Replicator::disabled(), clock.clone())
        .await
        .unwrap();

    ledger.set_plan(7, "elite", 0).await.unwrap();
    for _ in 0..10 {
        ledger.consume(7, Action::Download).await.unwrap();
    }
    let err = ledger.consume(7, Action::Download).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Rejected(Rejection::DownloadLimitReached { limit: 10 })
    ));

    clock.advance(Duration::days(45));
    assert!(ledger.check_and_expire_plan(7).await.unwrap().expired);
    assert!(!ledger.check_and_expire_plan(7).await.unwrap().expired);

    let profile = ledger.get_profile(7).await.unwrap();
    assert_eq!(profile.plan.name, PlanName::Free);
    assert_eq!(profile.usage.downloads_today, 0);

    assert!(ledger.refill_free_credits(7).await.unwrap().refilled);
    assert!(!ledger.refill_free_credits(7).await.unwrap().refilled);
    assert_eq!(ledger.get_profile(7).await.unwrap().credits, 3);
}

#[tokio::test]
async fn test_tasks_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let clock = clock();

    {
        let ledger = Ledger::open(&config, Replicator::disabled(), clock.clone()).await.unwrap();
        ledger
            .add_task(Task {
                id: "follow_channel".to_string(),
                title: "Follow the channel".to_string(),
                reward_credits: 4,
                link: None,
            })
            .await
            .unwrap();
        ledger.open_task(9, "follow_channel").await.unwrap();
        ledger.flush().await.unwrap();
    }

    clock.advance(Duration::seconds(6));
    let ledger = Ledger::open(&config, Replicator::disabled(), clock.clone()).await.unwrap();
    assert_eq!(ledger.list_tasks().unwrap().len(), 1);

    let done = ledger.complete_task(9, "follow_channel").await.unwrap();
    assert_eq!(done.new_balance, 4);
}

#[tokio::test]
async fn test_commits_reach_mirror_and_restore() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let mirror = Arc::new(FsMirror::new(config.mirror_path()).await.unwrap());
    let (replicator, worker) = Replicator::spawn(mirror.clone(), config.replication_queue_capacity);

    {
        let ledger = Ledger::open(&config, replicator.clone(), clock()).await.unwrap();
        ledger.register_if_absent(42, "Alice").await.unwrap();
        ledger.adjust_credits(42, 10, "grant").await.unwrap();
        ledger.add_code("AB12CD34EF56GH78", Reward::credits(5)).await.unwrap();
        replicator.barrier().await;
    }

    let bytes = mirror.get(&MirrorKey::User(42)).await.unwrap().unwrap();
    let mirrored: UserRecord = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(mirrored.credits, 10);
    assert_eq!(mirrored.display_name, "Alice");
    assert!(mirror
        .get(&MirrorKey::Code("AB12CD34EF56GH78".into()))
        .await
        .unwrap()
        .is_some());

    drop(replicator);
    worker.await.unwrap();

    // Lost primary database: rebuild from the mirror
    let fresh = Ledger::new(LedgerDb::temporary().unwrap(), &config, Replicator::disabled(), clock()).unwrap();
    let report = fresh.restore_from_mirror(mirror.as_ref()).await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(fresh.get_profile(42).await.unwrap().credits, 10);

    let again = fresh.restore_from_mirror(mirror.as_ref()).await.unwrap();
    assert_eq!(again.restored, 0);
    assert_eq!(again.skipped, 2);

    fresh.redeem_code(42, "AB12CD34EF56GH78").await.unwrap();
    assert_eq!(fresh.get_profile(42).await.unwrap().credits, 15);
}

#[tokio::test]
async fn test_mirror_failure_does_not_fail_commit() {
    struct BrokenMirror;

    #[async_trait::async_trait]
    impl MirrorSink for BrokenMirror {
        async fn put(
            &self,
            _key: &MirrorKey,
            _bytes: &[u8],
        ) -> Result<rewards_ledger::replication::PutOutcome, rewards_ledger::StorageError> {
            Err(rewards_ledger::StorageError::Internal("unreachable".into()))
        }

        async fn get(&self, _key: &MirrorKey) -> Result<Option<Vec<u8>>, rewards_ledger::StorageError> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<MirrorKey>, rewards_ledger::StorageError> {
            Ok(Vec::new())
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let (replicator, _worker) = Replicator::spawn(Arc::new(BrokenMirror), 8);
    let ledger = Ledger::open(&test_config(&temp_dir), replicator.clone(), clock())
        .await
        .unwrap();

    let change = ledger.adjust_credits(1, 5, "grant").await.unwrap();
    assert_eq!(change.new_balance, 5);
    replicator.barrier().await;
    assert!(replicator.snapshot().failed >= 1);
    assert_eq!(ledger.get_profile(1).await.unwrap().credits, 5);
}
