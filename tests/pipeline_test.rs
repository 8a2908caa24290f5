//! End-to-end pipeline runs against in-memory collaborators

mod common;

use common::*;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

use storage_accounting::charge::ChargeResolver;
use storage_accounting::pipeline::{AccountingPipeline, PushTarget, ReportOptions};
use storage_accounting::pool::BoundedPool;
use storage_accounting::report::{FLAT_FILE, GROUPS_FILE, GROUP_ROLES_FILE, RECEIVER_FILE, SIMPLIFIED_FILE};

fn storage() -> FakeStorage {
    FakeStorage::default()
        .with_entity(PROJECT_A, "/eos/project/a/atlas/", 10)
        .with_entity(PROJECT_A, "/eos/project/a/alpha/", 20)
        .with_entity(PROJECT_A, "/eos/project/a/orphan/", 99)
        .with_entity(PROJECT_B, "/eos/project/b/beta/", 30)
        .with_entity(HOME_A, "/eos/user/a/alice/", 10)
        .with_quota(PROJECT_A, "alice", 2_000_000_000_000, 1_000_000_000_000)
        .with_quota(PROJECT_A, "svc", 100, 50)
        .with_quota(PROJECT_B, "bob", 10, 5)
        .with_quota(HOME_A, "alice", 100, 10)
}

fn accounts() -> FakeAccounts {
    FakeAccounts::default()
        .with(10, "alice")
        .with(20, "svc")
        .with(30, "bob")
}

fn directory() -> FakeDirectory {
    FakeDirectory::default()
        .with_primary("alice", "IT")
        .with_primary("bob", "EP")
        .with_service("svc", "alice")
}

fn charges() -> FakeChargeApi {
    FakeChargeApi::default()
        .with_group("alice", "IT")
        .with_group("svc", "IT")
}

fn data_lines(content: &str) -> Vec<Vec<String>> {
    content
        .lines()
        .skip(1)
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_run_with_charging() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());

    let storage = Arc::new(storage());
    let charge_api = Arc::new(charges());
    let receiver = Arc::new(FakeReceiver::default());
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(storage.clone(), accounts(), directory(), charge_api.clone(), receiver.clone()),
    );

    let options = ReportOptions {
        charging: true,
        user_also: true,
        push: Some(PushTarget::Dev),
        archive: true,
        ..ReportOptions::from_config(&config)
    };
    let summary = pipeline.run(&options).await.unwrap();

    assert_eq!(summary.entities, 5);
    assert_eq!(summary.retained, 3);
    assert_eq!(summary.files.len(), 5);
    assert_eq!(summary.pushed_to.as_deref(), Some(config.billing.receiver_dev_url.as_str()));

    // flat view keeps unclassified entities
    let flat = data_lines(&fs::read_to_string(out.path().join(FLAT_FILE)).unwrap());
    assert_eq!(flat.len(), 5);
    let orphan = flat.iter().find(|r| r[3] == "/eos/project/a/orphan/").unwrap();
    assert_eq!(orphan[10], "");
    assert_eq!(orphan[17], "Unknown");
    assert_eq!(orphan[18], "CERNBox Project orphan");
    let alpha = flat.iter().find(|r| r[3] == "/eos/project/a/alpha/").unwrap();
    assert_eq!(alpha[9], "Service-Account");
    assert_eq!(alpha[11], "alice");
    assert_eq!(alpha[17], "IT");

    let groups = data_lines(&fs::read_to_string(out.path().join(GROUPS_FILE)).unwrap());
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0][0], "2000000000200");
    assert_eq!(groups[0][1], "1000000000060");
    assert_eq!(groups[0][5], "IT");

    let roles = data_lines(&fs::read_to_string(out.path().join(GROUP_ROLES_FILE)).unwrap());
    let role_keys: Vec<_> = roles.iter().map(|r| r[6].as_str()).collect();
    assert_eq!(
        role_keys,
        vec!["CERNBox Project alpha", "CERNBox Project atlas", "Primary-Account"]
    );

    let simple = data_lines(&fs::read_to_string(out.path().join(SIMPLIFIED_FILE)).unwrap());
    assert_eq!(simple.len(), 2);
    assert_eq!(simple[0][6], "Home Directories");
    assert_eq!(simple[0][1], "10");
    assert_eq!(simple[1][6], "Project Spaces");
    assert_eq!(simple[1][1], "1000000000050");

    // one chunk, accounts with an identity only
    assert_eq!(*charge_api.chunks.lock().unwrap(), vec![4]);

    let pushes = receiver.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1["MessageFormatVersion"], 3);
    assert_eq!(pushes[0].1["data"].as_array().unwrap().len(), 3);
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join(RECEIVER_FILE)).unwrap()).unwrap();
    assert_eq!(written, pushes[0].1);

    let ops = storage.ops.lock().unwrap();
    assert_eq!(ops.len(), 6);
    assert!(ops[0].starts_with("mkdir root://eosproject-f.cern.ch"));
    assert!(ops[1].ends_with("/accounting.txt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_identity_failure_completes_run() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());

    // uid 99 has no local account
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(
            Arc::new(storage()),
            accounts(),
            directory(),
            Arc::new(charges()),
            Arc::new(FakeReceiver::default()),
        ),
    );

    let summary = pipeline.run(&ReportOptions::from_config(&config)).await.unwrap();
    assert_eq!(summary.entities, 4);
    assert_eq!(summary.files.len(), 1);

    let flat = data_lines(&fs::read_to_string(out.path().join(FLAT_FILE)).unwrap());
    let resolved = flat.iter().filter(|r| !r[10].is_empty()).count();
    assert_eq!(resolved, 3);

    // without charging the charge columns stay empty
    assert!(flat.iter().all(|r| r[17].is_empty() && r[18].is_empty()));
    assert!(!out.path().join(GROUPS_FILE).exists());
}

#[tokio::test]
async fn test_show_invalid_keeps_unknown_groups() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(
            Arc::new(storage()),
            accounts(),
            directory(),
            Arc::new(charges()),
            Arc::new(FakeReceiver::default()),
        ),
    );

    let options = ReportOptions {
        charging: true,
        show_invalid: true,
        ..ReportOptions::from_config(&config)
    };
    let summary = pipeline.run(&options).await.unwrap();
    assert_eq!(summary.retained, 4);

    let groups = data_lines(&fs::read_to_string(out.path().join(GROUPS_FILE)).unwrap());
    let names: Vec<_> = groups.iter().map(|r| r[5].as_str()).collect();
    assert_eq!(names, vec!["IT", "Unknown"]);
}

#[tokio::test]
async fn test_limit_is_per_category() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(
            Arc::new(storage()),
            accounts(),
            directory(),
            Arc::new(charges()),
            Arc::new(FakeReceiver::default()),
        ),
    );

    let options = ReportOptions {
        limit: Some(2),
        user_also: true,
        ..ReportOptions::from_config(&config)
    };
    let summary = pipeline.run(&options).await.unwrap();
    assert_eq!(summary.entities, 3);
}

#[tokio::test]
async fn test_listing_failure_aborts_run() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());
    let storage = FakeStorage {
        fail_list_on: Some(PROJECT_B.to_string()),
        ..storage()
    };
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(
            Arc::new(storage),
            accounts(),
            directory(),
            Arc::new(charges()),
            Arc::new(FakeReceiver::default()),
        ),
    );

    let err = pipeline.run(&ReportOptions::from_config(&config)).await.unwrap_err();
    assert!(format!("{:#}", err).contains("eosproject-b"));
    assert!(!out.path().join(FLAT_FILE).exists());
}

#[tokio::test]
async fn test_quota_failure_aborts_run() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());
    let storage = FakeStorage {
        fail_quota_on: Some(PROJECT_A.to_string()),
        ..storage()
    };
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(
            Arc::new(storage),
            accounts(),
            directory(),
            Arc::new(charges()),
            Arc::new(FakeReceiver::default()),
        ),
    );

    assert!(pipeline.run(&ReportOptions::from_config(&config)).await.is_err());
}

#[tokio::test]
async fn test_charge_failure_aborts_run() {
    let out = TempDir::new().unwrap();
    let config = test_config(out.path());
    let receiver = Arc::new(FakeReceiver::default());
    let failing = FakeChargeApi {
        fail: true,
        ..charges()
    };
    let pipeline = AccountingPipeline::new(
        config.clone(),
        collaborators(Arc::new(storage()), accounts(), directory(), Arc::new(failing), receiver.clone()),
    );

    let options = ReportOptions {
        charging: true,
        push: Some(PushTarget::Prod),
        ..ReportOptions::from_config(&config)
    };
    assert!(pipeline.run(&options).await.is_err());
    assert!(receiver.pushes.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_charge_chunks_go_out_one_at_a_time() {
    let api = Arc::new(FakeChargeApi::default());
    let resolver = ChargeResolver::new(api.clone(), 1000);
    let accounts: Vec<String> = (0..2500).map(|i| format!("user{}", i)).collect();

    let charges = resolver
        .resolve(&accounts, &BoundedPool::new("charge", 1))
        .await
        .unwrap();

    assert!(charges.is_empty());
    assert_eq!(*api.chunks.lock().unwrap(), vec![1000, 1000, 500]);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_charge_chunk_sends_no_further_chunks() {
    let api = Arc::new(FakeChargeApi {
        fail: true,
        ..FakeChargeApi::default()
    });
    let resolver = ChargeResolver::new(api.clone(), 1000);
    let accounts: Vec<String> = (0..2500).map(|i| format!("user{}", i)).collect();

    let result = resolver.resolve(&accounts, &BoundedPool::new("charge", 1)).await;

    assert!(result.is_err());
    assert_eq!(*api.chunks.lock().unwrap(), vec![1000]);
}
