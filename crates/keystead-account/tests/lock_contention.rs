//! Cross-instance exclusion on the descriptor file.

use std::{
    fs,
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use keystead_account::{Account, AccountError, AccountPaths};
use keystead_core::{IdentityRole, RecipientAddress, Settings, StoreError};
use tempfile::tempdir;
use uuid::Uuid;

const NUMBER: &str = "+15550777";

fn write_minimal_descriptor(paths: &AccountPaths) {
    fs::write(
        paths.descriptor_file(),
        format!(r#"{{"version": 7, "username": "{NUMBER}", "registered": false}}"#),
    )
    .unwrap();
}

#[test]
fn test_concurrent_fail_fast_loads_admit_exactly_one() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    write_minimal_descriptor(&paths);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let data_dir = dir.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                let result = Account::load(&data_dir, NUMBER, false, Settings::default());
                // Hold a winning account until both attempts are done
                barrier.wait();
                result.map(|_| ())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(loser, AccountError::Locked { .. }));

    // The file is intact and loadable again
    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    assert_eq!(account.number(), NUMBER);
}

#[test]
fn test_locked_account_stays_with_its_owner() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    write_minimal_descriptor(&paths);

    let owner = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    let err = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap_err();
    assert!(matches!(err, AccountError::Locked { .. }));

    // The owner can still write
    owner.set_aci(Uuid::new_v4());
    owner.set_registered(true).unwrap();
    drop(owner);
    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    assert!(account.is_registered());
}

#[test]
fn test_waiting_load_proceeds_after_close() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    write_minimal_descriptor(&paths);

    let mut owner = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    let data_dir = dir.path().to_path_buf();
    let waiter = thread::spawn(move || {
        Account::load(&data_dir, NUMBER, true, Settings::default()).map(|account| account.number())
    });

    thread::sleep(Duration::from_millis(100));
    owner.set_aci(Uuid::new_v4());
    owner.set_registered(true).unwrap();
    owner.close();

    assert_eq!(waiter.join().unwrap().unwrap(), NUMBER);
}

#[test]
fn test_reload_after_close_with_outstanding_handles() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    write_minimal_descriptor(&paths);

    let mut account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    let shared = account.shared_store().unwrap();
    let aci = account.protocol_store(IdentityRole::Aci).unwrap();
    account.close();

    let reloaded = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    assert!(reloaded.self_recipient_id().is_ok());

    // Handles from the closed instance are dead, not silently reopened
    assert_eq!(shared.find(&RecipientAddress::from_number(NUMBER)), Err(StoreError::Closed));
    assert_eq!(aci.protocol.pre_key_ids(), Err(StoreError::Closed));
}
