//! Property tests for pre-key allocation through a live account.
//!
//! Each case opens a fresh on-disk account, so case counts are kept low.

use keystead_account::{Account, AccountError, NewAccount};
use keystead_core::{
    IdentityKeyPair, IdentityRole, KyberPreKeyRecord, PREKEY_MAXIMUM_ID, PreKeyCollection,
    PreKeyRecord, PreKeyStream, ProfileKey, ServiceEnvironment, Settings,
};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn new_account(seed: u64) -> NewAccount {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    NewAccount {
        number: "+15550555".to_owned(),
        service_environment: ServiceEnvironment::Live,
        aci_identity_key_pair: IdentityKeyPair::generate(&mut rng),
        pni_identity_key_pair: IdentityKeyPair::generate(&mut rng),
        registration_id: 1,
        pni_registration_id: 2,
        profile_key: ProfileKey::generate(&mut rng),
    }
}

fn role_strategy() -> impl Strategy<Value = IdentityRole> {
    prop_oneof![Just(IdentityRole::Aci), Just(IdentityRole::Pni)]
}

fn kyber(id: u32) -> KyberPreKeyRecord {
    KyberPreKeyRecord { id, timestamp: 0, key_pair: vec![1], signature: vec![2] }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: batches built from the advertised next id are always
    /// accepted and stored, and the stream ends exactly past the last id
    #[test]
    fn prop_sequential_batches_are_accepted(
        seed in any::<u64>(),
        role in role_strategy(),
        batches in prop::collection::vec(1u32..20, 1..5)
    ) {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+15550555", new_account(seed), Settings::default()).unwrap();
        let start = account.pre_key_metadata(role).next_id(PreKeyStream::OneTime);

        let mut total = 0u32;
        for len in batches {
            let next = account.pre_key_metadata(role).next_id(PreKeyStream::OneTime);
            let records: Vec<_> = (0..len)
                .map(|i| PreKeyRecord { id: (next + i) % PREKEY_MAXIMUM_ID, key_pair: vec![0; 4] })
                .collect();
            account.add_pre_keys(role, &records).unwrap();
            total += len;
        }

        let meta = account.pre_key_metadata(role);
        prop_assert_eq!(meta.next_id(PreKeyStream::OneTime), (start + total) % PREKEY_MAXIMUM_ID);
        let store = account.protocol_store(role).unwrap().protocol;
        prop_assert_eq!(store.pre_key_ids().unwrap().len(), total as usize);
    }

    /// Property: a batch starting anywhere but the next id is rejected
    /// without touching the store or the allocator
    #[test]
    fn prop_misaligned_batch_is_rejected(
        seed in any::<u64>(),
        role in role_strategy(),
        skew in 1u32..1000,
    ) {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+15550555", new_account(seed), Settings::default()).unwrap();
        let before = account.pre_key_metadata(role);
        let first = (before.next_id(PreKeyStream::Kyber) + skew) % PREKEY_MAXIMUM_ID;

        let err = account.add_kyber_pre_keys(role, &[kyber(first)]).unwrap_err();

        let is_desync = matches!(err, AccountError::PreKeyIdDesync { .. });
        prop_assert!(is_desync);
        prop_assert_eq!(account.pre_key_metadata(role), before);
        let store = account.protocol_store(role).unwrap().protocol;
        prop_assert!(store.kyber_pre_key_ids().unwrap().is_empty());
    }

    /// Property: after clearing, the very next last-resort key lands on the
    /// reseeded id and becomes active
    #[test]
    fn prop_clear_then_last_resort(seed in any::<u64>(), role in role_strategy()) {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+15550555", new_account(seed), Settings::default()).unwrap();
        let old = account.pre_key_metadata(role).next_id(PreKeyStream::Kyber);
        account.add_kyber_pre_keys(role, &[kyber(old)]).unwrap();

        account.clear_all_pre_keys(role).unwrap();
        let fresh = account.pre_key_metadata(role).next_id(PreKeyStream::Kyber);
        prop_assert!(fresh < PREKEY_MAXIMUM_ID);
        prop_assert_ne!(fresh, (old + 1) % PREKEY_MAXIMUM_ID);

        account.add_last_resort_kyber_pre_key(role, &kyber(fresh)).unwrap();
        let meta = account.pre_key_metadata(role);
        prop_assert_eq!(meta.active_last_resort_kyber_pre_key_id(), Some(fresh));
        let store = account.protocol_store(role).unwrap().protocol;
        prop_assert_eq!(store.kyber_pre_key_ids().unwrap(), vec![fresh]);
    }
}

#[test]
fn test_rejected_collection_survives_reload_unchanged() {
    let dir = tempdir().unwrap();
    let mut account =
        Account::create(dir.path(), "+15550555", new_account(7), Settings::default()).unwrap();
    let before = account.pre_key_metadata(IdentityRole::Pni);
    let collection = PreKeyCollection {
        one_time_pre_key_offset: 10,
        next_signed_pre_key_id: 10,
        one_time_kyber_pre_key_offset: 500,
        one_time_pre_keys: Vec::new(),
        signed_pre_key: None,
        one_time_kyber_pre_keys: vec![kyber(501)],
        last_resort_kyber_pre_key: None,
    };

    let err = account.set_pre_keys(IdentityRole::Pni, &collection).unwrap_err();
    assert!(matches!(err, AccountError::PreKeyIdDesync { .. }));
    assert_eq!(account.pre_key_metadata(IdentityRole::Pni), before);
    account.close();

    let account = Account::load(dir.path(), "+15550555", false, Settings::default()).unwrap();
    assert_eq!(account.pre_key_metadata(IdentityRole::Pni), before);
}
