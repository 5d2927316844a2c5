use keystead_core::{
    GroupId, GroupInfo, GroupStore, StickerPack, StickerStore, StoreError,
    records::{from_cbor, to_cbor},
};

use super::{AccountDatabase, GROUPS, STICKER_PACKS};

impl GroupStore for AccountDatabase {
    fn group(&self, id: &GroupId) -> Result<Option<GroupInfo>, StoreError> {
        self.get(GROUPS, id.as_bytes())?.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn store_group(&self, group: &GroupInfo) -> Result<(), StoreError> {
        self.put(GROUPS, group.group_id().as_bytes(), &to_cbor(group)?)
    }

    fn delete_group(&self, id: &GroupId) -> Result<(), StoreError> {
        self.delete(GROUPS, id.as_bytes())
    }

    fn groups(&self) -> Result<Vec<GroupInfo>, StoreError> {
        self.scan(GROUPS, &[])?.into_iter().map(|(_, value)| from_cbor(&value)).collect()
    }
}

impl StickerStore for AccountDatabase {
    fn sticker_pack(&self, pack_id: &[u8]) -> Result<Option<StickerPack>, StoreError> {
        self.get(STICKER_PACKS, pack_id)?.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn store_sticker_pack(&self, pack: &StickerPack) -> Result<(), StoreError> {
        self.put(STICKER_PACKS, &pack.pack_id, &to_cbor(pack)?)
    }

    fn sticker_packs(&self) -> Result<Vec<StickerPack>, StoreError> {
        self.scan(STICKER_PACKS, &[])?.into_iter().map(|(_, value)| from_cbor(&value)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use keystead_core::{GroupInfoV1, GroupInfoV2, RecipientId, settings::TrustNewIdentity};
    use tempfile::tempdir;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_both_group_generations_persist() {
        let dir = tempdir().unwrap();
        let db = AccountDatabase::open(dir.path().join("account.db"), TrustNewIdentity::default())
            .unwrap();
        let v1 = GroupInfo::V1(GroupInfoV1 {
            group_id: GroupId(vec![1; 16]),
            expected_v2_id: None,
            name: Some("old".into()),
            members: BTreeSet::from([RecipientId(1), RecipientId(2)]),
            color: None,
            message_expiration_time: 0,
            blocked: false,
            archived: false,
        });
        let v2 = GroupInfo::V2(GroupInfoV2 {
            group_id: GroupId(vec![2; 32]),
            master_key: vec![3; 32],
            group_data: None,
            blocked: true,
            permission_denied: false,
            distribution_id: Uuid::new_v4(),
        });

        db.store_group(&v1).unwrap();
        db.store_group(&v2).unwrap();

        assert_eq!(db.group(v1.group_id()).unwrap(), Some(v1.clone()));
        assert_eq!(db.groups().unwrap().len(), 2);
        db.delete_group(v1.group_id()).unwrap();
        assert_eq!(db.groups().unwrap(), vec![v2]);
    }

    #[test]
    fn test_sticker_pack_replaced_in_place() {
        let dir = tempdir().unwrap();
        let db = AccountDatabase::open(dir.path().join("account.db"), TrustNewIdentity::default())
            .unwrap();
        let mut pack = StickerPack { pack_id: vec![7; 16], pack_key: vec![8; 32], installed: false };
        db.store_sticker_pack(&pack).unwrap();
        pack.installed = true;
        db.store_sticker_pack(&pack).unwrap();

        assert_eq!(db.sticker_packs().unwrap(), vec![pack.clone()]);
        assert_eq!(db.sticker_pack(&pack.pack_id).unwrap(), Some(pack));
    }
}
