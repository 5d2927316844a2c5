//! Records kept about other parties: trust, contacts, profiles, groups and
//! sticker packs.

use std::{collections::BTreeSet, fmt};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{identifiers::RecipientId, keys::IdentityKey};

/// Messaging service deployment an account is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEnvironment {
    /// Production service
    Live,
    /// Staging service
    Staging,
}

impl fmt::Display for ServiceEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("LIVE"),
            Self::Staging => f.write_str("STAGING"),
        }
    }
}

/// How far a remote identity key is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Key changed or was never approved
    Untrusted,
    /// Accepted without out-of-band verification
    TrustedUnverified,
    /// Verified out of band (safety number comparison)
    TrustedVerified,
}

impl TrustLevel {
    /// Decode the integer form used by legacy stores. Unknown values map
    /// to [`TrustLevel::Untrusted`].
    pub fn from_legacy(value: i64) -> Self {
        match value {
            1 => Self::TrustedUnverified,
            2 => Self::TrustedVerified,
            _ => Self::Untrusted,
        }
    }

    /// Whether messages may be sent to a key at this level.
    pub fn is_trusted(self) -> bool {
        !matches!(self, Self::Untrusted)
    }
}

/// Stored identity of a remote service id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    /// Last identity key seen
    pub identity_key: IdentityKey,
    /// Trust assigned to that key
    pub trust_level: TrustLevel,
    /// When the key was first stored, in milliseconds since the epoch
    pub added_timestamp: u64,
}

/// Locally kept contact details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Given name as entered locally
    pub given_name: Option<String>,
    /// Family name as entered locally
    pub family_name: Option<String>,
    /// Conversation color
    pub color: Option<String>,
    /// Disappearing-message timer in seconds, 0 when disabled
    pub message_expiration_time: u32,
    /// Messages from this contact are dropped
    pub blocked: bool,
    /// Conversation is archived
    pub archived: bool,
    /// Own profile is shared with this contact
    pub profile_sharing: bool,
}

impl Contact {
    /// Copy of this contact with a different expiration timer.
    #[must_use]
    pub fn with_message_expiration_time(mut self, seconds: u32) -> Self {
        self.message_expiration_time = seconds;
        self
    }
}

/// Optional feature advertised by a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Storage service sync
    Storage,
    /// Group V1 to V2 migration
    Gv1Migration,
    /// Sender key distribution
    SenderKey,
    /// Announcement-only groups
    AnnouncementGroup,
    /// Phone number change
    ChangeNumber,
    /// Stories
    Stories,
}

/// Sealed-sender access level of a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnidentifiedAccessMode {
    /// Not yet fetched
    #[default]
    Unknown,
    /// Sealed sender not accepted
    Disabled,
    /// Accepted with a valid access key
    Enabled,
    /// Accepted from anyone
    Unrestricted,
}

/// Cached remote profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// When the profile was fetched, milliseconds since the epoch
    pub last_update_timestamp: u64,
    /// Decrypted given name
    pub given_name: Option<String>,
    /// Decrypted family name
    pub family_name: Option<String>,
    /// About text
    pub about: Option<String>,
    /// About emoji
    pub about_emoji: Option<String>,
    /// Server path of the avatar
    pub avatar_url_path: Option<String>,
    /// Payment address
    pub mobile_coin_address: Option<Vec<u8>>,
    /// Sealed-sender access level
    pub unidentified_access_mode: UnidentifiedAccessMode,
    /// Advertised capabilities
    pub capabilities: BTreeSet<Capability>,
}

/// Binary group identifier. V1 ids are 16 bytes, V2 ids 32.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    /// Decode the standard base64 form used in legacy documents.
    pub fn from_base64(text: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(text).map(Self)
    }

    /// Standard base64 form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Legacy group, membership kept locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfoV1 {
    /// 16-byte group id
    pub group_id: GroupId,
    /// Id of the V2 group this one migrates to, if announced
    pub expected_v2_id: Option<GroupId>,
    /// Display name
    pub name: Option<String>,
    /// Members, as recipient ids
    pub members: BTreeSet<RecipientId>,
    /// Conversation color
    pub color: Option<String>,
    /// Disappearing-message timer in seconds
    pub message_expiration_time: u32,
    /// Group is blocked
    pub blocked: bool,
    /// Conversation is archived
    pub archived: bool,
}

/// Server-managed group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfoV2 {
    /// 32-byte group id
    pub group_id: GroupId,
    /// Group master key
    pub master_key: Vec<u8>,
    /// Last fetched encrypted group state
    pub group_data: Option<Vec<u8>>,
    /// Group is blocked
    pub blocked: bool,
    /// Own account lacks permission to read the group
    pub permission_denied: bool,
    /// Sender key distribution id
    pub distribution_id: Uuid,
}

/// A group of either generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupInfo {
    /// Legacy group
    V1(GroupInfoV1),
    /// Server-managed group
    V2(GroupInfoV2),
}

impl GroupInfo {
    /// Id of the group.
    pub fn group_id(&self) -> &GroupId {
        match self {
            Self::V1(group) => &group.group_id,
            Self::V2(group) => &group.group_id,
        }
    }
}

/// Installed or known sticker pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerPack {
    /// Pack id
    pub pack_id: Vec<u8>,
    /// Pack decryption key
    pub pack_key: Vec<u8>,
    /// Pack is installed
    pub installed: bool,
}
