//! Per-process settings and the account's persisted configuration.

use serde::{Deserialize, Serialize};

use crate::model::TrustLevel;

/// Policy for identity keys seen for the first time or after a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustNewIdentity {
    /// Trust every new key
    Always,
    /// Trust the first key of a service id, distrust any later change
    #[default]
    OnFirstUse,
    /// Never trust a key without explicit verification
    Never,
}

impl TrustNewIdentity {
    /// Trust level given to a newly stored key.
    ///
    /// `first_seen` is true if no key was stored before for the service id.
    pub fn initial_trust(self, first_seen: bool) -> TrustLevel {
        match self {
            Self::Always => TrustLevel::TrustedUnverified,
            Self::OnFirstUse if first_seen => TrustLevel::TrustedUnverified,
            Self::OnFirstUse | Self::Never => TrustLevel::Untrusted,
        }
    }
}

/// Settings supplied by the embedding process when an account is opened.
///
/// Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// Trust policy for new identity keys
    pub trust_new_identity: TrustNewIdentity,
    /// Skip recording sent messages for resend requests
    pub disable_message_send_log: bool,
}

/// Who may see the account's phone number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhoneNumberSharingMode {
    /// Everyone
    Everybody,
    /// Contacts only
    Contacts,
    /// Nobody
    Nobody,
}

/// Account preferences embedded in the descriptor as `configurationStore`.
///
/// Every field is optional; `None` means the preference was never set and
/// the service default applies. Unknown keys in stored documents are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStore {
    /// Send read receipts
    pub read_receipts: Option<bool>,
    /// Show sealed-sender indicators
    pub unidentified_delivery_indicators: Option<bool>,
    /// Send typing indicators
    pub typing_indicators: Option<bool>,
    /// Generate link previews
    pub link_previews: Option<bool>,
    /// Phone number visibility
    pub phone_number_sharing_mode: Option<PhoneNumberSharingMode>,
    /// Hide from phone number discovery
    pub phone_number_unlisted: Option<bool>,
    /// Serialized username link
    pub username_link: Option<String>,
}

impl ConfigurationStore {
    /// Whether the account can be found by phone number.
    pub fn is_discoverable_by_phone_number(&self) -> bool {
        self.phone_number_unlisted != Some(true)
    }
}
