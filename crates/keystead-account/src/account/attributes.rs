//! Snapshots handed to the registration handshake and the transport.

use std::collections::BTreeSet;

use keystead_core::{Capability, UnidentifiedAccessMode};
use uuid::Uuid;

use super::Account;
use crate::{error::AccountError, stores::StoreProvider};

/// Capabilities announced by every device.
const CAPABILITIES: [Capability; 5] = [
    Capability::Gv1Migration,
    Capability::SenderKey,
    Capability::AnnouncementGroup,
    Capability::ChangeNumber,
    Capability::Stories,
];

/// Attributes sent to the service when registering or updating the
/// account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAttributes {
    /// ACI registration id
    pub registration_id: u32,
    /// PNI registration id
    pub pni_registration_id: u32,
    /// The client fetches messages itself
    pub fetches_messages: bool,
    /// Registration lock token
    pub registration_lock: Option<String>,
    /// Access key derived from the own profile key
    pub unidentified_access_key: Option<[u8; 16]>,
    /// Anyone may send sealed-sender messages to this account
    pub unrestricted_unidentified_access: bool,
    /// Announced capabilities
    pub capabilities: BTreeSet<Capability>,
    /// Whether the account can be found by phone number
    pub discoverable_by_phone_number: bool,
    /// Encrypted device name
    pub encrypted_device_name: Option<String>,
}

/// Identity the transport authenticates with.
pub trait CredentialsProvider {
    /// Account identifier
    fn aci(&self) -> Option<Uuid>;
    /// Phone number identifier
    fn pni(&self) -> Option<Uuid>;
    /// Phone number
    fn e164(&self) -> &str;
    /// Service password
    fn password(&self) -> Option<&str>;
    /// Device id of this installation
    fn device_id(&self) -> u32;
}

/// Credentials as of the moment they were taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    aci: Option<Uuid>,
    pni: Option<Uuid>,
    number: String,
    password: Option<String>,
    device_id: u32,
}

impl CredentialsProvider for Credentials {
    fn aci(&self) -> Option<Uuid> {
        self.aci
    }

    fn pni(&self) -> Option<Uuid> {
        self.pni
    }

    fn e164(&self) -> &str {
        &self.number
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl Account {
    /// Current credentials.
    pub fn credentials(&self) -> Credentials {
        let state = self.lock_state();
        Credentials {
            aci: state.aci,
            pni: state.pni,
            number: state.number.clone(),
            password: state.password.clone(),
            device_id: state.device_id,
        }
    }

    /// Capabilities this device announces. Storage is reserved for the
    /// primary device.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut capabilities = BTreeSet::from(CAPABILITIES);
        if self.is_primary_device() {
            capabilities.insert(Capability::Storage);
        }
        capabilities
    }

    /// Whether the own profile allows sealed-sender messages from anyone.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn is_unrestricted_unidentified_access(&self) -> Result<bool, AccountError> {
        let id = self.self_recipient_id()?;
        let profile = self.stores.shared()?.profile(id)?;
        Ok(profile.is_some_and(|profile| {
            profile.unidentified_access_mode == UnidentifiedAccessMode::Unrestricted
        }))
    }

    /// Attributes for a registration or attribute update.
    ///
    /// `registration_lock` overrides the token derived from the stored pin.
    ///
    /// # Errors
    ///
    /// Store errors while reading the own profile.
    pub fn account_attributes(
        &self,
        registration_lock: Option<String>,
    ) -> Result<AccountAttributes, AccountError> {
        let unrestricted_unidentified_access = self.is_unrestricted_unidentified_access()?;
        let registration_lock = registration_lock.or_else(|| self.registration_lock());
        let capabilities = self.capabilities();
        let state = self.lock_state();
        Ok(AccountAttributes {
            registration_id: state.aci_data.registration_id,
            pni_registration_id: state.pni_data.registration_id,
            fetches_messages: true,
            registration_lock,
            unidentified_access_key: state.profile_key.map(|key| key.derive_access_key()),
            unrestricted_unidentified_access,
            capabilities,
            discoverable_by_phone_number: state.configuration.is_discoverable_by_phone_number(),
            encrypted_device_name: state.encrypted_device_name.clone(),
        })
    }
}
