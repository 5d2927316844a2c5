//! Account and recipient identifiers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device id of the primary (registering) device.
///
/// Any other id denotes a linked secondary device.
pub const PRIMARY_DEVICE_ID: u32 = 1;

const PNI_PREFIX: &str = "PNI:";

/// One of the two identity roles of an account.
///
/// Each role has independent key material and its own pre-key id streams.
/// The roles are siblings: nothing is shared between them except the
/// identity-trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdentityRole {
    /// Account identifier, the primary role
    Aci,
    /// Phone number identifier, the privacy-preserving secondary role
    Pni,
}

impl IdentityRole {
    /// Both roles in canonical order.
    pub const ALL: [Self; 2] = [Self::Aci, Self::Pni];

    /// Single-byte tag used to prefix role-scoped storage keys.
    pub fn tag(self) -> u8 {
        match self {
            Self::Aci => 0,
            Self::Pni => 1,
        }
    }
}

impl fmt::Display for IdentityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aci => f.write_str("aci"),
            Self::Pni => f.write_str("pni"),
        }
    }
}

/// A service identifier: a UUID tagged with the role it names.
///
/// The textual form of an ACI is the bare UUID; a PNI is prefixed with
/// `PNI:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceId {
    /// Account identifier
    Aci(Uuid),
    /// Phone number identifier
    Pni(Uuid),
}

impl ServiceId {
    /// Construct the service id of `role` for `uuid`.
    pub fn new(role: IdentityRole, uuid: Uuid) -> Self {
        match role {
            IdentityRole::Aci => Self::Aci(uuid),
            IdentityRole::Pni => Self::Pni(uuid),
        }
    }

    /// Underlying UUID.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Aci(uuid) | Self::Pni(uuid) => *uuid,
        }
    }

    /// Role this id belongs to.
    pub fn role(&self) -> IdentityRole {
        match self {
            Self::Aci(_) => IdentityRole::Aci,
            Self::Pni(_) => IdentityRole::Pni,
        }
    }

    /// Fixed-width binary form: role tag followed by the 16 UUID bytes.
    pub fn to_key_bytes(&self) -> [u8; 17] {
        let mut out = [0u8; 17];
        out[0] = self.role().tag();
        out[1..].copy_from_slice(self.uuid().as_bytes());
        out
    }

    /// Inverse of [`Self::to_key_bytes`]. `None` on a malformed key.
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        let (&tag, rest) = bytes.split_first()?;
        let uuid = Uuid::from_slice(rest).ok()?;
        match tag {
            0 => Some(Self::Aci(uuid)),
            1 => Some(Self::Pni(uuid)),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aci(uuid) => write!(f, "{uuid}"),
            Self::Pni(uuid) => write!(f, "{PNI_PREFIX}{uuid}"),
        }
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(PNI_PREFIX) {
            Some(rest) => Uuid::parse_str(rest).map(Self::Pni),
            None => Uuid::parse_str(s).map(Self::Aci),
        }
    }
}

/// Stable process-local handle for a remote party.
///
/// Assigned by the recipient store. Everything that refers to another
/// party (sessions, sender keys, group members, contacts) stores this id
/// rather than an address, so that addresses can be merged without
/// rewriting references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientId(pub u64);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything known about how to reach a recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientAddress {
    /// Account identifier, if known
    pub aci: Option<Uuid>,
    /// Phone number identifier, if known
    pub pni: Option<Uuid>,
    /// E.164 phone number, if known
    pub number: Option<String>,
    /// Username, if known
    pub username: Option<String>,
}

impl RecipientAddress {
    /// Address with only an ACI.
    pub fn from_aci(aci: Uuid) -> Self {
        Self { aci: Some(aci), ..Self::default() }
    }

    /// Address with only a phone number.
    pub fn from_number(number: impl Into<String>) -> Self {
        Self { number: Some(number.into()), ..Self::default() }
    }

    /// Address for a service id of either role.
    pub fn from_service_id(service_id: ServiceId) -> Self {
        match service_id {
            ServiceId::Aci(uuid) => Self::from_aci(uuid),
            ServiceId::Pni(uuid) => Self { pni: Some(uuid), ..Self::default() },
        }
    }

    /// Parse a textual identifier: a bare UUID (ACI), `PNI:<uuid>`, or a
    /// `+`-prefixed phone number. `None` for anything else.
    pub fn parse_identifier(identifier: &str) -> Option<Self> {
        if identifier.starts_with('+') {
            return Some(Self::from_number(identifier));
        }
        identifier.parse::<ServiceId>().ok().map(Self::from_service_id)
    }

    /// Preferred service id: the ACI, falling back to the PNI.
    pub fn service_id(&self) -> Option<ServiceId> {
        self.aci.map(ServiceId::Aci).or_else(|| self.pni.map(ServiceId::Pni))
    }

    /// Preferred textual identifier, used for logging.
    pub fn identifier(&self) -> String {
        match (self.service_id(), &self.number) {
            (Some(service_id), _) => service_id.to_string(),
            (None, Some(number)) => number.clone(),
            (None, None) => self.username.clone().unwrap_or_default(),
        }
    }

    /// True if no identifying field is set.
    pub fn is_empty(&self) -> bool {
        self.aci.is_none() && self.pni.is_none() && self.number.is_none() && self.username.is_none()
    }

    /// Whether both addresses share at least one identifying field.
    pub fn matches(&self, other: &Self) -> bool {
        fn same<T: PartialEq>(a: Option<&T>, b: Option<&T>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }
        same(self.aci.as_ref(), other.aci.as_ref())
            || same(self.pni.as_ref(), other.pni.as_ref())
            || same(self.number.as_ref(), other.number.as_ref())
    }

    /// Fill fields that `self` lacks from `other`. Returns whether anything
    /// changed.
    pub fn merge_from(&mut self, other: &Self) -> bool {
        let before = self.clone();
        if self.aci.is_none() {
            self.aci = other.aci;
        }
        if self.pni.is_none() {
            self.pni = other.pni;
        }
        if self.number.is_none() {
            self.number.clone_from(&other.number);
        }
        if self.username.is_none() {
            self.username.clone_from(&other.username);
        }
        *self != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pni_text_form_is_prefixed() {
        let uuid = Uuid::new_v4();
        let pni = ServiceId::Pni(uuid);
        assert_eq!(pni.to_string(), format!("PNI:{uuid}"));
        assert_eq!(pni.to_string().parse::<ServiceId>().unwrap(), pni);
        assert_eq!(uuid.to_string().parse::<ServiceId>().unwrap(), ServiceId::Aci(uuid));
    }

    #[test]
    fn key_bytes_keep_role() {
        let uuid = Uuid::new_v4();
        for id in [ServiceId::Aci(uuid), ServiceId::Pni(uuid)] {
            assert_eq!(ServiceId::from_key_bytes(&id.to_key_bytes()), Some(id));
        }
        assert_eq!(ServiceId::from_key_bytes(&[9; 17]), None);
        assert_eq!(ServiceId::from_key_bytes(&[]), None);
    }

    #[test]
    fn identifier_parsing() {
        let uuid = Uuid::new_v4();
        assert_eq!(
            RecipientAddress::parse_identifier("+15551234567"),
            Some(RecipientAddress::from_number("+15551234567"))
        );
        assert_eq!(
            RecipientAddress::parse_identifier(&uuid.to_string()),
            Some(RecipientAddress::from_aci(uuid))
        );
        assert_eq!(RecipientAddress::parse_identifier("not-an-id"), None);
    }

    #[test]
    fn merge_only_fills_missing_fields() {
        let aci = Uuid::new_v4();
        let mut stored = RecipientAddress::from_number("+1");
        let incoming = RecipientAddress {
            aci: Some(aci),
            number: Some("+2".into()),
            ..RecipientAddress::default()
        };

        assert!(stored.matches(&RecipientAddress::from_number("+1")));
        assert!(stored.merge_from(&incoming));
        assert_eq!(stored.aci, Some(aci));
        assert_eq!(stored.number.as_deref(), Some("+1"));
        assert!(!stored.merge_from(&incoming));
    }
}
