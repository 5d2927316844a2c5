use std::fs;

use keystead_core::{RecipientAddress, RecipientId};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MigrationContext, array, decode_entry};
use crate::error::AccountError;

/// Recipient store files predate version 5.
const RECIPIENTS_FILE_BEFORE: i64 = 5;

/// The own recipient was not marked trusted before version 6.
const SELF_TRUST_BEFORE: i64 = 6;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecipient {
    id: u64,
    number: Option<String>,
    uuid: Option<Uuid>,
    pni: Option<Uuid>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct LegacyAddress {
    number: Option<String>,
    uuid: Option<Uuid>,
}

pub(super) fn migrate(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let mut changed = false;

    if ctx.previous_version < RECIPIENTS_FILE_BEFORE {
        changed |= import_recipients_file(ctx)?;
    }
    changed |= resolve_address_document(ctx)?;
    if ctx.previous_version < SELF_TRUST_BEFORE {
        ctx.stores.shared()?.resolve_trusted(&ctx.self_address())?;
        changed = true;
    }
    Ok(changed)
}

fn import_recipients_file(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let path = ctx.paths.recipients_store_file();
    if !path.is_file() {
        return Ok(false);
    }
    let document: serde_json::Value = match fs::read(&path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(document) => document,
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unreadable legacy recipient store");
            return Ok(false);
        },
    };

    let store = ctx.stores.shared()?;
    let mut count = 0usize;
    for value in array(&document, "recipients") {
        let Some(entry) = decode_entry::<LegacyRecipient>("recipients-store", value) else {
            continue;
        };
        let address = RecipientAddress {
            aci: entry.uuid,
            pni: entry.pni,
            number: entry.number,
            username: entry.username,
        };
        if address.aci.is_none() && address.pni.is_none() && address.number.is_none() {
            warn!(id = entry.id, "skipping legacy recipient without address");
            continue;
        }
        store.import(RecipientId(entry.id), &address)?;
        count += 1;
    }
    debug!(count, "imported legacy recipients");
    ctx.consumed(path);
    Ok(true)
}

/// Resolve every address of a legacy `recipientStore` sub-document, then
/// the own address, all as trusted. Runs whenever the key is present, even
/// if it holds null.
fn resolve_address_document(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.document.get("recipientStore") else {
        return Ok(false);
    };
    let store = ctx.stores.shared()?;
    for value in array(document, "addresses") {
        let Some(entry) = decode_entry::<LegacyAddress>("recipientStore", value) else {
            continue;
        };
        let address = RecipientAddress {
            aci: entry.uuid,
            number: entry.number,
            ..RecipientAddress::default()
        };
        if address.aci.is_none() && address.number.is_none() {
            continue;
        }
        store.resolve_trusted(&address)?;
    }
    store.resolve_trusted(&ctx.self_address())?;
    Ok(true)
}
