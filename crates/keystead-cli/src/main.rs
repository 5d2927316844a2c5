//! Keystead account tool.
//!
//! # Usage
//!
//! ```bash
//! # Show the state of an account, upgrading its files if needed
//! keystead inspect +15550123
//!
//! # Run pending migrations and report the version change
//! keystead --config /srv/keystead migrate +15550123
//!
//! # Remove every file belonging to an account
//! keystead delete +15550123 --yes
//! ```

use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand, ValueEnum};
use keystead_account::{Account, AccountPaths, CURRENT_STORAGE_VERSION};
use keystead_core::{IdentityRole, PreKeyStream, Settings, TrustNewIdentity};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keystead account storage tool
#[derive(Parser, Debug)]
#[command(name = "keystead")]
#[command(about = "Inspect, migrate and remove keystead accounts")]
#[command(version)]
struct Args {
    /// Data directory holding account descriptors
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Wait for another instance to release the account instead of failing
    #[arg(long)]
    wait: bool,

    /// Trust policy for identity keys seen while the account is open
    #[arg(long, value_enum, default_value_t = TrustPolicy::OnFirstUse)]
    trust_new_identities: TrustPolicy,

    /// Do not record sent messages for resend requests
    #[arg(long)]
    disable_message_send_log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print identifiers, device state and pre-key allocators
    Inspect {
        /// Account id, usually the phone number
        account: String,
    },
    /// Open the account once so pending migrations run
    Migrate {
        /// Account id, usually the phone number
        account: String,
    },
    /// Delete the descriptor and all account data
    Delete {
        /// Account id, usually the phone number
        account: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Print the on-disk locations of an account without opening it
    Paths {
        /// Account id, usually the phone number
        account: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TrustPolicy {
    Always,
    OnFirstUse,
    Never,
}

impl From<TrustPolicy> for TrustNewIdentity {
    fn from(policy: TrustPolicy) -> Self {
        match policy {
            TrustPolicy::Always => Self::Always,
            TrustPolicy::OnFirstUse => Self::OnFirstUse,
            TrustPolicy::Never => Self::Never,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let data_dir = match args.config {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let settings = Settings {
        trust_new_identity: args.trust_new_identities.into(),
        disable_message_send_log: args.disable_message_send_log,
    };
    tracing::debug!(data_dir = %data_dir.display(), "using data directory");

    let mut out = io::stdout().lock();
    match args.command {
        Command::Inspect { account } => {
            let account = Account::load(&data_dir, &account, args.wait, settings)?;
            inspect(&mut out, &account)?;
        },
        Command::Migrate { account } => {
            let account = Account::load(&data_dir, &account, args.wait, settings)?;
            let from = account.previous_storage_version();
            if from == CURRENT_STORAGE_VERSION {
                writeln!(out, "already at version {CURRENT_STORAGE_VERSION}")?;
            } else {
                writeln!(out, "migrated from version {from} to {CURRENT_STORAGE_VERSION}")?;
            }
        },
        Command::Delete { account, yes } => {
            if !yes {
                return Err(format!("refusing to delete {account} without --yes").into());
            }
            let opened = Account::load(&data_dir, &account, args.wait, settings)?;
            opened.delete_account_data()?;
            tracing::info!(account = %account, "deleted account");
            writeln!(out, "deleted {account}")?;
        },
        Command::Paths { account } => {
            let paths = AccountPaths::new(&data_dir, account);
            writeln!(out, "descriptor:  {}", paths.descriptor_file().display())?;
            writeln!(out, "data:        {}", paths.account_dir().display())?;
            writeln!(out, "database:    {}", paths.database_file().display())?;
            writeln!(out, "msg-cache:   {}", paths.message_cache_dir().display())?;
            writeln!(out, "manifest:    {}", paths.storage_manifest_file().display())?;
        },
    }

    Ok(())
}

fn inspect(out: &mut impl Write, account: &Account) -> io::Result<()> {
    fn or_unset<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "-".to_owned(), |v| v.to_string())
    }

    writeln!(out, "number:       {}", account.number())?;
    writeln!(out, "environment:  {}", or_unset(account.service_environment()))?;
    writeln!(out, "aci:          {}", or_unset(account.aci()))?;
    writeln!(out, "pni:          {}", or_unset(account.pni()))?;
    writeln!(out, "username:     {}", or_unset(account.username()))?;
    writeln!(out, "device:       {}", account.device_id())?;
    writeln!(out, "primary:      {}", account.is_primary_device())?;
    writeln!(out, "registered:   {}", account.is_registered())?;
    writeln!(out, "multi-device: {}", account.is_multi_device())?;
    writeln!(out, "version:      {}", account.previous_storage_version())?;

    for role in IdentityRole::ALL {
        let meta = account.pre_key_metadata(role);
        writeln!(out, "{role}:")?;
        writeln!(out, "  registration id: {}", account.registration_id(role))?;
        writeln!(out, "  identity key:    {}", account.identity_key_pair(role).is_some())?;
        for stream in [PreKeyStream::OneTime, PreKeyStream::Signed, PreKeyStream::Kyber] {
            writeln!(out, "  next {stream} id: {}", meta.next_id(stream))?;
        }
        writeln!(
            out,
            "  last resort:     {}",
            or_unset(meta.active_last_resort_kyber_pre_key_id())
        )?;
    }
    Ok(())
}

/// `$XDG_DATA_HOME/keystead/data`, falling back to `~/.local/share`.
fn default_data_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(base) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(base).join("keystead").join("data"));
    }
    let home = std::env::var_os("HOME").ok_or("HOME is not set; pass --config")?;
    Ok(PathBuf::from(home).join(".local/share/keystead/data"))
}
