use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use passlock_core::biometric::{BiometricGate, KeyringPlatform};
use passlock_core::paths;
use passlock_core::record::CredentialRecord;
use passlock_core::session::{SessionConfig, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "passlock")]
#[command(about = "Encrypted local credential store", long_about = None)]
struct Cli {
    /// Store file to operate on (defaults to the platform data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new credential store
    Init,

    /// Add a credential
    Add {
        /// Label, typically the site or service name
        label: String,
        /// Username or account identifier
        username: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Show a credential, including its secret
    Get {
        /// Record id (see `list`)
        id: Uuid,
    },

    /// List all credentials (no secrets)
    List,

    /// Search credentials by label
    Search {
        /// Case-insensitive substring
        query: String,
    },

    /// Delete one credential
    Delete {
        /// Record id
        id: Uuid,
    },

    /// Delete every credential in the store
    DeleteAll {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Change the master passphrase, re-encrypting the whole store
    Rotate,

    /// Whether a scheduled rotation is due
    RotationStatus,

    /// Export all credentials to a passphrase-encrypted backup file
    Export {
        /// Backup file to write
        path: PathBuf,
    },

    /// Import credentials from a backup file
    Import {
        /// Backup file to read
        path: PathBuf,
    },

    /// Enroll biometric unlock for this store
    BiometricEnroll,

    /// Remove biometric enrollment
    BiometricRemove,
}

fn store_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.store {
        Some(path) => Ok(path.clone()),
        None => paths::store_file_path().ok_or_else(|| anyhow!("cannot determine data directory")),
    }
}

fn session_for(cli: &Cli) -> Result<SessionManager> {
    let path = store_path(cli)?;
    let data_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| anyhow!("store path has no parent directory"))?;
    let gate = BiometricGate::new(Arc::new(KeyringPlatform::new()), data_dir, "default");
    Ok(SessionManager::new(path, Some(gate), SessionConfig::default()))
}

fn prompt_passphrase(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("reading passphrase")
}

fn prompt_new_passphrase(prompt: &str) -> Result<String> {
    let first = prompt_passphrase(prompt)?;
    let second = prompt_passphrase("Repeat: ")?;
    if first != second {
        bail!("passphrases do not match");
    }
    Ok(first)
}

/// Unlock interactively: biometric first when enrolled, passphrase otherwise.
async fn unlock(session: &SessionManager) -> Result<()> {
    if !session.store_exists() {
        bail!("no store found; run `passlock init` first");
    }
    match session.unlock_with_biometric().await {
        Ok(()) => return Ok(()),
        Err(e) => tracing::debug!("biometric unlock unavailable: {e}"),
    }
    let passphrase = prompt_passphrase("Master passphrase: ")?;
    session.unlock_with_passphrase(&passphrase).await?;
    Ok(())
}

fn print_listing(entries: &[passlock_core::RecordMetadata]) {
    if entries.is_empty() {
        println!("(no credentials)");
        return;
    }
    for entry in entries {
        println!("{}  {:24}  {}", entry.id, entry.label, entry.username);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let session = session_for(&cli)?;

    match &cli.command {
        Commands::Init => {
            if session.store_exists() {
                bail!("store already exists at {}", store_path(&cli)?.display());
            }
            let passphrase = prompt_new_passphrase("New master passphrase: ")?;
            session.create_with_passphrase(&passphrase).await?;
            println!("Store created at {}", store_path(&cli)?.display());
        }

        Commands::Add {
            label,
            username,
            notes,
        } => {
            unlock(&session).await?;
            let secret = prompt_passphrase("Secret: ")?;
            let mut record = CredentialRecord::new(label.clone(), username.clone(), secret);
            record.notes = notes.clone();
            session.put(&record)?;
            println!("Added {} ({})", record.label, record.id);
        }

        Commands::Get { id } => {
            unlock(&session).await?;
            let record = session.get(*id)?;
            println!("label:    {}", record.label);
            println!("username: {}", record.username);
            println!("secret:   {}", record.secret);
            if let Some(notes) = &record.notes {
                println!("notes:    {notes}");
            }
            println!("created:  {}", record.created_at);
            println!("modified: {}", record.modified_at);
        }

        Commands::List => {
            unlock(&session).await?;
            print_listing(&session.list()?);
        }

        Commands::Search { query } => {
            unlock(&session).await?;
            print_listing(&session.search(query)?);
        }

        Commands::Delete { id } => {
            unlock(&session).await?;
            session.delete(*id)?;
            println!("Deleted {id}");
        }

        Commands::DeleteAll { yes } => {
            if !*yes {
                bail!("refusing to delete all credentials without --yes");
            }
            unlock(&session).await?;
            session.delete_all()?;
            println!("All credentials deleted");
        }

        Commands::Rotate => {
            unlock(&session).await?;
            let old = prompt_passphrase("Current master passphrase: ")?;
            let new = prompt_new_passphrase("New master passphrase: ")?;
            session.rotate_passphrase(&old, &new).await?;
            println!("Store re-encrypted under the new passphrase");
        }

        Commands::RotationStatus => {
            unlock(&session).await?;
            if session.rotation_due()? {
                println!("Rotation is due; run `passlock rotate`");
            } else {
                println!("Rotation is not due yet");
            }
        }

        Commands::Export { path } => {
            unlock(&session).await?;
            let passphrase = prompt_new_passphrase("Backup passphrase: ")?;
            session.export_backup(path, &passphrase)?;
            println!("Backup written to {}", path.display());
        }

        Commands::Import { path } => {
            unlock(&session).await?;
            let passphrase = prompt_passphrase("Backup passphrase: ")?;
            let count = session.import_backup(path, &passphrase)?;
            println!("Imported {count} credential(s)");
        }

        Commands::BiometricEnroll => {
            unlock(&session).await?;
            session.enroll_biometric()?;
            println!("Biometric unlock enrolled");
        }

        Commands::BiometricRemove => {
            let path = store_path(&cli)?;
            let data_dir = path
                .parent()
                .ok_or_else(|| anyhow!("store path has no parent directory"))?;
            let gate = BiometricGate::new(Arc::new(KeyringPlatform::new()), data_dir, "default");
            gate.unenroll()?;
            println!("Biometric unlock removed");
        }
    }

    Ok(())
}
