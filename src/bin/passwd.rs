//! CLI tool for managing the davfs credential file
//!
//! Usage:
//!   davfs-passwd set <username> [--password <password>] [--cost <cost>]
//!   davfs-passwd delete <username>
//!   davfs-passwd check <username> [--password <password>]
//!   davfs-passwd list
//!   davfs-passwd hash <username> [--password <password>]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use davfs::credentials::{self, CredentialStore, DEFAULT_COST};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Manage username:bcrypt-hash records for davfs
#[derive(Parser, Debug)]
#[command(name = "davfs-passwd")]
#[command(version)]
#[command(about = "Manage the davfs credential file")]
struct Args {
    /// Credential file
    #[arg(long, alias = "htpass", env = "DAVFS_HTPASSWD", default_value = ".htpasswd")]
    file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a user or change their password
    Set {
        username: String,

        /// Password; read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,

        /// bcrypt cost
        #[arg(long, default_value_t = DEFAULT_COST)]
        cost: u32,
    },

    /// Remove a user
    Delete { username: String },

    /// Verify a password against the file
    Check {
        username: String,

        /// Password; read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// List users
    List,

    /// Print a record without touching the file
    Hash {
        username: String,

        /// Password; read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,

        /// bcrypt cost
        #[arg(long, default_value_t = DEFAULT_COST)]
        cost: u32,
    },
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        bail!("username must not be empty");
    }
    if username.contains(':') {
        bail!("username must not contain ':'");
    }
    Ok(())
}

fn read_password(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    eprint!("Password: ");
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Set {
            username,
            password,
            cost,
        } => {
            validate_username(&username)?;
            let password = read_password(password)?;
            let hash = credentials::hash_password(&password, cost)?;

            let replaced = credentials::upsert_record(&args.file, &username, &hash)?;
            if replaced {
                println!("Updated password for {} in {}", username, args.file.display());
            } else {
                println!("Added {} to {}", username, args.file.display());
            }
        }

        Commands::Delete { username } => {
            if credentials::remove_record(&args.file, &username)? {
                println!("Removed {} from {}", username, args.file.display());
            } else {
                eprintln!("No record for {} in {}", username, args.file.display());
                std::process::exit(1);
            }
        }

        Commands::Check { username, password } => {
            let store = CredentialStore::load(&args.file)?;
            let password = read_password(password)?;

            if store.authenticate(&username, &password) {
                println!("OK");
            } else {
                eprintln!("Authentication failed for {}", username);
                std::process::exit(1);
            }
        }

        Commands::List => {
            let store = CredentialStore::load(&args.file)?;
            if store.is_empty() {
                println!("No users in {}", args.file.display());
                return Ok(());
            }

            for username in store.usernames() {
                println!("{}", username);
            }
            println!("\nTotal: {} user(s)", store.len());
        }

        Commands::Hash {
            username,
            password,
            cost,
        } => {
            validate_username(&username)?;
            let password = read_password(password)?;
            let hash = credentials::hash_password(&password, cost)?;
            println!("{}", credentials::format_record(&username, &hash));
        }
    }

    Ok(())
}
