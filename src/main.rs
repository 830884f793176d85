//! gitkv - command-line access to a gitkv repository

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gitkv::bus::HealthStatus;
use gitkv::config::StoreConfig;
use gitkv::credentials::Realm;
use gitkv::metadata::Metadata;
use gitkv::storage::{CommitMeta, GitSignature, KeyPath};
use gitkv::store::{KeyOutcome, KeyStore};
use gitkv::validate::validate_tips;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Key/value store backed by a Git repository
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the bare repository
    #[arg(short, long, default_value = ".gitkv", global = true)]
    repo: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the repository if it doesn't exist
    Init,
    /// Print a key's data, or its metadata
    Get {
        key: String,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        metadata: bool,
    },
    /// Create or replace a key with the contents of a file (`-` for stdin)
    Put {
        key: String,
        file: PathBuf,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
        /// Rely on a directory master instead of writing own metadata
        #[arg(long)]
        inherit: bool,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Delete a key
    Rm {
        key: String,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List keys under a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(short = 'R', long)]
        recursive: bool,
    },
    /// Validate the tip of every ref
    Validate,
    /// Add a user to a credential realm
    Useradd {
        realm: String,
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Report and clear the last recorded fault
    Health,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(args.log_level.parse().unwrap_or(tracing::Level::WARN.into()))
        .from_env_lossy();
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run one command; `Ok(false)` means it ran but the answer was negative.
fn run(args: Args) -> CliResult<bool> {
    let create = matches!(args.command, Command::Init);
    let store = KeyStore::open(StoreConfig::new(&args.repo).create_if_missing(create))?;

    match args.command {
        Command::Init => {
            println!("Initialized gitkv repository in {}", store.repo().path().display());
            Ok(true)
        }

        Command::Get {
            key,
            reference,
            metadata,
        } => {
            let branch = store.resolve_ref(reference.as_deref())?;
            let key = KeyPath::new(key)?;
            let Some(info) = store.get_source_info(&key, &branch)? else {
                eprintln!("{key}: not found");
                return Ok(false);
            };
            let mut out = std::io::stdout().lock();
            if metadata {
                out.write_all(&info.metadata_raw)?;
            } else if let Some(data) = &info.data {
                out.write_all(data)?;
            }
            Ok(true)
        }

        Command::Put {
            key,
            file,
            reference,
            content_type,
            inherit,
            message,
        } => {
            let branch = store.resolve_ref(reference.as_deref())?;
            let key = KeyPath::new(key)?;
            let data = read_input(&file)?;
            let meta = commit_meta(message);

            let outcome = match store.get_source_info(&key, &branch)? {
                Some(current) => match &current.data_version {
                    Some(version) => store.update_key(&key, &branch, &data, &meta, version),
                    None => KeyOutcome::Rejected("directory keys only carry metadata".to_string()),
                },
                None => {
                    let metadata = (!inherit).then(|| match content_type {
                        Some(content_type) => Metadata::with_content_type(content_type),
                        None => Metadata::default(),
                    });
                    store.add_key(&key, &branch, &data, metadata.as_ref(), &meta)
                }
            };
            Ok(report(&key, outcome))
        }

        Command::Rm {
            key,
            reference,
            message,
        } => {
            let branch = store.resolve_ref(reference.as_deref())?;
            let key = KeyPath::new(key)?;
            let Some(current) = store.get_source_info(&key, &branch)? else {
                eprintln!("{key}: not found");
                return Ok(false);
            };
            let outcome = store.delete_key(&key, &branch, &commit_meta(message), current.version());
            Ok(report(&key, outcome))
        }

        Command::List {
            prefix,
            reference,
            recursive,
        } => {
            let branch = store.resolve_ref(reference.as_deref())?;
            for key in store.get_list(&prefix, &branch, recursive)? {
                println!("{key}");
            }
            Ok(true)
        }

        Command::Validate => {
            let tips = store.repo().list_refs()?;
            let report = store.repo().with_handle(|repo| Ok(validate_tips(repo, &tips)))?;
            println!("{}", report.message());
            Ok(report.is_valid())
        }

        Command::Useradd {
            realm,
            username,
            password,
            roles,
        } => {
            let realm = Realm::parse(&realm).ok_or_else(|| format!("unknown realm {realm:?}"))?;
            let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
            let meta = commit_meta(None);
            store
                .credentials()
                .add_user(realm, &username, &password, &roles, &meta)?;
            println!("added {username} to the {realm} realm");
            Ok(true)
        }

        Command::Health => match store.health() {
            HealthStatus::Healthy => {
                println!("healthy");
                Ok(true)
            }
            HealthStatus::Unhealthy(fault) => {
                println!("unhealthy: {fault}");
                Ok(false)
            }
        },
    }
}

fn read_input(file: &PathBuf) -> CliResult<Vec<u8>> {
    let mut data = Vec::new();
    if file.as_os_str() == "-" {
        std::io::stdin().lock().read_to_end(&mut data)?;
    } else {
        data = std::fs::read(file)?;
    }
    Ok(data)
}

fn commit_meta(message: Option<String>) -> CommitMeta {
    CommitMeta {
        author: GitSignature::gitkv(),
        message,
    }
}

fn report(key: &KeyPath, outcome: KeyOutcome) -> bool {
    match &outcome {
        KeyOutcome::Ok(version) => println!("{key} {version}"),
        other => eprintln!("{key}: {other}"),
    }
    outcome.is_ok()
}
