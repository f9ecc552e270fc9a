use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use resync_core::{CachedFile, CatalogFile, JsonTaskStore, TaskStore, TrackedTask};
use resync_daemon::config::CONFIG_FILE_NAME;
use resync_daemon::{AccountConfig, DaemonConfig, run_daemon};
use serde_json::json;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Writes a new configuration file with a single account.
    Init {
        /// Where uploads are written to
        remote_root: PathBuf,
        /// Server URL of the account
        #[clap(long)]
        server: String,
        /// Login of the account
        #[clap(long)]
        email: String,
        /// Local directory holding the account's cached files
        #[clap(long)]
        cache_dir: PathBuf,
    },
    /// Watches the configured cache directories until interrupted
    Run,
    /// Lists the uploads that are still pending
    Status,
    /// Registers a local file as the cached copy of a remote file
    Track {
        local_path: PathBuf,
        #[clap(long)]
        repo_id: String,
        #[clap(long)]
        repo_name: String,
        /// Remote path inside the repo, e.g. `/docs/report.odt`
        #[clap(long)]
        remote_path: String,
        /// Account login, needed when several accounts are configured
        #[clap(long)]
        email: Option<String>,
    },
    /// Forgets a local file registered with `track`
    Untrack {
        local_path: PathBuf,
        /// Account login, needed when several accounts are configured
        #[clap(long)]
        email: Option<String>,
    },
}

#[derive(Parser)]
#[clap(version, author, about)]
pub struct Cli {
    /// Configuration file
    #[clap(long, global = true, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// Output results as JSON
    #[clap(long, global = true)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Command,
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Loads the configuration with every path in it made absolute, so watched
/// paths line up with the catalog entries.
fn load_config(path: &Path) -> Result<DaemonConfig> {
    if !path.is_file() {
        bail!("No configuration at {}, run `resync init` first", path.display());
    }
    let path = std::env::current_dir()?.join(path);
    Ok(DaemonConfig::load(&path)?)
}

/// The configured account with login `email`, or the only account when no
/// login is given.
fn select_account<'a>(
    config: &'a DaemonConfig,
    email: Option<&str>,
) -> Result<&'a AccountConfig> {
    match email {
        Some(email) => config
            .accounts
            .iter()
            .find(|a| a.email == email)
            .ok_or_else(|| anyhow!("No account {} in the configuration", email)),
        None => match config.accounts.as_slice() {
            [only] => Ok(only),
            [] => bail!("No accounts configured"),
            _ => bail!("Several accounts configured, pass --email"),
        },
    }
}

fn print_task(task: &TrackedTask) {
    println!(
        "{} -> {}:{} ({})",
        task.local_path.display(),
        task.repo_name,
        task.parent_dir,
        task.account
    );
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init {
            remote_root,
            server,
            email,
            cache_dir,
        } => {
            init_logging("info");
            if cli.config.exists() {
                bail!("{} already exists", cli.config.display());
            }
            let config = DaemonConfig {
                remote_root,
                accounts: vec![AccountConfig {
                    server,
                    email,
                    name: None,
                    cache_dir,
                }],
                ..DaemonConfig::default()
            };
            config.validate()?;
            config.save(&cli.config)?;
            if cli.json {
                println!("{}", json!({"status": "initialized"}));
            } else {
                println!("resync initialized");
            }
        }
        Command::Run => {
            let config = load_config(&cli.config)?;
            init_logging(&config.log_level);

            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run_daemon(config, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Could not listen for Ctrl-C: {}", e);
                }
            }))?;
        }
        Command::Status => {
            let config = load_config(&cli.config)?;
            init_logging(&config.log_level);

            let store = JsonTaskStore::new(config.task_store_path());
            let mut tasks: Vec<_> = store.load_all()?.into_iter().collect();
            tasks.sort_by(|a, b| a.local_path.cmp(&b.local_path));
            if cli.json {
                println!("{}", serde_json::to_string(&tasks)?);
            } else if tasks.is_empty() {
                println!("No pending uploads");
            } else {
                for task in &tasks {
                    print_task(task);
                }
            }
        }
        Command::Track {
            local_path,
            repo_id,
            repo_name,
            remote_path,
            email,
        } => {
            let config = load_config(&cli.config)?;
            init_logging(&config.log_level);

            let account = select_account(&config, email.as_deref())?;
            let local_path = std::env::current_dir()?.join(local_path);

            let catalog = CatalogFile::load(&config.catalog_path)?;
            catalog.insert(
                &account.account(),
                &local_path,
                CachedFile::new(repo_id, repo_name, remote_path),
            );
            catalog.save()?;
            if cli.json {
                println!("{}", json!({"status": "tracked", "path": local_path}));
            } else {
                println!("Tracked: {}", local_path.display());
            }
        }
        Command::Untrack { local_path, email } => {
            let config = load_config(&cli.config)?;
            init_logging(&config.log_level);

            let account = select_account(&config, email.as_deref())?;
            let local_path = std::env::current_dir()?.join(local_path);

            let catalog = CatalogFile::load(&config.catalog_path)?;
            if catalog.remove(&account.account(), &local_path).is_none() {
                bail!("{} is not tracked", local_path.display());
            }
            catalog.save()?;
            if cli.json {
                println!("{}", json!({"status": "untracked", "path": local_path}));
            } else {
                println!("Untracked: {}", local_path.display());
            }
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{e:?}");
        ::std::process::exit(1)
    }
}
