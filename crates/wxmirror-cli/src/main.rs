use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wxmirror_core::account::{self, Platform};
use wxmirror_core::cancel::CancelToken;
use wxmirror_core::dat;
use wxmirror_core::keys::dbkey::{DbKeyOptions, DEFAULT_HOOK_MODULE};
use wxmirror_db::service::{DecryptConfig, DecryptService};

#[derive(Parser, Debug)]
#[command(name = "wxmirror", version, about = "Mirror a messenger's encrypted local chat state", long_about = None)]
struct Cli {
    /// Raise the log level to debug (also via WXMIRROR_DEBUG=1).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recover the database and image keys from a running messenger
    Key {
        /// Hook this pid directly instead of restarting the messenger
        #[arg(long)]
        pid: Option<u32>,
        /// Account cache directory (auto-detected when omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Seconds to wait for the hook to capture the key
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Path to the auxiliary hook module
        #[arg(long, default_value = DEFAULT_HOOK_MODULE)]
        hook_module: PathBuf,
        /// Also print the recovered v4 XOR key
        #[arg(long)]
        show_xor: bool,
    },
    /// Bulk-decrypt every database under a data directory
    Decrypt {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        work_dir: PathBuf,
        /// Database key, 64 hex characters
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "windows")]
        platform: String,
        #[arg(long, default_value_t = 4)]
        version: u8,
    },
}

fn init_logging(debug: bool) {
    let debug = debug || std::env::var("WXMIRROR_DEBUG").is_ok_and(|v| v == "1");
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Key {
            pid,
            data_dir,
            timeout,
            hook_module,
            show_xor,
        } => key_command(pid, data_dir, timeout, hook_module, show_xor),
        Commands::Decrypt {
            data_dir,
            work_dir,
            key,
            platform,
            version,
        } => decrypt_command(data_dir, work_dir, key, platform, version),
    }
}

fn key_command(
    pid: Option<u32>,
    data_dir: Option<PathBuf>,
    timeout: u64,
    hook_module: PathBuf,
    show_xor: bool,
) -> Result<()> {
    let accounts = account::discover()?;
    let account = match pid {
        Some(pid) => accounts.iter().find(|a| a.pid == pid).cloned(),
        None => accounts.first().cloned(),
    };
    let mut account = account.ok_or_else(|| anyhow!("no running messenger process found"))?;
    if let Some(dir) = data_dir {
        account.data_dir = dir;
    }
    info!(pid = account.pid, version = account.version, "selected account");

    let opts = DbKeyOptions {
        pid,
        timeout: Duration::from_secs(timeout),
        module_path: hook_module,
    };
    let keys = wxmirror_core::keys::extract_v4(&account, &opts, &CancelToken::new())?;

    match &keys.data_key {
        Some(key) => println!("data key:  {key}"),
        None => println!("data key:  (not recovered)"),
    }
    match &keys.image_key {
        Some(key) => {
            dat::set_aes_key(key)?;
            println!("image key: {key}");
        }
        None => println!("image key: (not recovered)"),
    }
    if show_xor {
        match keys.xor_key {
            Some(xor) => {
                dat::set_xor_key(xor);
                println!("xor key:   0x{xor:02x}");
            }
            None => println!("xor key:   (not recovered)"),
        }
    }
    Ok(())
}

fn decrypt_command(
    data_dir: PathBuf,
    work_dir: PathBuf,
    key: String,
    platform: String,
    version: u8,
) -> Result<()> {
    let platform: Platform = platform.parse()?;
    let service = DecryptService::new(DecryptConfig {
        data_key: key,
        data_dir,
        work_dir,
        platform,
        version,
    })?;

    let ok = service.decrypt_db_files()?;
    println!("decrypted {ok} database(s)");
    Ok(())
}
