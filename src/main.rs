use std::{env, path::{Path, PathBuf}, process::ExitCode};

use increment_index::{
    config::Config,
    index_service::IndexService,
    tree_node::{DirectoryBrowser, VirtualNode},
};
use lazy_static::lazy_static;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

lazy_static! {
    static ref CONFIG: Config = Config::load(Path::new("config.json"))
        .expect("config.json must exist and be valid");
}

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

///
/// Runs the configured listing command against the backup directory
///
async fn read_listing() -> Result<Vec<String>> {
    let (program, args) = CONFIG.listing_command.split_first()
        .ok_or("listing_command must not be empty")?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .arg(&CONFIG.backup_directory)
        .output()
        .await?;

    // The failed-backup notice is printed on stderr
    let mut lines: Vec<String> =
        String::from_utf8_lossy(&output.stdout).lines().map(String::from).collect();
    lines.extend(String::from_utf8_lossy(&output.stderr).lines().map(String::from));
    Ok(lines)
}

async fn run() -> Result<()> {
    let store_path = env::var("INDEX_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(&CONFIG.store_path));
    let listing = read_listing().await?;

    let service = match IndexService::open(&store_path, &CONFIG.backup_directory, listing).await {
        Ok(service) => service,
        Err(err) if err.is_store_locked() => {
            error!(?store_path, "index store is in use; set INDEX_STORE to use another location");
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let report = match service.sync().await {
        Ok(report) => report,
        Err(err) if err.is_corrupted_backup() => {
            error!(
                "backup directory needs repair: run `rdiff-backup --check-destination-dir {}`",
                CONFIG.backup_directory
            );
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    info!(changed = report.changed(), failed = report.failed.len(), "index up to date");

    for increment in service.increments().await {
        let size = increment.size().await.unwrap_or(0);
        let kind = if increment.is_mirror() { "mirror" } else { "increment" };
        println!("{}\t{}\t{}", kind, increment.timestamp(), size);

        if let Some(path) = &CONFIG.browse_path {
            let dir = VirtualNode::directory(increment.clone(), path);
            for node in service.list(&dir).await? {
                let kind = if node.is_directory() { "d" } else { "-" };
                println!("  {kind} {:>12} {}", node.size(), node.path());
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "increment index failed");
            ExitCode::FAILURE
        }
    }
}
