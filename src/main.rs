use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info};
use secrecy::SecretString;

mod cli;
mod config;
mod control;
mod fetch;
mod hash;
mod mirror;
mod packages;
mod release;
mod sign;
mod sources;
mod trash;
mod version;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args: cli::Args = argh::from_env();
    env_logger::Builder::from_default_env()
        .filter_level(cli::level_filter(args.log_level))
        .init();
    cli::validate(&args)?;

    info!("Loading configuration '{}' ...", args.config);
    let mirrors = config::parse_config(&args.config)?;
    config::lint_config(&mirrors);

    if let Some(output) = &args.sources_list {
        info!("Writing sources.list to '{}' ...", output);
        sources::write_sources_list(&mirrors, Path::new(output))?;
    }

    let signer = match &args.resign_key {
        Some(key_path) => {
            // cli::validate guarantees the passphrase is present
            let passphrase = SecretString::from(args.key_passphrase.clone().unwrap_or_default());
            Some(
                sign::ReleaseSigner::new(Path::new(key_path), &passphrase)
                    .context("setting up the resigning key")?,
            )
        }
        None => None,
    };

    let fetcher = fetch::Fetcher::new(HTTP_TIMEOUT)?;
    let mut failed = 0usize;
    let mut processed = 0usize;
    for spec in &mirrors {
        if !spec.enabled {
            info!("Mirror '{}' is disabled, skipping.", spec.source);
            continue;
        }
        processed += 1;
        info!(
            "Mirroring '{}' to '{}' ...",
            spec.source,
            spec.destination.display()
        );
        let runner =
            mirror::MirrorRunner::new(spec, &fetcher, signer.as_ref(), args.remove_valid_until);
        match runner.run().await {
            Ok(()) => info!("Mirror '{}' is up to date.", spec.source),
            Err(err) => {
                error!("Error while mirroring '{}': {:?}", spec.source, err);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} mirror(s) failed to synchronize", failed, processed);
    }

    Ok(())
}
