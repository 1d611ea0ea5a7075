use std::path::PathBuf;

use cdnsd::config::RootConfig;
use cdnsd::prelude::*;
use cdnsd::store::Source;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dump the records of one domain
    #[arg(long)]
    domain: Option<String>,

    /// Show the chain-sync cursors
    #[arg(long)]
    cursors: bool,
}

pub fn run(args: &Args) -> Result<(), Error> {
    let config = RootConfig::load(args.config.as_deref())?;
    let store = crate::common::open_store(&config)?;

    if args.cursors {
        println!(
            "chainsync_cursor: {}",
            store.chainsync_cursor()?.unwrap_or_else(|| "-".into())
        );
        println!(
            "handshake_cursor: {}",
            store.handshake_cursor()?.unwrap_or_else(|| "-".into())
        );
    }

    if let Some(domain) = &args.domain {
        for (label, source) in [("cardano", Source::Cardano), ("handshake", Source::Handshake)] {
            let keys = store.zone_keys(source, domain)?;

            if keys.is_empty() {
                continue;
            }

            println!("{label} zone for {domain}:");

            for key in keys {
                println!("  {key}");
            }

            for record in store.lookup_records(source, &["NS", "DS", "TXT"], domain)? {
                println!("  {}", serde_json::to_string(&record).map_err(Error::parse)?);
            }
        }
    }

    Ok(())
}
