use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

use cdnsd::config::{LoggingConfig, RootConfig};
use cdnsd::prelude::*;
use cdnsd::store::Store;

pub fn setup_tracing(config: &LoggingConfig) -> Result<(), Error> {
    let level: Level = config
        .max_level
        .parse()
        .map_err(|_| Error::config(format!("invalid log level {:?}", config.max_level)))?;

    let mut filter = Targets::new()
        .with_target("cdnsd", level)
        .with_target("cdnsd_handshake", level)
        .with_target("cdnsd_store", level);

    if config.include_gasket {
        filter = filter.with_target("gasket", level);
    }

    tracing_subscriber::fmt()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

pub fn open_store(config: &RootConfig) -> Result<Store, Error> {
    let dir = config.storage.dir();

    std::fs::create_dir_all(&dir)?;

    let fingerprint = config.fingerprint()?;

    Store::open(dir.join("zones.redb"), &fingerprint).map_err(Error::from)
}
