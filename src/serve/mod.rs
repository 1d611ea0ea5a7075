use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServeConfig;
use crate::prelude::*;
use crate::store::Store;

pub mod dns;

pub fn load_drivers(
    all_drivers: &FuturesUnordered<tokio::task::JoinHandle<Result<(), Error>>>,
    config: ServeConfig,
    store: Store,
    exit: CancellationToken,
) {
    info!("starting dns driver");

    let driver = dns::Driver::run(config, store, exit);
    all_drivers.push(tokio::spawn(driver));
}
