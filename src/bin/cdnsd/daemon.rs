use std::path::PathBuf;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cdnsd::config::RootConfig;
use cdnsd::handshake::network::Network;
use cdnsd::prelude::*;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<(), Error> {
    let config = RootConfig::load(args.config.as_deref())?;

    crate::common::setup_tracing(&config.logging)?;

    if config.upstream.peer_address.is_empty() {
        return Err(Error::config("upstream.peer_address is required"));
    }

    let network = Network::by_name(&config.upstream.network)
        .ok_or_else(|| Error::config("unknown handshake network"))?;

    if let Some(metrics) = &config.metrics {
        PrometheusBuilder::new()
            .with_http_listener(metrics.listen_address)
            .install()
            .map_err(Error::server)?;

        info!(address = %metrics.listen_address, "metrics listening");
    }

    let store = crate::common::open_store(&config)?;

    tokio::spawn(store.clone().run_gc());

    let exit = CancellationToken::new();

    let mut drivers = FuturesUnordered::new();
    cdnsd::serve::load_drivers(&mut drivers, config.serve.clone(), store.clone(), exit.clone());

    let tethers = cdnsd::sync::pipeline(
        config.upstream.peer_address.clone(),
        network,
        store,
        config.retries.as_ref(),
    )?;

    let pipeline = tokio::task::spawn_blocking(move || {
        gasket::daemon::Daemon::new(tethers).block();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            exit.cancel();
            Ok(())
        }
        finished = drivers.next() => match finished {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(err)) => Err(Error::server(err)),
            None => Ok(()),
        },
        _ = pipeline => Err(Error::message("sync pipeline exited")),
    }
}
