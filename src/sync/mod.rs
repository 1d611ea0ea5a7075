use std::time::Duration;

use crate::config::RetryConfig;
use crate::handshake::network::Network;
use crate::prelude::*;
use crate::store::Store;

pub mod apply;
pub mod pull;
pub mod records;

/// Reconnect/backoff policy for the pipeline stages: 1 second doubling up
/// to the 2 minute cap.
pub fn define_gasket_policy(config: Option<&RetryConfig>) -> gasket::runtime::Policy {
    let default_retries = gasket::retries::Policy {
        max_retries: 20,
        backoff_unit: Duration::from_secs(1),
        backoff_factor: 2,
        max_backoff: Duration::from_secs(120),
        dismissible: false,
    };

    let retries = match config {
        Some(config) => gasket::retries::Policy {
            max_retries: config.max_retries,
            backoff_unit: Duration::from_secs(config.backoff_unit_sec),
            backoff_factor: config.backoff_factor,
            max_backoff: Duration::from_secs(config.max_backoff_sec),
            dismissible: false,
        },
        None => default_retries,
    };

    gasket::runtime::Policy {
        // generous tick timeout so tip awaits don't trip the watchdog
        tick_timeout: Duration::from_secs(600).into(),
        bootstrap_retry: retries.clone(),
        work_retry: retries.clone(),
        teardown_retry: retries,
    }
}

/// Assemble the Handshake follower pipeline: pull → apply.
pub fn pipeline(
    peer_address: String,
    network: Network,
    store: Store,
    retries: Option<&RetryConfig>,
) -> Result<Vec<gasket::runtime::Tether>, Error> {
    let mut pull = pull::Stage::new(peer_address, network, store.clone());
    let mut apply = apply::Stage::new(store);

    let (to_apply, from_pull) = gasket::messaging::tokio::mpsc_channel(50);
    pull.downstream.connect(to_apply);
    apply.upstream.connect(from_pull);

    let policy = define_gasket_policy(retries);

    let pull = gasket::runtime::spawn_stage(pull, policy.clone());
    let apply = gasket::runtime::spawn_stage(apply, policy);

    Ok(vec![pull, apply])
}
