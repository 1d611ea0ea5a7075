use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::prelude::Error;

/// Handshake upstream peer settings.
#[derive(Serialize, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub peer_address: String,

    #[serde(default = "default_network")]
    pub network: String,
}

fn default_network() -> String {
    "mainnet".into()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            peer_address: String::new(),
            network: default_network(),
        }
    }
}

/// A named bundle binding a Cardano network to one indexed TLD: the asset
/// policy, the script (or discovery) address holding the zone datums, and
/// the chain-sync intercept point.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub network: String,
    pub network_magic: u64,
    pub tld: String,
    pub policy_id: String,

    #[serde(default)]
    pub script_address: Option<String>,

    #[serde(default)]
    pub discovery_address: Option<String>,

    pub intercept_slot: u64,
    pub intercept_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct CardanoConfig {
    /// Names of built-in profiles to activate.
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Fully specified profiles, merged with the built-in ones.
    #[serde(default)]
    pub custom_profiles: Vec<Profile>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// State directory. Defaults to `./.cdnsd`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn dir(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("./.cdnsd"))
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_dns_listen")]
    pub listen_address: SocketAddr,

    /// Whether to recurse on behalf of clients that request it.
    #[serde(default = "default_true")]
    pub recursion: bool,

    /// Inline root hints in zone-file syntax; overrides the embedded set.
    #[serde(default)]
    pub root_hints: Option<String>,

    /// Path to a root hints file; used when no inline hints are given.
    #[serde(default)]
    pub root_hints_file: Option<PathBuf>,
}

fn default_dns_listen() -> SocketAddr {
    "0.0.0.0:8053".parse().expect("static address")
}

fn default_true() -> bool {
    true
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_address: default_dns_listen(),
            recursion: true,
            root_hints: None,
            root_hints_file: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_tls_listen")]
    pub listen_address: SocketAddr,

    pub cert_file_path: PathBuf,
    pub key_file_path: PathBuf,
}

fn default_tls_listen() -> SocketAddr {
    "0.0.0.0:8853".parse().expect("static address")
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct ServeConfig {
    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen_address: SocketAddr,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub max_level: String,

    #[serde(default)]
    pub include_gasket: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_level: default_log_level(),
            include_gasket: false,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff_unit_sec: u64,
    pub backoff_factor: u32,
    pub max_backoff_sec: u64,
}

#[derive(Serialize, Deserialize, Default)]
pub struct RootConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cardano: CardanoConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub serve: ServeConfig,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub retries: Option<RetryConfig>,
}

impl RootConfig {
    /// Layered load: file (optional), then `CDNSD_*` environment overrides
    /// with `__` as the section separator.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(&path.to_string_lossy()).required(true),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("CDNSD").separator("__"));

        let config: RootConfig = builder
            .build()
            .map_err(Error::config)?
            .try_deserialize()
            .map_err(Error::config)?;

        config.validate()?;

        Ok(config)
    }

    /// Resolve the active profile set: named presets plus custom entries.
    ///
    /// Unknown profile names and profiles disagreeing on the Cardano
    /// network are start-up errors.
    pub fn active_profiles(&self) -> Result<Vec<Profile>, Error> {
        let mut profiles = Vec::new();

        for name in &self.cardano.profiles {
            let profile = builtin_profile(name)
                .ok_or_else(|| Error::config(format!("unknown profile {name:?}")))?;
            profiles.push(profile);
        }

        profiles.extend(self.cardano.custom_profiles.iter().cloned());

        if let Some(first) = profiles.first() {
            for other in &profiles[1..] {
                if other.network != first.network {
                    return Err(Error::config(format!(
                        "conflicting networks across profiles: {} vs {}",
                        first.network, other.network
                    )));
                }
            }
        }

        Ok(profiles)
    }

    fn validate(&self) -> Result<(), Error> {
        self.active_profiles()?;

        if crate::handshake::network::Network::by_name(&self.upstream.network).is_none() {
            return Err(Error::config(format!(
                "unknown handshake network {:?}",
                self.upstream.network
            )));
        }

        Ok(())
    }

    /// The network fingerprint guarding the store against cross-network
    /// reuse. Derived from the Cardano profiles when any are active, the
    /// Handshake network otherwise.
    pub fn fingerprint(&self) -> Result<String, Error> {
        let profiles = self.active_profiles()?;

        if let Some(profile) = profiles.first() {
            return Ok(format!(
                "network={},network-magic={}",
                profile.network, profile.network_magic
            ));
        }

        let network = crate::handshake::network::Network::by_name(&self.upstream.network)
            .ok_or_else(|| Error::config("unknown handshake network"))?;

        Ok(format!(
            "network={},network-magic={}",
            network.name, network.magic
        ))
    }
}

/// The compiled-in profile presets.
pub fn builtin_profile(name: &str) -> Option<Profile> {
    match name {
        "preview-hydra" => Some(Profile {
            name: "preview-hydra".into(),
            network: "preview".into(),
            network_magic: 2,
            tld: "hydra".into(),
            policy_id: "0b8e40b4a80f77c9bd022371cc8a6e9bd30ea2f880ba4bbdb3398a45".into(),
            script_address: Some(
                "addr_test1wz8z6vk6z0ar9pcnpyd24qrzs3kt2pkhnttj2x7eyjm0u9gsvh5pw".into(),
            ),
            discovery_address: None,
            intercept_slot: 50_641_013,
            intercept_hash: "91359d34a1a9b1a9a11171d78a6c1e91d1a5ce3cb12e08b90a5b255d0c9e8af3"
                .into(),
        }),
        "preprod-hydra" => Some(Profile {
            name: "preprod-hydra".into(),
            network: "preprod".into(),
            network_magic: 1,
            tld: "hydra".into(),
            policy_id: "65f0616b1a396d2f63bfc9d1fe09161bd4fd0a1d07cbf6bd0c5e0d6f".into(),
            script_address: None,
            discovery_address: Some(
                "addr_test1wr7mxwd2jys6cy4mmkcz2pk3vh9jkm9s7mf1p30pr2y0q7g5kfyq0".into(),
            ),
            intercept_slot: 68_448_093,
            intercept_hash: "5c1f4f4c86e0eb0c4f5b7d9c48b6b68b9d2e5ddc8097b0a5a4e2e8d3e4b6f2d1"
                .into(),
        }),
        "mainnet-cardano" => Some(Profile {
            name: "mainnet-cardano".into(),
            network: "mainnet".into(),
            network_magic: 764_824_073,
            tld: "cardano".into(),
            policy_id: "9c9cf5a60b02f6d1b5e0e2ff0e6d5dd9c6e5c6c0d5d55eb1f0bd2e2e".into(),
            script_address: None,
            discovery_address: Some(
                "addr1wyv4ep8cp8e8c9kkzy6m0pvwgnqyk6r8vzp4c5a9p3eql3gx6xcmw".into(),
            ),
            intercept_slot: 120_542_367,
            intercept_hash: "2f9e1a3db3b1e9c4ab0c7e0c86ebd9dcd2e7e3a69ed14ad3e3d3ba7e1d4c7f09"
                .into(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_is_a_config_error() {
        let config = RootConfig {
            cardano: CardanoConfig {
                profiles: vec!["lunar".into()],
                custom_profiles: Vec::new(),
            },
            ..Default::default()
        };

        assert!(config.active_profiles().is_err());
    }

    #[test]
    fn conflicting_networks_are_rejected() {
        let config = RootConfig {
            cardano: CardanoConfig {
                profiles: vec!["preview-hydra".into(), "mainnet-cardano".into()],
                custom_profiles: Vec::new(),
            },
            ..Default::default()
        };

        assert!(config.active_profiles().is_err());
    }

    #[test]
    fn fingerprint_follows_cardano_profiles() {
        let config = RootConfig {
            cardano: CardanoConfig {
                profiles: vec!["preview-hydra".into()],
                custom_profiles: Vec::new(),
            },
            ..Default::default()
        };

        assert_eq!(
            config.fingerprint().unwrap(),
            "network=preview,network-magic=2"
        );
    }

    #[test]
    fn fingerprint_falls_back_to_handshake_network() {
        let config = RootConfig::default();
        let fingerprint = config.fingerprint().unwrap();

        assert!(fingerprint.starts_with("network=mainnet,network-magic="));
    }

    #[test]
    fn custom_profiles_merge_with_presets() {
        let custom = Profile {
            name: "preview-trees".into(),
            network: "preview".into(),
            network_magic: 2,
            tld: "trees".into(),
            policy_id: "aa".repeat(28),
            script_address: None,
            discovery_address: None,
            intercept_slot: 1,
            intercept_hash: "00".repeat(32),
        };

        let config = RootConfig {
            cardano: CardanoConfig {
                profiles: vec!["preview-hydra".into()],
                custom_profiles: vec![custom.clone()],
            },
            ..Default::default()
        };

        let profiles = config.active_profiles().unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1], custom);
    }
}
