//! # Node configuration
//!
//! Two sources, mirroring deployment reality: environment variables for
//! production (`nosana-node env`) and a TOML file for development
//! (`nosana-node <config.toml>`). Either way the result is one immutable
//! [`NodeConfig`] validated at startup; a bad config is fatal there and only
//! there.

use std::fmt;
use std::path::PathBuf;

use ed25519_dalek::{SigningKey, VerifyingKey};
use nosana_common::{cid, NodeError, Result};
use serde::Deserialize;

/// Default tick interval for the work loop.
pub const DEFAULT_POLL_DELAY_MS: u64 = 5_000;
/// Default health endpoint port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Chain network the node operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Devnet,
}

impl Network {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "devnet" => Ok(Network::Devnet),
            other => Err(NodeError::Misconfiguration(format!(
                "unknown network '{other}', expected mainnet or devnet"
            ))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Devnet => write!(f, "devnet"),
        }
    }
}

/// The node's Ed25519 signer.
///
/// The signing key is never exposed; `Debug` redacts it. The node address is
/// the Base58 of the verifying key, matching on-chain account fields.
pub struct Signer {
    key: SigningKey,
    address: String,
}

impl Signer {
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self> {
        // 64-byte keypair files carry secret ‖ public; 32-byte files just
        // the secret.
        let secret: [u8; 32] = match bytes.len() {
            32 | 64 => bytes[..32]
                .try_into()
                .map_err(|_| NodeError::Misconfiguration("signer key truncated".into()))?,
            n => {
                return Err(NodeError::Misconfiguration(format!(
                    "signer keypair is {n} bytes, expected 32 or 64"
                )))
            }
        };
        let key = SigningKey::from_bytes(&secret);
        let address = bs58::encode(key.verifying_key().to_bytes()).into_string();
        Ok(Self { key, address })
    }

    /// Load a JSON byte-array keypair file.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Misconfiguration(format!("read signer file {}: {e}", path.display()))
        })?;
        let bytes: Vec<u8> = serde_json::from_str(&raw).map_err(|e| {
            NodeError::Misconfiguration(format!("signer file {}: {e}", path.display()))
        })?;
        Self::from_keypair_bytes(&bytes)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Immutable per-session node configuration.
#[derive(Debug)]
pub struct NodeConfig {
    pub network: Network,
    /// Market account address to work in.
    pub market: String,
    /// Node signer; absent keys surface as a health reason, not a crash.
    pub signer: Option<Signer>,
    /// Chain gateway endpoint, or `mock`.
    pub rpc_url: String,
    /// Container engine: `mock`, `docker`, `podman`, or a binary path.
    pub engine_uri: String,
    /// Engine socket override (DOCKER_HOST), when not the default.
    pub engine_host: Option<String>,
    /// Blob pinning endpoint, or `mock`.
    pub blob_pin_url: String,
    /// Public blob gateway for downloads.
    pub blob_gateway_url: String,
    /// Pinning credential; absence is a health reason.
    pub blob_credential: Option<String>,
    /// Work loop tick interval in milliseconds.
    pub poll_delay_ms: u64,
    /// Whether the market admits nodes without an access key.
    pub open_market: bool,
    /// Whether to run the work loop at all (false: health endpoint only).
    pub start_job_loop: bool,
    /// Root for the flow store, repos, and logs.
    pub data_dir: PathBuf,
    /// Health endpoint port.
    pub http_port: u16,
}

/// TOML shape for file-based configuration.
#[derive(Debug, Deserialize)]
struct FileConfig {
    network: Option<String>,
    market: String,
    signer_file: Option<String>,
    rpc_url: Option<String>,
    engine: Option<String>,
    engine_host: Option<String>,
    blob_pin_url: Option<String>,
    blob_gateway_url: Option<String>,
    blob_credential: Option<String>,
    poll_delay_ms: Option<u64>,
    open_market: Option<bool>,
    start_job_loop: Option<bool>,
    data_dir: Option<String>,
    http_port: Option<u16>,
}

impl NodeConfig {
    /// Parse configuration from environment variables.
    ///
    /// Required: `NOSANA_MARKET`. Everything else has a development
    /// default; production deployments set `NOSANA_SIGNER_FILE`,
    /// `NOSANA_RPC_URL`, and `NOSANA_BLOB_CREDENTIAL`.
    pub fn from_env() -> Result<Self> {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let market = get("NOSANA_MARKET")
            .ok_or_else(|| NodeError::Misconfiguration("NOSANA_MARKET not set".into()))?;
        let network = Network::parse(&get("NOSANA_NETWORK").unwrap_or_else(|| "devnet".into()))?;
        let signer = match get("NOSANA_SIGNER_FILE") {
            Some(path) => Some(Signer::from_file(&PathBuf::from(path))?),
            None => None,
        };
        let poll_delay_ms = match get("NOSANA_POLL_DELAY_MS") {
            Some(raw) => raw.parse().map_err(|_| {
                NodeError::Misconfiguration(format!("NOSANA_POLL_DELAY_MS invalid: {raw}"))
            })?,
            None => DEFAULT_POLL_DELAY_MS,
        };
        let http_port = match get("NOSANA_HTTP_PORT") {
            Some(raw) => raw.parse().map_err(|_| {
                NodeError::Misconfiguration(format!("NOSANA_HTTP_PORT invalid: {raw}"))
            })?,
            None => DEFAULT_HTTP_PORT,
        };
        let truthy = |v: String| v == "true" || v == "1";

        let config = Self {
            network,
            market,
            signer,
            rpc_url: get("NOSANA_RPC_URL").unwrap_or_else(|| "mock".into()),
            engine_uri: get("NOSANA_ENGINE").unwrap_or_else(|| "docker".into()),
            engine_host: get("NOSANA_ENGINE_HOST"),
            blob_pin_url: get("NOSANA_BLOB_PIN_URL").unwrap_or_else(|| "mock".into()),
            blob_gateway_url: get("NOSANA_BLOB_GATEWAY_URL")
                .unwrap_or_else(|| "https://nosana.mypinata.cloud/ipfs".into()),
            blob_credential: get("NOSANA_BLOB_CREDENTIAL"),
            poll_delay_ms,
            open_market: get("NOSANA_OPEN_MARKET").map(truthy).unwrap_or(false),
            start_job_loop: get("NOSANA_START_JOB_LOOP").map(truthy).unwrap_or(true),
            data_dir: PathBuf::from(get("NOSANA_DATA_DIR").unwrap_or_else(|| "./data".into())),
            http_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Misconfiguration(format!("read config {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|e| {
            NodeError::Misconfiguration(format!("parse config {}: {e}", path.display()))
        })?;

        let signer = match file.signer_file {
            Some(p) => Some(Signer::from_file(&PathBuf::from(p))?),
            None => None,
        };
        let config = Self {
            network: Network::parse(&file.network.unwrap_or_else(|| "devnet".into()))?,
            market: file.market,
            signer,
            rpc_url: file.rpc_url.unwrap_or_else(|| "mock".into()),
            engine_uri: file.engine.unwrap_or_else(|| "docker".into()),
            engine_host: file.engine_host,
            blob_pin_url: file.blob_pin_url.unwrap_or_else(|| "mock".into()),
            blob_gateway_url: file
                .blob_gateway_url
                .unwrap_or_else(|| "https://nosana.mypinata.cloud/ipfs".into()),
            blob_credential: file.blob_credential,
            poll_delay_ms: file.poll_delay_ms.unwrap_or(DEFAULT_POLL_DELAY_MS),
            open_market: file.open_market.unwrap_or(false),
            start_job_loop: file.start_job_loop.unwrap_or(true),
            data_dir: PathBuf::from(file.data_dir.unwrap_or_else(|| "./data".into())),
            http_port: file.http_port.unwrap_or(DEFAULT_HTTP_PORT),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.market.is_empty() {
            return Err(NodeError::Misconfiguration("market address is empty".into()));
        }
        if self.poll_delay_ms == 0 {
            return Err(NodeError::Misconfiguration("poll delay must be positive".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(NodeError::Misconfiguration("data dir is empty".into()));
        }
        Ok(())
    }

    /// Node address: Base58 of the signer's verifying key, or a placeholder
    /// when no signer is configured (the health gate blocks chain work then).
    pub fn node_address(&self) -> String {
        self.signer
            .as_ref()
            .map(|s| s.address().to_string())
            .unwrap_or_else(|| "unconfigured".to_string())
    }

    /// Derived associated token address for the node on this market.
    pub fn token_address(&self) -> String {
        self.derive_address("token")
    }

    /// Derived stake account address.
    pub fn stake_address(&self) -> String {
        self.derive_address("stake")
    }

    /// Derived market vault address.
    pub fn vault_address(&self) -> String {
        self.derive_address("vault")
    }

    fn derive_address(&self, seed: &str) -> String {
        let material = format!("{seed}:{}:{}", self.market, self.node_address());
        bs58::encode(cid::sha256_digest(material.as_bytes())).into_string()
    }

    pub fn flow_store_dir(&self) -> PathBuf {
        self.data_dir.join("flows")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> NodeConfig {
        NodeConfig {
            network: Network::Devnet,
            market: "market111".into(),
            signer: None,
            rpc_url: "mock".into(),
            engine_uri: "mock".into(),
            engine_host: None,
            blob_pin_url: "mock".into(),
            blob_gateway_url: "https://gateway.example/ipfs".into(),
            blob_credential: None,
            poll_delay_ms: 100,
            open_market: false,
            start_job_loop: true,
            data_dir: PathBuf::from("./data"),
            http_port: 8080,
        }
    }

    #[test]
    fn validate_rejects_empty_market() {
        let mut config = base_config();
        config.market = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_poll_delay() {
        let mut config = base_config();
        config.poll_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn signer_from_keypair_bytes() {
        let secret = [7u8; 32];
        let signer = Signer::from_keypair_bytes(&secret).expect("signer");
        // address is base58 of the verifying key
        let decoded = bs58::decode(signer.address()).into_vec().expect("base58");
        assert_eq!(decoded.len(), 32);

        // 64-byte keypair form derives the same address
        let mut full = secret.to_vec();
        full.extend_from_slice(&signer.verifying_key().to_bytes());
        let again = Signer::from_keypair_bytes(&full).expect("signer");
        assert_eq!(again.address(), signer.address());

        assert!(Signer::from_keypair_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn signer_debug_redacts_key() {
        let signer = Signer::from_keypair_bytes(&[7u8; 32]).expect("signer");
        let debug = format!("{signer:?}");
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains(signer.address()));
    }

    #[test]
    fn derived_addresses_are_stable_and_distinct() {
        let config = base_config();
        assert_eq!(config.token_address(), config.token_address());
        assert_ne!(config.token_address(), config.stake_address());
        assert_ne!(config.stake_address(), config.vault_address());
    }

    #[test]
    fn from_file_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            tmp,
            r#"
            network = "devnet"
            market = "market111"
            engine = "mock"
            poll_delay_ms = 250
            open_market = true
            http_port = 9090
            "#
        )
        .expect("write");

        let config = NodeConfig::from_file(tmp.path()).expect("load");
        assert_eq!(config.market, "market111");
        assert_eq!(config.poll_delay_ms, 250);
        assert!(config.open_market);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.network, Network::Devnet);
        // defaults fill the rest
        assert_eq!(config.rpc_url, "mock");
        assert!(config.start_job_loop);
    }

    #[test]
    fn network_parse() {
        assert_eq!(Network::parse("mainnet").expect("parse"), Network::Mainnet);
        assert_eq!(Network::parse("devnet").expect("parse"), Network::Devnet);
        assert!(Network::parse("testnet").is_err());
    }
}
