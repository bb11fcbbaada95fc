//! Deployment descriptor and feed tunables.
//!
//! Everything a component needs is passed in explicitly through these structs;
//! nothing reads environment variables behind the caller's back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ─── Enumerations ─────────────────────────────────────────────────────────────

/// Governor contract lineage. Selects id-field naming and module resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GovernorFamily {
    /// OpenZeppelin Governor: `proposalId`, `voteStart`/`voteEnd`, `weight`.
    #[default]
    Oz,
    /// Compound GovernorBravo: `id`, `startBlock`/`endBlock`, `votes`.
    Compound,
    /// Agora governor with voting modules and proposal types.
    Agora,
}

impl GovernorFamily {
    pub fn proposal_id_field(&self) -> &'static str {
        match self {
            GovernorFamily::Compound => "id",
            _ => "proposal_id",
        }
    }

    /// `(start, end)` field names of a classic `ProposalCreated`.
    pub fn window_fields(&self) -> (&'static str, &'static str) {
        match self {
            GovernorFamily::Oz => ("vote_start", "vote_end"),
            _ => ("start_block", "end_block"),
        }
    }

    /// Whether the voting module may be inferred from the proposal payload
    /// when the deployment does not name it.
    pub fn infers_modules(&self) -> bool {
        matches!(self, GovernorFamily::Agora)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Erc20,
    Erc721,
}

/// Voting module attached to a module-based proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingModuleKind {
    Standard,
    Approval,
    Optimistic,
}

impl VotingModuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            VotingModuleKind::Standard => "standard",
            VotingModuleKind::Approval => "approval",
            VotingModuleKind::Optimistic => "optimistic",
        }
    }
}

// ─── Deployment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    #[serde(default)]
    pub kind: TokenKind,
    /// Name of the amount field on `Transfer` (ERC-20 only). Defaults to
    /// `value`, falling back to `amount`.
    #[serde(default)]
    pub value_field: Option<String>,
    /// Token emits the fractional `DelegateChanged` shape.
    #[serde(default)]
    pub partial_delegation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub address: String,
    #[serde(default)]
    pub family: GovernorFamily,
}

/// Contracts of one DAO on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDeployment {
    pub chain_id: u64,
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub governor: Option<GovernorConfig>,
    #[serde(default)]
    pub proposal_types: Option<ContractConfig>,
    /// module address → module kind
    #[serde(default)]
    pub modules: BTreeMap<String, VotingModuleKind>,
}

impl ChainDeployment {
    pub fn family(&self) -> GovernorFamily {
        self.governor.as_ref().map(|g| g.family).unwrap_or_default()
    }

    pub fn token_kind(&self) -> TokenKind {
        self.token.as_ref().map(|t| t.kind).unwrap_or_default()
    }

    pub fn module_for(&self, address: &str) -> Option<VotingModuleKind> {
        self.modules.get(&address.to_ascii_lowercase()).copied()
    }

    fn normalize(&mut self) {
        if let Some(t) = &mut self.token {
            t.address = t.address.to_ascii_lowercase();
        }
        if let Some(g) = &mut self.governor {
            g.address = g.address.to_ascii_lowercase();
        }
        if let Some(p) = &mut self.proposal_types {
            p.address = p.address.to_ascii_lowercase();
        }
        self.modules = std::mem::take(&mut self.modules)
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
    }

    fn addresses(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(t) = &self.token {
            out.push(t.address.as_str());
        }
        if let Some(g) = &self.governor {
            out.push(g.address.as_str());
        }
        if let Some(p) = &self.proposal_types {
            out.push(p.address.as_str());
        }
        out.extend(self.modules.keys().map(String::as_str));
        out
    }
}

// ─── Feed tunables ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub dir: PathBuf,
}

/// Retry tunables for HTTP JSON-RPC calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10_000 }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    /// Blocks per `eth_getLogs` page. Chain default when absent.
    #[serde(default)]
    pub block_span: Option<u64>,
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: u32,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Blocks between sampled headers during a historical read. Chain
    /// default (about an hour of blocks) when absent.
    #[serde(default)]
    pub header_stride: Option<u64>,
}

fn default_max_split_depth() -> u32 { 12 }
fn default_request_timeout_ms() -> u64 { 30_000 }

impl RpcConfig {
    /// An endpoint with every tunable at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            block_span: None,
            max_split_depth: default_max_split_depth(),
            start_block: 0,
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetrySettings::default(),
            header_stride: None,
        }
    }

    pub fn span_for(&self, chain_id: u64) -> u64 {
        self.block_span.unwrap_or_else(|| default_block_span(chain_id))
    }

    pub fn stride_for(&self, chain_id: u64) -> u64 {
        self.header_stride.unwrap_or_else(|| default_header_stride(chain_id)).max(1)
    }
}

/// Roughly one hour of blocks, so hour-bucketed block-time bookkeeping
/// sees every bucket during a historical read.
pub fn default_header_stride(chain_id: u64) -> u64 {
    match chain_id {
        1 => 300,
        42161 => 14_400,
        10 | 8453 | 137 => 1_800,
        _ => 300,
    }
}

/// Provider-friendly `eth_getLogs` span per chain.
pub fn default_block_span(chain_id: u64) -> u64 {
    match chain_id {
        1 => 2_000,
        10 | 42161 | 8453 => 10_000,
        _ => 5_000,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub url: String,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_reconnect_initial_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 60_000 }

/// Where the database poller sits in the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseTier {
    /// Drained once during boot.
    Archive,
    /// Re-polled during run.
    #[default]
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default)]
    pub max_block: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub tier: DatabaseTier,
}

fn default_batch_size() -> u64 { 10_000 }
fn default_poll_interval_ms() -> u64 { 5_000 }

/// Which sources to build, in no particular order (the sequencer sorts them).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeedConfig {
    #[serde(default)]
    pub archive: Option<ArchiveConfig>,
    #[serde(default)]
    pub rpc: Option<RpcConfig>,
    #[serde(default)]
    pub ws: Option<WsConfig>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

// ─── Logging ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error".
    /// Empty means "use RUST_LOG".
    #[serde(default = "default_level")]
    pub level: String,
    /// component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

// ─── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub chains: Vec<ChainDeployment>,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl DeploymentConfig {
    /// Parse, normalize and validate a YAML descriptor.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: DeploymentConfig = serde_yaml::from_str(yaml)?;
        for chain in &mut config.chains {
            chain.normalize();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainDeployment> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("no chains configured".into()));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "chain {} listed twice",
                    chain.chain_id
                )));
            }
            for address in chain.addresses() {
                if !is_address(address) {
                    return Err(ConfigError::Invalid(format!(
                        "chain {}: '{}' is not a 20-byte hex address",
                        chain.chain_id, address
                    )));
                }
            }
        }
        if let Some(rpc) = &self.feed.rpc {
            if rpc.block_span == Some(0) {
                return Err(ConfigError::Invalid("rpc.block_span must be > 0".into()));
            }
        }
        if let Some(ws) = &self.feed.ws {
            if ws.reconnect_initial_ms == 0 || ws.reconnect_initial_ms > ws.reconnect_max_ms {
                return Err(ConfigError::Invalid(
                    "ws.reconnect_initial_ms must be in 1..=reconnect_max_ms".into(),
                ));
            }
        }
        if let Some(db) = &self.feed.database {
            if db.batch_size == 0 {
                return Err(ConfigError::Invalid("database.batch_size must be > 0".into()));
            }
        }
        Ok(())
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
chains:
  - chain_id: 10
    token:
      address: "0x4200000000000000000000000000000000000042"
    governor:
      address: "0xCDF27F107725988F2261CE2256BDFCDE8B382B10"
      family: agora
    proposal_types:
      address: "0x67ecA7B65Baf0342CE7fBf0AA15921524414C09f"
    modules:
      "0xDD0229D72A414DC821DEC66F3CC4EF6DB2C7B7DF": approval
      "0x27964c5f4F389B8399036e1076d84c6984576C33": optimistic
feed:
  rpc:
    url: "https://mainnet.optimism.io"
  ws:
    url: "wss://mainnet.optimism.io"
"#;

    #[test]
    fn parses_and_normalizes() {
        let cfg = DeploymentConfig::from_yaml_str(YAML).unwrap();
        let chain = cfg.chain(10).unwrap();
        assert_eq!(chain.family(), GovernorFamily::Agora);
        assert_eq!(chain.token_kind(), TokenKind::Erc20);
        assert_eq!(
            chain.governor.as_ref().unwrap().address,
            "0xcdf27f107725988f2261ce2256bdfcde8b382b10"
        );
        assert_eq!(
            chain.module_for("0xdd0229d72a414dc821dec66f3cc4ef6db2c7b7df"),
            Some(VotingModuleKind::Approval)
        );
        let rpc = cfg.feed.rpc.as_ref().unwrap();
        assert_eq!(rpc.max_split_depth, 12);
        assert_eq!(rpc.span_for(10), 10_000);
        assert_eq!(cfg.feed.ws.as_ref().unwrap().reconnect_max_ms, 60_000);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn chain_spans() {
        assert_eq!(default_block_span(1), 2_000);
        assert_eq!(default_block_span(8453), 10_000);
        assert_eq!(default_block_span(137), 5_000);
    }

    #[test]
    fn rejects_bad_address_and_duplicate_chain() {
        let bad = "chains:\n  - chain_id: 1\n    token:\n      address: \"0x1234\"\n";
        assert!(matches!(
            DeploymentConfig::from_yaml_str(bad),
            Err(ConfigError::Invalid(_))
        ));
        let dup = "chains:\n  - chain_id: 1\n  - chain_id: 1\n";
        assert!(DeploymentConfig::from_yaml_str(dup).is_err());
    }

    #[test]
    fn family_field_names() {
        assert_eq!(GovernorFamily::Compound.proposal_id_field(), "id");
        assert_eq!(GovernorFamily::Oz.window_fields(), ("vote_start", "vote_end"));
        assert!(GovernorFamily::Agora.infers_modules());
    }
}
