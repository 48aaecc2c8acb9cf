use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `postgres://...` or `sqlite://...` connection string.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Namespace (schema prefix) for user tables.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_max_connections() -> u32 {
    10
}

fn default_namespace() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    /// Ordered list of HTTP JSON-RPC endpoints; all participate in routing.
    pub rpc: Vec<String>,
    /// Optional WebSocket endpoint for the newHeads subscription.
    pub ws: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks behind head beyond which the chain is treated as immutable.
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Whether cached intervals are read from / written to the sync store.
    #[serde(default = "default_cache")]
    pub cache: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_finality_depth() -> u64 {
    64
}

fn default_cache() -> bool {
    true
}

/// One declared filter. `kind` selects the variant; unrelated fields must be
/// left unset.
#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    #[serde(default)]
    pub include_receipts: bool,

    /// Log filters: concrete contract addresses (empty with no factory
    /// means any address).
    #[serde(default)]
    pub address: Vec<String>,
    /// Log filters: accepted values per topic slot, empty meaning wildcard.
    #[serde(default)]
    pub topic0: Vec<String>,
    #[serde(default)]
    pub topic1: Vec<String>,
    #[serde(default)]
    pub topic2: Vec<String>,
    #[serde(default)]
    pub topic3: Vec<String>,

    /// Transaction/trace/transfer filters.
    #[serde(default)]
    pub from_address: Vec<String>,
    #[serde(default)]
    pub to_address: Vec<String>,
    /// Trace filters: accepted call types, e.g. `["CALL", "DELEGATECALL"]`.
    #[serde(default)]
    pub call_type: Vec<String>,
    /// Trace/transfer filters: minimum value in wei, decimal string.
    pub min_value: Option<String>,
    /// Trace filters: required 4-byte selector, `0x`-prefixed.
    pub function_selector: Option<String>,

    /// Block filters: emit every `interval`-th block shifted by `offset`.
    pub interval: Option<u64>,
    #[serde(default)]
    pub offset: u64,

    /// A factory standing in for `address` (log filters) or for
    /// `from_address`/`to_address` (trace/transfer/transaction filters).
    pub factory: Option<FactoryConfig>,
    /// Which side of a trace/transfer the factory constrains.
    pub factory_side: Option<FactorySide>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Log,
    Transaction,
    Trace,
    Transfer,
    Block,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactorySide {
    From,
    To,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FactoryConfig {
    /// The parent contract emitting child-creation events.
    pub address: String,
    /// topic0 of the creation event, `0x`-prefixed 32 bytes.
    pub event_selector: String,
    /// Where the child address lives in the parent log: `"topic1"`..`"topic3"`
    /// or `"offset<N>"` for a byte offset into the data section.
    pub child: String,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        for chain in &self.chains {
            if chain.rpc.is_empty() {
                return Err(eyre::eyre!(
                    "Chain '{}' must have at least one rpc endpoint",
                    chain.name
                ));
            }
            if chain.finality_depth == 0 {
                return Err(eyre::eyre!(
                    "Chain '{}' finality_depth must be positive",
                    chain.name
                ));
            }
            for filter in &chain.filters {
                validate_filter(&chain.name, filter)?;
            }
        }
        Ok(())
    }
}

fn validate_filter(chain: &str, filter: &FilterConfig) -> eyre::Result<()> {
    let addresses = filter
        .address
        .iter()
        .chain(&filter.from_address)
        .chain(&filter.to_address);
    for address in addresses {
        if !is_hex_of_len(address, 42) {
            return Err(eyre::eyre!(
                "Invalid address '{}' in filter on chain '{}'",
                address,
                chain
            ));
        }
    }
    let topics = filter
        .topic0
        .iter()
        .chain(&filter.topic1)
        .chain(&filter.topic2)
        .chain(&filter.topic3);
    for topic in topics {
        if !is_hex_of_len(topic, 66) {
            return Err(eyre::eyre!(
                "Invalid topic '{}' in filter on chain '{}'",
                topic,
                chain
            ));
        }
    }
    if filter.kind == FilterKind::Block {
        match filter.interval {
            None | Some(0) => {
                return Err(eyre::eyre!(
                    "Block filter on chain '{}' needs a positive interval",
                    chain
                ))
            }
            Some(_) => {}
        }
    }
    if let Some(factory) = &filter.factory {
        if !is_hex_of_len(&factory.address, 42) {
            return Err(eyre::eyre!(
                "Invalid factory address '{}' on chain '{}'",
                factory.address,
                chain
            ));
        }
        if !is_hex_of_len(&factory.event_selector, 66) {
            return Err(eyre::eyre!(
                "Invalid factory event selector '{}' on chain '{}'",
                factory.event_selector,
                chain
            ));
        }
        let child_ok = matches!(factory.child.as_str(), "topic1" | "topic2" | "topic3")
            || factory
                .child
                .strip_prefix("offset")
                .is_some_and(|n| n.parse::<usize>().is_ok());
        if !child_ok {
            return Err(eyre::eyre!(
                "Invalid factory child rule '{}' on chain '{}'",
                factory.child,
                chain
            ));
        }
    }
    Ok(())
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[[chains]]
name = "ethereum"
chain_id = 1
rpc = ["http://localhost:8545", "http://localhost:8546"]
ws = "ws://localhost:8545"

[[chains.filters]]
kind = "log"
address = ["0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"]
topic0 = ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"]
from_block = 1000
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].chain_id, 1);
        assert_eq!(config.chains[0].rpc.len(), 2);
        assert_eq!(config.chains[0].poll_interval_ms, 2000); // default
        assert_eq!(config.chains[0].finality_depth, 64); // default
        assert!(config.chains[0].cache); // default
        let filter = &config.chains[0].filters[0];
        assert_eq!(filter.kind, FilterKind::Log);
        assert_eq!(filter.from_block, Some(1000));
    }

    #[test]
    fn test_parse_factory_filter() {
        let toml_str = r#"
[database]
url = "sqlite://chainmirror.db"

[[chains]]
name = "base"
chain_id = 8453
rpc = ["http://localhost:8545"]

[[chains.filters]]
kind = "log"
topic0 = ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"]

[chains.filters.factory]
address = "0x33128a8fC17869897dcE68Ed026d694621f6FDfD"
event_selector = "0x783cca1c0412dd0d695e784568c96da2e9c22ff989357a2e8b1d9b2b4e6b7118"
child = "topic3"
from_block = 100
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        let factory = config.chains[0].filters[0].factory.as_ref().unwrap();
        assert_eq!(factory.child, "topic3");
        assert_eq!(factory.from_block, Some(100));
    }

    #[test]
    fn test_validate_empty_chains() {
        let config = Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
                namespace: "public".to_string(),
            },
            chains: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_address() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"

[[chains]]
name = "test"
chain_id = 1
rpc = ["http://localhost:8545"]

[[chains.filters]]
kind = "log"
address = ["not-an-address"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_block_filter_needs_interval() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"

[[chains]]
name = "test"
chain_id = 1
rpc = ["http://localhost:8545"]

[[chains.filters]]
kind = "block"
offset = 3
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }
}
