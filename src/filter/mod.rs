pub mod fragment;

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{Address, B256, U256};

use crate::config::{FactoryConfig, FactorySide, FilterConfig, FilterKind};
use crate::interval::Interval;
use crate::types::{CallKind, SyncLog, SyncTrace, SyncTransaction};

pub type FilterId = String;
pub type FactoryId = String;

/// Where a factory's child address lives in the parent log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLocation {
    /// An indexed parameter: topic 1..3.
    Topic(usize),
    /// A byte offset into the data section; the address occupies the last
    /// 20 bytes of the 32-byte word starting there.
    Offset(usize),
}

/// A rule extracting child contract addresses from a parent event, producing
/// the dynamic address set other filters match against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factory {
    pub id: FactoryId,
    pub chain_id: u64,
    pub address: Address,
    pub event_selector: B256,
    pub child: ChildLocation,
    pub from_block: u64,
    pub to_block: Option<u64>,
}

impl Factory {
    pub fn from_config(chain_id: u64, cfg: &FactoryConfig) -> eyre::Result<Self> {
        let address: Address = cfg
            .address
            .parse()
            .map_err(|e| eyre::eyre!("bad factory address '{}': {e}", cfg.address))?;
        let event_selector: B256 = cfg
            .event_selector
            .parse()
            .map_err(|e| eyre::eyre!("bad factory event selector '{}': {e}", cfg.event_selector))?;
        let child = match cfg.child.as_str() {
            "topic1" => ChildLocation::Topic(1),
            "topic2" => ChildLocation::Topic(2),
            "topic3" => ChildLocation::Topic(3),
            other => {
                let offset = other
                    .strip_prefix("offset")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| eyre::eyre!("bad factory child rule '{}'", other))?;
                ChildLocation::Offset(offset)
            }
        };
        let id = format!(
            "factory_{}_{:#x}_{:#x}_{}",
            chain_id, address, event_selector, cfg.child
        );
        Ok(Factory {
            id,
            chain_id,
            address,
            event_selector,
            child,
            from_block: cfg.from_block.unwrap_or(0),
            to_block: cfg.to_block,
        })
    }

    /// The factory's own block range, clipped to `interval`.
    pub fn range_within(&self, interval: Interval) -> Option<Interval> {
        let own = Interval::new(self.from_block, self.to_block.unwrap_or(u64::MAX));
        own.intersect(&interval)
    }

    /// Pull the child address out of a parent log, or `None` when the log is
    /// not a creation event of this factory.
    pub fn extract_child(&self, log: &SyncLog) -> Option<Address> {
        if log.address != self.address || log.topic(0) != Some(self.event_selector) {
            return None;
        }
        match self.child {
            ChildLocation::Topic(i) => log.topic(i).map(Address::from_word),
            ChildLocation::Offset(offset) => {
                let word = log.data.get(offset..offset + 32)?;
                Some(Address::from_slice(&word[12..]))
            }
        }
    }
}

/// The dynamic child-address sets, keyed by factory. Shared read-mostly by
/// historical workers; updated after the owning insert transaction commits.
#[derive(Debug, Default, Clone)]
pub struct ChildAddresses {
    inner: HashMap<FactoryId, BTreeMap<Address, u64>>,
}

impl ChildAddresses {
    /// Record a discovery. First-seen block numbers only ever decrease.
    pub fn insert(&mut self, factory_id: &str, address: Address, block: u64) {
        let seen = self
            .inner
            .entry(factory_id.to_string())
            .or_default()
            .entry(address)
            .or_insert(block);
        *seen = (*seen).min(block);
    }

    pub fn first_seen(&self, factory_id: &str, address: &Address) -> Option<u64> {
        self.inner.get(factory_id)?.get(address).copied()
    }

    pub fn len(&self, factory_id: &str) -> usize {
        self.inner.get(factory_id).map_or(0, BTreeMap::len)
    }

    /// Child addresses usable as fetch targets for a filter starting at
    /// `filter_from`, up to and including `to_block`. Children first seen
    /// before the filter's own start are excluded.
    pub fn targets(&self, factory_id: &str, filter_from: u64, to_block: u64) -> Vec<Address> {
        self.inner
            .get(factory_id)
            .map(|set| {
                set.iter()
                    .filter(|(_, &seen)| seen >= filter_from && seen <= to_block)
                    .map(|(addr, _)| *addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `address` is a child visible to a filter starting at
    /// `filter_from`, evaluated at `at_block`.
    pub fn matches(
        &self,
        factory_id: &str,
        address: &Address,
        at_block: u64,
        filter_from: u64,
    ) -> bool {
        self.first_seen(factory_id, address)
            .is_some_and(|seen| seen >= filter_from && seen <= at_block)
    }
}

/// Address constraint of a filter: anything, a fixed set, or a factory's
/// child set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    Any,
    Concrete(Vec<Address>),
    Factory(Factory),
}

impl AddressSpec {
    pub fn factory(&self) -> Option<&Factory> {
        match self {
            AddressSpec::Factory(f) => Some(f),
            _ => None,
        }
    }

    fn matches(
        &self,
        address: Option<&Address>,
        at_block: u64,
        filter_from: u64,
        children: &ChildAddresses,
    ) -> bool {
        match self {
            AddressSpec::Any => true,
            AddressSpec::Concrete(list) => {
                address.is_some_and(|a| list.contains(a))
            }
            AddressSpec::Factory(f) => address
                .is_some_and(|a| children.matches(&f.id, a, at_block, filter_from)),
        }
    }

    fn id_part(&self) -> String {
        match self {
            AddressSpec::Any => "any".to_string(),
            AddressSpec::Concrete(list) => {
                let mut parts: Vec<String> =
                    list.iter().map(|a| format!("{a:#x}")).collect();
                parts.sort();
                parts.join("+")
            }
            AddressSpec::Factory(f) => f.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub id: FilterId,
    pub chain_id: u64,
    pub address: AddressSpec,
    /// Accepted values per topic slot; an empty slot is a wildcard.
    pub topics: [Vec<B256>; 4],
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub include_receipts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilter {
    pub id: FilterId,
    pub chain_id: u64,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub include_receipts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFilter {
    pub id: FilterId,
    pub chain_id: u64,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    /// Accepted call shapes; empty accepts all.
    pub call_types: Vec<CallKind>,
    pub min_value: Option<U256>,
    pub function_selector: Option<[u8; 4]>,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub include_receipts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFilter {
    pub id: FilterId,
    pub chain_id: u64,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    pub min_value: Option<U256>,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub include_receipts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFilter {
    pub id: FilterId,
    pub chain_id: u64,
    pub interval: u64,
    pub offset: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
}

impl BlockFilter {
    pub fn matches(&self, number: u64) -> bool {
        number >= self.from_block
            && self.to_block.is_none_or(|hi| number <= hi)
            && number >= self.offset
            && (number - self.offset) % self.interval == 0
    }
}

/// A declared subscription to a slice of on-chain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Log(LogFilter),
    Transaction(TransactionFilter),
    Trace(TraceFilter),
    Transfer(TransferFilter),
    Block(BlockFilter),
}

impl Filter {
    pub fn from_config(chain_id: u64, cfg: &FilterConfig) -> eyre::Result<Self> {
        let from_block = cfg.from_block.unwrap_or(0);
        let to_block = cfg.to_block;
        match cfg.kind {
            FilterKind::Log => {
                let address = if let Some(factory) = &cfg.factory {
                    AddressSpec::Factory(Factory::from_config(chain_id, factory)?)
                } else if cfg.address.is_empty() {
                    AddressSpec::Any
                } else {
                    AddressSpec::Concrete(parse_addresses(&cfg.address)?)
                };
                let topics = [
                    parse_topics(&cfg.topic0)?,
                    parse_topics(&cfg.topic1)?,
                    parse_topics(&cfg.topic2)?,
                    parse_topics(&cfg.topic3)?,
                ];
                let id = log_filter_id(chain_id, &address, &topics, cfg.include_receipts);
                Ok(Filter::Log(LogFilter {
                    id,
                    chain_id,
                    address,
                    topics,
                    from_block,
                    to_block,
                    include_receipts: cfg.include_receipts,
                }))
            }
            FilterKind::Transaction | FilterKind::Trace | FilterKind::Transfer => {
                let (from_address, to_address) = address_pair(chain_id, cfg)?;
                let min_value = cfg
                    .min_value
                    .as_deref()
                    .map(|v| {
                        U256::from_str_radix(v, 10)
                            .map_err(|e| eyre::eyre!("bad min_value '{v}': {e}"))
                    })
                    .transpose()?;
                let prefix = match cfg.kind {
                    FilterKind::Transaction => "transaction",
                    FilterKind::Trace => "trace",
                    _ => "transfer",
                };
                let id = format!(
                    "{}_{}_{}_{}_{}",
                    prefix,
                    chain_id,
                    from_address.id_part(),
                    to_address.id_part(),
                    cfg.include_receipts as u8,
                );
                match cfg.kind {
                    FilterKind::Transaction => Ok(Filter::Transaction(TransactionFilter {
                        id,
                        chain_id,
                        from_address,
                        to_address,
                        from_block,
                        to_block,
                        include_receipts: cfg.include_receipts,
                    })),
                    FilterKind::Trace => {
                        let call_types = cfg
                            .call_type
                            .iter()
                            .map(|t| {
                                CallKind::parse(t)
                                    .ok_or_else(|| eyre::eyre!("unknown call type '{t}'"))
                            })
                            .collect::<eyre::Result<Vec<_>>>()?;
                        let function_selector = cfg
                            .function_selector
                            .as_deref()
                            .map(parse_selector)
                            .transpose()?;
                        Ok(Filter::Trace(TraceFilter {
                            id,
                            chain_id,
                            from_address,
                            to_address,
                            call_types,
                            min_value,
                            function_selector,
                            from_block,
                            to_block,
                            include_receipts: cfg.include_receipts,
                        }))
                    }
                    _ => Ok(Filter::Transfer(TransferFilter {
                        id,
                        chain_id,
                        from_address,
                        to_address,
                        min_value,
                        from_block,
                        to_block,
                        include_receipts: cfg.include_receipts,
                    })),
                }
            }
            FilterKind::Block => {
                let interval = cfg
                    .interval
                    .filter(|i| *i > 0)
                    .ok_or_else(|| eyre::eyre!("block filter needs a positive interval"))?;
                let id = format!("block_{}_{}_{}", chain_id, interval, cfg.offset);
                Ok(Filter::Block(BlockFilter {
                    id,
                    chain_id,
                    interval,
                    offset: cfg.offset,
                    from_block,
                    to_block,
                }))
            }
        }
    }

    pub fn id(&self) -> &FilterId {
        match self {
            Filter::Log(f) => &f.id,
            Filter::Transaction(f) => &f.id,
            Filter::Trace(f) => &f.id,
            Filter::Transfer(f) => &f.id,
            Filter::Block(f) => &f.id,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Filter::Log(f) => f.chain_id,
            Filter::Transaction(f) => f.chain_id,
            Filter::Trace(f) => f.chain_id,
            Filter::Transfer(f) => f.chain_id,
            Filter::Block(f) => f.chain_id,
        }
    }

    pub fn from_block(&self) -> u64 {
        match self {
            Filter::Log(f) => f.from_block,
            Filter::Transaction(f) => f.from_block,
            Filter::Trace(f) => f.from_block,
            Filter::Transfer(f) => f.from_block,
            Filter::Block(f) => f.from_block,
        }
    }

    pub fn to_block(&self) -> Option<u64> {
        match self {
            Filter::Log(f) => f.to_block,
            Filter::Transaction(f) => f.to_block,
            Filter::Trace(f) => f.to_block,
            Filter::Transfer(f) => f.to_block,
            Filter::Block(f) => f.to_block,
        }
    }

    pub fn include_receipts(&self) -> bool {
        match self {
            Filter::Log(f) => f.include_receipts,
            Filter::Transaction(f) => f.include_receipts,
            Filter::Trace(f) => f.include_receipts,
            Filter::Transfer(f) => f.include_receipts,
            Filter::Block(_) => false,
        }
    }

    /// The factory feeding this filter's dynamic address set, if any.
    pub fn factory(&self) -> Option<&Factory> {
        match self {
            Filter::Log(f) => f.address.factory(),
            Filter::Transaction(f) => {
                f.from_address.factory().or_else(|| f.to_address.factory())
            }
            Filter::Trace(f) => f.from_address.factory().or_else(|| f.to_address.factory()),
            Filter::Transfer(f) => {
                f.from_address.factory().or_else(|| f.to_address.factory())
            }
            Filter::Block(_) => None,
        }
    }

    /// The filter's own `[from_block, to_block]` clipped to `interval`.
    pub fn range_within(&self, interval: Interval) -> Option<Interval> {
        let own = Interval::new(self.from_block(), self.to_block().unwrap_or(u64::MAX));
        own.intersect(&interval)
    }

    pub fn needs_traces(&self) -> bool {
        matches!(self, Filter::Trace(_) | Filter::Transfer(_))
    }
}

impl LogFilter {
    pub fn matches(&self, log: &SyncLog, children: &ChildAddresses) -> bool {
        if !in_block_range(log.block_number, self.from_block, self.to_block) {
            return false;
        }
        if !self.address.matches(
            Some(&log.address),
            log.block_number,
            self.from_block,
            children,
        ) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty() || log.topic(i).is_some_and(|t| accepted.contains(&t))
        })
    }
}

impl TransactionFilter {
    pub fn matches(&self, tx: &SyncTransaction, children: &ChildAddresses) -> bool {
        in_block_range(tx.block_number, self.from_block, self.to_block)
            && self.from_address.matches(
                Some(&tx.from),
                tx.block_number,
                self.from_block,
                children,
            )
            && self
                .to_address
                .matches(tx.to.as_ref(), tx.block_number, self.from_block, children)
    }
}

impl TraceFilter {
    pub fn matches(&self, trace: &SyncTrace, children: &ChildAddresses) -> bool {
        if !in_block_range(trace.block_number, self.from_block, self.to_block) {
            return false;
        }
        if !self.call_types.is_empty() && !self.call_types.contains(&trace.kind) {
            return false;
        }
        if let Some(min) = self.min_value {
            if trace.value < min {
                return false;
            }
        }
        if let Some(selector) = self.function_selector {
            if trace.input.len() < 4 || trace.input[..4] != selector {
                return false;
            }
        }
        self.from_address.matches(
            Some(&trace.from),
            trace.block_number,
            self.from_block,
            children,
        ) && self.to_address.matches(
            trace.to.as_ref(),
            trace.block_number,
            self.from_block,
            children,
        )
    }
}

impl TransferFilter {
    pub fn matches(&self, trace: &SyncTrace, children: &ChildAddresses) -> bool {
        if !trace.is_transfer() {
            return false;
        }
        if !in_block_range(trace.block_number, self.from_block, self.to_block) {
            return false;
        }
        if let Some(min) = self.min_value {
            if trace.value < min {
                return false;
            }
        }
        self.from_address.matches(
            Some(&trace.from),
            trace.block_number,
            self.from_block,
            children,
        ) && self.to_address.matches(
            trace.to.as_ref(),
            trace.block_number,
            self.from_block,
            children,
        )
    }
}

fn in_block_range(number: u64, from: u64, to: Option<u64>) -> bool {
    number >= from && to.is_none_or(|hi| number <= hi)
}

fn address_pair(
    chain_id: u64,
    cfg: &FilterConfig,
) -> eyre::Result<(AddressSpec, AddressSpec)> {
    let concrete = |list: &[String]| -> eyre::Result<AddressSpec> {
        Ok(if list.is_empty() {
            AddressSpec::Any
        } else {
            AddressSpec::Concrete(parse_addresses(list)?)
        })
    };
    let mut from_address = concrete(&cfg.from_address)?;
    let mut to_address = concrete(&cfg.to_address)?;
    if let Some(factory) = &cfg.factory {
        let factory = AddressSpec::Factory(Factory::from_config(chain_id, factory)?);
        match cfg.factory_side.unwrap_or(FactorySide::To) {
            FactorySide::From => from_address = factory,
            FactorySide::To => to_address = factory,
        }
    }
    Ok((from_address, to_address))
}

fn parse_addresses(list: &[String]) -> eyre::Result<Vec<Address>> {
    list.iter()
        .map(|s| {
            s.parse::<Address>()
                .map_err(|e| eyre::eyre!("bad address '{s}': {e}"))
        })
        .collect()
}

fn parse_topics(list: &[String]) -> eyre::Result<Vec<B256>> {
    list.iter()
        .map(|s| {
            s.parse::<B256>()
                .map_err(|e| eyre::eyre!("bad topic '{s}': {e}"))
        })
        .collect()
}

fn parse_selector(s: &str) -> eyre::Result<[u8; 4]> {
    let bytes =
        hex::decode(s.trim_start_matches("0x")).map_err(|e| eyre::eyre!("bad selector '{s}': {e}"))?;
    let arr: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| eyre::eyre!("selector '{s}' must be 4 bytes"))?;
    Ok(arr)
}

fn log_filter_id(
    chain_id: u64,
    address: &AddressSpec,
    topics: &[Vec<B256>; 4],
    include_receipts: bool,
) -> FilterId {
    let topic_part = |list: &Vec<B256>| {
        if list.is_empty() {
            "null".to_string()
        } else {
            let mut parts: Vec<String> = list.iter().map(|t| format!("{t:#x}")).collect();
            parts.sort();
            parts.join("+")
        }
    };
    format!(
        "log_{}_{}_{}_{}_{}_{}_{}",
        chain_id,
        address.id_part(),
        topic_part(&topics[0]),
        topic_part(&topics[1]),
        topic_part(&topics[2]),
        topic_part(&topics[3]),
        include_receipts as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;

    fn log(address: Address, topics: Vec<B256>, block: u64) -> SyncLog {
        SyncLog {
            chain_id: 1,
            block_hash: B256::repeat_byte(1),
            block_number: block,
            block_timestamp: Some(100),
            log_index: 0,
            transaction_hash: B256::repeat_byte(2),
            transaction_index: 0,
            address,
            topics,
            data: Bytes::new(),
        }
    }

    fn transfer_topic() -> B256 {
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_log_filter_topic_and_address_matching() {
        let token = Address::repeat_byte(0x11);
        let filter = LogFilter {
            id: "f".into(),
            chain_id: 1,
            address: AddressSpec::Concrete(vec![token]),
            topics: [vec![transfer_topic()], vec![], vec![], vec![]],
            from_block: 10,
            to_block: Some(100),
            include_receipts: false,
        };
        let children = ChildAddresses::default();

        assert!(filter.matches(&log(token, vec![transfer_topic()], 50), &children));
        // wrong address
        assert!(!filter.matches(&log(Address::repeat_byte(0x22), vec![transfer_topic()], 50), &children));
        // wrong topic0
        assert!(!filter.matches(&log(token, vec![B256::repeat_byte(9)], 50), &children));
        // outside block range
        assert!(!filter.matches(&log(token, vec![transfer_topic()], 5), &children));
        assert!(!filter.matches(&log(token, vec![transfer_topic()], 101), &children));
    }

    #[test]
    fn test_factory_child_extraction_from_topic() {
        let factory = Factory {
            id: "fac".into(),
            chain_id: 1,
            address: Address::repeat_byte(0xfa),
            event_selector: B256::repeat_byte(0xee),
            child: ChildLocation::Topic(1),
            from_block: 0,
            to_block: None,
        };
        let child = Address::repeat_byte(0xcc);
        let parent_log = log(
            factory.address,
            vec![factory.event_selector, child.into_word()],
            10,
        );
        assert_eq!(factory.extract_child(&parent_log), Some(child));

        // wrong selector extracts nothing
        let other = log(factory.address, vec![B256::repeat_byte(1), child.into_word()], 10);
        assert_eq!(factory.extract_child(&other), None);
    }

    #[test]
    fn test_factory_child_extraction_from_data_offset() {
        let factory = Factory {
            id: "fac".into(),
            chain_id: 1,
            address: Address::repeat_byte(0xfa),
            event_selector: B256::repeat_byte(0xee),
            child: ChildLocation::Offset(32),
            from_block: 0,
            to_block: None,
        };
        let child = Address::repeat_byte(0xcd);
        let mut data = vec![0u8; 64];
        data[44..64].copy_from_slice(child.as_slice());
        let mut parent_log = log(factory.address, vec![factory.event_selector], 10);
        parent_log.data = Bytes::from(data);
        assert_eq!(factory.extract_child(&parent_log), Some(child));
    }

    #[test]
    fn test_child_first_seen_only_decreases() {
        let mut children = ChildAddresses::default();
        let a = Address::repeat_byte(1);
        children.insert("fac", a, 20);
        children.insert("fac", a, 30);
        assert_eq!(children.first_seen("fac", &a), Some(20));
        children.insert("fac", a, 10);
        assert_eq!(children.first_seen("fac", &a), Some(10));
    }

    #[test]
    fn test_children_before_filter_from_block_are_excluded() {
        // Parent emits children at blocks 10, 20, 20; dependent filter
        // starts at 15, so the block-10 child is not a target.
        let mut children = ChildAddresses::default();
        children.insert("fac", Address::repeat_byte(1), 10);
        children.insert("fac", Address::repeat_byte(2), 20);
        children.insert("fac", Address::repeat_byte(3), 20);

        let targets = children.targets("fac", 15, 100);
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&Address::repeat_byte(1)));

        assert!(!children.matches("fac", &Address::repeat_byte(1), 50, 15));
        assert!(children.matches("fac", &Address::repeat_byte(2), 50, 15));
        // not yet discovered at block 12
        assert!(!children.matches("fac", &Address::repeat_byte(2), 12, 0));
    }

    #[test]
    fn test_block_filter_modulo() {
        let filter = BlockFilter {
            id: "b".into(),
            chain_id: 1,
            interval: 10,
            offset: 3,
            from_block: 0,
            to_block: None,
        };
        assert!(filter.matches(3));
        assert!(filter.matches(13));
        assert!(!filter.matches(10));
        assert!(!filter.matches(2));
    }

    #[test]
    fn test_trace_filter_call_type_and_selector() {
        let filter = TraceFilter {
            id: "t".into(),
            chain_id: 1,
            from_address: AddressSpec::Any,
            to_address: AddressSpec::Any,
            call_types: vec![CallKind::Call],
            min_value: Some(U256::from(100)),
            function_selector: Some([0xaa, 0xbb, 0xcc, 0xdd]),
            from_block: 0,
            to_block: None,
            include_receipts: false,
        };
        let mut trace = SyncTrace {
            chain_id: 1,
            transaction_hash: B256::repeat_byte(1),
            block_hash: B256::repeat_byte(2),
            block_number: 10,
            block_timestamp: 100,
            transaction_index: 0,
            trace_address: vec![],
            trace_index: 0,
            kind: CallKind::Call,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::from(500),
            input: Bytes::from(vec![0xaa, 0xbb, 0xcc, 0xdd, 0x01]),
            output: None,
            gas_used: 21000,
            error: None,
        };
        let children = ChildAddresses::default();
        assert!(filter.matches(&trace, &children));

        trace.kind = CallKind::StaticCall;
        assert!(!filter.matches(&trace, &children));
        trace.kind = CallKind::Call;
        trace.value = U256::from(1);
        assert!(!filter.matches(&trace, &children));
        trace.value = U256::from(500);
        trace.input = Bytes::from(vec![0x00, 0xbb, 0xcc, 0xdd]);
        assert!(!filter.matches(&trace, &children));
    }

    #[test]
    fn test_filter_ids_are_deterministic() {
        let cfg = FilterConfig {
            kind: FilterKind::Log,
            from_block: Some(1),
            to_block: None,
            include_receipts: false,
            address: vec!["0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into()],
            topic0: vec![
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".into(),
            ],
            topic1: vec![],
            topic2: vec![],
            topic3: vec![],
            from_address: vec![],
            to_address: vec![],
            call_type: vec![],
            min_value: None,
            function_selector: None,
            interval: None,
            offset: 0,
            factory: None,
            factory_side: None,
        };
        let a = Filter::from_config(1, &cfg).unwrap();
        let b = Filter::from_config(1, &cfg).unwrap();
        assert_eq!(a.id(), b.id());
        let c = Filter::from_config(10, &cfg).unwrap();
        assert_ne!(a.id(), c.id());
    }
}
