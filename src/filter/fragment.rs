//! Decomposition of filters into the minimal wire-level subscriptions whose
//! progress can be cached and reused across filters.

use std::collections::HashMap;

use alloy::primitives::B256;

use crate::filter::{AddressSpec, Filter};
use crate::interval::{self, Interval};

/// One wire-level unit of a filter: enough to run a single request, with a
/// stable id so cached progress survives restarts and is shared between
/// filters that decompose to the same fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: String,
}

/// Decompose a filter into its fragments: the cartesian product over each
/// multi-valued coordinate, with wildcards kept as a single `null`
/// coordinate. A filter with no multi-valued coordinates is one fragment.
pub fn fragments(filter: &Filter) -> Vec<Fragment> {
    match filter {
        Filter::Log(f) => {
            let addresses = address_parts(&f.address);
            let mut out = Vec::new();
            for address in &addresses {
                for t0 in topic_parts(&f.topics[0]) {
                    for t1 in topic_parts(&f.topics[1]) {
                        for t2 in topic_parts(&f.topics[2]) {
                            for t3 in topic_parts(&f.topics[3]) {
                                out.push(Fragment {
                                    id: format!(
                                        "log_{}_{}_{}_{}_{}_{}_{}",
                                        f.chain_id,
                                        address,
                                        t0,
                                        t1,
                                        t2,
                                        t3,
                                        f.include_receipts as u8
                                    ),
                                });
                            }
                        }
                    }
                }
            }
            out
        }
        Filter::Transaction(f) => {
            pair_fragments("transaction", f.chain_id, &f.from_address, &f.to_address, f.include_receipts)
        }
        Filter::Trace(f) => {
            pair_fragments("trace", f.chain_id, &f.from_address, &f.to_address, f.include_receipts)
        }
        Filter::Transfer(f) => {
            pair_fragments("transfer", f.chain_id, &f.from_address, &f.to_address, f.include_receipts)
        }
        Filter::Block(f) => vec![Fragment {
            id: format!("block_{}_{}_{}", f.chain_id, f.interval, f.offset),
        }],
    }
}

fn pair_fragments(
    prefix: &str,
    chain_id: u64,
    from: &AddressSpec,
    to: &AddressSpec,
    include_receipts: bool,
) -> Vec<Fragment> {
    let mut out = Vec::new();
    for f in address_parts(from) {
        for t in address_parts(to) {
            out.push(Fragment {
                id: format!(
                    "{}_{}_{}_{}_{}",
                    prefix, chain_id, f, t, include_receipts as u8
                ),
            });
        }
    }
    out
}

fn address_parts(spec: &AddressSpec) -> Vec<String> {
    match spec {
        AddressSpec::Any => vec!["null".to_string()],
        AddressSpec::Concrete(list) => {
            let mut parts: Vec<String> = list.iter().map(|a| format!("{a:#x}")).collect();
            parts.sort();
            parts
        }
        AddressSpec::Factory(f) => vec![f.id.clone()],
    }
}

fn topic_parts(list: &[B256]) -> Vec<String> {
    if list.is_empty() {
        vec!["null".to_string()]
    } else {
        let mut parts: Vec<String> = list.iter().map(|t| format!("{t:#x}")).collect();
        parts.sort();
        parts
    }
}

/// The blocks already fully cached for a filter: a block is covered only
/// when every fragment of the filter has it.
pub fn cached_for_filter(
    filter: &Filter,
    cached: &HashMap<String, Vec<Interval>>,
) -> Vec<Interval> {
    let mut acc: Option<Vec<Interval>> = None;
    for fragment in fragments(filter) {
        let set = cached.get(&fragment.id).cloned().unwrap_or_default();
        acc = Some(match acc {
            None => interval::union(&set),
            Some(prev) => interval::intersection(&prev, &set),
        });
    }
    acc.unwrap_or_default()
}

/// What still needs fetching for each filter to cover `request`.
///
/// Per filter: clip `request` to the filter's own range, union in the
/// factory's live range, subtract what is cached, and — when a factory is
/// involved — widen the remaining work rightward from the earliest missing
/// block, because child discovery is order-sensitive.
pub fn required_intervals(
    request: Interval,
    cached: &HashMap<String, Vec<Interval>>,
    filters: &[Filter],
) -> Vec<(usize, Vec<Interval>)> {
    let mut out = Vec::new();
    for (idx, filter) in filters.iter().enumerate() {
        let mut wanted: Vec<Interval> = filter.range_within(request).into_iter().collect();
        if let Some(factory) = filter.factory() {
            if let Some(live) = factory.range_within(request) {
                wanted = interval::union(&[wanted.as_slice(), &[live]].concat());
            }
        }
        if wanted.is_empty() {
            continue;
        }

        let covered = cached_for_filter(filter, cached);
        let mut missing = interval::difference(&wanted, &covered);

        if filter.factory().is_some() {
            if let (Some(first), Some(outer)) =
                (missing.first().copied(), interval::bounds(&wanted))
            {
                missing = vec![Interval::new(first.lo, outer.hi)];
            }
        }

        if !missing.is_empty() {
            out.push((idx, missing));
        }
    }
    out
}

/// The closest-to-tip block `B` such that every filter has `[from_block, B]`
/// fully cached; the resume point after a restart. `None` when some filter
/// has not even covered its own first block.
pub fn cached_block(
    filters: &[Filter],
    cached: &HashMap<String, Vec<Interval>>,
) -> Option<u64> {
    let mut best: Option<u64> = None;
    for filter in filters {
        let covered = cached_for_filter(filter, cached);
        let from = filter.from_block();
        let prefix_end = covered
            .iter()
            .find(|iv| iv.contains(from))
            .map(|iv| iv.hi);
        let bound = match prefix_end {
            Some(hi) => hi,
            None if from > 0 => from - 1,
            None => return None,
        };
        best = Some(best.map_or(bound, |b: u64| b.min(bound)));
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{
        AddressSpec, BlockFilter, ChildLocation, Factory, LogFilter,
    };
    use alloy::primitives::Address;

    fn log_filter(
        address: AddressSpec,
        topic0: Vec<B256>,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Filter {
        Filter::Log(LogFilter {
            id: "test".into(),
            chain_id: 1,
            address,
            topics: [topic0, vec![], vec![], vec![]],
            from_block,
            to_block,
            include_receipts: false,
        })
    }

    fn test_factory() -> Factory {
        Factory {
            id: "factory_1_test".into(),
            chain_id: 1,
            address: Address::repeat_byte(0xfa),
            event_selector: B256::repeat_byte(0xee),
            child: ChildLocation::Topic(1),
            from_block: 0,
            to_block: None,
        }
    }

    #[test]
    fn test_fragment_per_topic_value() {
        let filter = log_filter(
            AddressSpec::Concrete(vec![Address::repeat_byte(1), Address::repeat_byte(2)]),
            vec![B256::repeat_byte(0xa), B256::repeat_byte(0xb)],
            0,
            None,
        );
        let frags = fragments(&filter);
        // 2 addresses x 2 topic0 values, wildcards collapse to one coordinate
        assert_eq!(frags.len(), 4);
        let ids: std::collections::HashSet<_> = frags.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids.len(), 4, "fragment ids must be distinct");
    }

    #[test]
    fn test_fragments_shared_across_filters() {
        let a = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 0, None);
        let b = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 500, None);
        // same wire shape, different block ranges: identical fragments
        assert_eq!(fragments(&a), fragments(&b));
    }

    #[test]
    fn test_block_filter_single_fragment() {
        let filter = Filter::Block(BlockFilter {
            id: "b".into(),
            chain_id: 1,
            interval: 10,
            offset: 3,
            from_block: 0,
            to_block: None,
        });
        assert_eq!(fragments(&filter).len(), 1);
    }

    #[test]
    fn test_required_intervals_subtracts_cache() {
        let filter = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 0, None);
        let frag_id = fragments(&filter)[0].id.clone();
        let cached = HashMap::from([(frag_id, vec![Interval::new(0, 49)])]);

        let required = required_intervals(Interval::new(0, 100), &cached, &[filter]);
        assert_eq!(required, vec![(0, vec![Interval::new(50, 100)])]);
    }

    #[test]
    fn test_required_intervals_clips_to_filter_range() {
        let filter = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 20, Some(60));
        let required = required_intervals(Interval::new(0, 100), &HashMap::new(), &[filter]);
        assert_eq!(required, vec![(0, vec![Interval::new(20, 60)])]);
    }

    #[test]
    fn test_required_intervals_fully_cached_is_empty() {
        let filter = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 0, None);
        let frag_id = fragments(&filter)[0].id.clone();
        let cached = HashMap::from([(frag_id, vec![Interval::new(0, 100)])]);
        assert!(required_intervals(Interval::new(0, 100), &cached, &[filter]).is_empty());
    }

    #[test]
    fn test_factory_widens_rightward() {
        let filter = log_filter(
            AddressSpec::Factory(test_factory()),
            vec![B256::repeat_byte(0xa)],
            0,
            None,
        );
        let frag_id = fragments(&filter)[0].id.clone();
        // cached hole in the middle: [0,30] and [60,100] cached
        let cached = HashMap::from([(
            frag_id,
            vec![Interval::new(0, 30), Interval::new(60, 100)],
        )]);

        let required = required_intervals(Interval::new(0, 100), &cached, &[filter]);
        // child discovery is order-sensitive, so everything right of the
        // hole is re-driven even though [60,100] was cached
        assert_eq!(required, vec![(0, vec![Interval::new(31, 100)])]);
    }

    #[test]
    fn test_cached_block_is_min_across_filters() {
        let a = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 0, None);
        let b = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xb)], 0, None);
        let cached = HashMap::from([
            (fragments(&a)[0].id.clone(), vec![Interval::new(0, 80)]),
            (fragments(&b)[0].id.clone(), vec![Interval::new(0, 50)]),
        ]);
        assert_eq!(cached_block(&[a, b], &cached), Some(50));
    }

    #[test]
    fn test_cached_block_ignores_non_prefix_coverage() {
        let a = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 10, None);
        let cached = HashMap::from([(
            fragments(&a)[0].id.clone(),
            vec![Interval::new(40, 80)],
        )]);
        // nothing covers block 10 itself, resume just before it
        assert_eq!(cached_block(&[a], &cached), Some(9));
    }

    #[test]
    fn test_cached_block_none_when_uncovered_from_zero() {
        let a = log_filter(AddressSpec::Any, vec![B256::repeat_byte(0xa)], 0, None);
        assert_eq!(cached_block(&[a], &HashMap::new()), None);
    }

    #[test]
    fn test_multi_fragment_filter_requires_all_fragments() {
        let filter = log_filter(
            AddressSpec::Any,
            vec![B256::repeat_byte(0xa), B256::repeat_byte(0xb)],
            0,
            None,
        );
        let frags = fragments(&filter);
        assert_eq!(frags.len(), 2);
        // only one of the two topic fragments is cached
        let cached = HashMap::from([(frags[0].id.clone(), vec![Interval::new(0, 100)])]);
        let required = required_intervals(Interval::new(0, 100), &cached, &[filter]);
        assert_eq!(required, vec![(0, vec![Interval::new(0, 100)])]);
    }
}
