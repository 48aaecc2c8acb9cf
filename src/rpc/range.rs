//! Interpretation of provider-specific `eth_getLogs` rejections.
//!
//! Providers cap log queries in incompatible ways and describe the cap in
//! free text. This helper inspects the error string and proposes smaller
//! sub-ranges when it recognizes one.

use crate::interval::Interval;

/// Propose sub-ranges of `requested` based on a provider error message, or
/// `None` when the message does not look like a range complaint (or the
/// range cannot shrink further).
pub fn suggest_ranges(message: &str, requested: Interval) -> Option<Vec<Interval>> {
    if requested.len() <= 1 {
        return None;
    }
    let lower = message.to_ascii_lowercase();

    // Alchemy: "this block range should work: [0x..., 0x...]"
    if let Some(range) = parse_suggested_hex_pair(&lower) {
        if let Some(clipped) = range.intersect(&requested) {
            if clipped.len() < requested.len() {
                return Some(fill_remainder(clipped, requested));
            }
        }
    }

    // "... is limited to a 2000 blocks range" / "max is 1000" /
    // "up to a 10000 block range"
    if lower.contains("range") {
        if let Some(cap) = parse_block_cap(&lower) {
            if cap > 0 && cap < requested.len() {
                return Some(requested.chunks(cap));
            }
        }
    }

    // Result-size complaints give no usable number; halve.
    const HALVE_MARKERS: [&str; 6] = [
        "query returned more than",
        "response size exceeded",
        "response too large",
        "query timeout exceeded",
        "block range is too large",
        "block range is too wide",
    ];
    if HALVE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(halve(requested));
    }

    None
}

fn halve(iv: Interval) -> Vec<Interval> {
    let mid = iv.lo + (iv.hi - iv.lo) / 2;
    vec![Interval::new(iv.lo, mid), Interval::new(mid + 1, iv.hi)]
}

/// The suggested first sub-range plus whatever of `requested` it leaves
/// uncovered, so the caller still fetches everything.
fn fill_remainder(first: Interval, requested: Interval) -> Vec<Interval> {
    let mut out = vec![first];
    if first.hi < requested.hi {
        out.extend(Interval::new(first.hi + 1, requested.hi).chunks(first.len()));
    }
    out
}

fn parse_suggested_hex_pair(message: &str) -> Option<Interval> {
    let open = message.find('[')?;
    let close = message[open..].find(']')? + open;
    let inner = &message[open + 1..close];
    let mut parts = inner.split(',').map(str::trim);
    let lo = parse_hex(parts.next()?)?;
    let hi = parse_hex(parts.next()?)?;
    (lo <= hi).then(|| Interval::new(lo, hi))
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

/// First integer that plausibly names a block cap, e.g. "2000" in
/// "limited to a 2000 blocks range".
fn parse_block_cap(message: &str) -> Option<u64> {
    let mut best: Option<u64> = None;
    let mut current = String::new();
    for c in message.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            if current.len() >= 2 {
                if let Ok(n) = current.parse::<u64>() {
                    // error codes like -32000 are preceded by digits too;
                    // prefer the smallest plausible cap
                    if (10..=1_000_000).contains(&n) {
                        best = Some(best.map_or(n, |b: u64| b.min(n)));
                    }
                }
            }
            current.clear();
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval;

    #[test]
    fn test_alchemy_style_suggestion() {
        let requested = Interval::new(0x100, 0x1100);
        let msg = "Log response size exceeded. You can make eth_getLogs requests with up to a 2K block range and no limit on the response size, or you can request any block range with a cap of 10K logs in the response. Based on your parameters and the response size limit, this block range should work: [0x100, 0x4ff]";
        let ranges = suggest_ranges(msg, requested).unwrap();
        assert_eq!(ranges[0], Interval::new(0x100, 0x4ff));
        // the whole requested range is still covered
        assert_eq!(interval::union(&ranges), vec![requested]);
    }

    #[test]
    fn test_block_cap_in_text() {
        let requested = Interval::new(0, 9999);
        let msg = "eth_getLogs is limited to a 2000 blocks range";
        let ranges = suggest_ranges(msg, requested).unwrap();
        assert!(ranges.iter().all(|iv| iv.len() <= 2000));
        assert_eq!(interval::union(&ranges), vec![requested]);
    }

    #[test]
    fn test_result_count_halves() {
        let requested = Interval::new(0, 999);
        let msg = "query returned more than 10000 results";
        let ranges = suggest_ranges(msg, requested).unwrap();
        assert_eq!(ranges, vec![Interval::new(0, 499), Interval::new(500, 999)]);
    }

    #[test]
    fn test_unrelated_error_is_ignored() {
        let requested = Interval::new(0, 999);
        assert_eq!(suggest_ranges("execution reverted", requested), None);
        assert_eq!(suggest_ranges("internal error", requested), None);
    }

    #[test]
    fn test_single_block_cannot_shrink() {
        let requested = Interval::new(5, 5);
        assert_eq!(
            suggest_ranges("query returned more than 10000 results", requested),
            None
        );
    }

    #[test]
    fn test_split_preserves_coverage() {
        let requested = Interval::new(100, 10_099);
        for msg in [
            "block range is too wide",
            "requested range 10000 exceeds allowed range",
        ] {
            if let Some(ranges) = suggest_ranges(msg, requested) {
                assert_eq!(interval::union(&ranges), vec![requested], "{msg}");
            }
        }
    }
}
