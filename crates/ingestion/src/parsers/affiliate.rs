use std::collections::BTreeMap;
use swapledger_core_types::Platform;

/// Minimum `:`-segments for a Midgard memo to carry an affiliate tail.
const MEMO_AFFILIATE_MIN_SEGMENTS: usize = 6;
const RECONCILE_MAX_SLIP_BPS: f64 = 500.0;
const RECONCILE_MAX_DIVERGENCE: f64 = 0.10;

/// The platform's slot among the event's referrers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliateMatch {
    pub code: String,
    pub bps: u32,
    pub addresses: Vec<String>,
    pub fee_bps: Vec<u32>,
    /// The memo listed bps but not one per referrer.
    pub bps_mismatch: bool,
    /// Position of `code` in the affiliate field, and how many slots it had.
    pub slot: usize,
    pub slot_count: usize,
}

pub fn split_affiliates(field: &str) -> Vec<String> {
    field
        .split('/')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .collect()
}

/// Bps list from the last `:` segment of a swap memo, e.g. `...:vi:30` or `...:ref/vi:10/35`.
pub fn memo_affiliate_bps(memo: &str) -> Vec<u32> {
    let parts: Vec<&str> = memo.split(':').collect();
    if parts.len() < MEMO_AFFILIATE_MIN_SEGMENTS {
        return Vec::new();
    }
    let Some(tail) = parts.last() else {
        return Vec::new();
    };
    tail.split('/')
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|value| value.parse::<u32>().ok())
        .collect()
}

/// Finds the first allow-listed code in `affiliate_field` and pairs every
/// allow-listed slot with its bps. `None` when no allow-listed code appears.
pub fn resolve_affiliates(
    affiliate_field: &str,
    memo: &str,
    allow_list: &[String],
) -> Option<AffiliateMatch> {
    let slots = split_affiliates(affiliate_field);
    let is_allowed = |code: &str| {
        let lowered = code.to_ascii_lowercase();
        allow_list
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&lowered))
    };
    let platform_index = slots.iter().position(|code| is_allowed(code))?;
    let memo_bps = memo_affiliate_bps(memo);
    let bps_mismatch = !memo_bps.is_empty() && memo_bps.len() != slots.len();

    let platform_bps = memo_bps
        .get(platform_index)
        .or_else(|| memo_bps.first())
        .copied()
        .unwrap_or(0);

    let mut addresses = Vec::new();
    let mut fee_bps = Vec::new();
    for (idx, code) in slots.iter().enumerate() {
        if !is_allowed(code) {
            continue;
        }
        addresses.push(code.to_ascii_lowercase());
        if idx == platform_index {
            fee_bps.push(platform_bps);
        } else {
            fee_bps.push(memo_bps.get(idx).copied().unwrap_or(0));
        }
    }

    Some(AffiliateMatch {
        code: slots[platform_index].to_ascii_lowercase(),
        bps: platform_bps,
        addresses,
        fee_bps,
        bps_mismatch,
        slot: platform_index,
        slot_count: slots.len(),
    })
}

/// Large in/out divergence under low slippage is treated as a bad price feed:
/// both legs take the lower value.
pub fn reconcile_usd(in_usd: f64, out_usd: f64, slip_bps: f64) -> (f64, f64) {
    if in_usd <= 0.0 || out_usd <= 0.0 || slip_bps >= RECONCILE_MAX_SLIP_BPS {
        return (in_usd, out_usd);
    }
    let divergence = (in_usd - out_usd).abs() / in_usd.max(out_usd);
    if divergence > RECONCILE_MAX_DIVERGENCE {
        let lower = in_usd.min(out_usd);
        return (lower, lower);
    }
    (in_usd, out_usd)
}

/// Exact code first, then a suffix match against known codes, else `Other`.
pub fn platform_from_code(code: &str, platform_by_code: &BTreeMap<String, String>) -> Platform {
    let code = code.trim().to_ascii_lowercase();
    if code.is_empty() {
        return Platform::Unknown;
    }
    let resolved = platform_by_code
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(&code))
        .or_else(|| {
            platform_by_code
                .iter()
                .find(|(known, _)| !known.is_empty() && code.ends_with(&known.to_ascii_lowercase()))
        })
        .and_then(|(_, platform)| platform.parse::<Platform>().ok());
    resolved.unwrap_or(Platform::Other)
}

/// Integrator strings are matched by the first platform name they contain.
pub fn platform_from_integrator(
    integrator: &str,
    platform_by_integrator: &BTreeMap<String, String>,
) -> Platform {
    let lowered = integrator.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Platform::Unknown;
    }
    const MATCH_ORDER: [&str; 5] = ["ios", "android", "web", "mac", "windows"];
    for needle in MATCH_ORDER {
        if !lowered.contains(needle) {
            continue;
        }
        if let Some(platform) = platform_by_integrator
            .get(needle)
            .and_then(|platform| platform.parse::<Platform>().ok())
        {
            return platform;
        }
    }
    if lowered.contains("vultisig") {
        return Platform::Unknown;
    }
    Platform::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes() -> Vec<String> {
        vec!["va".to_string(), "vi".to_string(), "v0".to_string()]
    }

    fn code_platforms() -> BTreeMap<String, String> {
        [("va", "android"), ("vi", "ios"), ("v0", "web")]
            .into_iter()
            .map(|(code, platform)| (code.to_string(), platform.to_string()))
            .collect()
    }

    #[test]
    fn dual_affiliate_takes_bps_at_matching_index() {
        let matched = resolve_affiliates(
            "EXTREF/vi",
            "=:ETH.ETH:0xabc:0/1/0:EXTREF/vi:10/35",
            &codes(),
        )
        .expect("vi is allow-listed");
        assert_eq!(matched.code, "vi");
        assert_eq!(matched.bps, 35);
        assert_eq!(matched.addresses, vec!["vi".to_string()]);
        assert_eq!(matched.fee_bps, vec![35]);
        assert!(!matched.bps_mismatch);
        assert_eq!((matched.slot, matched.slot_count), (1, 2));
    }

    #[test]
    fn short_bps_list_falls_back_to_first_value() {
        let matched = resolve_affiliates("EXTREF/va", "=:BTC.BTC:bc1q:0/1/0:EXTREF/va:25", &codes())
            .expect("va is allow-listed");
        assert_eq!(matched.bps, 25);
        assert!(matched.bps_mismatch);
        assert_eq!(matched.addresses.len(), matched.fee_bps.len());
    }

    #[test]
    fn memo_without_affiliate_tail_yields_zero_bps() {
        let matched = resolve_affiliates("vi", "=:ETH.ETH:0xabc", &codes()).expect("match");
        assert_eq!(matched.bps, 0);
        assert_eq!(matched.fee_bps, vec![0]);
        assert!(!matched.bps_mismatch);
    }

    #[test]
    fn foreign_affiliates_are_filtered_out() {
        assert!(resolve_affiliates("t/ss", "=:ETH.ETH:0xabc:0/1/0:t/ss:10/20", &codes()).is_none());
        assert!(resolve_affiliates("", "", &codes()).is_none());
    }

    #[test]
    fn codes_match_case_insensitively() {
        let matched = resolve_affiliates("VI", "=:a:b:c:VI:50", &codes()).expect("match");
        assert_eq!(matched.code, "vi");
        assert_eq!(matched.bps, 50);
    }

    #[test]
    fn reconciliation_boundaries() {
        assert_eq!(reconcile_usd(100.0, 80.0, 200.0), (80.0, 80.0));
        assert_eq!(reconcile_usd(100.0, 80.0, 600.0), (100.0, 80.0));
        assert_eq!(reconcile_usd(100.0, 95.0, 0.0), (100.0, 95.0));
        assert_eq!(reconcile_usd(0.0, 80.0, 0.0), (0.0, 80.0));
    }

    #[test]
    fn platform_from_code_uses_table_then_suffix() {
        let table = code_platforms();
        assert_eq!(platform_from_code("vi", &table), Platform::Ios);
        assert_eq!(platform_from_code("VA", &table), Platform::Android);
        assert_eq!(platform_from_code("thor1xyzv0", &table), Platform::Web);
        assert_eq!(platform_from_code("zz", &table), Platform::Other);
        assert_eq!(platform_from_code("", &table), Platform::Unknown);
    }

    #[test]
    fn platform_from_integrator_checks_names_in_order() {
        let table: BTreeMap<String, String> = ["ios", "android", "web", "mac", "windows"]
            .into_iter()
            .map(|name| (name.to_string(), name.to_string()))
            .collect();
        assert_eq!(platform_from_integrator("vultisig-ios", &table), Platform::Ios);
        assert_eq!(platform_from_integrator("vultisig-windows", &table), Platform::Windows);
        assert_eq!(platform_from_integrator("vultisig", &table), Platform::Unknown);
        assert_eq!(platform_from_integrator("jumper", &table), Platform::Other);
        assert_eq!(platform_from_integrator("", &table), Platform::Unknown);
    }
}
