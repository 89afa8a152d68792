// Ranking
// Multipliers applied on top of the text index's bm25-like base score:
// recency (bucketed by mtime age), structural boost (hits inside known
// symbol blocks), and the exact-token bonus. All weights come from
// RankingConfig and are folded into config_hash, so a weight change
// invalidates old snapshots instead of mixing rankings.

use crate::config::RankingConfig;
use crate::types::SymbolKind;

/// Bucketed recency multiplier. Ages beyond the last boundary fall into
/// the final factor.
pub fn recency_factor(now: i64, mtime: i64, config: &RankingConfig) -> f64 {
    let age = (now - mtime).max(0);
    for (i, boundary) in config.recency_buckets_secs.iter().enumerate() {
        if age < *boundary {
            return config.recency_factors.get(i).copied().unwrap_or(1.0);
        }
    }
    config
        .recency_factors
        .last()
        .copied()
        .unwrap_or(1.0)
}

/// Multiplier for hits landing inside a known structural block.
pub fn structural_boost(kind: Option<SymbolKind>, config: &RankingConfig) -> f64 {
    match kind {
        Some(SymbolKind::Function) => config.boost_function,
        Some(SymbolKind::Method) => config.boost_method,
        Some(SymbolKind::Class) | Some(SymbolKind::Struct) | Some(SymbolKind::Interface) => {
            config.boost_class
        }
        Some(SymbolKind::Module) => config.boost_module,
        Some(_) => 1.0,
        None => 1.0,
    }
}

/// Combine everything into the final hit score.
pub fn final_score(
    base: f64,
    now: i64,
    mtime: i64,
    context_kind: Option<SymbolKind>,
    exact_match: bool,
    recency_boost: bool,
    config: &RankingConfig,
) -> f64 {
    let mut score = base;
    if recency_boost {
        score *= recency_factor(now, mtime, config);
    }
    score *= structural_boost(context_kind, config);
    if exact_match {
        score *= config.exact_token_bonus;
    }
    score
}
