//! Weighted Reciprocal Rank Fusion
//!
//! Shared by the hybrid search arms and the multi-query retriever. Fusion is
//! deterministic: contributions accumulate in id order and ties break by id,
//! so identical inputs fuse identically regardless of arrival order.

use std::collections::BTreeMap;

/// RRF constant (standard value)
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Fuse weighted ranked id lists.
///
/// score(d) = Σ_l w_l / (k + rank_l(d)), ranks 1-based within each list.
/// Returns (id, score) sorted by score desc, then id asc.
pub fn fuse<I: AsRef<str>>(lists: &[(f64, Vec<I>)], k: f64) -> Vec<(String, f64)> {
    let mut scores: BTreeMap<String, f64> = BTreeMap::new();

    for (weight, ids) in lists {
        for (rank, id) in ids.iter().enumerate() {
            let contribution = weight / (k + (rank + 1) as f64);
            *scores.entry(id.as_ref().to_string()).or_insert(0.0) += contribution;
        }
    }

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_one_in_both_beats_split_ranks() {
        let lists = vec![
            (1.0, vec!["a", "b", "c"]),
            (1.0, vec!["a", "c", "b"]),
        ];
        let fused = fuse(&lists, DEFAULT_RRF_K);

        let score_a = fused.iter().find(|(id, _)| id == "a").unwrap().1;
        let score_b = fused.iter().find(|(id, _)| id == "b").unwrap().1;

        assert!((score_a - 2.0 / 61.0).abs() < 1e-12);
        assert!((score_b - (1.0 / 62.0 + 1.0 / 63.0)).abs() < 1e-12);
        assert_eq!(fused[0].0, "a");
    }

    #[test]
    fn test_rank_one_and_three() {
        let lists = vec![(1.0, vec!["x"]), (1.0, vec!["y", "z", "x"])];
        let fused = fuse(&lists, DEFAULT_RRF_K);
        let score_x = fused.iter().find(|(id, _)| id == "x").unwrap().1;
        assert!((score_x - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-12);
    }

    #[test]
    fn test_weight_scales_contribution() {
        let light = fuse(&[(0.5, vec!["d"])], DEFAULT_RRF_K);
        let heavy = fuse(&[(1.0, vec!["d"])], DEFAULT_RRF_K);
        assert!(heavy[0].1 > light[0].1);
    }

    #[test]
    fn test_tie_breaks_by_id() {
        let fused = fuse(&[(1.0, vec!["b"]), (1.0, vec!["a"])], DEFAULT_RRF_K);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[1].0, "b");
    }

    #[test]
    fn test_empty_input() {
        let fused = fuse::<&str>(&[], DEFAULT_RRF_K);
        assert!(fused.is_empty());
    }
}
