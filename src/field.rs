//! Same-race comparisons.
//!
//! Slices passed in here hold one value per runner of a single race, in the
//! race's tie-break order (saddle-cloth number, then horse id). Missing
//! values take no part in a ranking and get no rank back.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    /// Smallest value ranks first (odds).
    Ascending,
    /// Largest value ranks first (ratings, strike rates).
    Descending,
}

impl RankOrder {
    fn better(self, a: f64, b: f64) -> bool {
        match self {
            Self::Ascending => a < b,
            Self::Descending => a > b,
        }
    }
}

/// `(rank - 1) / (n - 1)` where rank counts the strictly better runners plus
/// one, so ties share a value. 0 is the best runner; a lone runner gets 0.
pub fn percent_ranks(values: &[Option<f64>], order: RankOrder) -> Vec<Option<f64>> {
    let known: Vec<f64> = values.iter().flatten().copied().collect();
    let n = known.len();
    values
        .iter()
        .map(|value| {
            value.map(|v| {
                if n <= 1 {
                    return 0.0;
                }
                let better = known.iter().filter(|other| order.better(**other, v)).count();
                better as f64 / (n - 1) as f64
            })
        })
        .collect()
}

/// Dense 1-based positions with ties broken by slice order.
pub fn ordinal_ranks(values: &[Option<f64>], order: RankOrder) -> Vec<Option<u32>> {
    let mut ranked: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|v| (idx, v)))
        .collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        let by_value = match order {
            RankOrder::Ascending => a.total_cmp(b),
            RankOrder::Descending => b.total_cmp(a),
        };
        by_value.then(ia.cmp(ib))
    });

    let mut ranks = vec![None; values.len()];
    for (position, (idx, _)) in ranked.into_iter().enumerate() {
        ranks[idx] = Some(position as u32 + 1);
    }
    ranks
}

pub fn field_mean(values: &[Option<f64>]) -> Option<f64> {
    let known: Vec<f64> = values.iter().flatten().copied().collect();
    if known.is_empty() {
        None
    } else {
        Some(known.iter().sum::<f64>() / known.len() as f64)
    }
}

pub fn field_max(values: &[Option<f64>]) -> Option<f64> {
    values.iter().flatten().copied().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rank_shares_ties_and_skips_missing() {
        let odds = [Some(2.5), Some(8.0), None, Some(2.5), Some(21.0)];
        let ranks = percent_ranks(&odds, RankOrder::Ascending);
        assert_eq!(
            ranks,
            vec![Some(0.0), Some(2.0 / 3.0), None, Some(0.0), Some(1.0)]
        );

        let ratings = [Some(1300.0), Some(1200.0)];
        assert_eq!(
            percent_ranks(&ratings, RankOrder::Descending),
            vec![Some(0.0), Some(1.0)]
        );
        assert_eq!(percent_ranks(&[Some(5.0)], RankOrder::Ascending), vec![Some(0.0)]);
    }

    #[test]
    fn ordinal_rank_breaks_ties_by_position() {
        let odds = [Some(4.0), Some(3.0), None, Some(3.0)];
        assert_eq!(
            ordinal_ranks(&odds, RankOrder::Ascending),
            vec![Some(3), Some(1), None, Some(2)]
        );
    }

    #[test]
    fn mean_and_max_ignore_missing() {
        let weights = [Some(56.0), None, Some(58.0)];
        assert_eq!(field_mean(&weights), Some(57.0));
        assert_eq!(field_max(&weights), Some(58.0));
        assert_eq!(field_mean(&[None, None]), None);
    }
}
