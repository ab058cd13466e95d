use super::rng::XorShift32;

const ALPHA: f64 = 1.4;

/// One participant's settled share of the pool, in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub user_id: i64,
    pub score: i64,
    pub amount: i64,
    pub base_amount: i64,
    pub lucky_amount: i64,
}

/// Seed mix for the lucky portion. `now_ns` keeps the draw unpredictable
/// ahead of time; tests pin it for reproducibility.
pub fn lucky_seed(round_seed: u32, now_ns: i64, participant_count: usize) -> u32 {
    let mixed = i64::from(round_seed) ^ now_ns ^ (participant_count as i64).wrapping_mul(7919);
    (mixed as u32) ^ ((mixed as u64 >> 32) as u32)
}

/// Splits `total_pool` among scoring participants.
///
/// The pool divides into a weighted base portion and a randomized lucky
/// portion; both are reconciled with largest-remainder so the integer
/// amounts land on their sub-pool exactly, and any residual after summing
/// is handed out one unit at a time in weight-descending order. The sum of
/// all amounts equals `total_pool` whenever at least one participant scores.
pub fn distribute_pool(
    total_pool: i64,
    lucky_ratio: i64,
    base_ratio: i64,
    scores: &[(i64, i64)],
    lucky_seed: u32,
) -> Vec<Allocation> {
    let mut allocs: Vec<Allocation> = scores
        .iter()
        .filter(|&&(_, score)| score > 0)
        .map(|&(user_id, score)| Allocation {
            user_id,
            score,
            amount: 0,
            base_amount: 0,
            lucky_amount: 0,
        })
        .collect();
    if allocs.is_empty() {
        return allocs;
    }
    // Weight consumption order must not depend on input order.
    allocs.sort_by_key(|a| a.user_id);

    let mut lucky_ratio = lucky_ratio.max(0);
    let mut base_ratio = base_ratio.max(0);
    if lucky_ratio == 0 && base_ratio == 0 {
        lucky_ratio = 40;
        base_ratio = 60;
    }
    let total_ratio = lucky_ratio + base_ratio;

    // Lucky first; base takes the remainder so rounding loss stays in base.
    let lucky_pool = total_pool * lucky_ratio / total_ratio;
    let base_pool = total_pool - lucky_pool;

    let weights: Vec<f64> = allocs.iter().map(|a| (a.score as f64).powf(ALPHA)).collect();
    let total_weight: f64 = weights.iter().sum();

    if total_weight > 0.0 && base_pool > 0 {
        let base_amounts = floor_largest_remainder(base_pool, &weights);
        for (a, amount) in allocs.iter_mut().zip(base_amounts) {
            a.base_amount = amount;
        }
    }

    if lucky_pool > 0 && total_weight > 0.0 {
        let mut rng = XorShift32::new(lucky_seed);
        let mut lucky_weights: Vec<f64> = weights
            .iter()
            .map(|w| w * (0.3 + rng.float_unit()))
            .collect();
        if lucky_weights.iter().sum::<f64>() == 0.0 {
            lucky_weights = vec![1.0; allocs.len()];
        }
        let lucky_amounts = floor_largest_remainder(lucky_pool, &lucky_weights);
        for (a, amount) in allocs.iter_mut().zip(lucky_amounts) {
            a.lucky_amount = amount;
        }
    }

    for a in allocs.iter_mut() {
        a.amount = a.base_amount + a.lucky_amount;
    }

    // Final reconciliation. The sub-pool allocations are already exact, so
    // this only fires when one sub-pool was skipped (e.g. zero weights).
    let allocated: i64 = allocs.iter().map(|a| a.amount).sum();
    let mut diff = total_pool - allocated;
    if diff > 0 {
        let mut idxs: Vec<usize> = (0..allocs.len()).collect();
        idxs.sort_by(|&a, &b| weights[b].partial_cmp(&weights[a]).unwrap_or(std::cmp::Ordering::Equal));
        let mut i = 0usize;
        while diff > 0 {
            allocs[idxs[i % idxs.len()]].amount += 1;
            diff -= 1;
            i += 1;
        }
    }

    allocs
}

/// `floor(pool * w_i / Σw)` each, then the residual one unit at a time to the
/// largest fractional parts.
fn floor_largest_remainder(pool: i64, weights: &[f64]) -> Vec<i64> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return vec![0; weights.len()];
    }
    let mut amounts = Vec::with_capacity(weights.len());
    let mut fracs = Vec::with_capacity(weights.len());
    let mut allocated = 0i64;
    for &w in weights {
        let exact = pool as f64 * w / total;
        let floor = exact.floor() as i64;
        amounts.push(floor);
        fracs.push(exact - floor as f64);
        allocated += floor;
    }
    let residual = pool - allocated;
    if residual > 0 {
        let mut idxs: Vec<usize> = (0..weights.len()).collect();
        idxs.sort_by(|&a, &b| fracs[b].partial_cmp(&fracs[a]).unwrap_or(std::cmp::Ordering::Equal));
        for k in 0..residual.min(idxs.len() as i64) as usize {
            amounts[idxs[k]] += 1;
        }
    }
    amounts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(allocs: &[Allocation]) -> i64 {
        allocs.iter().map(|a| a.amount).sum()
    }

    #[test]
    fn test_pool_split_exactness() {
        let scores = vec![(1, 100), (2, 50), (3, 50)];
        let allocs = distribute_pool(1_001, 40, 60, &scores, 0x1234);
        assert_eq!(total(&allocs), 1_001);
        // sub-pools land exactly: lucky = 1001*40/100 = 400, base = 601
        assert_eq!(allocs.iter().map(|a| a.lucky_amount).sum::<i64>(), 400);
        assert_eq!(allocs.iter().map(|a| a.base_amount).sum::<i64>(), 601);
        for a in &allocs {
            assert!(a.amount >= 0);
            assert_eq!(a.amount, a.base_amount + a.lucky_amount);
        }
    }

    #[test]
    fn test_zero_score_users_excluded() {
        let scores = vec![(1, 100), (2, 0), (3, -5)];
        let allocs = distribute_pool(500, 40, 60, &scores, 7);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].user_id, 1);
        assert_eq!(allocs[0].amount, 500);
    }

    #[test]
    fn test_deterministic_under_pinned_seed() {
        let scores = vec![(5, 30), (9, 120), (2, 77), (14, 77)];
        let a = distribute_pool(99_999, 25, 55, &scores, 0xfeed);
        let b = distribute_pool(99_999, 25, 55, &scores, 0xfeed);
        assert_eq!(a, b);
        // input order must not matter
        let shuffled = vec![(14, 77), (2, 77), (9, 120), (5, 30)];
        let c = distribute_pool(99_999, 25, 55, &shuffled, 0xfeed);
        assert_eq!(a, c);
        // a different lucky seed moves the lucky portion
        let d = distribute_pool(99_999, 25, 55, &scores, 0xbeef);
        assert_eq!(total(&d), 99_999);
        assert_ne!(
            a.iter().map(|x| x.lucky_amount).collect::<Vec<_>>(),
            d.iter().map(|x| x.lucky_amount).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_zero_ratios_renormalized() {
        let scores = vec![(1, 10), (2, 20)];
        let allocs = distribute_pool(1_000, 0, 0, &scores, 1);
        assert_eq!(total(&allocs), 1_000);
        // (40, 60) fallback: lucky pool is 400
        assert_eq!(allocs.iter().map(|a| a.lucky_amount).sum::<i64>(), 400);
    }

    #[test]
    fn test_higher_score_gets_higher_base() {
        let scores = vec![(1, 10), (2, 200)];
        let allocs = distribute_pool(10_000, 0, 100, &scores, 3);
        let low = allocs.iter().find(|a| a.user_id == 1).unwrap();
        let high = allocs.iter().find(|a| a.user_id == 2).unwrap();
        assert!(high.base_amount > low.base_amount);
        assert_eq!(total(&allocs), 10_000);
    }

    #[test]
    fn test_no_participants_empty() {
        assert!(distribute_pool(1_000, 40, 60, &[], 9).is_empty());
        assert!(distribute_pool(1_000, 40, 60, &[(1, 0)], 9).is_empty());
    }

    #[test]
    fn test_single_minor_unit_pool() {
        let scores = vec![(1, 5), (2, 5), (3, 5)];
        let allocs = distribute_pool(1, 40, 60, &scores, 11);
        assert_eq!(total(&allocs), 1);
    }

    #[test]
    fn test_largest_remainder_prefers_big_fractions() {
        // pool 10 over weights (1, 1, 1): 3.33 each, residual 1 to one entry
        let amounts = floor_largest_remainder(10, &[1.0, 1.0, 1.0]);
        assert_eq!(amounts.iter().sum::<i64>(), 10);
        // pool 7 over (3, 1): exact 5.25 / 1.75 -> floors 5/1, frac .25 < .75
        let amounts = floor_largest_remainder(7, &[3.0, 1.0]);
        assert_eq!(amounts, vec![5, 2]);
    }
}
