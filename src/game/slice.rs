use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::rng::{shuffle, XorShift32};

/// Public description of one slice. Together with the right seeds this is
/// enough to rebuild every outcome in the slice, which is what makes the
/// commit-reveal verification work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceManifest {
    pub slice_id: usize,
    #[serde(rename = "start_at")]
    pub start_at_ms: i64,
    pub duration_ms: i64,
    pub drop_count: usize,
    pub bomb_count: usize,
    pub big_count: usize,
    pub empty_count: usize,
    pub big_multiplier: f64,
    pub window_ms: i64,
    pub seed: u32,
    pub score_total: i64,
}

#[derive(Debug, Clone)]
pub struct SliceRuntime {
    pub manifest: SliceManifest,
    pub offsets_ms: Vec<i64>,
    pub is_bomb: Vec<bool>,
    pub is_big: Vec<bool>,
    pub is_empty: Vec<bool>,
    pub base_scores: Vec<i64>,
}

/// Builds a slice runtime from its manifest. Pure: repeat invocation with the
/// same manifest yields an identical runtime.
///
/// The RNG call order is load-bearing. Shuffles only happen when their group
/// is non-trivial, so skipping one must not consume generator state.
pub fn build_slice_runtime(manifest: &SliceManifest) -> SliceRuntime {
    let mut rng = XorShift32::new(manifest.seed);
    let n = manifest.drop_count;

    let mut indices: Vec<usize> = (0..n).collect();
    shuffle(&mut indices, &mut rng);

    let mut is_bomb = vec![false; n];
    for &idx in indices.iter().take(manifest.bomb_count.min(n)) {
        is_bomb[idx] = true;
    }

    let mut non_bomb: Vec<usize> = indices[manifest.bomb_count.min(n)..].to_vec();
    let mut is_big = vec![false; n];
    if manifest.big_count > 0 && !non_bomb.is_empty() {
        shuffle(&mut non_bomb, &mut rng);
        let max_big = manifest.big_count.min(non_bomb.len());
        for &idx in non_bomb.iter().take(max_big) {
            is_big[idx] = true;
        }
    }

    let mut remaining: Vec<usize> = non_bomb.iter().copied().filter(|&i| !is_big[i]).collect();
    let mut is_empty = vec![false; n];
    if manifest.empty_count > 0 && !remaining.is_empty() {
        shuffle(&mut remaining, &mut rng);
        let max_empty = manifest.empty_count.min(remaining.len());
        for &idx in remaining.iter().take(max_empty) {
            is_empty[idx] = true;
        }
    }

    let mut base_scores = vec![0i64; n];
    let mut scoring: Vec<usize> = non_bomb.iter().copied().filter(|&i| !is_empty[i]).collect();
    if !scoring.is_empty() && manifest.score_total > 0 {
        let total_weight: f64 = scoring
            .iter()
            .map(|&i| if is_big[i] { manifest.big_multiplier } else { 1.0 })
            .sum();
        let mut allocated = 0i64;
        for &idx in &scoring {
            let weight = if is_big[idx] { manifest.big_multiplier } else { 1.0 };
            let val = (manifest.score_total as f64 * weight / total_weight).floor() as i64;
            base_scores[idx] = val;
            allocated += val;
        }
        let rem = manifest.score_total - allocated;
        if rem > 0 {
            shuffle(&mut scoring, &mut rng);
            for k in 0..rem as usize {
                base_scores[scoring[k % scoring.len()]] += 1;
            }
        }
    }

    let offsets_ms = sample_offsets(manifest, &mut rng);

    SliceRuntime {
        manifest: manifest.clone(),
        offsets_ms,
        is_bomb,
        is_big,
        is_empty,
        base_scores,
    }
}

fn sample_offsets(manifest: &SliceManifest, rng: &mut XorShift32) -> Vec<i64> {
    let max_offset = (manifest.duration_ms - manifest.window_ms).max(0);
    (0..manifest.drop_count)
        .map(|_| (rng.float_unit() * (max_offset + 1) as f64).floor() as i64)
        .collect()
}

/// Per-user outcome seed: fold the user id into 32 bits and mix it into the
/// slice seed with a Knuth multiplicative constant.
pub fn user_seed(base_seed: u32, user_id: i64) -> u32 {
    let u = (user_id as u32) ^ ((user_id as u64 >> 32) as u32);
    base_seed ^ u.wrapping_mul(2_654_435_761)
}

/// Per-user visual seed, salted so a client cannot derive another user's drop
/// timings from its own revealed seed.
pub fn user_visual_seed(base_seed: u32, user_id: i64, salt: &str) -> u32 {
    if salt.is_empty() {
        return user_seed(base_seed, user_id) ^ 0x9e37_79b9;
    }
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(base_seed.to_be_bytes());
    h.update((user_id as u64).to_be_bytes());
    let sum = h.finalize();
    u32::from_be_bytes([sum[0], sum[1], sum[2], sum[3]])
}

/// Hex commit over `salt || seed_be32`, published before the round runs.
pub fn seed_commit(seed: u32, salt: &str) -> String {
    if salt.is_empty() {
        return String::new();
    }
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(seed.to_be_bytes());
    hex::encode(h.finalize())
}

/// Rebuilds the slice with a substituted seed (per-user outcomes).
pub fn build_with_seed(manifest: &SliceManifest, seed: u32) -> SliceRuntime {
    let mut m = manifest.clone();
    m.seed = seed;
    build_slice_runtime(&m)
}

/// Per-user view: outcomes from the outcome seed, offsets re-sampled from the
/// visual seed when the two differ.
pub fn build_with_seeds(manifest: &SliceManifest, outcome_seed: u32, visual_seed: u32) -> SliceRuntime {
    let mut runtime = build_with_seed(manifest, outcome_seed);
    if visual_seed != outcome_seed {
        let mut rng = XorShift32::new(visual_seed);
        runtime.offsets_ms = sample_offsets(manifest, &mut rng);
    }
    runtime
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(drops: usize, bombs: usize, bigs: usize, empties: usize, score: i64) -> SliceManifest {
        SliceManifest {
            slice_id: 0,
            start_at_ms: 1_000,
            duration_ms: 1_000,
            drop_count: drops,
            bomb_count: bombs,
            big_count: bigs,
            empty_count: empties,
            big_multiplier: 2.0,
            window_ms: 1_200,
            seed: 0xdead_beef,
            score_total: score,
        }
    }

    #[test]
    fn test_counts_match_manifest() {
        let m = manifest(10, 2, 3, 1, 100);
        let rt = build_slice_runtime(&m);
        assert_eq!(rt.is_bomb.iter().filter(|&&b| b).count(), 2);
        assert_eq!(rt.is_big.iter().filter(|&&b| b).count(), 3);
        assert_eq!(rt.is_empty.iter().filter(|&&b| b).count(), 1);
        // groups are disjoint
        for i in 0..10 {
            let flags = [rt.is_bomb[i], rt.is_big[i], rt.is_empty[i]];
            assert!(flags.iter().filter(|&&f| f).count() <= 1);
        }
    }

    #[test]
    fn test_base_scores_sum_to_total() {
        for seed in [1u32, 7, 0xffff_ffff, 12345] {
            let mut m = manifest(12, 2, 2, 2, 777);
            m.seed = seed;
            let rt = build_slice_runtime(&m);
            let sum: i64 = rt.base_scores.iter().sum();
            assert_eq!(sum, 777, "seed {seed}");
            for i in 0..12 {
                if rt.is_bomb[i] || rt.is_empty[i] {
                    assert_eq!(rt.base_scores[i], 0);
                }
            }
        }
    }

    #[test]
    fn test_builder_is_pure() {
        let m = manifest(16, 3, 2, 2, 500);
        let a = build_slice_runtime(&m);
        let b = build_slice_runtime(&m);
        assert_eq!(a.offsets_ms, b.offsets_ms);
        assert_eq!(a.is_bomb, b.is_bomb);
        assert_eq!(a.is_big, b.is_big);
        assert_eq!(a.is_empty, b.is_empty);
        assert_eq!(a.base_scores, b.base_scores);
    }

    #[test]
    fn test_offsets_within_window() {
        let mut m = manifest(50, 5, 0, 0, 100);
        m.duration_ms = 2_000;
        m.window_ms = 1_200;
        let rt = build_slice_runtime(&m);
        for &off in &rt.offsets_ms {
            assert!((0..=800).contains(&off));
        }
        // window wider than the slice clamps the offset range to zero
        m.window_ms = 5_000;
        let rt = build_slice_runtime(&m);
        assert!(rt.offsets_ms.iter().all(|&o| o == 0));
    }

    #[test]
    fn test_no_scoring_drops_all_zero() {
        // drops - bombs - bigs - empties == 0: bigs absorb some, empties the rest
        let m = manifest(6, 2, 0, 4, 300);
        let rt = build_slice_runtime(&m);
        assert!(rt.base_scores.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_zero_score_total_keeps_zero_bases() {
        let m = manifest(8, 1, 1, 0, 0);
        let rt = build_slice_runtime(&m);
        assert!(rt.base_scores.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_user_seed_folds_high_bits() {
        let base = 0x1111_2222;
        assert_ne!(user_seed(base, 1), user_seed(base, 1 | (1 << 40)));
        assert_eq!(user_seed(base, 42), user_seed(base, 42));
    }

    #[test]
    fn test_visual_seed_depends_on_salt() {
        let base = 0xabcd_0001;
        let a = user_visual_seed(base, 9, "salt-a");
        let b = user_visual_seed(base, 9, "salt-b");
        assert_ne!(a, b);
        // empty salt falls back to a fixed perturbation of the outcome seed
        assert_eq!(user_visual_seed(base, 9, ""), user_seed(base, 9) ^ 0x9e37_79b9);
    }

    #[test]
    fn test_commit_matches_recomputation() {
        let seed = user_seed(0x55aa_55aa, 1234);
        let commit = seed_commit(seed, "0123456789abcdef0123456789abcdef");
        let mut h = Sha256::new();
        h.update(b"0123456789abcdef0123456789abcdef");
        h.update(seed.to_be_bytes());
        assert_eq!(commit, hex::encode(h.finalize()));
        assert_eq!(seed_commit(seed, ""), "");
    }

    #[test]
    fn test_visual_offsets_differ_from_outcome_offsets() {
        let mut m = manifest(10, 1, 1, 1, 100);
        m.duration_ms = 5_000;
        let outcome = user_seed(m.seed, 7);
        let visual = user_visual_seed(m.seed, 7, "somesalt");
        let plain = build_with_seed(&m, outcome);
        let viewed = build_with_seeds(&m, outcome, visual);
        assert_eq!(plain.is_bomb, viewed.is_bomb);
        assert_eq!(plain.base_scores, viewed.base_scores);
        assert_ne!(plain.offsets_ms, viewed.offsets_ms);
    }
}
