use anyhow::{bail, Result};
use rand::RngCore;

use crate::models::Round;

use super::slice::{build_slice_runtime, SliceManifest, SliceRuntime};

/// Fully derived state for the round that is currently live. The slice
/// runtimes here carry the round-level seed view; per-user outcomes are
/// rebuilt from the manifests with user-salted seeds.
#[derive(Debug, Clone)]
pub struct RoundRuntime {
    pub round: Round,
    pub slices: std::sync::Arc<Vec<SliceRuntime>>,
    pub reveal_salt: String,
}

/// Compiles a round config into its runtime: validates the drop layout,
/// splits the per-user score total across slices, fixes the effective drop
/// window and derives one seed per slice.
pub fn build_round_runtime(mut round: Round, base_window_ms: i64) -> Result<RoundRuntime> {
    if round.drops_per_slice <= 0
        || round.bombs_per_slice < 0
        || round.bombs_per_slice >= round.drops_per_slice
    {
        bail!("invalid drop/bomb config");
    }
    if round.bigs_per_slice < 0 {
        bail!("invalid big config");
    }
    if round.bigs_per_slice > round.drops_per_slice - round.bombs_per_slice {
        bail!("invalid big config");
    }
    if round.empty_per_slice < 0 {
        bail!("invalid empty config");
    }
    if round.empty_per_slice > round.drops_per_slice - round.bombs_per_slice - round.bigs_per_slice
    {
        bail!("invalid empty config");
    }
    if round.big_multiplier <= 1.0 {
        round.big_multiplier = 2.0;
    }

    let duration_ms = round.duration_sec * 1000;
    let mut slice_count = duration_ms / round.slice_ms;
    if slice_count <= 0 {
        bail!("invalid slice config");
    }
    if duration_ms % round.slice_ms != 0 {
        slice_count += 1;
    }

    // Equal split with the first `score_total mod slice_count` slices
    // taking one extra point.
    let base = round.score_total / slice_count;
    let rem = round.score_total % slice_count;
    let per_slice: Vec<i64> = (0..slice_count)
        .map(|i| if i < rem { base + 1 } else { base })
        .collect();

    let effective_window = effective_window_ms(base_window_ms, round.drop_visible_ms, round.max_speed);

    let mut slices = Vec::with_capacity(slice_count as usize);
    for i in 0..slice_count {
        let manifest = SliceManifest {
            slice_id: i as usize,
            start_at_ms: round.start_at_ms + i * round.slice_ms,
            duration_ms: round.slice_ms,
            drop_count: round.drops_per_slice as usize,
            bomb_count: round.bombs_per_slice as usize,
            big_count: round.bigs_per_slice as usize,
            empty_count: round.empty_per_slice as usize,
            big_multiplier: round.big_multiplier,
            window_ms: effective_window,
            seed: slice_seed(round.seed, i as u32),
            score_total: per_slice[i as usize],
        };
        slices.push(build_slice_runtime(&manifest));
    }

    Ok(RoundRuntime {
        round,
        slices: std::sync::Arc::new(slices),
        reveal_salt: new_reveal_salt(),
    })
}

/// Drop visibility window: an explicit override wins, otherwise the base
/// window scaled down by max_speed (clamped to a sane band), and the result
/// always lands in [800, 6000] ms.
pub fn effective_window_ms(base_window_ms: i64, drop_visible_ms: i64, max_speed: f64) -> i64 {
    let mut window = base_window_ms;
    if drop_visible_ms > 0 {
        window = drop_visible_ms;
    } else if max_speed > 0.0 {
        let scale = max_speed.clamp(0.6, 1.6);
        window = (base_window_ms as f64 / scale).round() as i64;
    }
    window.clamp(800, 6000)
}

pub fn slice_seed(round_seed: u32, slice_id: u32) -> u32 {
    let seed = round_seed ^ slice_id.wrapping_mul(2_654_435_761);
    if seed == 0 {
        0x12345678
    } else {
        seed
    }
}

/// Fresh 128-bit hex salt, sampled from OS entropy at compile time and kept
/// secret until the round reaches ReadyDraw.
fn new_reveal_salt() -> String {
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn random_round_seed() -> u32 {
    rand::rngs::OsRng.next_u32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoundStatus;

    fn round() -> Round {
        Round {
            id: 1,
            title: "test".into(),
            total_pool: 100_000,
            duration_sec: 30,
            slice_ms: 1_000,
            drops_per_slice: 10,
            bombs_per_slice: 1,
            bigs_per_slice: 2,
            empty_per_slice: 1,
            big_multiplier: 2.0,
            max_speed: 1.0,
            drop_visible_ms: 0,
            score_total: 1_000,
            bomb_penalty: 50,
            lucky_ratio: 40,
            base_ratio: 60,
            status: RoundStatus::Countdown,
            start_at_ms: 1_700_000_000_000,
            end_at_ms: 1_700_000_030_000,
            seed: 0xc0ffee,
        }
    }

    #[test]
    fn test_slice_count_and_starts() {
        let rt = build_round_runtime(round(), 2_400).unwrap();
        assert_eq!(rt.slices.len(), 30);
        assert_eq!(rt.slices[0].manifest.start_at_ms, 1_700_000_000_000);
        assert_eq!(rt.slices[29].manifest.start_at_ms, 1_700_000_029_000);
    }

    #[test]
    fn test_slice_count_rounds_up() {
        let mut r = round();
        r.slice_ms = 7_000; // 30000 / 7000 = 4 rem 2000
        let rt = build_round_runtime(r, 2_400).unwrap();
        assert_eq!(rt.slices.len(), 5);
    }

    #[test]
    fn test_score_split_quotient_remainder() {
        let mut r = round();
        r.score_total = 1_003; // 30 slices: 13 slices of 34, 17 of 33
        let rt = build_round_runtime(r, 2_400).unwrap();
        let totals: Vec<i64> = rt.slices.iter().map(|s| s.manifest.score_total).collect();
        assert_eq!(totals.iter().sum::<i64>(), 1_003);
        assert!(totals[..13].iter().all(|&t| t == 34));
        assert!(totals[13..].iter().all(|&t| t == 33));
    }

    #[test]
    fn test_effective_window() {
        // explicit override wins, then clamp
        assert_eq!(effective_window_ms(2_400, 1_500, 1.0), 1_500);
        assert_eq!(effective_window_ms(2_400, 100, 1.0), 800);
        assert_eq!(effective_window_ms(2_400, 9_999, 1.0), 6_000);
        // speed scaling with band clamp
        assert_eq!(effective_window_ms(2_400, 0, 2.0), 1_500); // clamped to 1.6
        assert_eq!(effective_window_ms(2_400, 0, 0.1), 4_000); // clamped to 0.6
        assert_eq!(effective_window_ms(2_400, 0, 1.2), 2_000);
        // no speed set keeps the base window
        assert_eq!(effective_window_ms(2_400, 0, 0.0), 2_400);
    }

    #[test]
    fn test_big_multiplier_floor_promotion() {
        let mut r = round();
        r.big_multiplier = 1.0;
        let rt = build_round_runtime(r, 2_400).unwrap();
        assert_eq!(rt.round.big_multiplier, 2.0);
        assert_eq!(rt.slices[0].manifest.big_multiplier, 2.0);
    }

    #[test]
    fn test_per_slice_seed_mix() {
        assert_eq!(slice_seed(0xc0ffee, 0), 0xc0ffee);
        assert_ne!(slice_seed(0xc0ffee, 1), 0xc0ffee);
        // a zero mix result is substituted
        let forced = 3u32.wrapping_mul(2_654_435_761);
        assert_eq!(slice_seed(forced, 3), 0x12345678);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut r = round();
        r.bombs_per_slice = 10;
        assert!(build_round_runtime(r, 2_400).is_err());

        let mut r = round();
        r.bigs_per_slice = 10;
        assert!(build_round_runtime(r, 2_400).is_err());

        let mut r = round();
        r.empty_per_slice = 8; // 10 - 1 - 2 = 7 available
        assert!(build_round_runtime(r, 2_400).is_err());

        let mut r = round();
        r.drops_per_slice = 0;
        assert!(build_round_runtime(r, 2_400).is_err());
    }

    #[test]
    fn test_reveal_salt_is_fresh_hex() {
        let a = build_round_runtime(round(), 2_400).unwrap();
        let b = build_round_runtime(round(), 2_400).unwrap();
        assert_eq!(a.reveal_salt.len(), 32);
        assert!(a.reveal_salt.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.reveal_salt, b.reveal_salt);
    }
}
