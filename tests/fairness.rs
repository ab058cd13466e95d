//! End-to-end fairness checks over the pure layers: a compiled round's
//! per-user payloads must be reproducible from the revealed seeds, and the
//! settled pool must land exactly.

use redrain::game::compiler::build_round_runtime;
use redrain::game::payout::{distribute_pool, lucky_seed};
use redrain::game::slice::{build_with_seed, seed_commit, user_seed};
use redrain::models::{Round, RoundStatus};
use redrain::server::messages::build_slice_payload;

fn round() -> Round {
    Round {
        id: 9,
        title: "integration".into(),
        total_pool: 1_000_001,
        duration_sec: 20,
        slice_ms: 1_000,
        drops_per_slice: 8,
        bombs_per_slice: 1,
        bigs_per_slice: 1,
        empty_per_slice: 1,
        big_multiplier: 2.0,
        max_speed: 1.0,
        drop_visible_ms: 0,
        score_total: 500,
        bomb_penalty: 50,
        lucky_ratio: 40,
        base_ratio: 60,
        status: RoundStatus::Countdown,
        start_at_ms: 1_700_000_000_000,
        end_at_ms: 1_700_000_020_000,
        seed: 0x5eed_0001,
    }
}

#[test]
fn reveal_reproduces_committed_outcomes() {
    let rt = build_round_runtime(round(), 2_400).unwrap();
    let user_id = 31_337;

    for slice in rt.slices.iter() {
        let payload = build_slice_payload(&slice.manifest, &rt.reveal_salt, user_id);

        // what the reveal endpoint would hand out for this slice
        let revealed_seed = user_seed(slice.manifest.seed, user_id);
        assert_eq!(payload.seed_commit, seed_commit(revealed_seed, &rt.reveal_salt));

        // a client recomputes the outcomes from the revealed seed and must
        // land on the drop types it was shown during the round
        let rebuilt = build_with_seed(&slice.manifest, revealed_seed);
        for i in 0..slice.manifest.drop_count {
            let expected = if rebuilt.is_bomb[i] {
                1
            } else if rebuilt.is_empty[i] {
                3
            } else if rebuilt.is_big[i] {
                2
            } else {
                0
            };
            assert_eq!(payload.drop_types[i], expected, "slice {} drop {i}", slice.manifest.slice_id);
        }
    }
}

#[test]
fn distinct_users_get_distinct_outcomes() {
    // wide slices so the offset range is non-trivial
    let mut r = round();
    r.slice_ms = 5_000;
    let rt = build_round_runtime(r, 2_400).unwrap();
    let a = build_slice_payload(&rt.slices[0].manifest, &rt.reveal_salt, 1);
    let b = build_slice_payload(&rt.slices[0].manifest, &rt.reveal_salt, 2);
    assert_ne!(a.seed_commit, b.seed_commit);
    // offsets are visually salted per user as well
    assert_ne!(a.offsets_ms, b.offsets_ms);
}

#[test]
fn settled_pool_is_exact_for_many_shapes() {
    let r = round();
    for (pool, participants) in [
        (1_000_001i64, 50usize),
        (7i64, 3usize),
        (999i64, 1usize),
        (123_456_789i64, 200usize),
    ] {
        let scores: Vec<(i64, i64)> = (0..participants as i64)
            .map(|uid| (uid + 1, (uid % 37) + 1))
            .collect();
        let seed = lucky_seed(r.seed, 42, participants);
        let allocs = distribute_pool(pool, r.lucky_ratio, r.base_ratio, &scores, seed);
        assert_eq!(allocs.iter().map(|a| a.amount).sum::<i64>(), pool);
        assert_eq!(allocs.len(), participants);
        assert!(allocs.iter().all(|a| a.amount >= 0));
    }
}
