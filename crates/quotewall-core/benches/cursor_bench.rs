use criterion::{criterion_group, criterion_main, Criterion};
use quotewall_core::{
    cursor, Condition, CookieCodec, CookieKey, CursorState, FilterOutcome, FilterSet,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn speaker_filter() -> FilterSet {
    let mut set = FilterSet::default();
    set.insert(Condition::speaker_contains("Freeman"));
    set
}

fn bench_cookie_round_trip(c: &mut Criterion) {
    let codec = CookieCodec::new(CookieKey::from_bytes([3_u8; 32]));
    let cursor = CursorState {
        next: 17,
        list: (1..=200).collect(),
        fingerprint: Some(speaker_filter().fingerprint()),
        generation: Some(1),
    };

    c.bench_function("cursor_encode_decode_200_candidates", |b| {
        b.iter(|| {
            let sealed = match cursor.encode(&codec) {
                Ok(sealed) => sealed,
                Err(err) => panic!("cursor benchmark encode failed: {err}"),
            };
            if let Err(err) = CursorState::decode(&codec, &sealed) {
                panic!("cursor benchmark decode failed: {err}");
            }
        });
    });
}

fn bench_advance(c: &mut Criterion) {
    let filters = speaker_filter();
    let outcome = FilterOutcome { fingerprint: filters.fingerprint(), active: true, rebuilt: None };
    let mut rng = StdRng::seed_from_u64(7);

    c.bench_function("cursor_advance_filtered_1000_laps", |b| {
        b.iter(|| {
            let mut state = CursorState::fresh_filtered((1..=50).collect(), filters.fingerprint());
            for _ in 0..1_000 {
                state = cursor::advance(Some(state), 500, 1, &outcome, &mut rng).cursor;
            }
            state
        });
    });
}

criterion_group!(cursor_benches, bench_cookie_round_trip, bench_advance);
criterion_main!(cursor_benches);
