use super::*;

use proptest::prelude::*;
use std::num::NonZeroUsize;
use std::sync::Arc;

type Handle = (u32, u32, u64);

/// Reference model: registrations in order, each `(low, span, seq, gate_ok)`.
#[derive(Default, Clone)]
struct Model {
    entries: Vec<(u32, u32, u64, bool)>,
}

impl Model {
    fn register(&mut self, low: u32, span: u32, seq: u64, gate_ok: bool) {
        self.entries.push((low, span, seq, gate_ok));
    }

    fn unregister(&mut self, low: u32, span: u32) -> Option<u64> {
        let pos = self
            .entries
            .iter()
            .position(|&(l, s, _, _)| l == low && s == span)?;
        Some(self.entries.remove(pos).2)
    }

    /// Narrowest passing range; earliest registration on ties.
    fn resolve(&self, id: u32) -> Option<Handle> {
        self.entries
            .iter()
            .filter(|&&(l, s, _, ok)| ok && l <= id && id - l < s)
            .min_by_key(|&&(_, s, seq, _)| (s, seq))
            .map(|&(l, s, seq, _)| (l, s, seq))
    }
}

fn validate_registry(reg: &Registry<Handle>) {
    reg.with_table(|t| {
        let mut nodes = 0usize;
        for b in 0..t.buckets() {
            assert!(t.is_ordered(b), "bucket {b} out of span order");
            for (key, probe) in t.bucket(b) {
                assert_eq!(key, probe.key(), "node key must match its record");
                assert!(
                    t.buckets_for(key).contains(&b),
                    "{key:?} linked into foreign bucket {b}"
                );
                nodes += 1;
            }
        }
        assert_eq!(nodes, t.len(), "linked node count must match len");
    });
}

fn small_registry() -> Registry<Handle> {
    Registry::with_config(Config {
        buckets: NonZeroUsize::new(4).unwrap(),
        restart_limit: None,
    })
}

fn register(reg: &Registry<Handle>, low: u32, span: u32, seq: u64, gate_ok: bool) {
    let handle = (low, span, seq);
    let gate = if gate_ok {
        None
    } else {
        Some(gate(|_, _| false))
    };
    reg.register(
        DevId(low),
        span,
        None,
        resolver(move |_, _, _| Resolution::Found(handle)),
        gate,
        Arc::new(()),
    )
    .unwrap();
}

#[derive(Clone, Debug)]
enum Op {
    Register(u32, u32, bool),
    Unregister(u32, u32),
    Resolve(u32),
}

/// Device numbers clustered around a few major boundaries so ranges cross
/// buckets and majors collide modulo the bucket count.
fn dev_strategy() -> impl Strategy<Value = u32> + Clone {
    (1u32..7, 0u32..96).prop_map(|(major, off)| (major << dev::MINOR_BITS) + off - 48)
}

fn span_strategy() -> impl Strategy<Value = u32> + Clone {
    prop_oneof![
        8 => 1u32..=64,
        1 => Just(1u32 << dev::MINOR_BITS),
        1 => Just(3u32 << dev::MINOR_BITS),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let dev = dev_strategy();
    let span = span_strategy();
    let op = prop_oneof![
        35 => (dev.clone(), span.clone(), prop::bool::weighted(0.8))
            .prop_map(|(l, s, ok)| Op::Register(l, s, ok)),
        20 => (dev.clone(), span).prop_map(|(l, s)| Op::Unregister(l, s)),
        45 => dev.prop_map(Op::Resolve),
    ];
    prop::collection::vec(op, 0..=400)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy()) {
        let reg = small_registry();
        let mut m = Model::default();
        let mut seq = 0u64;

        for op in ops {
            match op {
                Op::Register(low, span, gate_ok) => {
                    register(&reg, low, span, seq, gate_ok);
                    m.register(low, span, seq, gate_ok);
                    seq += 1;
                }
                Op::Unregister(low, span) => {
                    let got = reg.unregister(DevId(low), span).map(|p| p.key());
                    let expected = m.unregister(low, span);
                    prop_assert_eq!(got.is_some(), expected.is_some());
                }
                Op::Resolve(id) => {
                    let got = reg.resolve(DevId(id));
                    let expected = m.resolve(id);
                    prop_assert_eq!(got.as_ref().map(|r| r.handle), expected);
                    if let Some(r) = got {
                        prop_assert_eq!(r.index, id - r.handle.0);
                    }
                }
            }

            prop_assert_eq!(reg.stats().ranges, m.entries.len());
        }

        validate_registry(&reg);
        let mut expected: Vec<(u32, u32)> =
            m.entries.iter().map(|&(l, s, _, _)| (l, s)).collect();
        expected.sort_unstable();
        let got: Vec<(u32, u32)> =
            reg.ranges().iter().map(|k| (k.low().raw(), k.span())).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_unregister_twice_is_noop(
        low in dev_strategy(),
        span in span_strategy(),
        others in prop::collection::vec((dev_strategy(), span_strategy()), 0..20),
    ) {
        let reg = small_registry();
        for (i, &(l, s)) in others.iter().enumerate() {
            register(&reg, l, s, i as u64, true);
        }
        register(&reg, low, span, 1_000, true);

        prop_assert!(reg.unregister(DevId(low), span).is_some());
        let after_once = reg.ranges();
        let second = reg.unregister(DevId(low), span);
        // Only a duplicate among `others` may still match.
        let dup = others.iter().any(|&(l, s)| l == low && s == span);
        prop_assert_eq!(second.is_some(), dup);
        if !dup {
            prop_assert_eq!(reg.ranges(), after_once);
        }
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_registration_order() {
    // Nested and overlapping ranges, with one equal-span pair.
    let ranges: Vec<(u32, u32)> = vec![
        (100, 10),
        (100, 100),
        (95, 20),
        (50, 200),
        (105, 20),
        (0, 1000),
    ];

    for_each_permutation(&ranges, |perm| {
        let reg = small_registry();
        let mut m = Model::default();
        for (seq, &(low, span)) in perm.iter().enumerate() {
            register(&reg, low, span, seq as u64, true);
            m.register(low, span, seq as u64, true);
        }

        validate_registry(&reg);
        for id in (0..1100).step_by(3) {
            let got = reg.resolve(DevId(id)).map(|r| r.handle);
            assert_eq!(got, m.resolve(id), "id {id} with order {perm:?}");
        }
    });
}

#[test]
fn exhaustive_removal_order() {
    let ranges: Vec<(u32, u32)> = vec![(100, 10), (100, 100), (95, 20), (50, 200), (105, 20)];

    for_each_permutation(&ranges, |perm| {
        let reg = small_registry();
        let mut m = Model::default();
        for (seq, &(low, span)) in ranges.iter().enumerate() {
            register(&reg, low, span, seq as u64, true);
            m.register(low, span, seq as u64, true);
        }

        for (low, span) in perm {
            assert!(reg.unregister(DevId(low), span).is_some());
            m.unregister(low, span);
            validate_registry(&reg);
            for id in (40..260).step_by(7) {
                let got = reg.resolve(DevId(id)).map(|r| r.handle);
                assert_eq!(got, m.resolve(id));
            }
        }
        assert_eq!(reg.stats().records, 0);
    });
}
