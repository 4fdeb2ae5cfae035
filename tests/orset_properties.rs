//! Convergence properties of the observed-remove set

use minipg::OrSet;
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum Op {
    Add(u8),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..6).prop_map(Op::Add), (0u8..6).prop_map(Op::Remove)]
}

fn apply(set: &mut OrSet<u8>, ops: &[Op], origin: u64) {
    for op in ops {
        match op {
            Op::Add(m) => {
                set.add(*m, origin);
            }
            Op::Remove(m) => {
                set.remove(m, origin);
            }
        }
    }
}

fn replica(ops: &[Op], origin: u64) -> OrSet<u8> {
    let mut set = OrSet::new();
    apply(&mut set, ops, origin);
    set
}

proptest! {
    #[test]
    fn sequential_ops_match_plain_set(ops in prop::collection::vec(op(), 0..40)) {
        let set = replica(&ops, 0);

        let mut model = BTreeSet::new();
        for op in &ops {
            match op {
                Op::Add(m) => { model.insert(*m); }
                Op::Remove(m) => { model.remove(m); }
            }
        }
        prop_assert_eq!(set.value(), model);
    }

    #[test]
    fn merge_is_commutative(
        a in prop::collection::vec(op(), 0..20),
        b in prop::collection::vec(op(), 0..20),
    ) {
        let a = replica(&a, 1);
        let b = replica(&b, 2);
        prop_assert_eq!(OrSet::merged(&a, &b), OrSet::merged(&b, &a));
    }

    #[test]
    fn merge_is_associative(
        a in prop::collection::vec(op(), 0..15),
        b in prop::collection::vec(op(), 0..15),
        c in prop::collection::vec(op(), 0..15),
    ) {
        let a = replica(&a, 1);
        let b = replica(&b, 2);
        let c = replica(&c, 3);
        let left = OrSet::merged(&OrSet::merged(&a, &b), &c);
        let right = OrSet::merged(&a, &OrSet::merged(&b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn merge_is_idempotent(ops in prop::collection::vec(op(), 0..30)) {
        let a = replica(&ops, 1);
        prop_assert_eq!(OrSet::merged(&a, &a), a);
    }

    #[test]
    fn replicas_converge_after_exchange(
        shared in prop::collection::vec(op(), 0..15),
        left in prop::collection::vec(op(), 0..15),
        right in prop::collection::vec(op(), 0..15),
    ) {
        let base = replica(&shared, 0);
        let mut a = base.clone();
        let mut b = base;
        apply(&mut a, &left, 1);
        apply(&mut b, &right, 2);

        let a_then_b = OrSet::merged(&a, &b);
        a.merge(&b);
        b.merge(&a_then_b);
        prop_assert!(a.value_eq(&b));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn concurrent_add_survives_remove(member in 0u8..6, history in prop::collection::vec(op(), 0..20)) {
        let base = replica(&history, 0);

        let mut remover = base.clone();
        remover.remove(&member, 1);

        let mut adder = base;
        adder.add(member, 2);

        let merged = OrSet::merged(&remover, &adder);
        prop_assert!(merged.contains(&member));
    }

    #[test]
    fn observed_remove_wins_over_stale_copy(member in 0u8..6) {
        let mut a = OrSet::new();
        a.add(member, 1);
        let stale = a.clone();
        a.remove(&member, 1);

        let merged = OrSet::merged(&stale, &a);
        prop_assert!(!merged.contains(&member));
        prop_assert!(merged.value_eq(&OrSet::new()));
    }
}
