//! Random allocation / scope programs checked against a simple model.

use std::{cell::Cell, collections::HashSet};

use handles::{BlockArena, HandleConfig, HandleScope, HandleStore, Value, Zone, ZoneSettings};
use proptest::{prelude::*, test_runner::TestCaseError};

const N: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Zone,
    Scoped,
    Open,
    Close,
    Visit,
    VisitIncremental,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Zone),
        5 => Just(Op::Scoped),
        2 => Just(Op::Open),
        2 => Just(Op::Close),
        1 => Just(Op::Visit),
        1 => Just(Op::VisitIncremental),
    ]
}

#[derive(Default)]
struct Model {
    zone: Vec<i64>,
    /// Live scoped ids in allocation order.
    scoped: Vec<i64>,
    /// `scoped.len()` at each open scope.
    scopes: Vec<usize>,
    /// Scoped position the incremental visitor has reached.
    watermark: usize,
    next_id: i64,
}

/// Open scopes, closed innermost first however the program ends.
struct ScopeStack<'s, A: BlockArena>(Vec<HandleScope<'s, Value, N, A>>);

impl<A: BlockArena> Drop for ScopeStack<'_, A> {
    fn drop(&mut self) {
        while let Some(scope) = self.0.pop() {
            drop(scope);
        }
    }
}

fn id_of(value: Value) -> i64 {
    assert!(value.is_fixnum(), "visited slot holds {value:?}");
    // SAFETY: checked above
    unsafe { value.to_i64() }
}

fn check_full_visit<A: BlockArena>(
    store: &HandleStore<Value, N, A>,
    model: &Model,
) -> Result<(), TestCaseError> {
    let mut addresses = HashSet::new();
    let mut ids = Vec::new();
    store.visit_object_pointers(&mut |slot: &Cell<Value>| {
        ids.push(id_of(slot.get()));
        addresses.insert(slot.as_ptr() as usize);
    });

    prop_assert_eq!(
        ids.len(),
        store.count_zone_handles() + store.count_scoped_handles()
    );
    prop_assert_eq!(addresses.len(), ids.len(), "slot visited twice");
    for &addr in &addresses {
        prop_assert!(store.is_valid_zone_handle(addr) || store.is_valid_scoped_handle(addr));
    }

    let mut expected: Vec<i64> = model.zone.iter().chain(&model.scoped).copied().collect();
    expected.sort_unstable();
    ids.sort_unstable();
    prop_assert_eq!(ids, expected);
    Ok(())
}

fn run_program<A: BlockArena>(
    store: &mut HandleStore<Value, N, A>,
    ops: &[Op],
) -> Result<(), TestCaseError> {
    let mut model = Model::default();
    {
        let store = &*store;
        let mut scopes = ScopeStack(Vec::new());

        for op in ops {
            match op {
                Op::Zone => {
                    let id = model.next_id;
                    model.next_id += 1;
                    store.zone_handle(Value::from_i64(id));
                    model.zone.push(id);
                }
                Op::Scoped => {
                    let id = model.next_id;
                    model.next_id += 1;
                    let slot = store.allocate_scoped_handle();
                    prop_assert_eq!(unsafe { *slot.as_ptr() }, Value::from_i64(0));
                    unsafe { slot.as_ptr().write(Value::from_i64(id)) };
                    model.scoped.push(id);
                }
                Op::Open => {
                    scopes.0.push(store.scope());
                    model.scopes.push(model.scoped.len());
                }
                Op::Close => {
                    if let Some(scope) = scopes.0.pop() {
                        drop(scope);
                        let restore = model.scopes.pop().unwrap_or(0);
                        model.scoped.truncate(restore);
                        model.watermark = model.watermark.min(restore);
                    }
                }
                Op::Visit => check_full_visit(store, &model)?,
                Op::VisitIncremental => {
                    let mut ids = Vec::new();
                    store.visit_unvisited_scoped_handles(&mut |slot: &Cell<Value>| {
                        ids.push(id_of(slot.get()));
                    });
                    prop_assert_eq!(&ids[..], &model.scoped[model.watermark..]);
                    model.watermark = model.scoped.len();
                }
            }

            prop_assert_eq!(store.count_zone_handles(), model.zone.len());
            prop_assert_eq!(store.count_scoped_handles(), model.scoped.len());
            prop_assert_eq!(store.zone_block_count(), model.zone.len().div_ceil(N));
            prop_assert_eq!(store.scope_depth(), model.scopes.len());
        }

        check_full_visit(store, &model)?;
        drop(scopes);
    }

    prop_assert_eq!(store.count_zone_handles(), model.zone.len());
    store.reset();
    prop_assert!(store.is_empty());
    prop_assert_eq!(store.count_zone_handles(), 0);
    prop_assert_eq!(store.count_scoped_handles(), 0);
    prop_assert_eq!(store.scoped_block_count(), 1);
    Ok(())
}

proptest! {
    #[test]
    fn programs_match_model(ops in proptest::collection::vec(arb_op(), 0..200)) {
        let mut store = HandleStore::<Value, N>::new();
        run_program(&mut store, &ops)?;
        // the store is reusable after a reset
        run_program(&mut store, &ops)?;
    }

    #[test]
    fn programs_match_model_on_zone(ops in proptest::collection::vec(arb_op(), 0..200)) {
        let zone = Zone::new(ZoneSettings::default()).unwrap();
        let mut store = HandleStore::<Value, N, Zone>::with_arena(zone, HandleConfig::default());
        run_program(&mut store, &ops)?;
        prop_assert_eq!(store.arena().live_bytes(), 0);
    }

    #[test]
    fn block_fills_after_exactly_n_allocations(extra in 0usize..3 * N) {
        let store = HandleStore::<Value, N>::new();
        for _ in 0..N {
            store.allocate_zone_handle();
        }
        prop_assert_eq!(store.zone_block_count(), 1);
        for i in 0..extra {
            store.allocate_zone_handle();
            prop_assert_eq!(store.zone_block_count(), 1 + (i / N) + 1);
        }
    }

    #[test]
    fn scope_restores_scoped_count(before in 0usize..10, inside in 0usize..20) {
        let store = HandleStore::<Value, N>::new();
        for _ in 0..before {
            store.allocate_scoped_handle();
        }
        let blocks = store.scoped_block_count();
        store.with_scope(|scope| {
            for _ in 0..inside {
                scope.allocate();
            }
        });
        prop_assert_eq!(store.count_scoped_handles(), before);
        prop_assert_eq!(store.scoped_block_count(), blocks);
    }
}
