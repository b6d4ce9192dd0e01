//! Collector-facing behaviour: roots found and rewritten through visitors,
//! stores recycled across threads.

use std::{cell::Cell, collections::HashMap};

use handles::{
    ContextPool, HandleConfig, HandleKind, HandleRef, HandleStore, RootProvider, Value, VmHandles,
    Zone, ZoneSettings,
};

/// Stand-in heap object.
#[repr(align(8))]
struct Object {
    payload: u64,
}

/// Copies every object a root points to and rewrites the root, the way a
/// scavenger would.
fn evacuate(roots: &dyn RootProvider<Value>, to_space: &mut Vec<Box<Object>>) -> usize {
    let mut forwarded: HashMap<u64, Value> = HashMap::new();
    let mut moved = 0;
    roots.visit_roots(&mut |slot| {
        let value = slot.get();
        if !value.is_ref() {
            return;
        }
        let target = *forwarded.entry(value.ref_bits()).or_insert_with(|| {
            // SAFETY: every reference root in these tests points at a live Object
            let old = unsafe { &*(value.ref_bits() as *const Object) };
            let copy = Box::new(Object {
                payload: old.payload,
            });
            let value = Value::from_ptr(&*copy);
            to_space.push(copy);
            value
        });
        slot.set(target);
        moved += 1;
    });
    moved
}

fn payload(value: Value) -> u64 {
    // SAFETY: only called on roots that point at live Objects
    unsafe { (*(value.ref_bits() as *const Object)).payload }
}

#[test]
fn relocation_rewrites_zone_and_scoped_roots() {
    let from_space: Vec<Box<Object>> = (0..10).map(|payload| Box::new(Object { payload })).collect();
    let mut to_space = Vec::new();

    let store = VmHandles::new();
    let globals: Vec<_> = from_space[..5]
        .iter()
        .map(|cell| store.zone_handle(Value::from_ptr(&**cell)))
        .collect();

    store.with_scope(|scope| {
        let locals: Vec<_> = from_space[5..]
            .iter()
            .map(|cell| scope.handle(Value::from_ptr(&**cell)))
            .collect();
        let fixnum = scope.handle(Value::from_i64(99));

        assert_eq!(evacuate(&store, &mut to_space), 10);

        for (i, local) in locals.iter().enumerate() {
            let moved = local.value();
            assert_ne!(moved, Value::from_ptr(&*from_space[5 + i]));
            assert_eq!(payload(moved), 5 + i as u64);
        }
        assert_eq!(fixnum.value(), Value::from_i64(99));
    });

    for (i, global) in globals.iter().enumerate() {
        assert_eq!(payload(global.value()), i as u64);
        assert!(
            to_space
                .iter()
                .any(|cell| Value::from_ptr(&**cell) == global.value())
        );
    }
}

#[test]
fn shared_referents_are_forwarded_once() {
    let cell = Box::new(Object { payload: 7 });
    let mut to_space = Vec::new();
    let store = VmHandles::new();
    let a = store.zone_handle(Value::from_ptr(&*cell));
    let scope = store.scope();
    let b = scope.handle(Value::from_ptr(&*cell));

    evacuate(&store, &mut to_space);

    assert_eq!(to_space.len(), 1);
    assert_eq!(a.value(), b.value());
    assert_eq!(payload(b.value()), 7);
}

#[test]
fn handle_visitor_can_clear_scoped_roots() {
    let store = VmHandles::new();
    let zone = store.zone_handle(Value::from_i64(1));
    let scope = store.scope();
    let local = scope.handle(Value::from_i64(2));

    store.visit_handles(&mut |mut handle: HandleRef<'_, Value>| {
        if handle.kind() == HandleKind::Scoped {
            handle.set(Value::from_i64(0));
        }
    });

    assert_eq!(zone.value(), Value::from_i64(1));
    assert_eq!(local.value(), Value::from_i64(0));
}

#[test]
fn incremental_visits_cover_each_handle_once_across_scopes() {
    let store = VmHandles::new();
    let mut seen = 0;
    let mut visit = |store: &VmHandles| {
        store.visit_unvisited_scoped_handles(&mut |_: &Cell<Value>| seen += 1);
    };

    store.with_scope(|outer| {
        for i in 0..100 {
            outer.handle(Value::from_i64(i));
        }
        visit(&store);
        let inner = outer.nested();
        for i in 0..100 {
            inner.handle(Value::from_i64(i));
        }
        visit(&store);
        visit(&store);
    });
    visit(&store);
    assert_eq!(seen, 200);
}

#[test]
fn word_sized_payloads_work_too() {
    let store: HandleStore<usize, 8> = HandleStore::new();
    let h = store.zone_handle(0xdead);
    store.with_scope(|scope| {
        scope.handle(1);
        scope.handle(2);
        let mut sum = 0;
        store.visit_object_pointers(&mut |slot: &Cell<usize>| sum += slot.get());
        assert_eq!(sum, 0xdead + 3);
    });
    assert_eq!(h.value(), 0xdead);
}

#[test]
fn zone_backed_stores_cycle_through_a_pool() {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = ContextPool::new(2, || {
        let zone = Zone::new(ZoneSettings {
            chunk_size: 4 * handles::OS_PAGE_SIZE,
            limit: Some(64 * handles::OS_PAGE_SIZE),
        })
        .expect("valid zone settings");
        VmHandles::with_arena(zone, HandleConfig::traced())
    });

    std::thread::scope(|s| {
        for t in 0..4 {
            let pool = &pool;
            s.spawn(move || {
                for _ in 0..25 {
                    let store = pool.acquire();
                    store.with_scope(|scope| {
                        for i in 0..200 {
                            scope.handle(Value::from_i64(t * 1000 + i));
                        }
                    });
                    for i in 0..70 {
                        store.zone_handle(Value::from_i64(i));
                    }
                    assert_eq!(store.count_zone_handles(), 70);
                    pool.release(store);
                }
            });
        }
    });

    assert!(pool.idle_count() <= 2);
    assert_eq!(pool.created_count() + pool.recycled_count(), 100);
    assert_eq!(
        pool.idle_capacity_in_bytes(),
        pool.idle_count() * size_of::<handles::HandleBlock<Value, 63>>()
    );
}
