use frankenvalue::{Context, ContextValue};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

#[test]
fn racing_first_reads_converge_on_one_value() {
    for _round in 0..20 {
        let calls = AtomicU32::new(0);
        let start = Barrier::new(THREADS);
        let def = ContextValue::from_fn(|_: &Context<()>| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(n)
        });
        let ctx = Context::new(());

        let seen: Vec<Arc<u32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        def.get(&ctx).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winner = def.get(&ctx).unwrap();
        for v in &seen {
            assert!(Arc::ptr_eq(v, &winner));
        }
        let computed = calls.load(Ordering::SeqCst) as usize;
        assert!((1..=THREADS).contains(&computed), "computed {computed} times");
        assert!(!ctx.inspect_cache().contains_promise());
    }
}

/// A computation that parks on its first call until released.
struct Gate {
    entered: Barrier,
    release: Barrier,
    calls: AtomicU32,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Barrier::new(2),
            release: Barrier::new(2),
            calls: AtomicU32::new(0),
        }
    }

    fn compute(&self) -> u32 {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.entered.wait();
            self.release.wait();
        }
        n + 1
    }
}

#[test]
fn slow_computation_never_overwrites_a_put() {
    let gate = Gate::new();
    let def = ContextValue::from_fn(|_: &Context<()>| Ok::<_, Infallible>(gate.compute()));
    let ctx = Context::new(());

    let result = thread::scope(|s| {
        let reader = s.spawn(|| def.get(&ctx).unwrap());
        gate.entered.wait();
        def.put(&ctx, 99u32);
        gate.release.wait();
        reader.join().unwrap()
    });

    assert_eq!(*result, 99);
    assert_eq!(*def.get(&ctx).unwrap(), 99);
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn remove_during_computation_lets_it_publish() {
    let gate = Gate::new();
    let def = ContextValue::from_fn(|_: &Context<()>| Ok::<_, Infallible>(gate.compute()));
    let ctx = Context::new(());

    let result = thread::scope(|s| {
        let reader = s.spawn(|| def.get(&ctx).unwrap());
        gate.entered.wait();
        def.remove(&ctx);
        gate.release.wait();
        reader.join().unwrap()
    });

    assert_eq!(*result, 1);
    assert_eq!(def.generation(), 0);
    assert!(Arc::ptr_eq(&result, &def.get(&ctx).unwrap()));
}

#[test]
fn readers_during_computation_compute_or_wait_but_agree() {
    let gate = Gate::new();
    let def = ContextValue::from_fn(|_: &Context<()>| Ok::<_, Infallible>(gate.compute()));
    let ctx = Context::new(());

    let (slow, fast) = thread::scope(|s| {
        let slow = s.spawn(|| def.get(&ctx).unwrap());
        gate.entered.wait();
        // Second reader computes its own candidate and publishes first.
        let fast = def.get(&ctx).unwrap();
        gate.release.wait();
        (slow.join().unwrap(), fast)
    });

    assert_eq!(*fast, 2);
    assert!(Arc::ptr_eq(&slow, &fast));
    assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn independent_contexts_run_in_parallel() {
    let def = ContextValue::from_fn(|ctx: &Context<usize>| Ok::<_, Infallible>(**ctx * 3));
    let contexts: Vec<Context<usize>> = (0..THREADS).map(Context::new).collect();
    thread::scope(|s| {
        for ctx in &contexts {
            let def = &def;
            s.spawn(move || {
                for _ in 0..1_000 {
                    assert_eq!(*def.get(ctx).unwrap(), **ctx * 3);
                }
            });
        }
    });
    for ctx in &contexts {
        assert_eq!(ctx.bound_definitions(), 1);
    }
}

#[test]
fn mixed_readers_and_writers_keep_the_cache_sound() {
    let defs: Vec<_> = (0..16u32)
        .map(|i| ContextValue::from_fn(move |_: &Context<()>| Ok::<_, Infallible>(i)))
        .collect();
    let ctx = Context::new(());

    thread::scope(|s| {
        for t in 0..THREADS {
            let defs = &defs;
            let ctx = &ctx;
            s.spawn(move || {
                for step in 0..2_000usize {
                    let def = &defs[(step * 7 + t) % defs.len()];
                    match (step + t) % 5 {
                        0 => def.remove(ctx),
                        1 => def.put(ctx, 1_000u32),
                        _ => {
                            let v = *def.get(ctx).unwrap();
                            assert!(v < 16 || v == 1_000, "unexpected value {v}");
                        }
                    }
                }
            });
        }
    });

    let snap = ctx.inspect_cache();
    assert!(!snap.contains_promise());
    assert!(snap.misplaced_live_slots().is_empty(), "{snap:?}");
    assert!(snap.load <= snap.capacity);
    for (i, def) in defs.iter().enumerate() {
        let v = *def.get(&ctx).unwrap();
        assert!(v == i as u32 || v == 1_000);
    }
}
