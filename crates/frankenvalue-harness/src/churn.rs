//! Randomized churn against a reference model.
//!
//! A single context is hammered with a seeded mix of reads, invalidations and
//! puts over a pool of definitions. Every returned value is checked against a
//! plain model of what should be bound, and the cache array is inspected
//! after every step.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use frankenvalue::{CacheConfig, CacheSnapshot, Context, ContextValue, MetricsSnapshot, global_metrics};

use crate::error::HarnessError;

/// Marks values that came from `put` rather than a computation.
const PUT_TAG: u64 = 1 << 63;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChurnParams {
    pub seed: u64,
    pub ops: usize,
    pub definitions: usize,
    pub config: CacheConfig,
}

impl Default for ChurnParams {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            ops: 10_000,
            definitions: 64,
            config: CacheConfig {
                initial_entries: 8,
                probe_limit: 3,
                load_limit_percent: 67,
                max_entries: 256,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub seed: u64,
    pub ops: usize,
    pub gets: usize,
    pub removes: usize,
    pub puts: usize,
    pub computations: u64,
    pub final_capacity: usize,
    pub peak_load: usize,
    pub bound_definitions: usize,
    pub config: CacheConfig,
    pub metrics: MetricsSnapshot,
}

pub fn run_churn(params: &ChurnParams) -> Result<ChurnReport, HarnessError> {
    params.config.validate()?;
    if params.definitions == 0 {
        return Err(HarnessError::Parameter(
            "at least one definition is required".to_owned(),
        ));
    }
    let before = global_metrics().snapshot();

    let counters: Vec<AtomicU64> = (0..params.definitions).map(|_| AtomicU64::new(0)).collect();
    let defs: Vec<_> = counters
        .iter()
        .enumerate()
        .map(|(i, calls)| {
            ContextValue::from_fn(move |_: &Context<()>| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, Infallible>(((i as u64) << 32) | n)
            })
        })
        .collect();
    let ctx = Context::with_config((), params.config)?;

    let mut rng = XorShift64::new(params.seed);
    let mut model: Vec<Option<u64>> = vec![None; params.definitions];
    let (mut gets, mut removes, mut puts, mut peak_load) = (0, 0, 0, 0);

    for step in 0..params.ops {
        let i = rng.below(defs.len());
        match rng.below(8) {
            0 => {
                defs[i].remove(&ctx);
                model[i] = None;
                removes += 1;
            }
            1 => {
                let value = PUT_TAG | step as u64;
                defs[i].put(&ctx, value);
                model[i] = Some(value);
                puts += 1;
            }
            _ => {
                let Ok(got) = defs[i].get(&ctx);
                let got = *got;
                match model[i] {
                    Some(expected) if expected != got => {
                        return Err(HarnessError::Invariant {
                            step,
                            detail: format!("definition {i}: expected {expected:#x}, got {got:#x}"),
                        });
                    }
                    Some(_) => {}
                    None if got & PUT_TAG != 0 || (got >> 32) as usize != i => {
                        return Err(HarnessError::Invariant {
                            step,
                            detail: format!("definition {i}: unbound read returned {got:#x}"),
                        });
                    }
                    None => model[i] = Some(got),
                }
                gets += 1;
            }
        }

        let snap = ctx.inspect_cache();
        check_snapshot(step, &snap)?;
        peak_load = peak_load.max(snap.load);
        let bound = model.iter().filter(|m| m.is_some()).count();
        if ctx.bound_definitions() != bound {
            return Err(HarnessError::Invariant {
                step,
                detail: format!(
                    "{} bindings in the map, model expects {bound}",
                    ctx.bound_definitions()
                ),
            });
        }
        if step % 1_000 == 999 {
            debug!(step, capacity = snap.capacity, load = snap.load, "churn progress");
        }
    }

    let report = ChurnReport {
        seed: params.seed,
        ops: params.ops,
        gets,
        removes,
        puts,
        computations: counters.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
        final_capacity: ctx.inspect_cache().capacity,
        peak_load,
        bound_definitions: ctx.bound_definitions(),
        config: params.config,
        metrics: global_metrics().snapshot().since(&before),
    };
    info!(
        seed = report.seed,
        ops = report.ops,
        final_capacity = report.final_capacity,
        "churn run complete"
    );
    Ok(report)
}

/// Structural checks on one cache array snapshot.
pub fn check_snapshot(step: usize, snap: &CacheSnapshot) -> Result<(), HarnessError> {
    let fail = |detail: String| Err(HarnessError::Invariant { step, detail });
    if snap.capacity == 0 {
        return Ok(());
    }
    if snap.contains_promise() {
        return fail("promise found in the cache array".to_owned());
    }
    let misplaced = snap.misplaced_live_slots();
    if !misplaced.is_empty() {
        return fail(format!("live entries outside their probe window at {misplaced:?}"));
    }
    if snap.load != snap.occupied_slots() || snap.load > snap.capacity {
        return fail(format!(
            "load {} disagrees with {} occupied of {} slots",
            snap.load,
            snap.occupied_slots(),
            snap.capacity
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut z = XorShift64::new(0);
        assert_ne!(z.next_u64(), 0);
    }

    #[test]
    fn short_run_matches_the_model() {
        let report = run_churn(&ChurnParams {
            ops: 2_000,
            definitions: 24,
            ..ChurnParams::default()
        })
        .unwrap();
        assert_eq!(report.gets + report.removes + report.puts, 2_000);
        assert!(report.final_capacity <= 256);
        assert!(report.computations > 0);
    }

    #[test]
    fn invalid_config_is_reported() {
        let mut params = ChurnParams::default();
        params.config.probe_limit = 0;
        assert!(matches!(run_churn(&params), Err(HarnessError::Config(_))));
    }
}
