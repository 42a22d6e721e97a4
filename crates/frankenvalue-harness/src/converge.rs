//! First-read convergence runs.
//!
//! Each round builds a fresh definition and context, releases every thread at
//! once on a barrier, and checks that all of them came back with the very
//! same allocation however many computations raced.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use frankenvalue::{Context, ContextValue, MetricsSnapshot, global_metrics};

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy)]
pub struct ConvergeParams {
    pub threads: usize,
    pub rounds: usize,
    /// Busy-work iterations per computation, to widen the race window.
    pub spin: u32,
}

impl Default for ConvergeParams {
    fn default() -> Self {
        Self {
            threads: 8,
            rounds: 100,
            spin: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergeReport {
    pub threads: usize,
    pub rounds: usize,
    /// Total `compute_value` calls across all rounds.
    pub computations: u64,
    pub max_computations_in_round: u64,
    /// Rounds in which more than one thread computed.
    pub contended_rounds: usize,
    pub elapsed_us: u64,
    pub metrics: MetricsSnapshot,
}

pub fn run_converge(params: &ConvergeParams) -> Result<ConvergeReport, HarnessError> {
    if params.threads == 0 || params.rounds == 0 {
        return Err(HarnessError::Parameter(
            "threads and rounds must be non-zero".to_owned(),
        ));
    }
    let before = global_metrics().snapshot();
    let started = Instant::now();
    let mut computations = 0;
    let mut max_computations_in_round = 0;
    let mut contended_rounds = 0;

    for round in 0..params.rounds {
        let calls = AtomicU64::new(0);
        let spin = params.spin;
        let def = ContextValue::from_fn(|ctx: &Context<usize>| {
            calls.fetch_add(1, Ordering::Relaxed);
            let mut acc = **ctx as u64;
            for i in 0..spin {
                acc = std::hint::black_box(acc.wrapping_mul(31).wrapping_add(u64::from(i)));
            }
            Ok::<_, Infallible>(acc)
        });
        let ctx = Context::new(round);
        let start = Barrier::new(params.threads);

        let seen: Vec<Arc<u64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..params.threads)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        let Ok(value) = def.get(&ctx);
                        value
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().map_err(|_| HarnessError::Invariant {
                        step: round,
                        detail: "reader thread panicked".to_owned(),
                    })
                })
                .collect::<Result<_, _>>()
        })?;

        let Ok(winner) = def.get(&ctx);
        if !seen.iter().all(|v| Arc::ptr_eq(v, &winner)) {
            return Err(HarnessError::Invariant {
                step: round,
                detail: "readers observed different values".to_owned(),
            });
        }
        if ctx.inspect_cache().contains_promise() {
            return Err(HarnessError::Invariant {
                step: round,
                detail: "promise leaked into the cache array".to_owned(),
            });
        }

        let n = calls.load(Ordering::Relaxed);
        computations += n;
        max_computations_in_round = max_computations_in_round.max(n);
        if n > 1 {
            contended_rounds += 1;
        }
    }

    let report = ConvergeReport {
        threads: params.threads,
        rounds: params.rounds,
        computations,
        max_computations_in_round,
        contended_rounds,
        elapsed_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        metrics: global_metrics().snapshot().since(&before),
    };
    info!(
        rounds = report.rounds,
        computations = report.computations,
        contended_rounds = report.contended_rounds,
        "convergence run complete"
    );
    Ok(report)
}
