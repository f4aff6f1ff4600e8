//! One calibration stage: grid evaluation, filtering, and subsampling.
//!
//! Stage k searches pool k's parameters with every upstream pool frozen to a
//! surviving candidate of stage k-1. The processing order is fixed:
//!
//! 1. evaluate all combinations (parallel, no shared state)
//! 2. drop integrator failures and unscoreable trajectories
//! 3. apply the acceptance rule; an empty result is fatal for the run
//! 4. keep candidates at or below the median RMSE of the acceptance-passers
//! 5. deduplicate identical parameter tuples
//! 6. non-terminal stages: reproducible seeded subsample of the canonically
//!    sorted survivors, force-including the minimum-RMSE candidate
//! 7. assign dense stage-local indices (the join keys for stage k+1)
//!
//! Determinism: candidates are enumerated in a fixed nested-loop order and
//! canonically re-sorted before the seeded draw, so the output is identical
//! across runs and across worker counts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::domain::{Chain, FitDiagnostic, PoolParams, StageEntry, StageStats, StageTable};
use crate::error::AppError;
use crate::fit::grid::StageGrid;
use crate::fit::scorer::score_pool;
use crate::io::ObservationSet;
use crate::sim::{CascadeSystem, SolverOptions, integrate_at};

/// Stage-invariant search settings.
#[derive(Debug, Clone)]
pub struct StageParams<'a> {
    /// 1-based pool index of this stage.
    pub stage: usize,
    /// Total pool count of the run.
    pub n_pools: usize,
    /// Subsample size for non-terminal stages.
    pub subsample: usize,
    /// Run seed; each stage derives its own generator from it.
    pub seed: u64,
    pub solver: &'a SolverOptions,
}

#[derive(Debug, Clone)]
struct Scored {
    parent: Option<usize>,
    params: PoolParams,
    rmse: f64,
    diagnostic: FitDiagnostic,
}

/// Run the grid search for one stage.
///
/// `upstream` carries the assembled chains of stage k-1 (absent at k=1);
/// parent foreign keys index into that slice.
pub fn search_stage(
    params: &StageParams<'_>,
    observations: &ObservationSet,
    grid: &StageGrid,
    upstream: Option<&[Chain]>,
) -> Result<StageTable, AppError> {
    let stage = params.stage;
    if stage == 0 || stage > params.n_pools {
        return Err(AppError::new(4, format!("Invalid stage index {stage}.")));
    }
    if stage > observations.n_pools {
        return Err(AppError::new(
            2,
            format!(
                "Stage {stage} has no observations (table has {} pool column(s)).",
                observations.n_pools
            ),
        ));
    }

    let combos = enumerate_combos(grid, upstream);
    let evaluated = combos.len();
    if evaluated == 0 {
        return Err(AppError::new(4, format!("Stage {stage} grid is empty.")));
    }

    let pool_obs = observations.pool_observations(stage - 1);

    // Step 1+2: evaluate every combination independently; a failed candidate
    // never aborts the stage.
    let scored: Vec<Scored> = combos
        .par_iter()
        .filter_map(|&(parent, own)| {
            let chain_params = resolve_chain(upstream, parent, own);
            let system = CascadeSystem::from_chain(&chain_params);
            let y0 = CascadeSystem::initial_state(&chain_params);
            let traj = integrate_at(&system, &y0, &observations.grid, params.solver).ok()?;
            let sim = traj.pool_series(stage - 1);
            let score = score_pool(&sim, pool_obs)?;
            Some(Scored {
                parent,
                params: own,
                rmse: score.rmse,
                diagnostic: score.diagnostic,
            })
        })
        .collect();
    let integration_failures = evaluated - scored.len();

    // Step 3: acceptance rule.
    let accepted: Vec<Scored> = scored
        .into_iter()
        .filter(|c| c.diagnostic.accepts())
        .collect();
    if accepted.is_empty() {
        return Err(AppError::new(
            3,
            format!(
                "Stage {stage}: no candidates pass the acceptance rule \
                 (evaluated {evaluated}, dropped by integrator/scorer {integration_failures})."
            ),
        ));
    }
    let n_accepted = accepted.len();

    // Step 4: adaptive quality threshold at the acceptance-passers' median.
    let mut rmses: Vec<f64> = accepted.iter().map(|c| c.rmse).collect();
    let threshold = median_mut(&mut rmses).unwrap_or(f64::INFINITY);
    let mut kept: Vec<Scored> = accepted
        .into_iter()
        .filter(|c| c.rmse <= threshold)
        .collect();
    let below_median = kept.len();

    // Step 5: canonical order, then dedup identical tuples.
    canonical_sort(&mut kept);
    kept.dedup_by(|a, b| a.parent == b.parent && same_tuple(&a.params, &b.params));
    let deduplicated = kept.len();

    // Step 6: bound growth for the next stage's cross product. The terminal
    // stage keeps everything; nothing downstream will multiply it.
    if stage < params.n_pools {
        kept = subsample_with_best(kept, params.subsample, stage_seed(params.seed, stage));
    }
    let kept_count = kept.len();

    // Step 7: dense stage-local indices.
    let entries = kept
        .into_iter()
        .enumerate()
        .map(|(index, c)| StageEntry {
            index,
            parent: c.parent,
            params: c.params,
            rmse: c.rmse,
            diagnostic: c.diagnostic,
        })
        .collect();

    Ok(StageTable {
        stage,
        n_pools: params.n_pools,
        entries,
        stats: StageStats {
            evaluated,
            integration_failures,
            accepted: n_accepted,
            below_median,
            deduplicated,
            kept: kept_count,
        },
    })
}

/// Fixed nested-loop enumeration: parents outermost, then decay rate,
/// initial concentration, input magnitude, transfer fraction.
fn enumerate_combos(
    grid: &StageGrid,
    upstream: Option<&[Chain]>,
) -> Vec<(Option<usize>, PoolParams)> {
    let parents: Vec<Option<usize>> = match upstream {
        None => vec![None],
        Some(chains) => (0..chains.len()).map(Some).collect(),
    };

    let mut combos = Vec::with_capacity(parents.len() * grid.combo_count());
    for &parent in &parents {
        for &decay_rate in &grid.decay_rates {
            for &initial_concentration in &grid.initials {
                for &input_magnitude in &grid.magnitudes {
                    for &transfer_fraction in &grid.transfers {
                        combos.push((
                            parent,
                            PoolParams {
                                decay_rate,
                                initial_concentration,
                                transfer_fraction,
                                input_magnitude,
                                input_duration: grid.input_duration,
                            },
                        ));
                    }
                }
            }
        }
    }
    combos
}

fn resolve_chain(
    upstream: Option<&[Chain]>,
    parent: Option<usize>,
    own: PoolParams,
) -> Vec<PoolParams> {
    let mut chain = match (upstream, parent) {
        (Some(chains), Some(p)) => chains[p].params.clone(),
        _ => Vec::new(),
    };
    chain.push(own);
    chain
}

/// Hash the run seed with the stage index so stages draw independent
/// subsamples while staying fully reproducible.
fn stage_seed(seed: u64, stage: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    stage.hash(&mut hasher);
    hasher.finish()
}

fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Canonical candidate order: parent index first (root candidates ahead of
/// joined ones), then the parameter tuple. Independent of evaluation order.
fn canonical_sort(candidates: &mut [Scored]) {
    candidates.sort_by(|a, b| {
        a.parent
            .cmp(&b.parent)
            .then_with(|| a.params.decay_rate.total_cmp(&b.params.decay_rate))
            .then_with(|| {
                a.params
                    .initial_concentration
                    .total_cmp(&b.params.initial_concentration)
            })
            .then_with(|| a.params.input_magnitude.total_cmp(&b.params.input_magnitude))
            .then_with(|| {
                a.params
                    .transfer_fraction
                    .total_cmp(&b.params.transfer_fraction)
            })
    });
}

fn same_tuple(a: &PoolParams, b: &PoolParams) -> bool {
    a.decay_rate == b.decay_rate
        && a.initial_concentration == b.initial_concentration
        && a.transfer_fraction == b.transfer_fraction
        && a.input_magnitude == b.input_magnitude
        && a.input_duration == b.input_duration
}

/// Seeded subsample over a canonically sorted candidate list.
///
/// The global-minimum-RMSE candidate is re-inserted if the draw missed it, so
/// the best-known point is never discarded.
fn subsample_with_best(candidates: Vec<Scored>, amount: usize, seed: u64) -> Vec<Scored> {
    if candidates.len() <= amount {
        return candidates;
    }

    // Minimum RMSE; ties resolve to the earliest candidate in canonical order.
    let mut best_idx = 0;
    for (i, c) in candidates.iter().enumerate() {
        if c.rmse < candidates[best_idx].rmse {
            best_idx = i;
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, candidates.len(), amount).into_vec();
    picked.sort_unstable();
    if let Err(slot) = picked.binary_search(&best_idx) {
        picked.insert(slot, best_idx);
    }

    let mut by_index: Vec<Option<Scored>> = candidates.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|i| by_index[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReplicateKind;
    use crate::fit::chain::assemble_chains;
    use crate::io::ObservationRow;

    fn pool(decay: f64, initial: f64, transfer: f64, magnitude: f64) -> PoolParams {
        PoolParams {
            decay_rate: decay,
            initial_concentration: initial,
            transfer_fraction: transfer,
            input_magnitude: magnitude,
            input_duration: 50.0,
        }
    }

    fn scored(decay: f64, rmse: f64) -> Scored {
        Scored {
            parent: None,
            params: pool(decay, 100.0, 0.0, 0.0),
            rmse,
            diagnostic: FitDiagnostic {
                intercept: 0.0,
                intercept_se: 1.0,
                slope: 1.0,
                slope_se: 0.1,
            },
        }
    }

    /// Perturbation orthogonal to both the constant regressor and `base`, so
    /// the OLS of `base + noise` on `base` has intercept exactly 0 and slope
    /// exactly 1 with strictly positive standard errors.
    fn orthogonal_noise(base: &[f64], scale: f64) -> Vec<f64> {
        let n = base.len() as f64;
        let raw: Vec<f64> = (0..base.len())
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();

        let mean_raw = raw.iter().sum::<f64>() / n;
        let mean_base = base.iter().sum::<f64>() / n;
        let mut centered: Vec<f64> = raw.iter().map(|v| v - mean_raw).collect();

        let dot: f64 = centered
            .iter()
            .zip(base.iter())
            .map(|(e, b)| e * (b - mean_base))
            .sum();
        let norm: f64 = base.iter().map(|b| (b - mean_base).powi(2)).sum();
        for (e, b) in centered.iter_mut().zip(base.iter()) {
            *e -= dot / norm * (b - mean_base);
        }
        centered.iter_mut().for_each(|e| *e *= scale);
        centered
    }

    fn observations_from_chain(chain: &[PoolParams], times: &[f64]) -> ObservationSet {
        let system = CascadeSystem::from_chain(chain);
        let y0 = CascadeSystem::initial_state(chain);
        let traj = integrate_at(&system, &y0, times, &SolverOptions::default()).unwrap();

        let noise: Vec<Vec<f64>> = (0..chain.len())
            .map(|pool| orthogonal_noise(&traj.pool_series(pool), 0.05))
            .collect();

        let rows: Vec<ObservationRow> = times
            .iter()
            .enumerate()
            .map(|(i, &time)| ObservationRow {
                time,
                concentrations: (0..chain.len())
                    .map(|pool| Some(traj.states[i][pool] + noise[pool][i]))
                    .collect(),
                horizon: format!("H{i}"),
                replicate: ReplicateKind::Mean,
            })
            .collect();
        ObservationSet::from_rows(chain.len(), rows).unwrap()
    }

    #[test]
    fn subsample_always_keeps_the_minimum_rmse_candidate() {
        for seed in 0..20u64 {
            for amount in [1usize, 3, 10, 49] {
                let candidates: Vec<Scored> = (0..50)
                    .map(|i| scored(0.001 + i as f64 * 1e-4, 100.0 - i as f64))
                    .collect();
                // RMSE descends from 100, so the best candidate sits last.
                let best_rmse = candidates.iter().map(|c| c.rmse).fold(f64::INFINITY, f64::min);
                let out = subsample_with_best(candidates, amount, seed);
                assert!(out.len() <= amount + 1);
                assert!(
                    out.iter().any(|c| c.rmse == best_rmse),
                    "seed {seed}, amount {amount}: best candidate was dropped"
                );
            }
        }
    }

    #[test]
    fn subsample_is_reproducible_and_ignores_input_excess() {
        let make = || (0..30).map(|i| scored(0.01 + i as f64 * 1e-3, i as f64)).collect::<Vec<_>>();
        let a = subsample_with_best(make(), 10, 7);
        let b = subsample_with_best(make(), 10, 7);
        let keys_a: Vec<f64> = a.iter().map(|c| c.params.decay_rate).collect();
        let keys_b: Vec<f64> = b.iter().map(|c| c.params.decay_rate).collect();
        assert_eq!(keys_a, keys_b);

        // Population not larger than the draw: returned unchanged.
        let small = subsample_with_best(make().into_iter().take(5).collect(), 10, 7);
        assert_eq!(small.len(), 5);
    }

    #[test]
    fn canonical_sort_and_dedup_collapse_identical_tuples() {
        let mut v = vec![scored(0.02, 5.0), scored(0.01, 3.0), scored(0.02, 5.0)];
        canonical_sort(&mut v);
        v.dedup_by(|a, b| a.parent == b.parent && same_tuple(&a.params, &b.params));
        assert_eq!(v.len(), 2);
        assert!(v[0].params.decay_rate < v[1].params.decay_rate);
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        let mut odd = vec![3.0, 1.0, 2.0];
        assert_eq!(median_mut(&mut odd), Some(2.0));
        let mut even = vec![4.0, 1.0, 2.0, 3.0];
        assert_eq!(median_mut(&mut even), Some(2.5));
        assert_eq!(median_mut(&mut []), None);
    }

    #[test]
    fn single_passing_combination_survives_alone() {
        // The grid holds the true parameters plus a flat (unscoreable)
        // combination; exactly one candidate must come out the other end.
        let truth = [pool(0.01, 100.0, 0.0, 0.0)];
        let times: Vec<f64> = (0..=8).map(|i| i as f64 * 25.0).collect();
        let observations = observations_from_chain(&truth, &times);

        let grid = StageGrid {
            decay_rates: vec![0.01],
            initials: vec![100.0, 0.0],
            magnitudes: vec![0.0],
            transfers: vec![0.0],
            input_duration: 50.0,
        };
        let solver = SolverOptions::default();
        // Non-terminal stage, so the subsampling path runs too.
        let params = StageParams {
            stage: 1,
            n_pools: 2,
            subsample: 50,
            seed: 42,
            solver: &solver,
        };

        let table = search_stage(&params, &observations, &grid, None).unwrap();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.stats.evaluated, 2);
        let entry = &table.entries[0];
        assert_eq!(entry.index, 0);
        assert!(entry.parent.is_none());
        assert!((entry.params.initial_concentration - 100.0).abs() < 1e-12);
        assert!(entry.diagnostic.accepts());
    }

    #[test]
    fn terminal_stage_keeps_every_deduplicated_candidate() {
        let truth = [pool(0.01, 100.0, 0.0, 0.0)];
        let times: Vec<f64> = (0..=8).map(|i| i as f64 * 25.0).collect();
        let observations = observations_from_chain(&truth, &times);

        // Several near-truth variants so more than one passes acceptance.
        let grid = StageGrid {
            decay_rates: vec![0.0099, 0.01, 0.0101],
            initials: vec![99.0, 100.0, 101.0],
            magnitudes: vec![0.0],
            transfers: vec![0.0],
            input_duration: 50.0,
        };
        let solver = SolverOptions::default();
        let params = StageParams {
            stage: 1,
            n_pools: 1,
            subsample: 1,
            seed: 42,
            solver: &solver,
        };

        let table = search_stage(&params, &observations, &grid, None).unwrap();
        // Terminal stage: no subsampling loss whatsoever.
        assert_eq!(table.entries.len(), table.stats.deduplicated);
        assert_eq!(table.entries.len(), table.stats.kept);
        // Dense indices.
        for (i, e) in table.entries.iter().enumerate() {
            assert_eq!(e.index, i);
        }
        // The acceptance rule holds for every survivor.
        assert!(table.entries.iter().all(|e| e.diagnostic.accepts()));
        // The best accepted candidate is present.
        let min_rmse = table
            .entries
            .iter()
            .map(|e| e.rmse)
            .fold(f64::INFINITY, f64::min);
        assert!(table.entries.iter().any(|e| e.rmse == min_rmse));
    }

    #[test]
    fn second_stage_crosses_parents_and_joins_back() {
        let truth = [pool(0.02, 80.0, 1.0, 0.0), pool(0.002, 20.0, 0.0, 0.0)];
        let times: Vec<f64> = (0..=8).map(|i| i as f64 * 50.0).collect();
        let observations = observations_from_chain(&truth, &times);
        let solver = SolverOptions::default();

        let grid1 = StageGrid {
            decay_rates: vec![0.02],
            initials: vec![80.0],
            magnitudes: vec![0.0],
            transfers: vec![0.25, 1.0],
            input_duration: 50.0,
        };
        let params1 = StageParams {
            stage: 1,
            n_pools: 2,
            subsample: 50,
            seed: 42,
            solver: &solver,
        };
        let table1 = search_stage(&params1, &observations, &grid1, None).unwrap();
        // The transfer sweep multiplies candidates without changing pool 1's
        // own trajectory, so both survive with identical RMSE.
        assert_eq!(table1.entries.len(), 2);
        assert_eq!(table1.entries[0].rmse, table1.entries[1].rmse);

        let chains = assemble_chains(std::slice::from_ref(&table1)).unwrap();
        let grid2 = StageGrid {
            decay_rates: vec![0.002],
            initials: vec![20.0],
            magnitudes: vec![0.0],
            transfers: vec![0.0],
            input_duration: 50.0,
        };
        let params2 = StageParams {
            stage: 2,
            n_pools: 2,
            subsample: 50,
            seed: 42,
            solver: &solver,
        };
        let table2 = search_stage(&params2, &observations, &grid2, Some(&chains)).unwrap();

        assert!(!table2.entries.is_empty());
        // The full-transfer parent must give the better pool-2 fit.
        let best = table2
            .entries
            .iter()
            .min_by(|a, b| a.rmse.total_cmp(&b.rmse))
            .unwrap();
        let parent = best.parent.expect("stage 2 entries carry a parent key");
        assert!((table1.entries[parent].params.transfer_fraction - 1.0).abs() < 1e-12);
    }
}
