//! Chain assembly, best-chain selection, and the parameter-range summary.
//!
//! A chain is one terminal-stage candidate joined back through its parent
//! foreign keys to a full parameter set for every pool. Stage RMSEs were
//! frozen when each stage ran; the aggregate score is their sum and is never
//! re-fit against the data.

use crate::domain::{Chain, PoolSummary, StageTable, ValueRange};
use crate::error::AppError;
use crate::math::lin_space;
use crate::sim::{CascadeSystem, SolverOptions, Trajectory, integrate_at};

/// Join every terminal-stage entry back to the root.
///
/// Chains come out in terminal-entry order, so a chain's position in the
/// returned vector doubles as the parent key for the next stage.
pub fn assemble_chains(tables: &[StageTable]) -> Result<Vec<Chain>, AppError> {
    let terminal = tables
        .last()
        .ok_or_else(|| AppError::new(4, "No stage tables to assemble."))?;

    let mut chains = Vec::with_capacity(terminal.entries.len());
    for entry in &terminal.entries {
        let mut params = vec![entry.params];
        let mut stage_rmse = vec![entry.rmse];
        let mut parent = entry.parent;

        // Walk upstream tables in reverse.
        for table in tables[..tables.len() - 1].iter().rev() {
            let key = parent.ok_or_else(|| {
                AppError::new(
                    4,
                    format!("Stage {} entry is missing its parent key.", table.stage + 1),
                )
            })?;
            let upstream = table.entries.get(key).ok_or_else(|| {
                AppError::new(
                    4,
                    format!(
                        "Dangling parent key {key} into stage {} ({} entries).",
                        table.stage,
                        table.entries.len()
                    ),
                )
            })?;
            params.push(upstream.params);
            stage_rmse.push(upstream.rmse);
            parent = upstream.parent;
        }
        if parent.is_some() {
            return Err(AppError::new(
                4,
                "Stage 1 entry carries a parent key; the root stage has no upstream.",
            ));
        }

        params.reverse();
        stage_rmse.reverse();
        let aggregate_rmse = stage_rmse.iter().sum();
        chains.push(Chain {
            terminal_index: entry.index,
            params,
            stage_rmse,
            aggregate_rmse,
        });
    }
    Ok(chains)
}

/// Best chain plus how many other chains tied its aggregate score exactly.
#[derive(Debug, Clone)]
pub struct Selection {
    pub best: Chain,
    /// Chains (excluding `best`) with a bitwise-equal aggregate RMSE. Ties
    /// are reported, never silently discarded.
    pub tied: usize,
}

/// Pick the minimum-aggregate-RMSE chain; ties resolve to the earliest chain
/// in canonical (terminal-entry) order.
pub fn select_best(chains: &[Chain]) -> Result<Selection, AppError> {
    let best = chains
        .iter()
        .min_by(|a, b| a.aggregate_rmse.total_cmp(&b.aggregate_rmse))
        .ok_or_else(|| AppError::new(3, "No complete chains to select from."))?;
    let tied = chains
        .iter()
        .filter(|c| c.aggregate_rmse == best.aggregate_rmse)
        .count()
        - 1;
    Ok(Selection {
        best: best.clone(),
        tied,
    })
}

/// Per-pool ensemble ranges over the surviving candidates, with the selected
/// chain's values as the point estimate.
///
/// Transfer fractions are attributed to the *receiving* pool: pool k's
/// incoming fraction lives on stage k-1's candidates, so pool 1 reports none.
pub fn summarize_pools(tables: &[StageTable], best: &Chain) -> Vec<PoolSummary> {
    tables
        .iter()
        .enumerate()
        .map(|(i, table)| {
            let pool = i + 1;
            let best_params = &best.params[i];

            let turnover = range_over(table, |e| e.params.turnover(), best_params.turnover());
            let initial = range_over(
                table,
                |e| e.params.initial_concentration,
                best_params.initial_concentration,
            );
            let magnitude = range_over(
                table,
                |e| e.params.input_magnitude,
                best_params.input_magnitude,
            );

            let transfer_fraction = if pool >= 2 {
                let feeder = &tables[i - 1];
                Some(range_over(
                    feeder,
                    |e| e.params.transfer_fraction,
                    best.params[i - 1].transfer_fraction,
                ))
            } else {
                None
            };

            PoolSummary {
                pool,
                turnover,
                initial_concentration: initial,
                input_magnitude: magnitude,
                transfer_fraction,
            }
        })
        .collect()
}

fn range_over(
    table: &StageTable,
    value: impl Fn(&crate::domain::StageEntry) -> f64,
    best: f64,
) -> ValueRange {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for entry in &table.entries {
        let v = value(entry);
        min = min.min(v);
        max = max.max(v);
    }
    ValueRange { min, max, best }
}

/// Re-simulate the selected chain on a fresh output grid.
pub fn project_chain(
    chain: &Chain,
    horizon: f64,
    steps: usize,
    solver: &SolverOptions,
) -> Result<Trajectory, AppError> {
    let grid = lin_space(0.0, horizon, steps)?;
    let system = CascadeSystem::from_chain(&chain.params);
    let y0 = CascadeSystem::initial_state(&chain.params);
    integrate_at(&system, &y0, &grid, solver).map_err(|e| {
        AppError::new(
            3,
            format!("Projection of the selected chain failed: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FitDiagnostic, PoolParams, StageEntry, StageStats};

    fn params(decay: f64, transfer: f64) -> PoolParams {
        PoolParams {
            decay_rate: decay,
            initial_concentration: 100.0,
            transfer_fraction: transfer,
            input_magnitude: 0.0,
            input_duration: 50.0,
        }
    }

    fn entry(index: usize, parent: Option<usize>, decay: f64, rmse: f64) -> StageEntry {
        StageEntry {
            index,
            parent,
            params: params(decay, 0.5),
            rmse,
            diagnostic: FitDiagnostic {
                intercept: 0.0,
                intercept_se: 1.0,
                slope: 1.0,
                slope_se: 0.1,
            },
        }
    }

    fn table(stage: usize, entries: Vec<StageEntry>) -> StageTable {
        let stats = StageStats {
            evaluated: entries.len(),
            integration_failures: 0,
            accepted: entries.len(),
            below_median: entries.len(),
            deduplicated: entries.len(),
            kept: entries.len(),
        };
        StageTable {
            stage,
            n_pools: 2,
            entries,
            stats,
        }
    }

    #[test]
    fn chains_join_back_to_the_root_in_order() {
        let t1 = table(1, vec![entry(0, None, 0.1, 2.0), entry(1, None, 0.2, 3.0)]);
        let t2 = table(
            2,
            vec![entry(0, Some(1), 0.01, 1.0), entry(1, Some(0), 0.02, 5.0)],
        );

        let chains = assemble_chains(&[t1, t2]).unwrap();
        assert_eq!(chains.len(), 2);

        assert_eq!(chains[0].terminal_index, 0);
        assert_eq!(chains[0].params[0].decay_rate, 0.2);
        assert_eq!(chains[0].params[1].decay_rate, 0.01);
        assert_eq!(chains[0].stage_rmse, vec![3.0, 1.0]);
        assert_eq!(chains[0].aggregate_rmse, 4.0);

        assert_eq!(chains[1].params[0].decay_rate, 0.1);
        assert_eq!(chains[1].aggregate_rmse, 7.0);
    }

    #[test]
    fn dangling_parent_key_is_an_internal_error() {
        let t1 = table(1, vec![entry(0, None, 0.1, 2.0)]);
        let t2 = table(2, vec![entry(0, Some(5), 0.01, 1.0)]);
        let err = assemble_chains(&[t1, t2]).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn missing_parent_key_on_a_joined_stage_is_rejected() {
        let t1 = table(1, vec![entry(0, None, 0.1, 2.0)]);
        let t2 = table(2, vec![entry(0, None, 0.01, 1.0)]);
        assert!(assemble_chains(&[t1, t2]).is_err());
    }

    #[test]
    fn selection_counts_exact_ties() {
        let chain = |agg: f64| Chain {
            terminal_index: 0,
            params: vec![params(0.1, 0.0)],
            stage_rmse: vec![agg],
            aggregate_rmse: agg,
        };
        let sel = select_best(&[chain(2.0), chain(1.0), chain(1.0), chain(3.0)]).unwrap();
        assert_eq!(sel.best.aggregate_rmse, 1.0);
        assert_eq!(sel.tied, 1);

        assert!(select_best(&[]).is_err());
    }

    #[test]
    fn summary_attributes_transfer_to_the_receiving_pool() {
        let mut e0 = entry(0, None, 0.1, 2.0);
        e0.params.transfer_fraction = 0.2;
        let mut e1 = entry(1, None, 0.2, 3.0);
        e1.params.transfer_fraction = 0.8;
        let t1 = table(1, vec![e0, e1]);
        let t2 = table(2, vec![entry(0, Some(1), 0.01, 1.0)]);

        let chains = assemble_chains(&[t1.clone(), t2.clone()]).unwrap();
        let best = select_best(&chains).unwrap().best;
        let summary = summarize_pools(&[t1, t2], &best);

        assert_eq!(summary.len(), 2);
        assert!(summary[0].transfer_fraction.is_none());
        let incoming = summary[1].transfer_fraction.as_ref().unwrap();
        assert_eq!(incoming.min, 0.2);
        assert_eq!(incoming.max, 0.8);
        assert_eq!(incoming.best, 0.8);

        // Turnover is the reciprocal decay rate.
        assert!((summary[0].turnover.min - 5.0).abs() < 1e-12);
        assert!((summary[0].turnover.max - 10.0).abs() < 1e-12);
    }

    #[test]
    fn projection_samples_the_requested_grid() {
        let chain = Chain {
            terminal_index: 0,
            params: vec![params(0.01, 0.0)],
            stage_rmse: vec![0.0],
            aggregate_rmse: 0.0,
        };
        let traj = project_chain(&chain, 200.0, 5, &SolverOptions::default()).unwrap();
        assert_eq!(traj.times.len(), 5);
        assert_eq!(traj.times[0], 0.0);
        assert_eq!(traj.times[4], 200.0);
        let expected = 100.0 * (-0.01f64 * 200.0).exp();
        assert!((traj.states[4][0] - expected).abs() < 1e-3);
    }
}
