//! The staged calibration pipeline shared by every front-end command.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! ingest -> stage loop (cache or search) -> chain assembly -> selection ->
//! summary -> projection
//!
//! The commands then focus on presentation (full report vs summary only).

use crate::cache::{CacheRead, StageCache};
use crate::domain::{Chain, PoolSummary, RunConfig, StageTable};
use crate::error::AppError;
use crate::fit::{
    Selection, StageGrid, StageParams, assemble_chains, project_chain, search_stage, select_best,
    summarize_pools,
};
use crate::io::{DatasetStats, read_observations};
use crate::report::StageSource;
use crate::sim::{SolverOptions, Trajectory};

/// All computed outputs of a single calibration run.
#[derive(Debug)]
pub struct RunOutput {
    pub stats: DatasetStats,
    pub tables: Vec<StageTable>,
    pub sources: Vec<StageSource>,
    pub chains: Vec<Chain>,
    pub selection: Selection,
    pub summaries: Vec<PoolSummary>,
    pub projection: Trajectory,
}

/// Execute the full calibration pipeline and return the computed outputs.
pub fn run_fit(config: &RunConfig) -> Result<RunOutput, AppError> {
    config.validate()?;

    let observations = read_observations(&config.obs_path)?;
    let n_pools = observations.n_pools;
    let cache = StageCache::open(&config.cache_dir)?;
    let solver = SolverOptions::default();

    let mut tables: Vec<StageTable> = Vec::with_capacity(n_pools);
    let mut sources: Vec<StageSource> = Vec::with_capacity(n_pools);

    for stage in 1..=n_pools {
        let (table, source) = match cache.load(stage, n_pools) {
            CacheRead::Hit(table) => (table, StageSource::CacheHit),
            CacheRead::Miss => {
                let table = compute_stage(config, stage, n_pools, &observations, &tables, &solver)?;
                cache.store(&table, config.seed)?;
                (table, StageSource::Computed)
            }
            CacheRead::Corrupt(reason) => {
                eprintln!("Warning: stage {stage} cache unusable ({reason}); recomputing.");
                let table = compute_stage(config, stage, n_pools, &observations, &tables, &solver)?;
                cache.store(&table, config.seed)?;
                (table, StageSource::Recomputed(reason))
            }
        };
        tables.push(table);
        sources.push(source);
    }

    let chains = assemble_chains(&tables)?;
    let selection = select_best(&chains)?;
    let summaries = summarize_pools(&tables, &selection.best);
    let projection = project_chain(
        &selection.best,
        config.project_to,
        config.project_steps,
        &solver,
    )?;

    Ok(RunOutput {
        stats: observations.stats(),
        tables,
        sources,
        chains,
        selection,
        summaries,
        projection,
    })
}

fn compute_stage(
    config: &RunConfig,
    stage: usize,
    n_pools: usize,
    observations: &crate::io::ObservationSet,
    tables: &[StageTable],
    solver: &SolverOptions,
) -> Result<StageTable, AppError> {
    let grid = StageGrid::from_config(config, stage, n_pools)?;
    let params = StageParams {
        stage,
        n_pools,
        subsample: config.subsample,
        seed: config.seed,
        solver,
    };

    // Stage 1 searches alone; later stages cross the grid with every chain
    // surviving the previous stage.
    if stage == 1 {
        search_stage(&params, observations, &grid, None)
    } else {
        let upstream = assemble_chains(tables)?;
        search_stage(&params, observations, &grid, Some(&upstream))
    }
}
