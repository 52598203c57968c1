// One LCA run: background -> foreground extension -> metadata -> packages
//
// Stage order:
//   1. build_background   technosphere, biosphere, characterization of the
//                         background database
//   2. extend             add the foreground system (single column or
//                         long format)
//   3. prepare_metadata   per-column uncertainty declarations (pedigree for
//                         background columns, uncertainty table for foreground)
//   4. package            coordinates, flip overrides, uncertainty, negative
//                         overrides, datapackage
//
// A pipeline value owns the metadata of its run. Packaging only reads it, so
// a scenario grid can be packaged in parallel from one prepared run.

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::lca_activity_index::{ActivityIndexMap, OrderedNames};
use crate::lca_config::PipelineConfig;
use crate::lca_errors::{AssemblyError, AssemblyResult};
use crate::lca_foreground::{
    extend_biosphere_column, extend_long_format, extend_technosphere_column, ColumnEntry, ExtendedSystem,
    ForegroundExchange,
};
use crate::lca_matrix_builder::{
    background_activities, form_bio_matrix, form_tech_matrix, split_labeled_grid, CfResolution,
    CharacterizationSource, LabeledMatrix, TaxonomyRecord,
};
use crate::lca_packager::{prepare_datapackage, prepare_matrices, Datapackage, MatrixKind, PackageUncertainty};
use crate::lca_uncertainty::{
    apply_flip_overrides, apply_negative_overrides, unsupported_overrides, ExchangeOverride, PedigreeTables,
    UncertaintyEngine, UncertaintyMetadata, UncertaintyRow, UncertaintyScenario,
};

/// Background tables as handed over by the caller's file loader.
pub struct BackgroundInputs<'a> {
    /// Tokenized coefficient table, header rows and label columns included
    pub technosphere_grid: &'a [Vec<String>],
    pub emission_table: &'a LabeledMatrix,
    pub taxonomy: &'a [TaxonomyRecord],
}

#[derive(Debug, Clone)]
pub struct BackgroundSystem {
    pub technosphere: Array2<f64>,
    pub biosphere: Array2<f64>,
    pub characterization: Array2<f64>,
    pub activities: OrderedNames,
    pub emissions: OrderedNames,
    pub characterization_resolution: CfResolution,
}

#[derive(Debug, Clone)]
pub enum ForegroundInput {
    /// No foreground; the background is packaged as is
    None,
    SingleColumn {
        activity: String,
        technosphere: Vec<ColumnEntry>,
        biosphere: Vec<ColumnEntry>,
    },
    LongFormat(Vec<ForegroundExchange>),
}

pub struct LcaPipeline {
    config: PipelineConfig,
    metadata: UncertaintyMetadata,
    /// From the long-format foreground, replaced by every `extend`
    exchange_overrides: Vec<ExchangeOverride>,
    /// From the uncertainty table, replaced by every `prepare_metadata`
    table_overrides: Vec<ExchangeOverride>,
}

impl LcaPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            metadata: UncertaintyMetadata::new(),
            exchange_overrides: Vec::new(),
            table_overrides: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &UncertaintyMetadata {
        &self.metadata
    }

    /// Sign overrides of the current run, foreground table first.
    pub fn overrides(&self) -> Vec<ExchangeOverride> {
        self.exchange_overrides.iter().chain(&self.table_overrides).cloned().collect()
    }

    pub fn build_background(
        &self,
        inputs: &BackgroundInputs<'_>,
        characterization: &CharacterizationSource<'_>,
    ) -> Result<BackgroundSystem> {
        let grid = split_labeled_grid(inputs.technosphere_grid, self.config.header_rows, self.config.label_columns)
            .context("splitting background coefficient table")?;
        let activities =
            OrderedNames::activities(background_activities(&grid.row_labels, self.config.activity_separator))
                .context("collecting background activities")?;
        if activities.len() != grid.coefficients.ncols() {
            return Err(AssemblyError::dimension(
                "background activities",
                grid.coefficients.ncols(),
                activities.len(),
            ))
            .context("country and sector labels do not span the coefficient table");
        }

        let technosphere = form_tech_matrix(&grid.coefficients).context("forming technosphere matrix")?;

        let emissions =
            OrderedNames::emissions(self.config.emissions.iter().cloned()).context("collecting emissions")?;
        let biosphere = form_bio_matrix(inputs.emission_table, &emissions).context("forming biosphere matrix")?;
        if biosphere.ncols() != activities.len() {
            return Err(AssemblyError::dimension("biosphere columns", activities.len(), biosphere.ncols()))
                .context("emission table does not match the background activities");
        }

        let resolution = characterization
            .form_cf_matrix(inputs.taxonomy, &self.config.method, &emissions)
            .with_context(|| format!("resolving characterization factors for {}", self.config.method))?;
        if !resolution.is_complete() {
            debug!(missing = resolution.missing_codes().len(), "characterization factors unresolved before fallback");
        }
        let cf_matrix = resolution
            .finalize(&self.config.co2_marker)
            .context("forming characterization matrix")?;

        info!(activities = activities.len(), emissions = emissions.len(), "background system ready");
        Ok(BackgroundSystem {
            technosphere,
            biosphere,
            characterization: cf_matrix,
            activities,
            emissions,
            characterization_resolution: resolution,
        })
    }

    /// Extend the background with the foreground and record any declared
    /// sign overrides.
    pub fn extend(&mut self, background: &BackgroundSystem, foreground: &ForegroundInput) -> Result<ExtendedSystem> {
        let system = match foreground {
            ForegroundInput::None => ExtendedSystem {
                technosphere: background.technosphere.clone(),
                biosphere: background.biosphere.clone(),
                activities: ActivityIndexMap::background_only(background.activities.iter())?,
                emissions: background.emissions.clone(),
            },
            ForegroundInput::SingleColumn { activity, technosphere, biosphere } => {
                let activities = ActivityIndexMap::new(vec![activity.as_str()], background.activities.iter())
                    .context("placing foreground activity")?;
                let tech = extend_technosphere_column(&background.technosphere, technosphere, &activities)
                    .context("extending technosphere column")?;
                let bio = extend_biosphere_column(&background.biosphere, biosphere, &background.emissions)
                    .context("extending biosphere column")?;
                ExtendedSystem {
                    technosphere: tech,
                    biosphere: bio,
                    activities,
                    emissions: background.emissions.clone(),
                }
            }
            ForegroundInput::LongFormat(exchanges) => extend_long_format(
                &background.technosphere,
                &background.biosphere,
                exchanges,
                &background.activities,
                &background.emissions,
            )
            .context("extending long-format foreground")?,
        };

        self.exchange_overrides = match foreground {
            ForegroundInput::LongFormat(exchanges) => {
                exchanges.iter().filter_map(ForegroundExchange::to_override).collect()
            }
            _ => Vec::new(),
        };
        unsupported_overrides(&self.exchange_overrides, &system.activities);

        info!(
            foreground = system.activities.n_foreground(),
            activities = system.activities.len(),
            overrides = self.exchange_overrides.len(),
            "extended system ready"
        );
        Ok(system)
    }

    /// Rebuild the run's metadata and uncertainty-table overrides for `system`.
    pub fn prepare_metadata(
        &mut self,
        system: &ExtendedSystem,
        pedigree: Option<&PedigreeTables>,
        rows: &[UncertaintyRow],
    ) -> Result<()> {
        let mut metadata = UncertaintyMetadata::new();
        metadata.register(&system.activities);
        if let Some(tables) = pedigree {
            metadata.apply_pedigree(tables, &system.activities);
        }
        metadata
            .import_rows(rows, &system.activities, &system.emissions)
            .context("importing foreground uncertainty")?;
        self.metadata = metadata;

        self.table_overrides = rows
            .iter()
            .filter(|r| r.negative.is_some())
            .map(|r| ExchangeOverride {
                activity: r.activity.clone(),
                exchange: r.exchange.clone(),
                flip: None,
                negative: r.negative,
            })
            .collect();
        unsupported_overrides(&self.table_overrides, &system.activities);
        Ok(())
    }

    /// Build one datapackage. The static scenario carries no distributions.
    pub fn package(
        &self,
        system: &ExtendedSystem,
        characterization: &Array2<f64>,
        scenario: &UncertaintyScenario,
    ) -> Result<Datapackage> {
        let overrides = self.overrides();
        let mut prepared = prepare_matrices(&system.technosphere, &system.biosphere, characterization)
            .context("preparing coordinate matrices")?;
        apply_flip_overrides(&mut prepared.technosphere, &overrides, &system.activities);

        let uncertainty = match scenario {
            UncertaintyScenario::Static => None,
            _ => {
                let engine = UncertaintyEngine::new(&self.metadata, &system.activities);
                let records = |kind: MatrixKind| engine.add_uncertainty(prepared.get(kind), scenario);
                let mut technosphere = records(MatrixKind::Technosphere);
                let mut biosphere = records(MatrixKind::Biosphere);
                let characterization = records(MatrixKind::Characterization);

                apply_negative_overrides(
                    &mut technosphere,
                    &prepared.technosphere,
                    &overrides,
                    &system.activities,
                    system.activities.names(),
                )?;
                apply_negative_overrides(
                    &mut biosphere,
                    &prepared.biosphere,
                    &overrides,
                    &system.activities,
                    &system.emissions,
                )?;
                Some(PackageUncertainty { technosphere, biosphere, characterization })
            }
        };

        let package = prepare_datapackage(&prepared, uncertainty.as_ref())
            .with_context(|| format!("packaging scenario {}", scenario.label()))?;
        info!(scenario = %scenario.label(), offset = prepared.offset, "datapackage ready");
        Ok(package)
    }

    /// Build the datapackage of the scenario set under `[uncertainty]`.
    pub fn package_configured(&self, system: &ExtendedSystem, characterization: &Array2<f64>) -> Result<Datapackage> {
        self.package(system, characterization, &self.config.uncertainty.scenario)
    }

    pub fn package_scenarios(
        &self,
        system: &ExtendedSystem,
        characterization: &Array2<f64>,
        scenarios: &[UncertaintyScenario],
    ) -> Result<Vec<(UncertaintyScenario, Datapackage)>> {
        scenarios
            .par_iter()
            .map(|scenario| -> Result<(UncertaintyScenario, Datapackage)> {
                Ok((scenario.clone(), self.package(system, characterization, scenario)?))
            })
            .collect()
    }
}

// ---
// Reference score
// ---

/// Technosphere in solve orientation: production positive, consumption negative.
fn signed_technosphere(technosphere: &Array2<f64>) -> DMatrix<f64> {
    let (n_rows, n_cols) = technosphere.dim();
    DMatrix::from_fn(n_rows, n_cols, |r, c| {
        let value = technosphere[[r, c]];
        if r == c {
            value
        } else {
            -value
        }
    })
}

fn to_dmatrix(matrix: &Array2<f64>) -> DMatrix<f64> {
    let (n_rows, n_cols) = matrix.dim();
    DMatrix::from_fn(n_rows, n_cols, |r, c| matrix[[r, c]])
}

fn check_reference_shapes(
    technosphere: &Array2<f64>,
    biosphere: &Array2<f64>,
    characterization: &Array2<f64>,
) -> AssemblyResult<()> {
    let n = technosphere.nrows();
    if technosphere.ncols() != n {
        return Err(AssemblyError::dimension("technosphere columns (square)", n, technosphere.ncols()));
    }
    if biosphere.ncols() != n {
        return Err(AssemblyError::dimension("biosphere columns", n, biosphere.ncols()));
    }
    if characterization.dim() != (biosphere.nrows(), biosphere.nrows()) {
        return Err(AssemblyError::dimension(
            "characterization rows",
            biosphere.nrows(),
            characterization.nrows(),
        ));
    }
    Ok(())
}

/// Dense check score `sum(C * B * T^-1 * f)` for one unit of `index`, with
/// `technosphere` in package layout (all entries non-negative).
pub fn reference_score(
    technosphere: &Array2<f64>,
    biosphere: &Array2<f64>,
    characterization: &Array2<f64>,
    index: usize,
) -> AssemblyResult<f64> {
    Ok(reference_scores(technosphere, biosphere, characterization, &[index])?[0])
}

/// One score per functional unit index, sharing one LU factorization.
pub fn reference_scores(
    technosphere: &Array2<f64>,
    biosphere: &Array2<f64>,
    characterization: &Array2<f64>,
    indices: &[usize],
) -> AssemblyResult<Vec<f64>> {
    check_reference_shapes(technosphere, biosphere, characterization)?;
    let n = technosphere.nrows();
    if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
        return Err(AssemblyError::dimension("functional unit index bound", n, bad));
    }

    let lu = signed_technosphere(technosphere).lu();
    let impact = to_dmatrix(characterization) * to_dmatrix(biosphere);

    indices
        .par_iter()
        .map(|&index| -> AssemblyResult<f64> {
            let mut demand = DVector::<f64>::zeros(n);
            demand[index] = 1.0;
            let supply = lu.solve(&demand).ok_or(AssemblyError::SingularTechnosphere)?;
            let score = (&impact * supply).sum();
            if score.is_finite() {
                Ok(score)
            } else {
                Err(AssemblyError::SingularTechnosphere)
            }
        })
        .collect()
}
