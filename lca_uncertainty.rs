// Per-cell uncertainty for packaged matrices
//
// DATA SOURCE REQUIREMENTS:
//
// 1. FOREGROUND UNCERTAINTY TABLE:
//    - Columns: "Activity name", "Exchange name", optional "Exchange type",
//      "Exchange uncertainty type" (integer distribution code), "GSD",
//      optional "Exchange negative"
//    - One group of rows per foreground activity (matrix column)
//
// 2. PEDIGREE TABLES (background columns):
//    - country -> region grouping
//    - sector -> sector category grouping
//    - (region, sector category) -> geometric standard deviation
//
// The metadata built from these tables is owned by one pipeline run and
// only read while packages are generated, so several scenarios can be
// packaged from it at once.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::lca_activity_index::{ActivityIndexMap, OrderedNames};
use crate::lca_errors::{AssemblyError, AssemblyResult, NameKind};
use crate::lca_foreground::ExchangeType;
use crate::lca_packager::{Cell, CoordinateMatrix, MatrixKind};

/// Only the first foreground column receives multifunctionality overrides.
pub const MULTIFUNCTIONAL_COLUMN: usize = 0;

// ---
// Distributions
// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DistributionKind {
    Undefined = 0,
    NoUncertainty = 1,
    Lognormal = 2,
    Normal = 3,
    Uniform = 4,
}

impl TryFrom<u8> for DistributionKind {
    type Error = AssemblyError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DistributionKind::Undefined),
            1 => Ok(DistributionKind::NoUncertainty),
            2 => Ok(DistributionKind::Lognormal),
            3 => Ok(DistributionKind::Normal),
            4 => Ok(DistributionKind::Uniform),
            other => Err(AssemblyError::UnknownDistribution(other)),
        }
    }
}

impl From<DistributionKind> for u8 {
    fn from(kind: DistributionKind) -> u8 {
        kind as u8
    }
}

/// `(kind, loc, scale, shape, minimum, maximum, negative)` as read by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyRecord {
    pub kind: DistributionKind,
    pub loc: f64,
    pub scale: f64,
    pub shape: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub negative: bool,
}

impl UncertaintyRecord {
    pub fn none(value: f64) -> Self {
        Self::fixed(DistributionKind::Undefined, value)
    }

    fn fixed(kind: DistributionKind, value: f64) -> Self {
        Self {
            kind,
            loc: value,
            scale: f64::NAN,
            shape: f64::NAN,
            minimum: f64::NAN,
            maximum: f64::NAN,
            negative: false,
        }
    }

    /// Build the record for one cell. `factor` is the GSD for lognormal, the
    /// relative standard deviation for normal and the relative half-width for
    /// uniform. A zero value or an unusable factor yields no uncertainty.
    pub fn generate(value: f64, kind: DistributionKind, factor: Option<f64>) -> Self {
        if value == 0.0 {
            return Self::none(value);
        }
        let factor = match (kind, factor) {
            (DistributionKind::Undefined, _) => return Self::none(value),
            (DistributionKind::NoUncertainty, _) => return Self::fixed(DistributionKind::NoUncertainty, value),
            (_, Some(f)) if f.is_finite() && f > 0.0 => f,
            _ => return Self::none(value),
        };

        match kind {
            DistributionKind::Lognormal => Self {
                kind,
                loc: value.abs().ln(),
                scale: factor.ln(),
                negative: value < 0.0,
                ..Self::fixed(kind, f64::NAN)
            },
            DistributionKind::Normal => Self {
                kind,
                loc: value,
                scale: value.abs() * factor,
                ..Self::fixed(kind, value)
            },
            DistributionKind::Uniform => {
                let (a, b) = (value - value * factor, value + value * factor);
                Self {
                    kind,
                    minimum: a.min(b),
                    maximum: a.max(b),
                    ..Self::fixed(kind, f64::NAN)
                }
            }
            DistributionKind::Undefined | DistributionKind::NoUncertainty => Self::none(value),
        }
    }

    pub fn has_uncertainty(&self) -> bool {
        !matches!(self.kind, DistributionKind::Undefined | DistributionKind::NoUncertainty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// One value per exchange (row) of the owning column
    Itemwise,
    /// One value for every cell of the owning column
    Columnwise,
}

/// How uncertainty is attached to a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "kebab-case")]
pub enum UncertaintyScenario {
    /// Deterministic package
    Static,
    /// Same relative half-width on every cell
    Uniform { spread: f64 },
    /// Same GSD on every cell
    LogNormal { gsd: f64 },
    /// Column-level GSD from metadata (pedigree for background columns)
    Pedigree,
    /// Metadata values, chosen per column by foreground/background strategy
    Specified {
        foreground: AggregationStrategy,
        background: AggregationStrategy,
    },
}

impl UncertaintyScenario {
    pub fn label(&self) -> String {
        match self {
            UncertaintyScenario::Static => "static".to_string(),
            UncertaintyScenario::Uniform { spread } => format!("uniform-{}", spread),
            UncertaintyScenario::LogNormal { gsd } => format!("log-normal-{}", gsd),
            UncertaintyScenario::Pedigree => "pedigree".to_string(),
            UncertaintyScenario::Specified { foreground, background } => {
                format!("specified-{:?}-{:?}", foreground, background).to_lowercase()
            }
        }
    }
}

// ---
// Metadata
// ---

/// Declared uncertainty of one matrix column (one activity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnUncertainty {
    pub activity: String,
    pub kind: Option<DistributionKind>,
    pub column_factor: Option<f64>,
    /// Indexed by activity row; 0 means no value
    pub technosphere_items: Vec<f64>,
    /// Indexed by emission row; 0 means no value
    pub biosphere_items: Vec<f64>,
}

impl ColumnUncertainty {
    fn new(activity: &str) -> Self {
        Self {
            activity: activity.to_string(),
            kind: None,
            column_factor: None,
            technosphere_items: Vec::new(),
            biosphere_items: Vec::new(),
        }
    }

    pub fn item(&self, matrix: MatrixKind, row: usize) -> Option<f64> {
        let items = match matrix {
            MatrixKind::Technosphere => &self.technosphere_items,
            MatrixKind::Biosphere => &self.biosphere_items,
            MatrixKind::Characterization => return None,
        };
        items.get(row).copied().filter(|v| *v != 0.0)
    }
}

/// One row of the foreground uncertainty table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyRow {
    #[serde(rename = "Activity name")]
    pub activity: String,
    #[serde(rename = "Exchange name")]
    pub exchange: String,
    #[serde(rename = "Exchange type", default)]
    pub exchange_type: Option<ExchangeType>,
    #[serde(rename = "Exchange uncertainty type", default)]
    pub kind: Option<DistributionKind>,
    #[serde(rename = "GSD", default)]
    pub gsd: Option<f64>,
    #[serde(rename = "Exchange negative", default)]
    pub negative: Option<bool>,
}

impl UncertaintyRow {
    fn factor(&self) -> f64 {
        self.gsd.filter(|g| g.is_finite()).unwrap_or(0.0)
    }
}

/// Column index -> declared uncertainty, for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyMetadata {
    columns: BTreeMap<usize, ColumnUncertainty>,
}

impl UncertaintyMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnUncertainty> {
        self.columns.get(&index)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ColumnUncertainty)> {
        self.columns.iter().map(|(i, c)| (*i, c))
    }

    /// Add an empty entry for every activity. Existing entries are kept.
    pub fn register(&mut self, activities: &ActivityIndexMap) {
        for (index, name) in activities.names().iter().enumerate() {
            self.columns.entry(index).or_insert_with(|| ColumnUncertainty::new(name));
        }
        debug!(columns = self.columns.len(), "registered activity columns");
    }

    /// Set the column-level GSD of every background column from the pedigree
    /// tables. Returns the number of columns resolved.
    pub fn apply_pedigree(&mut self, tables: &PedigreeTables, activities: &ActivityIndexMap) -> usize {
        let mut resolved = 0;
        for index in activities.n_foreground()..activities.len() {
            let Some(name) = activities.name(index) else { continue };
            let column = self.columns.entry(index).or_insert_with(|| ColumnUncertainty::new(name));
            match tables.find_pedigree_uncertainty(name) {
                Some(gsd) => {
                    column.column_factor = Some(gsd);
                    resolved += 1;
                }
                None => warn!(activity = name, "no pedigree GSD found, column left without uncertainty"),
            }
        }
        info!(resolved, background = activities.n_background(), "applied pedigree uncertainty");
        resolved
    }

    /// One pass per distinct "Activity name" group. Every pass fills both the
    /// per-row values and the column-level value of the owning column, so the
    /// strategy can be chosen at packaging time. Returns the number of groups.
    pub fn import_rows(
        &mut self,
        rows: &[UncertaintyRow],
        activities: &ActivityIndexMap,
        emissions: &OrderedNames,
    ) -> AssemblyResult<usize> {
        let mut groups: Vec<&str> = Vec::new();
        for row in rows {
            if !groups.contains(&row.activity.as_str()) {
                groups.push(&row.activity);
            }
        }

        for activity in &groups {
            let index = activities.index_of(activity)?;
            let column = self.columns.entry(index).or_insert_with(|| ColumnUncertainty::new(activity));
            if column.technosphere_items.len() != activities.len() {
                column.technosphere_items = vec![0.0; activities.len()];
            }
            if column.biosphere_items.len() != emissions.len() {
                column.biosphere_items = vec![0.0; emissions.len()];
            }

            let group: Vec<&UncertaintyRow> = rows.iter().filter(|r| r.activity == *activity).collect();
            for row in &group {
                match resolve_exchange(row, activities, emissions)? {
                    (MatrixKind::Biosphere, r) => column.biosphere_items[r] = row.factor(),
                    (_, r) => column.technosphere_items[r] = row.factor(),
                }
            }

            if let Some(kind) = group.iter().find_map(|r| r.kind) {
                column.kind = Some(kind);
            }
            let production = group.iter().find(|r| r.exchange == *activity).map(|r| r.factor());
            column.column_factor = production
                .filter(|f| *f > 0.0)
                .or_else(|| group.iter().map(|r| r.factor()).find(|f| *f > 0.0))
                .or(column.column_factor);
        }

        info!(groups = groups.len(), rows = rows.len(), "imported foreground uncertainty");
        Ok(groups.len())
    }
}

fn resolve_exchange(
    row: &UncertaintyRow,
    activities: &ActivityIndexMap,
    emissions: &OrderedNames,
) -> AssemblyResult<(MatrixKind, usize)> {
    match row.exchange_type {
        Some(ExchangeType::Biosphere) => Ok((MatrixKind::Biosphere, emissions.index_of(&row.exchange)?)),
        Some(_) => Ok((MatrixKind::Technosphere, activities.index_of(&row.exchange)?)),
        None => activities
            .position(&row.exchange)
            .map(|r| (MatrixKind::Technosphere, r))
            .or_else(|| emissions.position(&row.exchange).map(|r| (MatrixKind::Biosphere, r)))
            .ok_or_else(|| AssemblyError::UnknownName { kind: NameKind::Activity, name: row.exchange.clone() }),
    }
}

// ---
// Pedigree
// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRegionRow {
    #[serde(alias = "Country")]
    pub country: String,
    #[serde(alias = "Region")]
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorCategoryRow {
    #[serde(alias = "Sector")]
    pub sector: String,
    #[serde(alias = "Category")]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSectorGsdRow {
    #[serde(alias = "Region")]
    pub region: String,
    #[serde(alias = "Category")]
    pub category: String,
    #[serde(rename = "GSD")]
    pub gsd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedigreeTables {
    country_region: HashMap<String, String>,
    sector_category: HashMap<String, String>,
    gsd: HashMap<(String, String), f64>,
    separator: char,
}

impl PedigreeTables {
    /// First row wins on duplicate keys.
    pub fn from_rows(
        countries: &[CountryRegionRow],
        sectors: &[SectorCategoryRow],
        gsd_rows: &[RegionSectorGsdRow],
        separator: char,
    ) -> Self {
        let mut country_region = HashMap::new();
        for row in countries {
            country_region.entry(row.country.clone()).or_insert_with(|| row.region.clone());
        }
        let mut sector_category = HashMap::new();
        for row in sectors {
            sector_category.entry(row.sector.clone()).or_insert_with(|| row.category.clone());
        }
        let mut gsd = HashMap::new();
        for row in gsd_rows {
            gsd.entry((row.region.clone(), row.category.clone())).or_insert(row.gsd);
        }
        Self { country_region, sector_category, gsd, separator }
    }

    /// `country{sep}sector` -> (region, category) -> GSD.
    pub fn find_pedigree_uncertainty(&self, activity: &str) -> Option<f64> {
        let (country, sector) = activity.split_once(self.separator)?;
        let region = self.country_region.get(country)?;
        let category = self.sector_category.get(sector)?;
        self.gsd.get(&(region.clone(), category.clone())).copied()
    }
}

// ---
// Engine
// ---

pub struct UncertaintyEngine<'m> {
    metadata: &'m UncertaintyMetadata,
    n_foreground: usize,
}

impl<'m> UncertaintyEngine<'m> {
    pub fn new(metadata: &'m UncertaintyMetadata, activities: &ActivityIndexMap) -> Self {
        Self { metadata, n_foreground: activities.n_foreground() }
    }

    /// One record per coordinate triple, in coordinate order.
    pub fn add_uncertainty(&self, coords: &CoordinateMatrix, scenario: &UncertaintyScenario) -> Vec<UncertaintyRecord> {
        let kind = coords.kind();
        let records: Vec<UncertaintyRecord> = match kind {
            MatrixKind::Characterization => coords.data().iter().map(|v| UncertaintyRecord::none(*v)).collect(),
            _ => coords.cells().map(|cell| self.cell_uncertainty(kind, &cell, scenario)).collect(),
        };
        debug!(
            matrix = kind.matrix_name(),
            scenario = %scenario.label(),
            uncertain = records.iter().filter(|r| r.has_uncertainty()).count(),
            total = records.len(),
            "generated uncertainty"
        );
        records
    }

    fn cell_uncertainty(&self, matrix: MatrixKind, cell: &Cell, scenario: &UncertaintyScenario) -> UncertaintyRecord {
        // production entries stay certain
        if matrix == MatrixKind::Technosphere && !cell.flip {
            return UncertaintyRecord::none(cell.value);
        }

        let (kind, factor) = match scenario {
            UncertaintyScenario::Static => return UncertaintyRecord::none(cell.value),
            UncertaintyScenario::Uniform { spread } => (DistributionKind::Uniform, Some(*spread)),
            UncertaintyScenario::LogNormal { gsd } => (DistributionKind::Lognormal, Some(*gsd)),
            UncertaintyScenario::Pedigree => (
                DistributionKind::Lognormal,
                self.metadata.column(cell.col).and_then(|c| c.column_factor),
            ),
            UncertaintyScenario::Specified { foreground, background } => {
                let Some(column) = self.metadata.column(cell.col) else {
                    return UncertaintyRecord::none(cell.value);
                };
                let strategy = if cell.col < self.n_foreground { foreground } else { background };
                let factor = match strategy {
                    AggregationStrategy::Itemwise => column.item(matrix, cell.row),
                    AggregationStrategy::Columnwise => column.column_factor,
                };
                (column.kind.unwrap_or(DistributionKind::Lognormal), factor)
            }
        };

        UncertaintyRecord::generate(cell.value, kind, factor)
    }
}

// ---
// Multifunctionality overrides
// ---

/// User-declared sign handling for one exchange of a foreground activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOverride {
    pub activity: String,
    pub exchange: String,
    pub flip: Option<bool>,
    pub negative: Option<bool>,
}

fn multifunctional_matches<'a>(
    overrides: &'a [ExchangeOverride],
    activities: &ActivityIndexMap,
    exchange: &str,
) -> impl Iterator<Item = &'a ExchangeOverride> {
    let owner = activities.name(MULTIFUNCTIONAL_COLUMN).map(str::to_string);
    let exchange = exchange.to_string();
    overrides
        .iter()
        .filter(move |o| Some(&o.activity) == owner.as_ref() && o.exchange == exchange)
}

/// Overrides naming a foreground activity other than the column-0 one are
/// not applied. Logs one warning per such override and returns them.
pub fn unsupported_overrides<'a>(
    overrides: &'a [ExchangeOverride],
    activities: &ActivityIndexMap,
) -> Vec<&'a ExchangeOverride> {
    let ignored: Vec<&ExchangeOverride> = overrides
        .iter()
        .filter(|o| {
            activities
                .position(&o.activity)
                .map_or(false, |i| i != MULTIFUNCTIONAL_COLUMN && i < activities.n_foreground())
        })
        .collect();
    for o in &ignored {
        warn!(
            activity = %o.activity,
            exchange = %o.exchange,
            "sign override ignored, only the first foreground activity is multifunctional"
        );
    }
    ignored
}

/// Mark column-0 technosphere cells as not flipped where the user says so.
/// Runs before uncertainty generation. Returns the number of cells changed.
pub fn apply_flip_overrides(
    coords: &mut CoordinateMatrix,
    overrides: &[ExchangeOverride],
    activities: &ActivityIndexMap,
) -> usize {
    if coords.kind() != MatrixKind::Technosphere {
        return 0;
    }
    let targets: Vec<usize> = coords
        .cells()
        .filter(|c| c.col == MULTIFUNCTIONAL_COLUMN && c.flip)
        .filter(|c| {
            activities.name(c.row).map_or(false, |name| {
                multifunctional_matches(overrides, activities, name).find_map(|o| o.flip) == Some(false)
            })
        })
        .map(|c| c.position)
        .collect();

    if let Some(flip) = coords.flip_mut() {
        for &i in &targets {
            flip[i] = false;
        }
    }
    if !targets.is_empty() {
        debug!(cells = targets.len(), "applied flip overrides");
    }
    targets.len()
}

/// Force the negative flag of column-0 records where the user declares it.
/// `row_names` names the rows of `coords`. Runs after uncertainty generation.
pub fn apply_negative_overrides(
    records: &mut [UncertaintyRecord],
    coords: &CoordinateMatrix,
    overrides: &[ExchangeOverride],
    activities: &ActivityIndexMap,
    row_names: &OrderedNames,
) -> AssemblyResult<usize> {
    if records.len() != coords.len() {
        return Err(AssemblyError::dimension(
            format!("{} uncertainty records", coords.kind().matrix_name()),
            coords.len(),
            records.len(),
        ));
    }

    let mut changed = 0;
    for cell in coords.cells().filter(|c| c.col == MULTIFUNCTIONAL_COLUMN) {
        let Some(name) = row_names.name(cell.row) else { continue };
        if let Some(negative) = multifunctional_matches(overrides, activities, name).find_map(|o| o.negative) {
            records[cell.position].negative = negative;
            changed += 1;
        }
    }
    Ok(changed)
}
