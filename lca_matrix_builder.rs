// Background matrix construction
//
// DATA SOURCE REQUIREMENTS:
//
// 1. TECHNOSPHERE COEFFICIENTS (A):
//    - Source: multi-regional input-output table, e.g. aggregated EXIOBASE A.txt
//    - Layout: tab-delimited, first 3 rows are header metadata, first 2
//      columns are (country, sector) labels, remaining block is numeric
//    - Semantics: A[i, j] = amount of i consumed to produce one unit of j
//
// 2. EMISSION INTENSITIES (S):
//    - Source: aggregated EXIOBASE S.txt (satellite accounts)
//    - Layout: one row per stressor name, one column per (country, sector)
//
// 3. EMISSION TAXONOMY:
//    - Source: background-to-reference flow mapping, e.g.
//      EXIOBASE-ecoinvent-bio-bw-GHG.csv
//    - Columns: background emission name, reference flow name, trailing code
//
// Tokenizing those files is left to the caller. This module starts from
// in-memory cells and arrays.

use std::collections::HashMap;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::lca_activity_index::OrderedNames;
use crate::lca_errors::{AssemblyError, AssemblyResult};
use crate::lca_registry::{ActivityRegistry, MethodId, MethodRecords, MethodRegistry};

// ---
// Background tables
// ---

/// Labels and coefficients of a background table after the header rows are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundGrid {
    /// `(country, sector)` per data row
    pub row_labels: Vec<(String, String)>,
    pub coefficients: Array2<f64>,
}

/// Apply the header-skip convention to a tokenized background table: the first
/// `header_rows` rows are metadata, the first `label_columns` cells of every
/// remaining row are labels (country, sector), the rest is numeric.
pub fn split_labeled_grid(
    grid: &[Vec<String>],
    header_rows: usize,
    label_columns: usize,
) -> AssemblyResult<BackgroundGrid> {
    if label_columns < 2 {
        return Err(AssemblyError::dimension("background label columns", 2, label_columns));
    }

    let body = grid.get(header_rows..).unwrap_or(&[]);
    let width = body.first().map(|row| row.len()).unwrap_or(label_columns);
    let n_cols = width.saturating_sub(label_columns);

    let mut row_labels = Vec::with_capacity(body.len());
    let mut values = Vec::with_capacity(body.len() * n_cols);

    for (offset, row) in body.iter().enumerate() {
        let table_row = header_rows + offset;
        if row.len() != width {
            return Err(AssemblyError::dimension(format!("background table row {}", table_row), width, row.len()));
        }
        row_labels.push((row[0].trim().to_string(), row[1].trim().to_string()));
        for (col, cell) in row.iter().enumerate().skip(label_columns) {
            let value = cell.trim().parse::<f64>().map_err(|_| AssemblyError::UnparseableCell {
                row: table_row,
                col,
                cell: cell.clone(),
            })?;
            values.push(value);
        }
    }

    let coefficients = Array2::from_shape_vec((row_labels.len(), n_cols), values)?;
    debug!(rows = row_labels.len(), cols = n_cols, "split background grid");
    Ok(BackgroundGrid { row_labels, coefficients })
}

/// All background activities as `country{sep}sector`: unique countries in
/// first-appearance order, crossed with unique sectors in first-appearance order.
pub fn background_activities(row_labels: &[(String, String)], separator: char) -> Vec<String> {
    let mut countries: Vec<&str> = Vec::new();
    let mut sectors: Vec<&str> = Vec::new();
    for (country, sector) in row_labels {
        if !countries.contains(&country.as_str()) {
            countries.push(country);
        }
        if !sectors.contains(&sector.as_str()) {
            sectors.push(sector);
        }
    }

    countries
        .iter()
        .flat_map(|c| sectors.iter().map(move |s| format!("{}{}{}", c, separator, s)))
        .collect()
}

// ---
// Technosphere and biosphere
// ---

/// Convert raw coefficients `A` into the technosphere layout `T = -(I - A)`
/// with the diagonal negated back, so production sits positive on the
/// diagonal and consumption positive off it. Any negative residue is fatal.
pub fn form_tech_matrix(raw_tech: &Array2<f64>) -> AssemblyResult<Array2<f64>> {
    let (n_rows, n_cols) = raw_tech.dim();
    if n_rows != n_cols {
        return Err(AssemblyError::dimension("raw technosphere columns (square)", n_rows, n_cols));
    }
    if let Some(((row, col), &value)) = raw_tech.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(AssemblyError::NonFiniteCoefficient { row, col, value });
    }

    let identity = Array2::<f64>::eye(n_rows);
    let mut tech_matrix = -(&identity - raw_tech);
    let diagonal = tech_matrix.diag().to_owned();
    tech_matrix.diag_mut().assign(&(-diagonal));

    let mut negatives = tech_matrix.indexed_iter().filter(|(_, v)| **v < 0.0);
    if let Some(((row, col), &value)) = negatives.next() {
        let count = 1 + negatives.count();
        return Err(AssemblyError::NegativeTechnosphere { count, row, col, value });
    }

    info!(size = n_rows, "formed technosphere matrix");
    Ok(tech_matrix)
}

/// Background emission table: one row per stressor, one column per background activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledMatrix {
    rows: OrderedNames,
    data: Array2<f64>,
}

impl LabeledMatrix {
    pub fn new(rows: OrderedNames, data: Array2<f64>) -> AssemblyResult<Self> {
        if rows.len() != data.nrows() {
            return Err(AssemblyError::dimension("labeled matrix rows", data.nrows(), rows.len()));
        }
        Ok(Self { rows, data })
    }

    pub fn rows(&self) -> &OrderedNames {
        &self.rows
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

/// Select the emissions used for the assessment, in exactly the order given.
/// That order fixes the biosphere rows and the characterization diagonal.
pub fn form_bio_matrix(bio_table: &LabeledMatrix, emissions: &OrderedNames) -> AssemblyResult<Array2<f64>> {
    let indices = emissions
        .iter()
        .map(|name| bio_table.rows.index_of(name))
        .collect::<AssemblyResult<Vec<usize>>>()?;

    let bio_matrix = bio_table.data.select(Axis(0), &indices);
    info!(emissions = bio_matrix.nrows(), activities = bio_matrix.ncols(), "formed biosphere matrix");
    Ok(bio_matrix)
}

// ---
// Characterization
// ---

/// One row of the emission taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyRecord {
    /// Background emission name, joins to the biosphere rows
    #[serde(rename = "exiobase name", alias = "emission")]
    pub emission: String,
    /// Reference flow name in the external taxonomy
    #[serde(rename = "ecoinvent name", alias = "name")]
    pub name: String,
    #[serde(rename = "brightway code", alias = "code")]
    pub code: String,
}

/// Reorder taxonomy records to the caller's emission order.
pub fn reindex_taxonomy(taxonomy: &[TaxonomyRecord], emissions: &OrderedNames) -> AssemblyResult<Vec<TaxonomyRecord>> {
    let by_emission: HashMap<&str, &TaxonomyRecord> =
        taxonomy.iter().rev().map(|r| (r.emission.as_str(), r)).collect();

    emissions
        .iter()
        .map(|name| {
            by_emission.get(name).map(|r| (*r).clone()).ok_or_else(|| AssemblyError::UnknownName {
                kind: emissions.kind(),
                name: name.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfEntry {
    pub emission: String,
    pub name: String,
    pub code: String,
    /// `None` when the code did not resolve against the method
    pub value: Option<f64>,
}

/// Characterization factors joined to the emission order, before fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfResolution {
    entries: Vec<CfEntry>,
    expected: usize,
}

impl CfResolution {
    pub fn entries(&self) -> &[CfEntry] {
        &self.entries
    }

    pub fn missing_codes(&self) -> Vec<&str> {
        self.entries.iter().filter(|e| e.value.is_none()).map(|e| e.code.as_str()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.value.is_some())
    }

    /// Build the diagonal characterization matrix. Unresolved entries whose
    /// reference name contains `co2_marker` fall back to `1.0`; any other
    /// unresolved entry fails the build.
    pub fn finalize(&self, co2_marker: &str) -> AssemblyResult<Array2<f64>> {
        let mut values = Vec::with_capacity(self.entries.len());
        let mut unresolved = Vec::new();

        for entry in &self.entries {
            match entry.value {
                Some(value) => values.push(value),
                None if entry.name.contains(co2_marker) => {
                    warn!(code = %entry.code, name = %entry.name, "characterization factor missing, using CO2 fallback of 1.0");
                    values.push(1.0);
                }
                None => unresolved.push(entry.code.clone()),
            }
        }

        if !unresolved.is_empty() {
            return Err(AssemblyError::MissingCharacterization { codes: unresolved });
        }
        if values.len() != self.expected {
            return Err(AssemblyError::dimension("characterization diagonal", self.expected, values.len()));
        }

        Ok(Array2::from_diag(&Array1::from(values)))
    }
}

/// External collaborators needed to resolve characterization factors.
pub struct CharacterizationSource<'r> {
    pub methods: &'r dyn MethodRegistry,
    pub activities: &'r dyn ActivityRegistry,
    /// Biosphere database the taxonomy codes belong to
    pub biosphere_database: &'r str,
}

impl<'r> CharacterizationSource<'r> {
    /// Resolve one characterization factor per emission, in emission order.
    pub fn form_cf_matrix(
        &self,
        taxonomy: &[TaxonomyRecord],
        method: &MethodId,
        emissions: &OrderedNames,
    ) -> AssemblyResult<CfResolution> {
        let ordered = reindex_taxonomy(taxonomy, emissions)?;
        let records = self.methods.load(method)?;
        debug!(method = %method, scheme = records.scheme_name(), records = records.len(), "loaded method");

        let entries = match &records {
            MethodRecords::ListKeyed(factors) => {
                let mut by_code: HashMap<&str, f64> = HashMap::with_capacity(factors.len());
                for f in factors {
                    by_code.entry(f.code.as_str()).or_insert(f.value);
                }
                ordered
                    .into_iter()
                    .map(|r| {
                        let value = by_code.get(r.code.as_str()).copied();
                        CfEntry { emission: r.emission, name: r.name, code: r.code, value }
                    })
                    .collect::<Vec<_>>()
            }
            MethodRecords::IntKeyed(factors) => {
                let mut by_id: HashMap<i64, f64> = HashMap::with_capacity(factors.len());
                for f in factors {
                    by_id.entry(f.id).or_insert(f.value);
                }
                let mut entries = Vec::with_capacity(ordered.len());
                for r in ordered {
                    let id = self.activities.resolve_id(self.biosphere_database, &r.code)?;
                    let value = id.and_then(|id| by_id.get(&id).copied());
                    entries.push(CfEntry { emission: r.emission, name: r.name, code: r.code, value });
                }
                entries
            }
        };

        let resolution = CfResolution { entries, expected: emissions.len() };
        let missing = resolution.missing_codes();
        if !missing.is_empty() {
            warn!(?missing, "characterization factor data incomplete");
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lca_registry::{InMemoryActivityRegistry, InMemoryMethodRegistry, RawFactorKey};
    use approx::assert_relative_eq;
    use ndarray::array;
    use proptest::prelude::*;

    const DB: &str = "ecoinvent-3.11-biosphere";

    fn taxonomy() -> Vec<TaxonomyRecord> {
        vec![
            TaxonomyRecord {
                emission: "CH4 - agriculture - air".into(),
                name: "Methane, non-fossil".into(),
                code: "da1157e2".into(),
            },
            TaxonomyRecord {
                emission: "CO2 - combustion - air".into(),
                name: "Carbon dioxide, fossil".into(),
                code: "349b29d1".into(),
            },
            TaxonomyRecord {
                emission: "N2O - agriculture - air".into(),
                name: "Dinitrogen monoxide".into(),
                code: "afd6d670".into(),
            },
        ]
    }

    fn emissions() -> OrderedNames {
        OrderedNames::emissions(vec!["CO2 - combustion - air", "CH4 - agriculture - air", "N2O - agriculture - air"])
            .unwrap()
    }

    fn list_keyed(codes: &[(&str, f64)]) -> InMemoryMethodRegistry {
        let mut methods = InMemoryMethodRegistry::new();
        let raw = codes
            .iter()
            .map(|(c, v)| (RawFactorKey::Pair("biosphere3".into(), c.to_string()), *v))
            .collect();
        methods.insert_raw(MethodId::ipcc_2013_gwp100(), raw).unwrap();
        methods
    }

    #[test]
    fn test_tech_matrix_layout() {
        let raw = array![[0.1, 0.2], [0.3, 0.0]];
        let tech = form_tech_matrix(&raw).unwrap();

        assert_relative_eq!(tech[[0, 0]], 0.9, epsilon = 1e-12);
        assert_relative_eq!(tech[[1, 1]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(tech[[0, 1]], 0.2, epsilon = 1e-12);
        assert_relative_eq!(tech[[1, 0]], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_residue_is_fatal() {
        let raw = array![[0.1, -0.2], [0.3, 0.0]];
        match form_tech_matrix(&raw) {
            Err(AssemblyError::NegativeTechnosphere { count, row, col, .. }) => {
                assert_eq!(count, 1);
                assert_eq!((row, col), (0, 1));
            }
            other => panic!("expected negative technosphere error, got {:?}", other),
        }

        let raw = array![[1.5, 0.0], [0.0, 0.0]];
        assert!(matches!(form_tech_matrix(&raw), Err(AssemblyError::NegativeTechnosphere { .. })));
    }

    #[test]
    fn test_tech_matrix_rejects_bad_shapes_and_nan() {
        let raw = Array2::<f64>::zeros((2, 3));
        assert!(matches!(form_tech_matrix(&raw), Err(AssemblyError::DimensionMismatch { .. })));

        let raw = array![[0.0, f64::NAN], [0.0, 0.0]];
        assert!(matches!(form_tech_matrix(&raw), Err(AssemblyError::NonFiniteCoefficient { row: 0, col: 1, .. })));
    }

    proptest! {
        #[test]
        fn prop_tech_matrix_non_negative(
            (n, cells) in (1usize..6).prop_flat_map(|n| (Just(n), prop::collection::vec(0.0f64..0.99, n * n)))
        ) {
            let raw = Array2::from_shape_vec((n, n), cells).unwrap();
            let tech = form_tech_matrix(&raw).unwrap();
            prop_assert!(tech.iter().all(|v| *v >= 0.0));
            for i in 0..n {
                prop_assert!((tech[[i, i]] - (1.0 - raw[[i, i]])).abs() < 1e-12);
            }
        }

        #[test]
        fn prop_bio_rows_follow_requested_order(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
            let all: Vec<String> = (0..6).map(|i| format!("stressor {}", i)).collect();
            let data = Array2::from_shape_fn((6, 3), |(i, j)| (i * 10 + j) as f64);
            let table = LabeledMatrix::new(OrderedNames::emissions(all.clone()).unwrap(), data).unwrap();

            let requested = OrderedNames::emissions(order.iter().map(|i| all[*i].clone())).unwrap();
            let bio = form_bio_matrix(&table, &requested).unwrap();

            for (row, original) in order.iter().enumerate() {
                prop_assert_eq!(bio.row(row), table.data().row(*original));
            }
        }
    }

    #[test]
    fn test_bio_matrix_unknown_emission() {
        let table = LabeledMatrix::new(OrderedNames::emissions(vec!["SF6 - air"]).unwrap(), array![[1.0, 2.0]]).unwrap();
        let requested = OrderedNames::emissions(vec!["CO2 - combustion - air"]).unwrap();
        assert!(matches!(form_bio_matrix(&table, &requested), Err(AssemblyError::UnknownName { .. })));
    }

    #[test]
    fn test_cf_list_keyed_complete() {
        let methods = list_keyed(&[("349b29d1", 1.0), ("da1157e2", 27.0), ("afd6d670", 273.0), ("ffff", 5.0)]);
        let activities = InMemoryActivityRegistry::new();
        let source = CharacterizationSource { methods: &methods, activities: &activities, biosphere_database: DB };

        let resolution = source.form_cf_matrix(&taxonomy(), &MethodId::ipcc_2013_gwp100(), &emissions()).unwrap();
        assert!(resolution.is_complete());
        assert_eq!(resolution.entries()[0].code, "349b29d1");

        let cf = resolution.finalize("Carbon dioxide").unwrap();
        assert_eq!(cf.dim(), (3, 3));
        assert_eq!(cf.diag().to_vec(), vec![1.0, 27.0, 273.0]);
        assert_eq!(cf.iter().filter(|v| **v != 0.0).count(), 3);
    }

    #[test]
    fn test_cf_int_keyed_through_activity_registry() {
        let mut methods = InMemoryMethodRegistry::new();
        methods
            .insert_raw(
                MethodId::ipcc_2013_gwp100(),
                vec![(RawFactorKey::Id(11), 1.0), (RawFactorKey::Id(12), 27.0), (RawFactorKey::Id(13), 273.0)],
            )
            .unwrap();
        let mut activities = InMemoryActivityRegistry::new();
        activities.insert(DB, "349b29d1", 11);
        activities.insert(DB, "da1157e2", 12);
        activities.insert(DB, "afd6d670", 13);
        let source = CharacterizationSource { methods: &methods, activities: &activities, biosphere_database: DB };

        let cf = source
            .form_cf_matrix(&taxonomy(), &MethodId::ipcc_2013_gwp100(), &emissions())
            .unwrap()
            .finalize("Carbon dioxide")
            .unwrap();
        assert_eq!(cf.diag().to_vec(), vec![1.0, 27.0, 273.0]);
    }

    #[test]
    fn test_cf_co2_fallback_applies() {
        let methods = list_keyed(&[("da1157e2", 27.0), ("afd6d670", 273.0)]);
        let activities = InMemoryActivityRegistry::new();
        let source = CharacterizationSource { methods: &methods, activities: &activities, biosphere_database: DB };

        let resolution = source.form_cf_matrix(&taxonomy(), &MethodId::ipcc_2013_gwp100(), &emissions()).unwrap();
        assert_eq!(resolution.missing_codes(), vec!["349b29d1"]);
        let cf = resolution.finalize("Carbon dioxide").unwrap();
        assert_eq!(cf[[0, 0]], 1.0);
    }

    #[test]
    fn test_cf_missing_non_co2_fails() {
        let methods = list_keyed(&[("349b29d1", 1.0), ("afd6d670", 273.0)]);
        let activities = InMemoryActivityRegistry::new();
        let source = CharacterizationSource { methods: &methods, activities: &activities, biosphere_database: DB };

        let resolution = source.form_cf_matrix(&taxonomy(), &MethodId::ipcc_2013_gwp100(), &emissions()).unwrap();
        match resolution.finalize("Carbon dioxide") {
            Err(AssemblyError::MissingCharacterization { codes }) => assert_eq!(codes, vec!["da1157e2".to_string()]),
            other => panic!("expected missing characterization, got {:?}", other),
        }
    }

    #[test]
    fn test_cf_unregistered_int_code_is_unresolved() {
        let mut methods = InMemoryMethodRegistry::new();
        methods
            .insert_raw(MethodId::ipcc_2013_gwp100(), vec![(RawFactorKey::Id(12), 27.0), (RawFactorKey::Id(13), 273.0)])
            .unwrap();
        let mut activities = InMemoryActivityRegistry::new();
        activities.insert(DB, "da1157e2", 12);
        activities.insert(DB, "afd6d670", 13);
        let source = CharacterizationSource { methods: &methods, activities: &activities, biosphere_database: DB };

        let resolution = source.form_cf_matrix(&taxonomy(), &MethodId::ipcc_2013_gwp100(), &emissions()).unwrap();
        assert_eq!(resolution.missing_codes(), vec!["349b29d1"]);
        assert_eq!(resolution.finalize("Carbon dioxide").unwrap().diag().to_vec(), vec![1.0, 27.0, 273.0]);
    }

    #[test]
    fn test_taxonomy_must_cover_emissions() {
        let requested = OrderedNames::emissions(vec!["SF6 - air"]).unwrap();
        assert!(matches!(reindex_taxonomy(&taxonomy(), &requested), Err(AssemblyError::UnknownName { .. })));
    }

    #[test]
    fn test_split_grid_skips_header_rows() {
        let cell = |s: &str| s.to_string();
        let grid = vec![
            vec![cell("region"), cell(""), cell("DE"), cell("DE")],
            vec![cell("sector"), cell(""), cell("Agriculture"), cell("Services")],
            vec![cell("unit"), cell(""), cell("M.EUR"), cell("M.EUR")],
            vec![cell("DE"), cell("Agriculture"), cell("0.1"), cell("0.02")],
            vec![cell("DE"), cell("Services"), cell("0.05"), cell("0.2")],
        ];
        let split = split_labeled_grid(&grid, 3, 2).unwrap();
        assert_eq!(split.row_labels[1], ("DE".to_string(), "Services".to_string()));
        assert_eq!(split.coefficients, array![[0.1, 0.02], [0.05, 0.2]]);

        let mut bad = grid.clone();
        bad[4][3] = cell("n/a");
        assert!(matches!(split_labeled_grid(&bad, 3, 2), Err(AssemblyError::UnparseableCell { row: 4, col: 3, .. })));
    }

    #[test]
    fn test_background_activities_cross_product() {
        let labels = vec![
            ("DE".to_string(), "Agriculture".to_string()),
            ("DE".to_string(), "Services".to_string()),
            ("FR".to_string(), "Agriculture".to_string()),
            ("FR".to_string(), "Services".to_string()),
        ];
        assert_eq!(
            background_activities(&labels, '-'),
            vec!["DE-Agriculture", "DE-Services", "FR-Agriculture", "FR-Services"]
        );
    }
}
