// Foreground extension of background matrices
//
// Two input shapes are supported:
//
// 1. SINGLE COLUMN: one new activity given as (exchange name, amount) pairs.
//    The activity lands at index 0, consumes background activities through
//    its column and is consumed by nothing (zero first row).
//
// 2. LONG FORMAT: a flat exchange list
//      Activity name | Exchange name | Exchange type | Exchange amount
//    with Exchange type in {production, technosphere, biosphere}. Several
//    foreground activities may consume each other.
//
// In both cases the extended index space is [foreground | background], as
// described by the returned `ActivityIndexMap`.

use ndarray::{concatenate, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lca_activity_index::{ActivityIndexMap, OrderedNames};
use crate::lca_errors::{AssemblyError, AssemblyResult, NameKind};
use crate::lca_uncertainty::ExchangeOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Production,
    Technosphere,
    Biosphere,
}

/// One row of a long-format foreground table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForegroundExchange {
    #[serde(rename = "Activity name")]
    pub activity: String,
    #[serde(rename = "Exchange name")]
    pub exchange: String,
    #[serde(rename = "Exchange type")]
    pub exchange_type: ExchangeType,
    #[serde(rename = "Exchange amount", alias = "Amount")]
    pub amount: f64,
    #[serde(rename = "Exchange flip", default)]
    pub flip: Option<bool>,
    #[serde(rename = "Exchange negative", default)]
    pub negative: Option<bool>,
}

impl ForegroundExchange {
    pub fn new(
        activity: impl Into<String>,
        exchange: impl Into<String>,
        exchange_type: ExchangeType,
        amount: f64,
    ) -> Self {
        Self {
            activity: activity.into(),
            exchange: exchange.into(),
            exchange_type,
            amount,
            flip: None,
            negative: None,
        }
    }

    /// Sign handling declared on this row, if any.
    pub fn to_override(&self) -> Option<ExchangeOverride> {
        if self.flip.is_none() && self.negative.is_none() {
            return None;
        }
        Some(ExchangeOverride {
            activity: self.activity.clone(),
            exchange: self.exchange.clone(),
            flip: self.flip,
            negative: self.negative,
        })
    }
}

/// One `(name, amount)` pair of a single-column foreground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnEntry {
    #[serde(rename = "Exchange name", alias = "name")]
    pub name: String,
    #[serde(rename = "Exchange amount", alias = "Amount")]
    pub amount: f64,
}

impl ColumnEntry {
    pub fn new(name: impl Into<String>, amount: f64) -> Self {
        Self { name: name.into(), amount }
    }
}

fn nan_to_zero(amount: f64) -> f64 {
    if amount.is_nan() {
        0.0
    } else {
        amount
    }
}

// ---
// Single column
// ---

/// `[[1, 0], [column, original]]`: the new activity takes index 0 with unit
/// production. `index` must hold exactly one foreground activity followed by
/// the activities of `original`.
pub fn extend_technosphere_column(
    original: &Array2<f64>,
    entries: &[ColumnEntry],
    index: &ActivityIndexMap,
) -> AssemblyResult<Array2<f64>> {
    let (n_rows, n_cols) = original.dim();
    if n_rows != n_cols {
        return Err(AssemblyError::dimension("technosphere columns (square)", n_rows, n_cols));
    }
    if index.n_foreground() != 1 {
        return Err(AssemblyError::dimension("single-column foreground activities", 1, index.n_foreground()));
    }
    if index.len() != n_cols + 1 {
        return Err(AssemblyError::dimension("extended activity count", n_cols + 1, index.len()));
    }

    let mut column = Array1::<f64>::zeros(n_rows + 1);
    for entry in entries {
        column[index.index_of(&entry.name)?] = nan_to_zero(entry.amount);
    }
    column[0] = 1.0;

    let zero_row = Array2::<f64>::zeros((1, n_cols));
    let lower = concatenate(Axis(0), &[zero_row.view(), original.view()])?;
    let extended = concatenate(Axis(1), &[column.view().insert_axis(Axis(1)), lower.view()])?;

    info!(before = n_cols, after = extended.ncols(), "extended technosphere with one column");
    Ok(extended)
}

/// `[column | original]`, with the column placed by emission name.
pub fn extend_biosphere_column(
    original: &Array2<f64>,
    entries: &[ColumnEntry],
    emissions: &OrderedNames,
) -> AssemblyResult<Array2<f64>> {
    if original.nrows() != emissions.len() {
        return Err(AssemblyError::dimension("biosphere rows", emissions.len(), original.nrows()));
    }

    let mut column = Array1::<f64>::zeros(original.nrows());
    for entry in entries {
        column[emissions.index_of(&entry.name)?] = nan_to_zero(entry.amount);
    }

    let extended = concatenate(Axis(1), &[column.view().insert_axis(Axis(1)), original.view()])?;
    info!(before = original.ncols(), after = extended.ncols(), "extended biosphere with one column");
    Ok(extended)
}

// ---
// Long format
// ---

/// Extended matrices plus the index spaces that size them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedSystem {
    pub technosphere: Array2<f64>,
    pub biosphere: Array2<f64>,
    pub activities: ActivityIndexMap,
    pub emissions: OrderedNames,
}

/// Foreground activity names in first-appearance order.
pub fn foreground_activities(exchanges: &[ForegroundExchange]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for exchange in exchanges {
        if !names.contains(&exchange.activity) {
            names.push(exchange.activity.clone());
        }
    }
    names
}

pub fn extend_long_format(
    background_tech: &Array2<f64>,
    background_bio: &Array2<f64>,
    exchanges: &[ForegroundExchange],
    background: &OrderedNames,
    emissions: &OrderedNames,
) -> AssemblyResult<ExtendedSystem> {
    let n_bg = background.len();
    let n_em = emissions.len();
    if background_tech.dim() != (n_bg, n_bg) {
        return Err(AssemblyError::dimension("background technosphere", n_bg, background_tech.nrows()));
    }
    if background_bio.dim() != (n_em, n_bg) {
        return Err(AssemblyError::dimension("background biosphere rows", n_em, background_bio.nrows()));
    }

    let foreground = foreground_activities(exchanges);
    let n_fg = foreground.len();
    let activities = ActivityIndexMap::new(foreground, background.iter())?;

    let mut fg_fg = Array2::<f64>::zeros((n_fg, n_fg));
    let fg_bg = Array2::<f64>::zeros((n_fg, n_bg));
    let mut bg_fg = Array2::<f64>::zeros((n_bg, n_fg));
    let mut bio_fg = Array2::<f64>::zeros((n_em, n_fg));
    let mut has_production = vec![false; n_fg];

    for exchange in exchanges {
        let col = activities.index_of(&exchange.activity)?;
        let amount = nan_to_zero(exchange.amount);
        match exchange.exchange_type {
            ExchangeType::Production => has_production[col] = true,
            ExchangeType::Technosphere => match activities.position(&exchange.exchange) {
                Some(row) if row < n_fg => fg_fg[[row, col]] += amount,
                Some(row) => bg_fg[[row - n_fg, col]] += amount,
                None => {
                    return Err(AssemblyError::UnknownName {
                        kind: NameKind::Activity,
                        name: exchange.exchange.clone(),
                    })
                }
            },
            ExchangeType::Biosphere => bio_fg[[emissions.index_of(&exchange.exchange)?, col]] += amount,
        }
    }

    for (i, produced) in has_production.iter().enumerate() {
        if !produced {
            warn!(activity = activities.name(i).unwrap_or_default(), "no production exchange, assuming unit production");
        }
        fg_fg[[i, i]] = 1.0;
    }

    let upper = concatenate(Axis(1), &[fg_fg.view(), fg_bg.view()])?;
    let lower = concatenate(Axis(1), &[bg_fg.view(), background_tech.view()])?;
    let technosphere = concatenate(Axis(0), &[upper.view(), lower.view()])?;
    let biosphere = concatenate(Axis(1), &[bio_fg.view(), background_bio.view()])?;

    info!(
        foreground = n_fg,
        background = n_bg,
        emissions = n_em,
        exchanges = exchanges.len(),
        "extended system from long-format foreground"
    );
    Ok(ExtendedSystem { technosphere, biosphere, activities, emissions: emissions.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};
    use proptest::prelude::*;

    fn background() -> OrderedNames {
        OrderedNames::activities(vec!["DE-Agriculture", "DE-Services"]).unwrap()
    }

    fn emissions() -> OrderedNames {
        OrderedNames::emissions(vec!["CO2 - combustion - air", "CH4 - agriculture - air"]).unwrap()
    }

    #[test]
    fn test_single_column_layout() {
        let original = array![[1.0, 0.2], [0.1, 1.0]];
        let index = ActivityIndexMap::new(vec!["Bottle"], background().iter()).unwrap();
        let entries = vec![ColumnEntry::new("DE-Services", 0.7), ColumnEntry::new("DE-Agriculture", f64::NAN)];
        let extended = extend_technosphere_column(&original, &entries, &index).unwrap();

        assert_eq!(extended, array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.2], [0.7, 0.1, 1.0]]);
    }

    proptest! {
        #[test]
        fn prop_single_column_keeps_original(
            values in proptest::collection::vec(0.0f64..5.0, 9),
            amounts in proptest::collection::vec(0.0f64..5.0, 3),
        ) {
            let original = Array2::from_shape_vec((3, 3), values).unwrap();
            let index = ActivityIndexMap::new(vec!["Bottle"], vec!["A-x", "B-x", "C-x"]).unwrap();
            let entries: Vec<ColumnEntry> = ["A-x", "B-x", "C-x"]
                .iter()
                .zip(&amounts)
                .map(|(n, a)| ColumnEntry::new(*n, *a))
                .collect();
            let extended = extend_technosphere_column(&original, &entries, &index).unwrap();

            prop_assert_eq!(extended.dim(), (4, 4));
            prop_assert_eq!(extended.slice(s![1.., 1..]), original.view());
            prop_assert_eq!(extended[[0, 0]], 1.0);
            prop_assert!(extended.slice(s![0, 1..]).iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_single_column_contract() {
        let original = array![[1.0, 0.2], [0.1, 1.0]];
        let bg_only = ActivityIndexMap::background_only(background().iter()).unwrap();
        assert!(matches!(
            extend_technosphere_column(&original, &[], &bg_only),
            Err(AssemblyError::DimensionMismatch { .. })
        ));

        let index = ActivityIndexMap::new(vec!["Bottle"], background().iter()).unwrap();
        let unknown = vec![ColumnEntry::new("XX-Mining", 1.0)];
        assert!(matches!(
            extend_technosphere_column(&original, &unknown, &index),
            Err(AssemblyError::UnknownName { .. })
        ));
    }

    #[test]
    fn test_biosphere_column_by_emission_name() {
        let original = array![[0.5, 0.1], [0.0, 2.0]];
        let entries = vec![ColumnEntry::new("CH4 - agriculture - air", 0.03)];
        let extended = extend_biosphere_column(&original, &entries, &emissions()).unwrap();
        assert_eq!(extended, array![[0.0, 0.5, 0.1], [0.03, 0.0, 2.0]]);
    }

    #[test]
    fn test_long_format_quadrants() {
        let bg_tech = array![[1.0, 0.2], [0.1, 1.0]];
        let bg_bio = array![[0.5, 0.1], [0.0, 2.0]];
        let exchanges = vec![
            ForegroundExchange::new("Bottle", "Bottle", ExchangeType::Production, 1.0),
            ForegroundExchange::new("Bottle", "Resin", ExchangeType::Technosphere, 0.4),
            ForegroundExchange::new("Bottle", "DE-Services", ExchangeType::Technosphere, 0.3),
            ForegroundExchange::new("Bottle", "DE-Services", ExchangeType::Technosphere, 0.2),
            ForegroundExchange::new("Bottle", "CO2 - combustion - air", ExchangeType::Biosphere, 0.05),
            ForegroundExchange::new("Resin", "DE-Agriculture", ExchangeType::Technosphere, 2.0),
            ForegroundExchange::new("Resin", "Resin", ExchangeType::Production, 1.0),
        ];
        let system = extend_long_format(&bg_tech, &bg_bio, &exchanges, &background(), &emissions()).unwrap();

        assert_eq!(system.activities.foreground(), &["Bottle".to_string(), "Resin".to_string()]);
        assert_eq!(system.activities.index_of("DE-Agriculture").unwrap(), 2);
        assert_eq!(
            system.technosphere,
            array![
                [1.0, 0.0, 0.0, 0.0],
                [0.4, 1.0, 0.0, 0.0],
                [0.0, 2.0, 1.0, 0.2],
                [0.5, 0.0, 0.1, 1.0],
            ]
        );
        assert_eq!(system.biosphere, array![[0.05, 0.0, 0.5, 0.1], [0.0, 0.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_long_format_missing_production_still_unit() {
        let bg_tech = array![[1.0, 0.2], [0.1, 1.0]];
        let bg_bio = array![[0.5, 0.1], [0.0, 2.0]];
        let exchanges = vec![ForegroundExchange::new("Bottle", "DE-Agriculture", ExchangeType::Technosphere, 0.3)];
        let system = extend_long_format(&bg_tech, &bg_bio, &exchanges, &background(), &emissions()).unwrap();
        assert_eq!(system.technosphere[[0, 0]], 1.0);
        assert_eq!(system.technosphere[[1, 0]], 0.3);
    }

    #[test]
    fn test_long_format_unknown_exchange() {
        let bg_tech = array![[1.0, 0.2], [0.1, 1.0]];
        let bg_bio = array![[0.5, 0.1], [0.0, 2.0]];
        let exchanges = vec![ForegroundExchange::new("Bottle", "SF6 - air", ExchangeType::Biosphere, 0.3)];
        let err = extend_long_format(&bg_tech, &bg_bio, &exchanges, &background(), &emissions()).unwrap_err();
        assert!(matches!(err, AssemblyError::UnknownName { kind: NameKind::Emission, .. }));
    }

    #[test]
    fn test_override_only_when_declared() {
        let mut exchange = ForegroundExchange::new("Bottle", "DE-Services", ExchangeType::Technosphere, 0.3);
        assert!(exchange.to_override().is_none());
        exchange.flip = Some(false);
        let o = exchange.to_override().unwrap();
        assert_eq!(o.flip, Some(false));
        assert_eq!(o.negative, None);
    }
}
