// Run configuration
//
// Defaults reproduce the aggregated EXIOBASE greenhouse-gas case study:
// IPCC 2013 GWP100 over 20 GHG stressors, tab tables with 3 header rows
// and 2 label columns, "country-sector" activity names.

use serde::{Deserialize, Serialize};

use crate::lca_errors::AssemblyResult;
use crate::lca_registry::MethodId;
use crate::lca_uncertainty::{AggregationStrategy, UncertaintyScenario};

pub const HEADER_ROWS_DEFAULT: usize = 3;
pub const LABEL_COLUMNS_DEFAULT: usize = 2;
pub const ACTIVITY_SEPARATOR_DEFAULT: char = '-';
pub const CO2_MARKER_DEFAULT: &str = "Carbon dioxide";
pub const BIOSPHERE_DATABASE_DEFAULT: &str = "ecoinvent-3.11-biosphere";

pub const UNIFORM_SPREADS: [f64; 3] = [0.1, 0.2, 0.3];
pub const LOGNORMAL_GSDS: [f64; 3] = [1.106, 1.225, 1.363];

pub const GHG_EMISSIONS: [&str; 20] = [
    "CO2 - combustion - air",
    "CO2 - non combustion - Cement production - air",
    "CO2 - non combustion - Lime production - air",
    "CO2 - waste - biogenic - air",
    "CO2 - waste - fossil - air",
    "CO2 - agriculture - peat decay - air",
    "CH4 - agriculture - air",
    "CH4 - waste - air",
    "CH4 - combustion - air",
    "CH4 - non combustion - Extraction/production of (natural) gas - air",
    "CH4 - non combustion - Extraction/production of crude oil - air",
    "CH4 - non combustion - Mining of antracite - air",
    "CH4 - non combustion - Mining of bituminous coal - air",
    "CH4 - non combustion - Mining of coking coal - air",
    "CH4 - non combustion - Mining of lignite (brown coal) - air",
    "CH4 - non combustion - Mining of sub-bituminous coal - air",
    "CH4 - non combustion - Oil refinery - air",
    "N2O - combustion - air",
    "N2O - agriculture - air",
    "SF6 - air",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Characterization
    pub method: MethodId,
    pub emissions: Vec<String>,
    pub biosphere_database: String,
    pub co2_marker: String,

    // Background table layout
    pub header_rows: usize,
    pub label_columns: usize,
    pub activity_separator: char,

    pub uncertainty: UncertaintyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            method: MethodId::ipcc_2013_gwp100(),
            emissions: GHG_EMISSIONS.iter().map(|s| s.to_string()).collect(),
            biosphere_database: BIOSPHERE_DATABASE_DEFAULT.to_string(),
            co2_marker: CO2_MARKER_DEFAULT.to_string(),

            header_rows: HEADER_ROWS_DEFAULT,
            label_columns: LABEL_COLUMNS_DEFAULT,
            activity_separator: ACTIVITY_SEPARATOR_DEFAULT,

            uncertainty: UncertaintyConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> AssemblyResult<Self> {
        Ok(toml::from_str(source)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub scenario: UncertaintyScenario,
    pub foreground_strategy: AggregationStrategy,
    pub background_strategy: AggregationStrategy,

    // Scenario grid
    pub uniform_spreads: Vec<f64>,
    pub lognormal_gsds: Vec<f64>,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        UncertaintyConfig {
            scenario: UncertaintyScenario::Static,
            foreground_strategy: AggregationStrategy::Itemwise,
            background_strategy: AggregationStrategy::Columnwise,

            uniform_spreads: UNIFORM_SPREADS.to_vec(),
            lognormal_gsds: LOGNORMAL_GSDS.to_vec(),
        }
    }
}

impl UncertaintyConfig {
    /// static, each uniform spread, each lognormal GSD, pedigree.
    pub fn scenario_grid(&self) -> Vec<UncertaintyScenario> {
        let mut grid = vec![UncertaintyScenario::Static];
        grid.extend(self.uniform_spreads.iter().map(|&spread| UncertaintyScenario::Uniform { spread }));
        grid.extend(self.lognormal_gsds.iter().map(|&gsd| UncertaintyScenario::LogNormal { gsd }));
        grid.push(UncertaintyScenario::Pedigree);
        grid
    }

    /// Metadata-driven scenario using the configured strategies.
    pub fn specified(&self) -> UncertaintyScenario {
        UncertaintyScenario::Specified {
            foreground: self.foreground_strategy,
            background: self.background_strategy,
        }
    }
}
