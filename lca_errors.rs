// Error taxonomy for matrix assembly
//
// Three families of failure:
//   - data integrity: the input tables cannot produce a valid system
//     (negative technosphere residue, unresolved characterization codes,
//     shape mismatches). Fatal.
//   - caller contract: a name referenced by foreground or uncertainty input
//     is not part of the ordered name list that sized the matrices. Fatal.
//   - collaborator: the method or activity registry could not answer.
//
// Partial resolutions (CO2 fallback, pedigree misses) are not errors; they
// are logged with `tracing::warn!` at the point of fallback.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which ordered name list a lookup was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameKind {
    Activity,
    Emission,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::Activity => write!(f, "activity"),
            NameKind::Emission => write!(f, "emission"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Transformation failed, negative values remain: {count} entries, first at ({row}, {col}) = {value}")]
    NegativeTechnosphere { count: usize, row: usize, col: usize, value: f64 },

    #[error("Non-finite coefficient at ({row}, {col}): {value}")]
    NonFiniteCoefficient { row: usize, col: usize, value: f64 },

    #[error("Characterization factor data incomplete, missing: {codes:?}")]
    MissingCharacterization { codes: Vec<String> },

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch { context: String, expected: usize, actual: usize },

    #[error("{kind} '{name}' is not in the ordered name list")]
    UnknownName { kind: NameKind, name: String },

    #[error("Duplicate {kind} '{name}' in ordered name list")]
    DuplicateName { kind: NameKind, name: String },

    #[error("Method {0} returned no characterization records")]
    EmptyMethod(String),

    #[error("Method {0} mixes list-keyed and integer-keyed records")]
    MixedMethodRecords(String),

    #[error("Registry lookup failed: {0}")]
    Registry(String),

    #[error("Unknown distribution kind {0}")]
    UnknownDistribution(u8),

    #[error("Unparseable coefficient '{cell}' at table row {row}, column {col}")]
    UnparseableCell { row: usize, col: usize, cell: String },

    #[error("Technosphere matrix is singular, reference solve failed")]
    SingularTechnosphere,

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Datapackage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Datapackage encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl AssemblyError {
    pub(crate) fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        AssemblyError::DimensionMismatch { context: context.into(), expected, actual }
    }
}

pub type AssemblyResult<T> = std::result::Result<T, AssemblyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_message_names_transformation() {
        let err = AssemblyError::NegativeTechnosphere { count: 2, row: 0, col: 1, value: -0.5 };
        let msg = err.to_string();
        assert!(msg.starts_with("Transformation failed, negative values remain"));
        assert!(msg.contains("(0, 1)"));
    }

    #[test]
    fn test_missing_codes_are_listed() {
        let err = AssemblyError::MissingCharacterization { codes: vec!["abc".into(), "def".into()] };
        assert!(err.to_string().contains("\"abc\""));
        assert!(err.to_string().contains("\"def\""));
    }

    #[test]
    fn test_unknown_name_message() {
        let err = AssemblyError::UnknownName { kind: NameKind::Emission, name: "SF6 - air".into() };
        assert_eq!(err.to_string(), "emission 'SF6 - air' is not in the ordered name list");
    }
}
