// Sparse coordinate packaging for the external LCA solver
//
// The solver addresses technosphere, biosphere and characterization data
// through one index domain:
//
//   technosphere rows/cols      [0 .. offset)
//   biosphere rows              [offset .. offset + n_emissions)
//   biosphere cols              activity indices, unshifted
//   characterization rows/cols  [offset .. offset + n_emissions)
//
// `CoordinateMatrix` keeps LOCAL coordinates (what the uncertainty engine and
// the multifunctionality overrides work on). Shifting into the shared domain
// happens once, in `prepare_datapackage`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::lca_errors::{AssemblyError, AssemblyResult};
use crate::lca_uncertainty::UncertaintyRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixKind {
    Technosphere,
    Biosphere,
    Characterization,
}

impl MatrixKind {
    /// Matrix tag expected by the solver's datapackage ingestion.
    pub fn matrix_name(&self) -> &'static str {
        match self {
            MatrixKind::Technosphere => "technosphere_matrix",
            MatrixKind::Biosphere => "biosphere_matrix",
            MatrixKind::Characterization => "characterization_matrix",
        }
    }
}

/// One nonzero cell in local coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub position: usize,
    pub row: usize,
    pub col: usize,
    pub value: f64,
    /// Always `false` outside the technosphere
    pub flip: bool,
}

/// Nonzero triples of one dense matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateMatrix {
    kind: MatrixKind,
    shape: (usize, usize),
    rows: Vec<usize>,
    cols: Vec<usize>,
    data: Vec<f64>,
    flip: Option<Vec<bool>>,
}

impl CoordinateMatrix {
    /// Collect nonzero cells. For the technosphere every off-diagonal cell is
    /// flagged as flipped (consumption, negative in the solve) and every
    /// diagonal cell as unflipped (production).
    pub fn from_dense(kind: MatrixKind, matrix: &Array2<f64>) -> Self {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut data = Vec::new();
        for ((row, col), &value) in matrix.indexed_iter() {
            if value != 0.0 {
                rows.push(row);
                cols.push(col);
                data.push(value);
            }
        }

        let flip = match kind {
            MatrixKind::Technosphere => Some(rows.iter().zip(&cols).map(|(r, c)| r != c).collect()),
            _ => None,
        };

        debug!(matrix = kind.matrix_name(), nonzero = data.len(), "collected coordinates");
        Self { kind, shape: matrix.dim(), rows, cols, data, flip }
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn flip(&self) -> Option<&[bool]> {
        self.flip.as_deref()
    }

    pub fn flip_mut(&mut self) -> Option<&mut [bool]> {
        self.flip.as_deref_mut()
    }

    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.data.len()).map(move |i| Cell {
            position: i,
            row: self.rows[i],
            col: self.cols[i],
            value: self.data[i],
            flip: self.flip.as_ref().map_or(false, |f| f[i]),
        })
    }
}

/// The three matrices in coordinate form plus the shared index offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedMatrices {
    pub technosphere: CoordinateMatrix,
    pub biosphere: CoordinateMatrix,
    pub characterization: CoordinateMatrix,
    /// First index of the emission range in the shared domain, the
    /// technosphere dimension
    pub offset: usize,
}

impl PreparedMatrices {
    pub fn get(&self, kind: MatrixKind) -> &CoordinateMatrix {
        match kind {
            MatrixKind::Technosphere => &self.technosphere,
            MatrixKind::Biosphere => &self.biosphere,
            MatrixKind::Characterization => &self.characterization,
        }
    }
}

pub fn prepare_matrices(
    tech_matrix: &Array2<f64>,
    bio_matrix: &Array2<f64>,
    cf_matrix: &Array2<f64>,
) -> AssemblyResult<PreparedMatrices> {
    let (n_act, n_act_cols) = tech_matrix.dim();
    if n_act != n_act_cols {
        return Err(AssemblyError::dimension("technosphere columns (square)", n_act, n_act_cols));
    }
    if bio_matrix.ncols() != n_act {
        return Err(AssemblyError::dimension("biosphere columns", n_act, bio_matrix.ncols()));
    }
    if cf_matrix.dim() != (bio_matrix.nrows(), bio_matrix.nrows()) {
        return Err(AssemblyError::dimension("characterization rows", bio_matrix.nrows(), cf_matrix.nrows()));
    }

    let technosphere = CoordinateMatrix::from_dense(MatrixKind::Technosphere, tech_matrix);
    let biosphere = CoordinateMatrix::from_dense(MatrixKind::Biosphere, bio_matrix);
    let characterization = CoordinateMatrix::from_dense(MatrixKind::Characterization, cf_matrix);

    // An activity with an empty row and column still owns its index.
    let offset = n_act;

    info!(
        technosphere = technosphere.len(),
        biosphere = biosphere.len(),
        characterization = characterization.len(),
        offset,
        "prepared coordinate matrices"
    );
    Ok(PreparedMatrices { technosphere, biosphere, characterization, offset })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixIndex {
    pub row: usize,
    pub col: usize,
}

/// One persistent vector of the datapackage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixVector {
    pub matrix: MatrixKind,
    pub indices: Vec<MatrixIndex>,
    pub data: Vec<f64>,
    pub flip: Option<Vec<bool>>,
    pub distributions: Option<Vec<UncertaintyRecord>>,
}

impl MatrixVector {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-matrix uncertainty arrays, aligned with the coordinate order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageUncertainty {
    pub technosphere: Vec<UncertaintyRecord>,
    pub biosphere: Vec<UncertaintyRecord>,
    pub characterization: Vec<UncertaintyRecord>,
}

/// Bundle handed to the external solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapackage {
    vectors: Vec<MatrixVector>,
}

pub fn prepare_datapackage(
    prepared: &PreparedMatrices,
    uncertainty: Option<&PackageUncertainty>,
) -> AssemblyResult<Datapackage> {
    let offset = prepared.offset;
    let distributions = |records: Option<&Vec<UncertaintyRecord>>, coords: &CoordinateMatrix| match records {
        Some(records) if records.len() != coords.len() => Err(AssemblyError::dimension(
            format!("{} distributions", coords.kind.matrix_name()),
            coords.len(),
            records.len(),
        )),
        Some(records) => Ok(Some(records.clone())),
        None => Ok(None),
    };

    let tech = &prepared.technosphere;
    let bio = &prepared.biosphere;
    let cf = &prepared.characterization;

    let vectors = vec![
        MatrixVector {
            matrix: MatrixKind::Technosphere,
            indices: tech.cells().map(|c| MatrixIndex { row: c.row, col: c.col }).collect(),
            data: tech.data.clone(),
            flip: tech.flip.clone(),
            distributions: distributions(uncertainty.map(|u| &u.technosphere), tech)?,
        },
        MatrixVector {
            matrix: MatrixKind::Biosphere,
            indices: bio.cells().map(|c| MatrixIndex { row: c.row + offset, col: c.col }).collect(),
            data: bio.data.clone(),
            flip: None,
            distributions: distributions(uncertainty.map(|u| &u.biosphere), bio)?,
        },
        MatrixVector {
            matrix: MatrixKind::Characterization,
            indices: cf.cells().map(|c| MatrixIndex { row: c.row + offset, col: c.col + offset }).collect(),
            data: cf.data.clone(),
            flip: None,
            distributions: distributions(uncertainty.map(|u| &u.characterization), cf)?,
        },
    ];

    Ok(Datapackage { vectors })
}

impl Datapackage {
    pub fn vectors(&self) -> &[MatrixVector] {
        &self.vectors
    }

    pub fn vector(&self, kind: MatrixKind) -> Option<&MatrixVector> {
        self.vectors.iter().find(|v| v.matrix == kind)
    }

    /// Persist as gzip-compressed bincode.
    pub fn write_to(&self, path: &Path) -> AssemblyResult<()> {
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::serialize_into(&mut encoder, self)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> AssemblyResult<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        Ok(bincode::deserialize_from(decoder)?)
    }
}
