//! Sparse matrix assembly for life cycle assessment.
//!
//! Builds the technosphere, biosphere and characterization matrices of an
//! input-output background database, extends them with a user-defined
//! foreground system, attaches per-cell uncertainty and packages the result
//! as sparse coordinate vectors in one shared index space for an external
//! LCA solver.
//!
//! ```text
//!   A table ──► form_tech_matrix ──┐
//!   S table ──► form_bio_matrix  ──┼─► extend ──► prepare_matrices ──► add_uncertainty ──► Datapackage
//!   taxonomy ─► form_cf_matrix   ──┘
//! ```

pub mod lca_activity_index;
pub mod lca_config;
pub mod lca_errors;
pub mod lca_foreground;
pub mod lca_matrix_builder;
pub mod lca_packager;
pub mod lca_pipeline;
pub mod lca_registry;
pub mod lca_uncertainty;

pub use lca_activity_index::{ActivityIndexMap, OrderedNames};
pub use lca_config::{PipelineConfig, UncertaintyConfig};
pub use lca_errors::{AssemblyError, AssemblyResult, NameKind};
pub use lca_foreground::{
    extend_biosphere_column, extend_long_format, extend_technosphere_column, ColumnEntry, ExchangeType,
    ExtendedSystem, ForegroundExchange,
};
pub use lca_matrix_builder::{
    form_bio_matrix, form_tech_matrix, CfResolution, CharacterizationSource, LabeledMatrix, TaxonomyRecord,
};
pub use lca_packager::{
    prepare_datapackage, prepare_matrices, CoordinateMatrix, Datapackage, MatrixKind, PackageUncertainty,
    PreparedMatrices,
};
pub use lca_pipeline::{
    reference_score, reference_scores, BackgroundInputs, BackgroundSystem, ForegroundInput, LcaPipeline,
};
pub use lca_registry::{ActivityRegistry, MethodId, MethodRecords, MethodRegistry};
pub use lca_uncertainty::{
    AggregationStrategy, DistributionKind, ExchangeOverride, PedigreeTables, UncertaintyEngine, UncertaintyMetadata,
    UncertaintyRecord, UncertaintyRow, UncertaintyScenario,
};
