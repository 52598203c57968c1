// Characterization method and activity registry seams
//
// DATA SOURCE REQUIREMENTS:
//
// 1. IMPACT ASSESSMENT METHOD:
//    - Source: method registry export, e.g. ('IPCC 2013', 'climate change',
//      'global warming potential (GWP100)')
//    - Shape: sequence of (key, characterization factor)
//    - Older database vintages key each factor by a (database, code) pair,
//      newer vintages by the integer id of the biosphere flow
//
// 2. BIOSPHERE FLOW REGISTRY:
//    - Source: biosphere database of the matching vintage
//    - Used only for integer-keyed methods: taxonomy code -> flow id
//
// The key shape is resolved once, here, into `MethodRecords`. Matrix
// building never inspects raw record shapes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lca_errors::{AssemblyError, AssemblyResult};

/// `(category, subcategory, indicator)` method identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    pub category: String,
    pub subcategory: String,
    pub indicator: String,
}

impl MethodId {
    pub fn new(category: impl Into<String>, subcategory: impl Into<String>, indicator: impl Into<String>) -> Self {
        Self { category: category.into(), subcategory: subcategory.into(), indicator: indicator.into() }
    }

    pub fn ipcc_2013_gwp100() -> Self {
        Self::new("IPCC 2013", "climate change", "global warming potential (GWP100)")
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "('{}', '{}', '{}')", self.category, self.subcategory, self.indicator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListKeyedFactor {
    pub database: String,
    pub code: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntKeyedFactor {
    pub id: i64,
    pub value: f64,
}

/// Key of a raw method record as it comes out of a registry export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawFactorKey {
    Pair(String, String),
    Id(i64),
}

/// Characterization records, tagged by key scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MethodRecords {
    /// `((database, code), value)`, older vintage
    ListKeyed(Vec<ListKeyedFactor>),
    /// `(flow id, value)`, newer vintage
    IntKeyed(Vec<IntKeyedFactor>),
}

impl MethodRecords {
    /// Infer the key scheme from raw records. All records must share one shape.
    pub fn from_raw(method: &MethodId, raw: Vec<(RawFactorKey, f64)>) -> AssemblyResult<Self> {
        let list_keyed = match raw.first() {
            None => return Err(AssemblyError::EmptyMethod(method.to_string())),
            Some((key, _)) => matches!(key, RawFactorKey::Pair(..)),
        };
        if list_keyed {
            let mut factors = Vec::with_capacity(raw.len());
            for (key, value) in raw {
                match key {
                    RawFactorKey::Pair(database, code) => factors.push(ListKeyedFactor { database, code, value }),
                    RawFactorKey::Id(_) => return Err(AssemblyError::MixedMethodRecords(method.to_string())),
                }
            }
            Ok(MethodRecords::ListKeyed(factors))
        } else {
            let mut factors = Vec::with_capacity(raw.len());
            for (key, value) in raw {
                match key {
                    RawFactorKey::Id(id) => factors.push(IntKeyedFactor { id, value }),
                    RawFactorKey::Pair(..) => return Err(AssemblyError::MixedMethodRecords(method.to_string())),
                }
            }
            Ok(MethodRecords::IntKeyed(factors))
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MethodRecords::ListKeyed(f) => f.len(),
            MethodRecords::IntKeyed(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scheme_name(&self) -> &'static str {
        match self {
            MethodRecords::ListKeyed(_) => "list-keyed",
            MethodRecords::IntKeyed(_) => "int-keyed",
        }
    }
}

/// Source of characterization factors.
pub trait MethodRegistry {
    fn load(&self, method: &MethodId) -> AssemblyResult<MethodRecords>;
}

/// Resolves a taxonomy code to the stable integer id of a biosphere flow.
/// `Ok(None)` means the registry has no such flow.
pub trait ActivityRegistry {
    fn resolve_id(&self, database: &str, code: &str) -> AssemblyResult<Option<i64>>;
}

/// Method registry backed by preloaded exports.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMethodRegistry {
    methods: HashMap<MethodId, MethodRecords>,
}

impl InMemoryMethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: MethodId, records: MethodRecords) {
        self.methods.insert(method, records);
    }

    pub fn insert_raw(&mut self, method: MethodId, raw: Vec<(RawFactorKey, f64)>) -> AssemblyResult<()> {
        let records = MethodRecords::from_raw(&method, raw)?;
        self.methods.insert(method, records);
        Ok(())
    }
}

impl MethodRegistry for InMemoryMethodRegistry {
    fn load(&self, method: &MethodId) -> AssemblyResult<MethodRecords> {
        let records = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| AssemblyError::Registry(format!("method {} is not registered", method)))?;
        if records.is_empty() {
            return Err(AssemblyError::EmptyMethod(method.to_string()));
        }
        Ok(records)
    }
}

/// Activity registry backed by a `(database, code) -> id` table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryActivityRegistry {
    ids: HashMap<(String, String), i64>,
}

impl InMemoryActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, database: impl Into<String>, code: impl Into<String>, id: i64) {
        self.ids.insert((database.into(), code.into()), id);
    }
}

impl ActivityRegistry for InMemoryActivityRegistry {
    fn resolve_id(&self, database: &str, code: &str) -> AssemblyResult<Option<i64>> {
        Ok(self.ids.get(&(database.to_string(), code.to_string())).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_inferred_from_pairs() {
        let method = MethodId::ipcc_2013_gwp100();
        let raw = vec![
            (RawFactorKey::Pair("biosphere3".into(), "349b29d1".into()), 1.0),
            (RawFactorKey::Pair("biosphere3".into(), "0795345f".into()), 29.7),
        ];
        let records = MethodRecords::from_raw(&method, raw).unwrap();
        assert_eq!(records.scheme_name(), "list-keyed");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_scheme_inferred_from_ids() {
        let method = MethodId::ipcc_2013_gwp100();
        let raw = vec![(RawFactorKey::Id(4021), 1.0), (RawFactorKey::Id(4022), 273.0)];
        match MethodRecords::from_raw(&method, raw).unwrap() {
            MethodRecords::IntKeyed(f) => assert_eq!(f[1], IntKeyedFactor { id: 4022, value: 273.0 }),
            other => panic!("expected int-keyed records, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_and_empty_records_rejected() {
        let method = MethodId::ipcc_2013_gwp100();
        let mixed = vec![(RawFactorKey::Id(1), 1.0), (RawFactorKey::Pair("db".into(), "c".into()), 2.0)];
        assert!(matches!(MethodRecords::from_raw(&method, mixed), Err(AssemblyError::MixedMethodRecords(_))));
        assert!(matches!(MethodRecords::from_raw(&method, vec![]), Err(AssemblyError::EmptyMethod(_))));
    }

    #[test]
    fn test_in_memory_registries() {
        let method = MethodId::ipcc_2013_gwp100();
        let mut methods = InMemoryMethodRegistry::new();
        assert!(matches!(methods.load(&method), Err(AssemblyError::Registry(_))));
        methods.insert_raw(method.clone(), vec![(RawFactorKey::Id(7), 25.0)]).unwrap();
        assert_eq!(methods.load(&method).unwrap().len(), 1);

        let mut activities = InMemoryActivityRegistry::new();
        activities.insert("ecoinvent-3.11-biosphere", "349b29d1", 7);
        assert_eq!(activities.resolve_id("ecoinvent-3.11-biosphere", "349b29d1").unwrap(), Some(7));
        assert_eq!(activities.resolve_id("ecoinvent-3.11-biosphere", "missing").unwrap(), None);
    }
}
