// Ordered name lists and the shared activity index space
//
// Every matrix row/column index in the pipeline is a position in one of two
// ordered lists: activities (technosphere rows/cols, biosphere cols) and
// emissions (biosphere rows, characterization rows/cols). After foreground
// extension the activity list is laid out as
//
//   [0 .. n_fg)             foreground activities
//   [n_fg .. n_fg + n_bg)   background activities
//
// Extension, uncertainty and packaging all read positions from the same
// `ActivityIndexMap` value instead of assuming index 0 is the newest activity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lca_errors::{AssemblyError, AssemblyResult, NameKind};

/// Duplicate-free, ordered list of names with O(1) position lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedNames {
    kind: NameKind,
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl OrderedNames {
    pub fn new<I, S>(kind: NameKind, names: I) -> AssemblyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if positions.insert(name.clone(), i).is_some() {
                return Err(AssemblyError::DuplicateName { kind, name: name.clone() });
            }
        }
        Ok(Self { kind, names, positions })
    }

    pub fn activities<I, S>(names: I) -> AssemblyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(NameKind::Activity, names)
    }

    pub fn emissions<I, S>(names: I) -> AssemblyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(NameKind::Emission, names)
    }

    pub fn kind(&self) -> NameKind {
        self.kind
    }

    /// Position of `name`; a miss is a caller-contract violation.
    pub fn index_of(&self, name: &str) -> AssemblyResult<usize> {
        self.position(name).ok_or_else(|| AssemblyError::UnknownName {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// The activity index space after foreground extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityIndexMap {
    order: OrderedNames,
    n_foreground: usize,
}

impl ActivityIndexMap {
    /// Foreground activities take the leading indices, background follows.
    /// A foreground label that collides with a background activity is rejected.
    pub fn new<F, B, S, T>(foreground: F, background: B) -> AssemblyResult<Self>
    where
        F: IntoIterator<Item = S>,
        B: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut names: Vec<String> = foreground.into_iter().map(Into::into).collect();
        let n_foreground = names.len();
        names.extend(background.into_iter().map(Into::into));
        Ok(Self { order: OrderedNames::activities(names)?, n_foreground })
    }

    pub fn background_only<B, T>(background: B) -> AssemblyResult<Self>
    where
        B: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::new(Vec::<String>::new(), background)
    }

    pub fn index_of(&self, name: &str) -> AssemblyResult<usize> {
        self.order.index_of(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.position(name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.order.name(index)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn n_foreground(&self) -> usize {
        self.n_foreground
    }

    pub fn n_background(&self) -> usize {
        self.order.len() - self.n_foreground
    }

    pub fn is_foreground(&self, index: usize) -> bool {
        index < self.n_foreground
    }

    pub fn foreground(&self) -> &[String] {
        &self.order.as_slice()[..self.n_foreground]
    }

    pub fn background(&self) -> &[String] {
        &self.order.as_slice()[self.n_foreground..]
    }

    pub fn names(&self) -> &OrderedNames {
        &self.order
    }
}
