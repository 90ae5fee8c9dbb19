// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Transaction id, unique and increasing within a tenant. `0` is never allocated.
pub type TxId = u64;

const NAMESPACE_SEPARATOR: char = '|';
const ELEMENT_SEPARATOR: char = '/';

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementId {
    Int(i64),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    pub kind: String,
    pub id: ElementId,
}

impl PathElement {
    pub fn int(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: ElementId::Int(id),
        }
    }

    pub fn name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: ElementId::Name(name.into()),
        }
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            ElementId::Int(id) => write!(f, "{}:{}", self.kind, id),
            ElementId::Name(name) => write!(f, "{}::{}", self.kind, name),
        }
    }
}

/// Key of a datastore entity: an ancestor path of `(kind, id)` elements within a namespace.
///
/// The text form is `Kind:1/Child::name`, prefixed with `namespace|` outside the default
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub namespace: String,
    pub path: Vec<PathElement>,
}

impl EntityKey {
    pub fn new(namespace: impl Into<String>, path: Vec<PathElement>) -> CoordinatorResult<Self> {
        let key = Self {
            namespace: namespace.into(),
            path,
        };
        if key.path.is_empty() {
            return Err(CoordinatorError::InvalidKey {
                key: key.to_string(),
                reason: "empty path".to_owned(),
            });
        }
        Ok(key)
    }

    /// Key of the root entity, which identifies the entity group.
    pub fn entity_group(&self) -> EntityKey {
        EntityKey {
            namespace: self.namespace.clone(),
            path: self.path.iter().take(1).cloned().collect(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.len() == 1
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.namespace.is_empty() {
            write!(f, "{}{}", self.namespace, NAMESPACE_SEPARATOR)?;
        }
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "{ELEMENT_SEPARATOR}")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

fn parse_element(raw: &str) -> Result<PathElement, String> {
    if let Some((kind, name)) = raw.split_once("::") {
        if kind.is_empty() || name.is_empty() {
            return Err(format!("malformed element {raw:?}"));
        }
        return Ok(PathElement::name(kind, name));
    }
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| format!("element {raw:?} has no id"))?;
    if kind.is_empty() {
        return Err(format!("element {raw:?} has no kind"));
    }
    let id = id
        .parse()
        .map_err(|_| format!("element {raw:?} has a non integer id"))?;
    Ok(PathElement::int(kind, id))
}

impl FromStr for EntityKey {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| CoordinatorError::InvalidKey {
            key: s.to_owned(),
            reason,
        };
        let (namespace, rest) = match s.split_once(NAMESPACE_SEPARATOR) {
            Some((namespace, rest)) => (namespace, rest),
            None => ("", s),
        };
        if rest.is_empty() {
            return Err(invalid("empty path".to_owned()));
        }
        let path = rest
            .split(ELEMENT_SEPARATOR)
            .map(parse_element)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        EntityKey::new(namespace, path)
    }
}
