use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// The namespace assumed when a name is given without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// An `apiVersion` split into its group and version.
///
/// The core group is written without a group part, e.g. `v1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn parse(api_version: &str) -> Result<GroupVersion> {
        let invalid = || CoreError::InvalidApiVersion(api_version.to_string());
        let mut parts = api_version.split('/');
        let gv = match (parts.next(), parts.next(), parts.next()) {
            (Some(version), None, None) => GroupVersion {
                group: String::new(),
                version: version.to_string(),
            },
            (Some(group), Some(version), None) if !group.is_empty() => GroupVersion {
                group: group.to_string(),
                version: version.to_string(),
            },
            _ => return Err(invalid()),
        };
        if gv.version.is_empty() {
            return Err(invalid());
        }
        Ok(gv)
    }
}

impl Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

/// Identifies a single object in the store.
///
/// Two keys that differ only in the version part of `api_version` address the
/// same stored object; see [`ObjectKey::storage_id`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        ObjectKey {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group_version(&self) -> Result<GroupVersion> {
        GroupVersion::parse(&self.api_version)
    }

    /// The version-independent identity used to index stored objects:
    /// `group/kind/namespace/name`.
    pub fn storage_id(&self) -> Result<String> {
        let gv = self.group_version()?;
        Ok(format!(
            "{}/{}/{}/{}",
            gv.group, self.kind, self.namespace, self.name
        ))
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A name qualified by its namespace, as delivered by reconcile triggers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        NamespacedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for NamespacedName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidName(s.to_string());
        match s.split_once('/') {
            None if !s.is_empty() => Ok(NamespacedName::new(DEFAULT_NAMESPACE, s)),
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(NamespacedName::new(ns, name))
            }
            _ => Err(invalid()),
        }
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
