//! Typed credential-level changes.

use crate::credential::{ContentHash, Credential};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiffKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::Add => write!(f, "add"),
            DiffKind::Update => write!(f, "update"),
            DiffKind::Delete => write!(f, "delete"),
        }
    }
}

/// What changes, and to what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub id: Uuid,
    /// `None` only for a delete that has been finalized for sending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Credential>,
}

/// Selection key for a proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiffKey {
    pub id: Uuid,
    pub kind: DiffKind,
}

/// A single change between two credential sets, tagged with the content hash
/// of the proposed side. Immutable once built; transformations return a new
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    hash: ContentHash,
    #[serde(rename = "changes")]
    change: Change,
}

impl Diff {
    fn new(kind: DiffKind, credential: &Credential) -> Self {
        Self {
            hash: credential.content_hash(),
            change: Change {
                kind,
                id: credential.id,
                props: Some(credential.clone()),
            },
        }
    }

    pub fn add(credential: &Credential) -> Self {
        Self::new(DiffKind::Add, credential)
    }

    pub fn update(credential: &Credential) -> Self {
        Self::new(DiffKind::Update, credential)
    }

    /// A delete that still carries the credential being removed.
    pub fn delete(credential: &Credential) -> Self {
        Self::new(DiffKind::Delete, credential)
    }

    /// The same change with the payload dropped, ready to send or apply as
    /// a delete.
    pub fn finalized_delete(&self) -> Self {
        Self {
            hash: self.hash.clone(),
            change: Change {
                kind: DiffKind::Delete,
                id: self.change.id,
                props: None,
            },
        }
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn kind(&self) -> DiffKind {
        self.change.kind
    }

    pub fn id(&self) -> Uuid {
        self.change.id
    }

    pub fn props(&self) -> Option<&Credential> {
        self.change.props.as_ref()
    }

    pub fn key(&self) -> DiffKey {
        DiffKey {
            id: self.change.id,
            kind: self.change.kind,
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.props() {
            Some(c) => write!(f, "{} {} ({})", self.kind(), c.name, self.id()),
            None => write!(f, "{} {}", self.kind(), self.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_delete_drops_payload_and_keeps_hash() {
        let c = Credential::new("GitHub", "alice", "x");
        let delete = Diff::delete(&c);
        assert!(delete.props().is_some());

        let finalized = delete.finalized_delete();
        assert!(finalized.props().is_none());
        assert_eq!(finalized.hash(), delete.hash());
        assert_eq!(finalized.key(), DiffKey { id: c.id, kind: DiffKind::Delete });

        // Original untouched.
        assert!(delete.props().is_some());
    }

    #[test]
    fn wire_shape() {
        let c = Credential::new("GitHub", "alice", "x");
        let value = serde_json::to_value(Diff::add(&c)).unwrap();
        assert_eq!(value["hash"], c.content_hash().as_str());
        assert_eq!(value["changes"]["type"], "Add");
        assert_eq!(value["changes"]["id"], c.id.to_string());
        assert_eq!(value["changes"]["props"]["name"], "GitHub");

        let value = serde_json::to_value(Diff::delete(&c).finalized_delete()).unwrap();
        assert!(value["changes"].get("props").is_none());
        let parsed: Diff = serde_json::from_value(value).unwrap();
        assert!(parsed.props().is_none());
    }
}
