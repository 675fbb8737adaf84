//! Identifier newtypes for agents and registry entries.
//!
//! [`RegistryId`] is the numeric id handed out by the registry (or assigned
//! deterministically in fast mode). [`Tag`] is the hierarchical path that
//! names an agent's position in the tree, e.g. `fe[3]:0:1`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Registry entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryId(pub u32);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hierarchical agent tag.
///
/// The frontend is `fe[<id>]`, its single child (the root of the agent tree)
/// is `fe[<id>]:0`, and every further level appends `:<index>` where the
/// index is the child's position under its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Tag used by the frontend before the registry has assigned it an id.
    pub const UNREGISTERED_FRONTEND: &'static str = "fe";

    /// Builds the frontend tag for a registry id.
    pub fn frontend(id: RegistryId) -> Self {
        Tag(format!("fe[{}]", id.0))
    }

    /// Parses and validates a tag string.
    ///
    /// A tag is a non-empty sequence of `:`-separated segments; only the first
    /// segment may be non-numeric.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let mut segments = raw.split(':');
        let head = segments.next().unwrap_or_default();
        if head.is_empty() {
            return Err(CoreError::MalformedTag { tag: raw.to_string() });
        }
        for seg in segments {
            if seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CoreError::MalformedTag { tag: raw.to_string() });
            }
        }
        Ok(Tag(raw.to_string()))
    }

    /// Tag of this agent's `idx`-th child.
    pub fn child(&self, idx: usize) -> Tag {
        Tag(format!("{}:{}", self.0, idx))
    }

    /// Tag of this agent's parent, or `None` for the frontend.
    pub fn parent(&self) -> Option<Tag> {
        self.0
            .rsplit_once(':')
            .map(|(prefix, _)| Tag(prefix.to_string()))
    }

    /// Number of levels below the frontend (`fe[1]` is 0, `fe[1]:0` is 1).
    pub fn depth(&self) -> usize {
        self.0.matches(':').count()
    }

    /// Whether this tag names a frontend.
    pub fn is_frontend(&self) -> bool {
        self.depth() == 0 && self.0.starts_with(Self::UNREGISTERED_FRONTEND)
    }

    /// Registry id embedded in a frontend tag (`fe[7]` gives 7).
    pub fn frontend_id(&self) -> Option<RegistryId> {
        let head = self.0.split(':').next()?;
        let inner = head.strip_prefix("fe[")?.strip_suffix(']')?;
        inner.parse().ok().map(RegistryId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Tag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::parse(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Tag::parse(&raw)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> String {
        tag.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_and_children() {
        let fe = Tag::frontend(RegistryId(3));
        assert_eq!(fe.as_str(), "fe[3]");
        assert!(fe.is_frontend());
        assert_eq!(fe.parent(), None);

        let root = fe.child(0);
        assert_eq!(root.as_str(), "fe[3]:0");
        assert_eq!(root.child(1).as_str(), "fe[3]:0:1");
        assert_eq!(root.child(1).parent(), Some(root.clone()));
        assert_eq!(root.parent(), Some(fe));
        assert!(!root.is_frontend());
    }

    #[test]
    fn depth_counts_levels() {
        assert_eq!(Tag::parse("fe[1]").unwrap().depth(), 0);
        assert_eq!(Tag::parse("fe[1]:0:2:3").unwrap().depth(), 3);
    }

    #[test]
    fn frontend_id_extraction() {
        assert_eq!(
            Tag::parse("fe[42]:0:1").unwrap().frontend_id(),
            Some(RegistryId(42))
        );
        assert_eq!(Tag::parse("fe").unwrap().frontend_id(), None);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Tag::parse("").is_err());
        assert!(Tag::parse("fe[1]:").is_err());
        assert!(Tag::parse("fe[1]::0").is_err());
        assert!(Tag::parse("fe[1]:x").is_err());
        assert!("fe[1]:0".parse::<Tag>().is_ok());
    }

    #[test]
    fn registry_id_display() {
        assert_eq!(format!("{}", RegistryId(9)), "9");
    }

    #[test]
    fn serde_uses_the_plain_string() {
        let tag = Tag::parse("fe[2]:0").unwrap();
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"fe[2]:0\"");
        let back: Tag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn deserializing_a_malformed_tag_fails() {
        for raw in ["\"\"", "\"fe[1]:\"", "\"fe[1]:0:x\""] {
            let err = serde_json::from_str::<Tag>(raw).unwrap_err();
            assert!(err.to_string().contains("malformed"), "{raw}: {err}");
        }
    }
}
