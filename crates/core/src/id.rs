//! Hierarchical execution identifiers.
//!
//! Every execution — a flow run, an agent turn, a tool call, a chain link —
//! carries an [`ExecutionId`]. Children share their parent's root id, so any
//! id in a run can be correlated back to the run that produced it. The string
//! form is `KIND_<root>[_<parentseq>]_<nnn>` with the sequence zero-padded to
//! three digits.
//!
//! Sequences are assigned by the execution tracker from a process-wide
//! monotone counter; an id freshly derived with [`ExecutionId::derive_child`]
//! holds a placeholder sequence until the tracker registers it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What kind of execution an id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionKind {
    /// A whole workflow run.
    Flow,
    /// An agent loop within a run.
    Agent,
    /// A single tool invocation.
    Tool,
    /// A chain of dependent tool invocations.
    Chain,
}

impl ExecutionKind {
    /// Upper-case token used in the string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "FLOW",
            Self::Agent => "AGENT",
            Self::Tool => "TOOL",
            Self::Chain => "CHAIN",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "FLOW" => Some(Self::Flow),
            "AGENT" => Some(Self::Agent),
            "TOOL" => Some(Self::Tool),
            "CHAIN" => Some(Self::Chain),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`ExecutionId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    /// The string does not have the `KIND_ROOT[_PARENT-SEQ]_SEQ` shape.
    #[error("malformed execution id: {0:?}")]
    Malformed(String),
    /// The leading token is not a known execution kind.
    #[error("unknown execution kind: {0:?}")]
    UnknownKind(String),
    /// A sequence segment is not numeric.
    #[error("non-numeric sequence in execution id: {0:?}")]
    NonNumericSequence(String),
}

/// Immutable, hierarchical execution identity.
///
/// Identity — equality, hashing, ordering — is defined over
/// `(kind, root, parent_seq, seq)`, exactly the fields the string form
/// carries, so `parse(format(id)) == id` always holds. The `depth` field is
/// carried metadata maintained by the tracker and excluded from identity.
#[derive(Debug, Clone)]
pub struct ExecutionId {
    kind: ExecutionKind,
    root: Arc<str>,
    parent_seq: Option<u32>,
    seq: u32,
    depth: u16,
}

impl ExecutionId {
    /// Create a fresh root id with a random root component.
    ///
    /// The root is a v4 UUID in simple (hex) form: 122 random bits, well
    /// above the 96-bit floor the id grammar requires.
    #[must_use]
    pub fn new_root(kind: ExecutionKind) -> Self {
        let root = uuid::Uuid::new_v4().simple().to_string();
        Self {
            kind,
            root: root.into(),
            parent_seq: None,
            seq: 0,
            depth: 0,
        }
    }

    /// Derive a child id sharing this id's root.
    ///
    /// The child's sequence is a placeholder (0) until the tracker assigns
    /// the real one via [`ExecutionId::with_sequence`].
    #[must_use]
    pub fn derive_child(&self, kind: ExecutionKind) -> Self {
        Self {
            kind,
            root: Arc::clone(&self.root),
            parent_seq: Some(self.seq),
            seq: 0,
            depth: self.depth + 1,
        }
    }

    /// Return a copy of this id with the given sequence number.
    #[must_use]
    pub fn with_sequence(&self, seq: u32) -> Self {
        Self { seq, ..self.clone() }
    }

    /// Parse the canonical string form.
    ///
    /// # Errors
    ///
    /// Returns [`IdParseError`] when the string lacks the
    /// `KIND_ROOT[_PARENT-SEQ]_SEQ` shape, names an unknown kind, or carries
    /// a non-numeric sequence.
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        let parts: Vec<&str> = s.split('_').collect();
        if (parts.len() != 3 && parts.len() != 4) || parts[0].is_empty() {
            return Err(IdParseError::Malformed(s.to_owned()));
        }

        let kind = ExecutionKind::from_token(parts[0])
            .ok_or_else(|| IdParseError::UnknownKind(parts[0].to_owned()))?;

        let root = parts[1];
        if root.is_empty() || !root.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IdParseError::Malformed(s.to_owned()));
        }

        let parse_seq = |seg: &str| {
            seg.parse::<u32>()
                .map_err(|_| IdParseError::NonNumericSequence(s.to_owned()))
        };

        let (parent_seq, seq) = if parts.len() == 4 {
            (Some(parse_seq(parts[2])?), parse_seq(parts[3])?)
        } else {
            (None, parse_seq(parts[2])?)
        };

        // Depth beyond "root or not" is not encoded in the string; the
        // tracker re-derives it when the id is registered.
        let depth = u16::from(parent_seq.is_some());

        Ok(Self {
            kind,
            root: root.into(),
            parent_seq,
            seq,
            depth,
        })
    }

    /// The execution kind.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// The root id shared by every execution of one run.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The parent's sequence number, `None` for roots.
    #[must_use]
    pub fn parent_seq(&self) -> Option<u32> {
        self.parent_seq
    }

    /// The tracker-assigned sequence number.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Nesting depth: 0 for roots, parent depth + 1 for children.
    #[must_use]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Returns `true` if this id has no parent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_seq.is_none()
    }

    /// Return a copy with the given depth (used by the tracker, which knows
    /// the parent's real depth).
    #[must_use]
    pub fn with_depth(&self, depth: u16) -> Self {
        Self { depth, ..self.clone() }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_seq {
            Some(p) => write!(f, "{}_{}_{}_{:03}", self.kind, self.root, p, self.seq),
            None => write!(f, "{}_{}_{:03}", self.kind, self.root, self.seq),
        }
    }
}

impl PartialEq for ExecutionId {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.root == other.root
            && self.parent_seq == other.parent_seq
            && self.seq == other.seq
    }
}

impl Eq for ExecutionId {}

impl Hash for ExecutionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.root.hash(state);
        self.parent_seq.hash(state);
        self.seq.hash(state);
    }
}

impl PartialOrd for ExecutionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecutionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, &self.root, self.parent_seq, self.seq).cmp(&(
            other.kind,
            &other.root,
            other.parent_seq,
            other.seq,
        ))
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ExecutionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_id_has_no_parent_and_depth_zero() {
        let id = ExecutionId::new_root(ExecutionKind::Flow);
        assert!(id.is_root());
        assert_eq!(id.sequence(), 0);
        assert_eq!(id.depth(), 0);
        assert_eq!(id.parent_seq(), None);
    }

    #[test]
    fn root_entropy_is_32_hex_chars() {
        let id = ExecutionId::new_root(ExecutionKind::Flow);
        assert_eq!(id.root().len(), 32);
        assert!(id.root().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fresh_roots_are_distinct() {
        let a = ExecutionId::new_root(ExecutionKind::Flow);
        let b = ExecutionId::new_root(ExecutionKind::Flow);
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn child_shares_root_and_increments_depth() {
        let parent = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(7);
        let child = parent.derive_child(ExecutionKind::Tool);
        assert_eq!(child.root(), parent.root());
        assert_eq!(child.parent_seq(), Some(7));
        assert_eq!(child.depth(), parent.depth() + 1);
    }

    #[test]
    fn display_pads_sequence_to_three_digits() {
        let id = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(5);
        let s = id.to_string();
        assert!(s.starts_with("FLOW_"), "got {s}");
        assert!(s.ends_with("_005"), "got {s}");
    }

    #[test]
    fn display_includes_parent_sequence_for_children() {
        let parent = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(3);
        let child = parent.derive_child(ExecutionKind::Tool).with_sequence(12);
        let s = child.to_string();
        assert!(s.starts_with("TOOL_"), "got {s}");
        assert!(s.ends_with("_3_012"), "got {s}");
    }

    #[test]
    fn parse_format_roundtrip_root() {
        let id = ExecutionId::new_root(ExecutionKind::Agent).with_sequence(42);
        let parsed = ExecutionId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_format_roundtrip_child() {
        let parent = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(1);
        let child = parent.derive_child(ExecutionKind::Chain).with_sequence(999);
        let parsed = ExecutionId::parse(&child.to_string()).unwrap();
        assert_eq!(parsed, child);
    }

    #[test]
    fn parse_format_roundtrip_sequence_beyond_padding() {
        let id = ExecutionId::new_root(ExecutionKind::Tool).with_sequence(12345);
        let parsed = ExecutionId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_malformed_shapes() {
        for bad in ["", "FLOW", "FLOW_abc", "FLOW_abc_1_2_3", "_abc_001"] {
            assert!(
                matches!(ExecutionId::parse(bad), Err(IdParseError::Malformed(_))),
                "expected Malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        let err = ExecutionId::parse("BLOB_abc123_001").unwrap_err();
        assert!(matches!(err, IdParseError::UnknownKind(_)));
    }

    #[test]
    fn parse_rejects_non_numeric_sequence() {
        let err = ExecutionId::parse("FLOW_abc123_xyz").unwrap_err();
        assert!(matches!(err, IdParseError::NonNumericSequence(_)));

        let err = ExecutionId::parse("TOOL_abc123_up_001").unwrap_err();
        assert!(matches!(err, IdParseError::NonNumericSequence(_)));
    }

    #[test]
    fn depth_is_excluded_from_identity() {
        let parent = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(1);
        let grandchild = parent
            .derive_child(ExecutionKind::Agent)
            .with_sequence(2)
            .derive_child(ExecutionKind::Tool)
            .with_sequence(3);
        assert_eq!(grandchild.depth(), 2);

        // The string form encodes parent linkage but not full depth; parsing
        // yields the same identity.
        let parsed = ExecutionId::parse(&grandchild.to_string()).unwrap();
        assert_eq!(parsed, grandchild);
        assert_eq!(parsed.depth(), 1);
    }

    #[test]
    fn serde_roundtrips_as_string() {
        let parent = ExecutionId::new_root(ExecutionKind::Flow).with_sequence(4);
        let child = parent.derive_child(ExecutionKind::Tool).with_sequence(9);
        let json = serde_json::to_string(&child).unwrap();
        assert_eq!(json, format!("\"{child}\""));
        let back: ExecutionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, child);
    }

    #[test]
    fn ids_usable_as_hash_keys() {
        use std::collections::HashSet;
        let id = ExecutionId::new_root(ExecutionKind::Flow);
        let mut set = HashSet::new();
        set.insert(id.clone());
        assert!(set.contains(&ExecutionId::parse(&id.to_string()).unwrap()));
    }
}
