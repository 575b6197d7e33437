//! "Serialize yourself" contract for persisted graph sub-objects

use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A persisted sub-object of a graph
///
/// The snapshot coordinator treats implementations as opaque: it only looks at
/// success or failure and the reported counts.
pub trait Collaborator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Bytes currently held in memory
    fn bytes_used(&self) -> u64;

    /// Number of items held
    fn item_count(&self) -> u64;

    /// Write to disk; `force` requests a full rewrite. Returns words written.
    fn bulk_serialize(&self, force: bool) -> Result<u64>;

    /// Reload from disk. Returns words read.
    fn restore_objects(&self) -> Result<u64>;

    /// Remove on-disk data (used for empty per-type indexes)
    fn erase(&self) -> Result<()> {
        Ok(())
    }
}

/// Fixed serialization order of collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SerialOrder {
    /// Vector similarity engine
    Similarity,
    /// Property value allocator
    PropertyAllocator,
    /// Vertex type encoder
    VertexTypeEncoder,
    /// Vertex type decoder
    VertexTypeDecoder,
    /// Relationship encoder
    RelationshipEncoder,
    /// Relationship decoder
    RelationshipDecoder,
    /// Property key map
    PropertyKeyMap,
    /// Property value map
    PropertyValueMap,
    /// Vertex/arc allocator
    VertexAllocator,
    /// Global vertex index
    GlobalIndex,
    /// Per vertex type index, keyed by type encoding
    TypeIndex(u8),
}

impl SerialOrder {
    /// True for per-type indexes, which are erased instead of written when empty
    pub fn is_type_index(&self) -> bool {
        matches!(self, Self::TypeIndex(_))
    }
}

impl fmt::Display for SerialOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeIndex(enc) => write!(f, "TypeIndex[{}]", enc),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Collaborators registered with a graph, iterated in [`SerialOrder`]
#[derive(Default, Clone)]
pub struct CollaboratorSet {
    entries: BTreeMap<SerialOrder, Arc<dyn Collaborator>>,
}

impl CollaboratorSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator, replacing any previous one in the same slot
    pub fn insert(&mut self, order: SerialOrder, collaborator: Arc<dyn Collaborator>) {
        self.entries.insert(order, collaborator);
    }

    /// Remove a collaborator
    pub fn remove(&mut self, order: SerialOrder) -> Option<Arc<dyn Collaborator>> {
        self.entries.remove(&order)
    }

    /// Number of registered collaborators
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collaborators in serialization order
    pub fn ordered(&self) -> Vec<(SerialOrder, Arc<dyn Collaborator>)> {
        self.entries
            .iter()
            .map(|(order, c)| (*order, Arc::clone(c)))
            .collect()
    }

    /// Total bytes used across all collaborators
    pub fn bytes_used(&self) -> u64 {
        self.entries.values().map(|c| c.bytes_used()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_order_is_fixed() {
        let mut orders = vec![
            SerialOrder::TypeIndex(3),
            SerialOrder::GlobalIndex,
            SerialOrder::PropertyValueMap,
            SerialOrder::Similarity,
            SerialOrder::TypeIndex(1),
            SerialOrder::VertexTypeEncoder,
            SerialOrder::VertexAllocator,
            SerialOrder::PropertyAllocator,
        ];
        orders.sort();
        assert_eq!(
            orders,
            vec![
                SerialOrder::Similarity,
                SerialOrder::PropertyAllocator,
                SerialOrder::VertexTypeEncoder,
                SerialOrder::PropertyValueMap,
                SerialOrder::VertexAllocator,
                SerialOrder::GlobalIndex,
                SerialOrder::TypeIndex(1),
                SerialOrder::TypeIndex(3),
            ]
        );
        assert!(SerialOrder::TypeIndex(0).is_type_index());
        assert_eq!(SerialOrder::TypeIndex(4).to_string(), "TypeIndex[4]");
    }
}
