use crate::node::{Node, NodeTable};
use zwire_core::prelude::*;

/// The driver's view of a cached mesh, exchanged with the configuration
/// component. The on-disk format (XML, keyed by home id) belongs to that
/// component; the driver only decides *when* to load and save.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub home_id: u32,
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub id: NodeId,
    pub name: String,
    pub location: String,
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub command_classes: Vec<u8>,
}

impl NodeSummary {
    pub fn from_node(node: &Node) -> Self {
        let (manufacturer_id, product_type, product_id) = node.product();
        Self {
            id: node.id(),
            name: node.name().to_string(),
            location: node.location().to_string(),
            manufacturer_id,
            product_type,
            product_id,
            command_classes: node.command_classes().collect(),
        }
    }

    /// Restore the cached facts into a freshly created node
    pub fn apply_to(&self, node: &mut Node) {
        node.set_name(self.name.clone());
        node.set_location(self.location.clone());
        node.set_product(self.manufacturer_id, self.product_type, self.product_id);
        for class in &self.command_classes {
            node.add_command_class(*class);
        }
    }
}

impl NetworkSnapshot {
    pub fn from_table(home_id: u32, table: &NodeTable) -> Self {
        Self {
            home_id,
            nodes: table.iter().map(NodeSummary::from_node).collect(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSummary> {
        self.nodes.iter().find(|summary| summary.id == id)
    }
}

/// Where the cached mesh lives. Load is attempted once the home id is known;
/// save is triggered on the all-queried milestone and on clean shutdown.
pub trait ConfigStore: Send + Sync {
    fn load(&self, home_id: u32) -> Option<NetworkSnapshot>;
    fn save(&self, snapshot: &NetworkSnapshot);
}

/// A store that remembers nothing; every start is a cold start.
pub struct NullConfigStore;

impl ConfigStore for NullConfigStore {
    fn load(&self, _home_id: u32) -> Option<NetworkSnapshot> {
        None
    }

    fn save(&self, _snapshot: &NetworkSnapshot) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip_through_node() {
        let mut node = Node::new(NodeId::new(6));
        node.set_name("Porch light");
        node.set_product(0x86, 0x0003, 0x004e);
        node.add_command_class(0x25);
        node.add_command_class(0x72);

        let summary = NodeSummary::from_node(&node);
        let mut restored = Node::new(NodeId::new(6));
        summary.apply_to(&mut restored);

        assert_eq!(restored.name(), "Porch light");
        assert_eq!(restored.product(), (0x86, 0x0003, 0x004e));
        assert!(restored.supports_command_class(0x25));
        assert!(restored.supports_command_class(0x72));
    }
}
