use crate::stats::NodeStats;
use std::collections::BTreeMap;
use zwire_core::prelude::*;

mod query;
pub use query::QueryStage;

/// Everything the driver knows about one node on the mesh. Lives in the
/// node table and is only touched under its mutex (the driver loop holds it
/// briefly, never across a suspension or a handler callback).
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    protocol_info: Option<NodeProtocolInfo>,
    manufacturer_id: u16,
    product_type: u16,
    product_id: u16,
    name: String,
    location: String,
    /// Supported command classes, class byte -> version (0 = unknown)
    command_classes: BTreeMap<u8, u8>,
    neighbors: [u8; NODE_BITMASK_BYTES],
    query_stage: QueryStage,
    awake: bool,
    failed: bool,
    consecutive_no_ack: u8,
    pub stats: NodeStats,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            protocol_info: None,
            manufacturer_id: 0,
            product_type: 0,
            product_id: 0,
            name: String::new(),
            location: String::new(),
            command_classes: BTreeMap::new(),
            neighbors: [0; NODE_BITMASK_BYTES],
            query_stage: QueryStage::None,
            awake: true,
            failed: false,
            consecutive_no_ack: 0,
            stats: NodeStats::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn protocol_info(&self) -> Option<&NodeProtocolInfo> {
        self.protocol_info.as_ref()
    }

    /// Record the protocol info reported by the controller. A node that can
    /// sleep is considered asleep until it proves otherwise.
    pub fn set_protocol_info(&mut self, info: NodeProtocolInfo) {
        let first_time = self.protocol_info.is_none();
        self.protocol_info = Some(info);
        if first_time && info.can_sleep() {
            self.awake = false;
        }
    }

    pub fn can_sleep(&self) -> bool {
        self.protocol_info
            .map(|info| info.can_sleep())
            .unwrap_or(false)
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn set_awake(&mut self, awake: bool) {
        self.awake = awake;
    }

    /// Record a missing acknowledgement; returns how many arrived in a row
    pub fn note_no_ack(&mut self) -> u8 {
        self.consecutive_no_ack = self.consecutive_no_ack.saturating_add(1);
        self.consecutive_no_ack
    }

    pub fn note_delivery_ok(&mut self) {
        self.consecutive_no_ack = 0;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn set_location(&mut self, location: impl Into<String>) {
        self.location = location.into();
    }

    pub fn set_product(&mut self, manufacturer_id: u16, product_type: u16, product_id: u16) {
        self.manufacturer_id = manufacturer_id;
        self.product_type = product_type;
        self.product_id = product_id;
    }

    pub fn product(&self) -> (u16, u16, u16) {
        (self.manufacturer_id, self.product_type, self.product_id)
    }

    pub fn add_command_class(&mut self, class: u8) {
        self.command_classes.entry(class).or_insert(0);
    }

    pub fn set_command_class_version(&mut self, class: u8, version: u8) {
        self.command_classes.insert(class, version);
    }

    pub fn supports_command_class(&self, class: u8) -> bool {
        self.command_classes.contains_key(&class)
    }

    pub fn command_classes(&self) -> impl Iterator<Item = u8> + '_ {
        self.command_classes.keys().copied()
    }

    pub fn set_neighbors(&mut self, bitmask: &[u8]) {
        let len = bitmask.len().min(NODE_BITMASK_BYTES);
        self.neighbors[..len].copy_from_slice(&bitmask[..len]);
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        node_ids_in_bitmask(&self.neighbors).collect()
    }

    pub fn query_stage(&self) -> QueryStage {
        self.query_stage
    }

    /// Advance the interview cursor. The cursor is monotonic: attempts to
    /// move it backwards are ignored, only [`Node::reset_queries`] rewinds it.
    pub fn set_query_stage(&mut self, stage: QueryStage) {
        if stage > self.query_stage {
            self.query_stage = stage;
        }
    }

    /// Restart the interview from the very beginning (explicit re-init)
    pub fn reset_queries(&mut self) {
        self.query_stage = QueryStage::None;
    }

    pub fn queries_complete(&self) -> bool {
        self.query_stage == QueryStage::Complete
    }
}

/// The fixed-size node arena, indexed by node id 1..=232. Cross-references
/// into it are ids, never pointers; anything needing a node looks it up here.
pub struct NodeTable {
    slots: Vec<Option<Node>>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            slots: (0..=MAX_NODES as usize).map(|_| None).collect(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if !id.is_valid() {
            return None;
        }
        self.slots[u8::from(id) as usize].as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if !id.is_valid() {
            return None;
        }
        self.slots[u8::from(id) as usize].as_mut()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Create a fresh node in the slot, replacing whatever was there
    pub fn init_node(&mut self, id: NodeId) -> Option<&mut Node> {
        if !id.is_valid() {
            return None;
        }
        let slot = &mut self.slots[u8::from(id) as usize];
        *slot = Some(Node::new(id));
        slot.as_mut()
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        if !id.is_valid() {
            return None;
        }
        self.slots[u8::from(id) as usize].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Every node that stays awake has finished its interview
    pub fn awake_queried(&self) -> bool {
        self.iter()
            .filter(|node| !node.can_sleep() || node.is_awake())
            .all(|node| node.queries_complete())
    }

    /// Every known node has finished its interview
    pub fn all_queried(&self) -> bool {
        self.iter().all(|node| node.queries_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_stage_monotonic() {
        let mut node = Node::new(NodeId::new(4));
        node.set_query_stage(QueryStage::Versions);
        node.set_query_stage(QueryStage::ProtocolInfo);
        assert_eq!(node.query_stage(), QueryStage::Versions);
        node.set_query_stage(QueryStage::Complete);
        assert!(node.queries_complete());
        node.set_query_stage(QueryStage::Dynamic);
        assert!(node.queries_complete());

        node.reset_queries();
        assert_eq!(node.query_stage(), QueryStage::None);
    }

    #[test]
    fn test_sleeping_node_starts_asleep() {
        let mut node = Node::new(NodeId::new(7));
        assert!(node.is_awake());
        let info = NodeProtocolInfo::parse(&hex::decode("530000042001").unwrap()).unwrap();
        node.set_protocol_info(info);
        assert!(node.can_sleep());
        assert!(!node.is_awake());
    }

    #[test]
    fn test_table_milestones() {
        let mut table = NodeTable::new();
        table.init_node(NodeId::new(1));
        table.init_node(NodeId::new(2));

        // Node 2 is a sleeping sensor
        let sleeper = NodeProtocolInfo::parse(&hex::decode("530000042001").unwrap()).unwrap();
        table.get_mut(NodeId::new(2)).unwrap().set_protocol_info(sleeper);

        assert!(!table.awake_queried());
        table
            .get_mut(NodeId::new(1))
            .unwrap()
            .set_query_stage(QueryStage::Complete);
        assert!(table.awake_queried());
        assert!(!table.all_queried());

        table
            .get_mut(NodeId::new(2))
            .unwrap()
            .set_query_stage(QueryStage::Complete);
        assert!(table.all_queried());
    }

    #[test]
    fn test_invalid_ids_have_no_slot() {
        let mut table = NodeTable::new();
        assert!(table.init_node(NodeId::unspecified()).is_none());
        assert!(table.init_node(NodeId::broadcast()).is_none());
        assert!(table.init_node(NodeId::new(233)).is_none());
        assert!(table.init_node(NodeId::new(232)).is_some());
    }
}
