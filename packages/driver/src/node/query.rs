use crate::message::Message;
use bytes::Bytes;
use zwire_core::prelude::*;

/// The ordered interview a node goes through after discovery. Stages up to
/// `NodeInfo` are answered by the controller itself; later stages are driven
/// by the command-class handlers registered for the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryStage {
    None,
    ProtocolInfo,
    NodeInfo,
    ManufacturerSpecific1,
    Versions,
    Instances,
    Static,
    Associations,
    Neighbors,
    Session,
    Dynamic,
    Configuration,
    Complete,
}

impl QueryStage {
    pub fn next(&self) -> QueryStage {
        use QueryStage::*;
        match self {
            None => ProtocolInfo,
            ProtocolInfo => NodeInfo,
            NodeInfo => ManufacturerSpecific1,
            ManufacturerSpecific1 => Versions,
            Versions => Instances,
            Instances => Static,
            Static => Associations,
            Associations => Neighbors,
            Neighbors => Session,
            Session => Dynamic,
            Dynamic => Configuration,
            Configuration | Complete => Complete,
        }
    }

    /// The exchanges the driver core itself issues for this stage. Stages not
    /// listed here are populated by command-class handlers (or skipped when
    /// none contributes).
    pub(crate) fn core_queries(&self, node: NodeId) -> Vec<Message> {
        match self {
            QueryStage::ProtocolInfo => vec![Message::builder()
                .frame(zwire_serial::frame::DataFrame::request(
                    FunctionType::GetNodeProtocolInfo,
                    Bytes::copy_from_slice(&[node.into()]),
                ))
                .target_node(node)
                .expected_reply(FunctionType::GetNodeProtocolInfo as u8)
                .build()],
            QueryStage::NodeInfo => vec![Message::builder()
                .frame(zwire_serial::frame::DataFrame::request(
                    FunctionType::RequestNodeInfo,
                    Bytes::copy_from_slice(&[node.into()]),
                ))
                .target_node(node)
                // The node information itself arrives as an ApplicationUpdate
                .expected_reply(FunctionType::ApplicationUpdate as u8)
                .build()],
            QueryStage::Neighbors => vec![Message::builder()
                .frame(zwire_serial::frame::DataFrame::request(
                    FunctionType::GetRoutingInfo,
                    Bytes::copy_from_slice(&[node.into(), 0x00, 0x00]),
                ))
                .target_node(node)
                .expected_reply(FunctionType::GetRoutingInfo as u8)
                .build()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = QueryStage::None;
        let mut seen = vec![stage];
        while stage != QueryStage::Complete {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(seen.len(), 13);
        assert_eq!(seen.first(), Some(&QueryStage::None));
        assert_eq!(seen.last(), Some(&QueryStage::Complete));
        // Complete is terminal
        assert_eq!(QueryStage::Complete.next(), QueryStage::Complete);
    }

    #[test]
    fn test_core_stage_queries() {
        let node = NodeId::new(12);
        let protocol = QueryStage::ProtocolInfo.core_queries(node);
        assert_eq!(protocol.len(), 1);
        assert_eq!(protocol[0].function(), 0x41);
        assert_eq!(protocol[0].frame().payload[0], 12);

        let info = QueryStage::NodeInfo.core_queries(node);
        assert_eq!(info[0].function(), 0x60);
        assert_eq!(info[0].expected_reply(), 0x49);

        assert!(QueryStage::Versions.core_queries(node).is_empty());
    }
}
