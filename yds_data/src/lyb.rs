//! Binary encoding of data trees, diffs and operation payloads.
//!
//! The per-module datastore files and all event payloads carry trees in
//! this compact binary form.

use crate::diff::DiffTree;
use crate::tree::DataNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use yds_common::{YdsError, YdsResult};

fn encode<T: Serialize>(what: &str, value: &T) -> YdsResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| YdsError::Internal {
        msg: format!("Failed to encode {}: {}.", what, e),
    })
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> YdsResult<T> {
    bincode::deserialize(bytes).map_err(|e| YdsError::Internal {
        msg: format!("Failed to decode {}: {}.", what, e),
    })
}

/// Encode one module's top-level data nodes.
pub fn encode_data(nodes: &[DataNode]) -> YdsResult<Vec<u8>> {
    encode("data tree", &nodes)
}

/// Decode one module's top-level data nodes.
pub fn decode_data(bytes: &[u8]) -> YdsResult<Vec<DataNode>> {
    decode("data tree", bytes)
}

/// Encode a diff.
pub fn encode_diff(diff: &DiffTree) -> YdsResult<Vec<u8>> {
    encode("diff", diff)
}

/// Decode a diff.
pub fn decode_diff(bytes: &[u8]) -> YdsResult<DiffTree> {
    decode("diff", bytes)
}

/// Encode an arbitrary payload value for a subscription slot.
pub fn encode_payload<T: Serialize>(value: &T) -> YdsResult<Vec<u8>> {
    encode("event payload", value)
}

/// Decode an arbitrary payload value from a subscription slot.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> YdsResult<T> {
    decode("event payload", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::forest_diff;
    use crate::tree::DataForest;

    #[test]
    fn test_data_roundtrip() {
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "80"));
        let nodes = vec![server, DataNode::leaf("admin", "root")];
        let bytes = encode_data(&nodes).unwrap();
        assert_eq!(decode_data(&bytes).unwrap(), nodes);
    }

    #[test]
    fn test_diff_roundtrip() {
        let mut a = DataForest::new();
        a.set_module("m", vec![DataNode::leaf("x", "1")]);
        let mut b = DataForest::new();
        b.set_module("m", vec![DataNode::leaf("x", "2")]);
        let diff = forest_diff(&a, &b);
        let bytes = encode_diff(&diff).unwrap();
        assert_eq!(decode_diff(&bytes).unwrap(), diff);
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        assert!(decode_data(&[0xff, 0x00, 0x01]).is_err());
    }
}
