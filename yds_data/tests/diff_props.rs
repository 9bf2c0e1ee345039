//! Property tests for the diff laws: apply and reverse-apply round-trips.

use proptest::prelude::*;
use yds_data::diff::forest_diff;
use yds_data::tree::{DataForest, DataNode};

/// A small random forest: flat leaves plus one container level, enough to
/// exercise create/delete/replace and nested descend nodes.
fn forest_strategy() -> impl Strategy<Value = DataForest> {
    let leaf = ("[a-f]", "[0-9]{1,3}").prop_map(|(name, val)| DataNode::leaf(name, val));
    let container = (
        "[g-j]",
        proptest::collection::vec(("[a-f]", "[0-9]{1,3}"), 0..4),
    )
        .prop_map(|(name, leaves)| {
            let mut node = DataNode::new(name);
            for (leaf_name, val) in leaves {
                if node.find_child(&leaf_name, &[]).is_none() {
                    node.children.push(DataNode::leaf(leaf_name, val));
                }
            }
            node
        });
    proptest::collection::vec(prop_oneof![leaf, container], 0..6).prop_map(|nodes| {
        let mut forest = DataForest::new();
        let mut unique: Vec<DataNode> = Vec::new();
        for node in nodes {
            if !unique.iter().any(|n| n.name == node.name) {
                unique.push(node);
            }
        }
        forest.set_module("m", unique);
        forest
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// diff(A, B) applied to A yields B.
    #[test]
    fn prop_diff_apply(a in forest_strategy(), b in forest_strategy()) {
        let diff = forest_diff(&a, &b);
        let mut state = a.clone();
        diff.apply(&mut state).unwrap();
        prop_assert_eq!(state.canonicalized(), b.canonicalized());
    }

    /// Applying a diff and then its reverse restores the original.
    #[test]
    fn prop_diff_reverse(a in forest_strategy(), b in forest_strategy()) {
        let diff = forest_diff(&a, &b);
        let mut state = a.clone();
        diff.apply(&mut state).unwrap();
        diff.reversed().apply(&mut state).unwrap();
        prop_assert_eq!(state.canonicalized(), a.canonicalized());
    }

    /// An empty diff means equal forests, and diff(A, A) is empty.
    #[test]
    fn prop_diff_identity(a in forest_strategy()) {
        prop_assert!(forest_diff(&a, &a).is_empty());
    }
}
