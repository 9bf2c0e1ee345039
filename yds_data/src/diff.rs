//! Change-describing trees with forward operations and reverse values.

use crate::tree::{DataForest, DataNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use yds_common::{Cid, YdsError, YdsResult};

/// Forward diff operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOp {
    /// Subtree was created.
    Create,
    /// Subtree was deleted.
    Delete,
    /// Leaf value changed; `prev_value` holds the old value.
    Replace,
    /// No change at this node, only in descendants.
    None,
}

/// One diff node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffNode {
    /// Node name.
    pub name: String,
    /// List-key values.
    pub keys: Vec<(String, String)>,
    /// Operation.
    pub op: DiffOp,
    /// New value (Create/Replace) or deleted value (Delete).
    pub value: Option<String>,
    /// Previous value for Replace; the reverse value.
    pub prev_value: Option<String>,
    /// Whether the new value is a schema default.
    pub dflt: bool,
    /// Connection that contributed the change, for stored operational data.
    pub origin_cid: Option<Cid>,
    /// Child diff nodes.
    pub children: Vec<DiffNode>,
}

impl DiffNode {
    fn same_instance(&self, other: &DiffNode) -> bool {
        self.name == other.name && self.keys == other.keys
    }

    fn reversed(&self) -> DiffNode {
        let (op, value, prev_value) = match self.op {
            DiffOp::Create => (DiffOp::Delete, self.value.clone(), None),
            DiffOp::Delete => (DiffOp::Create, self.value.clone(), None),
            DiffOp::Replace => (DiffOp::Replace, self.prev_value.clone(), self.value.clone()),
            DiffOp::None => (DiffOp::None, None, None),
        };
        DiffNode {
            name: self.name.clone(),
            keys: self.keys.clone(),
            op,
            value,
            prev_value,
            dflt: self.dflt,
            origin_cid: self.origin_cid,
            children: self.children.iter().map(DiffNode::reversed).collect(),
        }
    }

    /// Whether this subtree carries an effective change.
    pub fn has_changes(&self) -> bool {
        self.op != DiffOp::None || self.children.iter().any(DiffNode::has_changes)
    }
}

/// A diff forest keyed by owning module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTree {
    /// Top-level diff nodes per module.
    pub modules: BTreeMap<String, Vec<DiffNode>>,
}

impl DiffTree {
    /// Empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the diff holds no change at all.
    pub fn is_empty(&self) -> bool {
        !self
            .modules
            .values()
            .flat_map(|v| v.iter())
            .any(DiffNode::has_changes)
    }

    /// Top-level diff nodes of one module.
    pub fn module_diff(&self, module: &str) -> &[DiffNode] {
        self.modules.get(module).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append diff roots to one module.
    pub fn extend_module(&mut self, module: &str, nodes: Vec<DiffNode>) {
        if nodes.is_empty() {
            return;
        }
        self.modules
            .entry(module.to_string())
            .or_default()
            .extend(nodes);
    }

    /// Extract one module's part as its own diff.
    pub fn split_module(&self, module: &str) -> DiffTree {
        let mut out = DiffTree::new();
        if let Some(nodes) = self.modules.get(module) {
            out.modules.insert(module.to_string(), nodes.clone());
        }
        out
    }

    /// Diff with every operation reversed; applying it undoes this diff.
    pub fn reversed(&self) -> DiffTree {
        DiffTree {
            modules: self
                .modules
                .iter()
                .map(|(m, nodes)| (m.clone(), nodes.iter().map(DiffNode::reversed).collect()))
                .collect(),
        }
    }

    /// Apply this diff onto `data`.
    pub fn apply(&self, data: &mut DataForest) -> YdsResult<()> {
        for (module, nodes) in &self.modules {
            let mut mod_data = data.unlink_module(module);
            let res = nodes
                .iter()
                .try_for_each(|n| apply_diff_node(n, &mut mod_data));
            data.set_module(module, mod_data);
            res?;
        }
        Ok(())
    }

    /// Merge `src` into this diff. When `origin` is set, every merged node
    /// is tagged with it.
    pub fn merge(&mut self, src: &DiffTree, origin: Option<Cid>) {
        for (module, nodes) in &src.modules {
            let dst = self.modules.entry(module.clone()).or_default();
            for node in nodes {
                merge_diff_node(dst, node, origin);
            }
        }
    }

    /// Drop every node contributed by `cid`, pruning emptied parents.
    pub fn remove_by_origin(&mut self, cid: Cid) {
        for nodes in self.modules.values_mut() {
            remove_origin(nodes, cid);
        }
        self.modules.retain(|_, v| !v.is_empty());
    }
}

fn apply_diff_node(diff: &DiffNode, siblings: &mut Vec<DataNode>) -> YdsResult<()> {
    match diff.op {
        DiffOp::Create => {
            if siblings
                .iter()
                .any(|n| n.same_instance(&diff.name, &diff.keys))
            {
                return Err(YdsError::Exists {
                    msg: format!("Diff create: node \"{}\" already exists.", diff.name),
                });
            }
            siblings.push(data_from_diff(diff));
            Ok(())
        }
        DiffOp::Delete => {
            let idx = siblings
                .iter()
                .position(|n| n.same_instance(&diff.name, &diff.keys))
                .ok_or_else(|| YdsError::NotFound {
                    msg: format!("Diff delete: node \"{}\" does not exist.", diff.name),
                })?;
            siblings.remove(idx);
            Ok(())
        }
        DiffOp::Replace => {
            let node = siblings
                .iter_mut()
                .find(|n| n.same_instance(&diff.name, &diff.keys))
                .ok_or_else(|| YdsError::NotFound {
                    msg: format!("Diff replace: node \"{}\" does not exist.", diff.name),
                })?;
            node.value = diff.value.clone();
            node.dflt = diff.dflt;
            Ok(())
        }
        DiffOp::None => {
            let node = siblings
                .iter_mut()
                .find(|n| n.same_instance(&diff.name, &diff.keys))
                .ok_or_else(|| YdsError::NotFound {
                    msg: format!("Diff descend: node \"{}\" does not exist.", diff.name),
                })?;
            diff.children
                .iter()
                .try_for_each(|c| apply_diff_node(c, &mut node.children))
        }
    }
}

fn data_from_diff(diff: &DiffNode) -> DataNode {
    DataNode {
        name: diff.name.clone(),
        keys: diff.keys.clone(),
        value: diff.value.clone(),
        dflt: diff.dflt,
        origin_cid: diff.origin_cid,
        children: diff.children.iter().map(data_from_diff).collect(),
    }
}

fn merge_diff_node(dst: &mut Vec<DiffNode>, src: &DiffNode, origin: Option<Cid>) {
    let mut src = src.clone();
    if let Some(cid) = origin {
        tag_origin(&mut src, cid);
    }
    let Some(idx) = dst.iter().position(|d| d.same_instance(&src)) else {
        dst.push(src);
        return;
    };
    let existing = &mut dst[idx];
    match (existing.op, src.op) {
        // A created node deleted again cancels out entirely.
        (DiffOp::Create, DiffOp::Delete) => {
            dst.remove(idx);
        }
        (DiffOp::Create, DiffOp::Replace) => {
            existing.value = src.value;
            existing.dflt = src.dflt;
            if src.origin_cid.is_some() {
                existing.origin_cid = src.origin_cid;
            }
            for child in src.children {
                merge_diff_node(&mut existing.children, &child, origin);
            }
        }
        (DiffOp::Replace, DiffOp::Replace) => {
            // Keep the original reverse value, take the newest forward one.
            existing.value = src.value;
            existing.dflt = src.dflt;
            if src.origin_cid.is_some() {
                existing.origin_cid = src.origin_cid;
            }
        }
        (_, DiffOp::None) => {
            for child in src.children {
                merge_diff_node(&mut existing.children, &child, origin);
            }
        }
        _ => {
            *existing = src;
        }
    }
}

fn tag_origin(node: &mut DiffNode, cid: Cid) {
    node.origin_cid = Some(cid);
    for child in &mut node.children {
        tag_origin(child, cid);
    }
}

fn remove_origin(nodes: &mut Vec<DiffNode>, cid: Cid) {
    nodes.retain_mut(|n| {
        remove_origin(&mut n.children, cid);
        if n.origin_cid == Some(cid) && n.children.is_empty() {
            return false;
        }
        // A pure descend node with no children left is dead weight.
        !(n.op == DiffOp::None && n.children.is_empty())
    });
}

/// Compute the diff turning `a` into `b`, per module.
pub fn forest_diff(a: &DataForest, b: &DataForest) -> DiffTree {
    let mut out = DiffTree::new();
    let mut modules: Vec<&String> = a.modules.keys().chain(b.modules.keys()).collect();
    modules.sort();
    modules.dedup();
    for module in modules {
        let nodes = sibling_diff(a.module_data(module), b.module_data(module));
        out.extend_module(module, nodes);
    }
    out
}

fn sibling_diff(a: &[DataNode], b: &[DataNode]) -> Vec<DiffNode> {
    let mut out = Vec::new();
    for old in a {
        match b.iter().find(|n| n.same_instance(&old.name, &old.keys)) {
            None => {
                let mut d = DiffNode {
                    name: old.name.clone(),
                    keys: old.keys.clone(),
                    op: DiffOp::Delete,
                    value: old.value.clone(),
                    prev_value: None,
                    dflt: old.dflt,
                    origin_cid: old.origin_cid,
                    children: Vec::new(),
                };
                d.children = old.children.iter().map(delete_diff).collect();
                out.push(d);
            }
            Some(new) => {
                let child_diffs = sibling_diff(&old.children, &new.children);
                let value_changed = old.value != new.value || old.dflt != new.dflt;
                if value_changed {
                    out.push(DiffNode {
                        name: old.name.clone(),
                        keys: old.keys.clone(),
                        op: DiffOp::Replace,
                        value: new.value.clone(),
                        prev_value: old.value.clone(),
                        dflt: new.dflt,
                        origin_cid: new.origin_cid,
                        children: child_diffs,
                    });
                } else if !child_diffs.is_empty() {
                    out.push(DiffNode {
                        name: old.name.clone(),
                        keys: old.keys.clone(),
                        op: DiffOp::None,
                        value: None,
                        prev_value: None,
                        dflt: false,
                        origin_cid: None,
                        children: child_diffs,
                    });
                }
            }
        }
    }
    for new in b {
        if !a.iter().any(|n| n.same_instance(&new.name, &new.keys)) {
            out.push(create_diff(new));
        }
    }
    out
}

fn create_diff(node: &DataNode) -> DiffNode {
    DiffNode {
        name: node.name.clone(),
        keys: node.keys.clone(),
        op: DiffOp::Create,
        value: node.value.clone(),
        prev_value: None,
        dflt: node.dflt,
        origin_cid: node.origin_cid,
        children: node.children.iter().map(create_diff).collect(),
    }
}

fn delete_diff(node: &DataNode) -> DiffNode {
    DiffNode {
        name: node.name.clone(),
        keys: node.keys.clone(),
        op: DiffOp::Delete,
        value: node.value.clone(),
        prev_value: None,
        dflt: node.dflt,
        origin_cid: node.origin_cid,
        children: node.children.iter().map(delete_diff).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;

    fn forest(pairs: &[(&str, &str)]) -> DataForest {
        let mut f = DataForest::new();
        let mut nodes = Vec::new();
        for (name, val) in pairs {
            nodes.push(DataNode::leaf(*name, *val));
        }
        f.set_module("m", nodes);
        f
    }

    #[test]
    fn test_diff_apply_yields_target() {
        let a = forest(&[("x", "1"), ("y", "2")]);
        let b = forest(&[("x", "9"), ("z", "3")]);
        let diff = forest_diff(&a, &b);

        let mut applied = a.clone();
        diff.apply(&mut applied).unwrap();
        assert_eq!(applied, b);
    }

    #[test]
    fn test_reverse_diff_restores_original() {
        let a = forest(&[("x", "1"), ("y", "2")]);
        let b = forest(&[("x", "9"), ("z", "3")]);
        let diff = forest_diff(&a, &b);

        let mut state = a.clone();
        diff.apply(&mut state).unwrap();
        diff.reversed().apply(&mut state).unwrap();
        assert_eq!(state, a);
    }

    #[test]
    fn test_nested_diff() {
        let mut a = DataForest::new();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "80"));
        a.set_module("m", vec![server]);

        let mut b = DataForest::new();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "443"));
        b.set_module("m", vec![server]);

        let diff = forest_diff(&a, &b);
        let top = &diff.modules["m"][0];
        assert_eq!(top.op, DiffOp::None);
        assert_eq!(top.children[0].op, DiffOp::Replace);
        assert_eq!(top.children[0].prev_value.as_deref(), Some("80"));

        let mut applied = a.clone();
        diff.apply(&mut applied).unwrap();
        assert_eq!(applied, b);
    }

    #[test]
    fn test_merge_create_then_delete_cancels() {
        let a = forest(&[]);
        let b = forest(&[("x", "1")]);
        let mut diff = forest_diff(&a, &b);
        let back = forest_diff(&b, &a);
        diff.merge(&back, None);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_remove_by_origin() {
        let a = forest(&[]);
        let b = forest(&[("x", "1"), ("y", "2")]);
        let mut diff = forest_diff(&a, &b);
        for node in diff.modules.get_mut("m").unwrap() {
            if node.name == "x" {
                node.origin_cid = Some(4);
            } else {
                node.origin_cid = Some(5);
            }
        }
        diff.remove_by_origin(4);
        let names: Vec<&str> = diff.modules["m"].iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["y"]);
    }

    #[test]
    fn test_filtered_diff_by_module() {
        let mut a = forest(&[("x", "1")]);
        a.set_module("n", vec![DataNode::leaf("w", "0")]);
        let mut b = forest(&[("x", "2")]);
        b.set_module("n", vec![DataNode::leaf("w", "9")]);
        let diff = forest_diff(&a, &b);
        let only_m = diff.split_module("m");
        assert!(only_m.modules.contains_key("m"));
        assert!(!only_m.modules.contains_key("n"));
        assert!(
            only_m
                .module_diff("m")
                .iter()
                .all(|n| n.op == DiffOp::Replace)
        );
        let _ = Path::parse("/m:x").unwrap();
    }
}
