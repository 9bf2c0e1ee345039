//! Data trees and per-module forests.

use crate::path::{Path, PathSegment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use yds_common::Cid;

/// One data node. List instances are distinguished by `keys`; leaf-list
/// entries use the `(".", value)` key convention so that node identity is
/// uniformly `(name, keys)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    /// Node name within its parent.
    pub name: String,
    /// List-key values, empty for containers and leaves.
    pub keys: Vec<(String, String)>,
    /// Canonical value for leaves and leaf-list entries.
    pub value: Option<String>,
    /// Whether the node carries a schema default rather than explicit data.
    pub dflt: bool,
    /// Connection that contributed this node, for stored operational data.
    pub origin_cid: Option<Cid>,
    /// Child nodes, in insertion order.
    pub children: Vec<DataNode>,
}

impl DataNode {
    /// New interior or leaf node.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            value: None,
            dflt: false,
            origin_cid: None,
            children: Vec::new(),
        }
    }

    /// New leaf with a value.
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut n = Self::new(name);
        n.value = Some(value.into());
        n
    }

    /// Identity equality: same name and same key values.
    pub fn same_instance(&self, name: &str, keys: &[(String, String)]) -> bool {
        self.name == name && self.keys == keys
    }

    /// Whether the node matches one path segment (name or wildcard, plus
    /// all predicates).
    pub fn matches_segment(&self, seg: &PathSegment) -> bool {
        if !seg.is_wildcard() && self.name != seg.name {
            return false;
        }
        seg.predicates.iter().all(|(k, v)| {
            self.keys
                .iter()
                .any(|(nk, nv)| nk == k && nv == v)
        })
    }

    /// Find a child by identity.
    pub fn find_child(&self, name: &str, keys: &[(String, String)]) -> Option<&DataNode> {
        self.children.iter().find(|c| c.same_instance(name, keys))
    }

    /// Find a child by identity, mutably.
    pub fn find_child_mut(
        &mut self,
        name: &str,
        keys: &[(String, String)],
    ) -> Option<&mut DataNode> {
        self.children
            .iter_mut()
            .find(|c| c.same_instance(name, keys))
    }

    /// Remove a child by identity, returning it.
    pub fn remove_child(&mut self, name: &str, keys: &[(String, String)]) -> Option<DataNode> {
        let idx = self
            .children
            .iter()
            .position(|c| c.same_instance(name, keys))?;
        Some(self.children.remove(idx))
    }

    /// Total node count of this subtree, including self.
    pub fn subtree_size(&self) -> usize {
        1 + self.children.iter().map(DataNode::subtree_size).sum::<usize>()
    }

    fn sort_recursive(&mut self) {
        for child in &mut self.children {
            child.sort_recursive();
        }
        self.children
            .sort_by(|a, b| (&a.name, &a.keys).cmp(&(&b.name, &b.keys)));
    }
}

/// A forest of data trees keyed by owning module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataForest {
    /// Top-level nodes per module, in deterministic module order.
    pub modules: BTreeMap<String, Vec<DataNode>>,
}

impl DataForest {
    /// Empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no module has any data.
    pub fn is_empty(&self) -> bool {
        self.modules.values().all(Vec::is_empty)
    }

    /// Top-level nodes of one module.
    pub fn module_data(&self, module: &str) -> &[DataNode] {
        self.modules.get(module).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Detach one module's data from the forest.
    pub fn unlink_module(&mut self, module: &str) -> Vec<DataNode> {
        self.modules.remove(module).unwrap_or_default()
    }

    /// Attach top-level nodes to a module, appending after existing ones.
    pub fn extend_module(&mut self, module: &str, nodes: Vec<DataNode>) {
        if nodes.is_empty() {
            return;
        }
        self.modules.entry(module.to_string()).or_default().extend(nodes);
    }

    /// Replace one module's data.
    pub fn set_module(&mut self, module: &str, nodes: Vec<DataNode>) {
        if nodes.is_empty() {
            self.modules.remove(module);
        } else {
            self.modules.insert(module.to_string(), nodes);
        }
    }

    /// All nodes selected by `path`.
    pub fn find(&self, path: &Path) -> Vec<&DataNode> {
        let module = path.module();
        let mut level: Vec<&DataNode> = self.module_data(module).iter().collect();
        let mut matched = Vec::new();
        for (i, seg) in path.segments.iter().enumerate() {
            matched = level
                .into_iter()
                .filter(|n| n.matches_segment(seg))
                .collect();
            if i + 1 == path.segments.len() {
                return matched;
            }
            level = matched
                .iter()
                .flat_map(|n| n.children.iter())
                .collect();
        }
        matched
    }

    /// First node selected by `path`, if any.
    pub fn find_one(&self, path: &Path) -> Option<&DataNode> {
        self.find(path).into_iter().next()
    }

    /// Merge `src` into `self`. Explicit nodes win over defaults; leaves
    /// take the incoming value. `origin` overrides the origin tag of every
    /// merged node when set.
    pub fn merge(&mut self, src: DataForest, origin: Option<Cid>) {
        for (module, nodes) in src.modules {
            let dst = self.modules.entry(module).or_default();
            for node in nodes {
                merge_node(dst, node, origin);
            }
        }
    }

    /// Extract the subtrees selected by `filter` together with their
    /// ancestor chain, preserving the rest of the forest structure.
    pub fn filtered(&self, filter: &Path) -> DataForest {
        let module = filter.module();
        let mut out = DataForest::new();
        let mut roots = Vec::new();
        for node in self.module_data(module) {
            if let Some(trimmed) = filter_node(node, &filter.segments) {
                roots.push(trimmed);
            }
        }
        out.set_module(module, roots);
        out
    }

    /// Copy with every sibling list sorted by node identity. Sibling order
    /// is not semantic; canonical forms compare equal iff the forests hold
    /// the same data.
    pub fn canonicalized(&self) -> DataForest {
        let mut out = self.clone();
        for nodes in out.modules.values_mut() {
            for node in nodes.iter_mut() {
                node.sort_recursive();
            }
            nodes.sort_by(|a, b| (&a.name, &a.keys).cmp(&(&b.name, &b.keys)));
        }
        out
    }

    /// Total node count across all modules.
    pub fn size(&self) -> usize {
        self.modules
            .values()
            .flat_map(|v| v.iter())
            .map(DataNode::subtree_size)
            .sum()
    }
}

fn merge_node(dst: &mut Vec<DataNode>, mut src: DataNode, origin: Option<Cid>) {
    if let Some(cid) = origin {
        src.origin_cid = Some(cid);
    }
    match dst
        .iter_mut()
        .find(|d| d.same_instance(&src.name, &src.keys))
    {
        Some(existing) => {
            if src.value.is_some() && (!src.dflt || existing.dflt) {
                existing.value = src.value;
                existing.dflt = src.dflt;
                if src.origin_cid.is_some() {
                    existing.origin_cid = src.origin_cid;
                }
            }
            for child in src.children {
                merge_node(&mut existing.children, child, origin);
            }
        }
        None => dst.push(src),
    }
}

fn filter_node(node: &DataNode, segments: &[PathSegment]) -> Option<DataNode> {
    let seg = segments.first()?;
    if !node.matches_segment(seg) {
        return None;
    }
    if segments.len() == 1 {
        return Some(node.clone());
    }
    let children: Vec<DataNode> = node
        .children
        .iter()
        .filter_map(|c| filter_node(c, &segments[1..]))
        .collect();
    if children.is_empty() {
        return None;
    }
    let mut trimmed = node.clone();
    trimmed.children = children;
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataForest {
        let mut server = DataNode::new("server");
        let mut listen = DataNode::new("listen");
        listen.keys = vec![("name".into(), "http".into())];
        listen.children.push(DataNode::leaf("port", "80"));
        server.children.push(listen);
        server.children.push(DataNode::leaf("admin", "root"));
        let mut forest = DataForest::new();
        forest.set_module("m", vec![server]);
        forest
    }

    #[test]
    fn test_find() {
        let f = sample();
        let p = Path::parse("/m:server/listen[name='http']/port").unwrap();
        let hits = f.find(&p);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value.as_deref(), Some("80"));

        let p = Path::parse("/m:server/listen[name='https']").unwrap();
        assert!(f.find(&p).is_empty());

        let p = Path::parse("/m:server/*").unwrap();
        assert_eq!(f.find(&p).len(), 2);
    }

    #[test]
    fn test_merge_overwrites_leaf() {
        let mut f = sample();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("admin", "alice"));
        let mut src = DataForest::new();
        src.set_module("m", vec![server]);
        f.merge(src, Some(7));

        let p = Path::parse("/m:server/admin").unwrap();
        let hit = f.find_one(&p).unwrap();
        assert_eq!(hit.value.as_deref(), Some("alice"));
        assert_eq!(hit.origin_cid, Some(7));
        // Untouched sibling kept.
        let p = Path::parse("/m:server/listen[name='http']/port").unwrap();
        assert!(f.find_one(&p).is_some());
    }

    #[test]
    fn test_merge_explicit_beats_default() {
        let mut f = DataForest::new();
        let mut dflt = DataNode::leaf("timeout", "30");
        dflt.dflt = true;
        f.set_module("m", vec![dflt]);

        let mut src = DataForest::new();
        src.set_module("m", vec![DataNode::leaf("timeout", "60")]);
        f.merge(src, None);
        let hit = f.find_one(&Path::parse("/m:timeout").unwrap()).unwrap();
        assert_eq!(hit.value.as_deref(), Some("60"));
        assert!(!hit.dflt);

        // A default must not clobber explicit data.
        let mut back = DataForest::new();
        let mut d = DataNode::leaf("timeout", "30");
        d.dflt = true;
        back.set_module("m", vec![d]);
        f.merge(back, None);
        let hit = f.find_one(&Path::parse("/m:timeout").unwrap()).unwrap();
        assert_eq!(hit.value.as_deref(), Some("60"));
    }

    #[test]
    fn test_filtered_keeps_ancestors() {
        let f = sample();
        let p = Path::parse("/m:server/listen[name='http']/port").unwrap();
        let out = f.filtered(&p);
        assert_eq!(out.size(), 3);
        assert!(out.find_one(&p).is_some());
        assert!(out.find_one(&Path::parse("/m:server/admin").unwrap()).is_none());
    }
}
