//! Edit trees carrying NETCONF operations and their application to data.

use crate::diff::{DiffNode, DiffOp, DiffTree};
use crate::path::Path;
use crate::tree::{DataForest, DataNode};
use serde::{Deserialize, Serialize};
use yds_common::{YdsError, YdsResult};

/// Edit operations. NETCONF operations plus the local extensions `Ether`
/// (like `None` but tolerating a missing node) and `Purge` (remove every
/// instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    /// No change to this node; it must exist. Children are processed.
    None,
    /// Like `None`, but a missing node is not an error.
    Ether,
    /// Remove all instances of the node.
    Purge,
    /// Merge: create if missing, update value if different.
    Merge,
    /// Replace the whole instance with the edit content.
    Replace,
    /// Create; the instance must not exist yet.
    Create,
    /// Delete; the instance must exist.
    Delete,
    /// Remove if present.
    Remove,
}

/// One edit node. The operation is optional and inherited from the nearest
/// ancestor carrying one; the edit root defaults to `Merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditNode {
    /// Node name.
    pub name: String,
    /// List-key values; leaf-list entries use the `(".", value)` form.
    pub keys: Vec<(String, String)>,
    /// Leaf value.
    pub value: Option<String>,
    /// Explicit operation, if any.
    pub op: Option<EditOp>,
    /// Child edit nodes.
    pub children: Vec<EditNode>,
}

impl EditNode {
    /// New edit node without an explicit operation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            value: None,
            op: None,
            children: Vec::new(),
        }
    }
}

/// A pending edit: top-level edit nodes per module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    /// `(module, node)` pairs in application order.
    pub roots: Vec<(String, EditNode)>,
}

impl Edit {
    /// Empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the edit holds no change.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Modules owning some part of this edit, deduplicated, in first-seen
    /// order.
    pub fn modules(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (module, _) in &self.roots {
            if !out.iter().any(|m| *m == module) {
                out.push(module);
            }
        }
        out
    }

    /// Add a change at `path`. Missing ancestors are created with an
    /// inherited operation; the terminal node gets `op`.
    pub fn add(&mut self, path: &Path, value: Option<&str>, op: EditOp) -> YdsResult<()> {
        let module = path.module().to_string();
        if module.is_empty() {
            return Err(YdsError::InvalArg {
                msg: format!("Path \"{}\" has no module.", path),
            });
        }

        let first = &path.segments[0];
        let root_idx = self.roots.iter().position(|(m, n)| {
            *m == module && n.name == first.name && n.keys == first.predicates
        });
        let root_idx = match root_idx {
            Some(i) => i,
            None => {
                let mut node = EditNode::new(first.name.clone());
                node.keys = first.predicates.clone();
                self.roots.push((module.clone(), node));
                self.roots.len() - 1
            }
        };

        let mut cur = &mut self.roots[root_idx].1;
        for seg in &path.segments[1..] {
            let pos = cur
                .children
                .iter()
                .position(|c| c.name == seg.name && c.keys == seg.predicates);
            let pos = match pos {
                Some(p) => p,
                None => {
                    let mut node = EditNode::new(seg.name.clone());
                    node.keys = seg.predicates.clone();
                    cur.children.push(node);
                    cur.children.len() - 1
                }
            };
            cur = &mut cur.children[pos];
        }

        cur.value = value.map(str::to_string);
        cur.op = Some(op);
        Ok(())
    }

    /// Merge another edit after this one.
    pub fn merge(&mut self, other: Edit) {
        self.roots.extend(other.roots);
    }

    /// Apply the parts of this edit owned by `module` onto `data`,
    /// appending forward-diff nodes into `diff` when given. Returns whether
    /// anything changed.
    pub fn apply_module(
        &self,
        module: &str,
        data: &mut DataForest,
        mut diff: Option<&mut DiffTree>,
    ) -> YdsResult<bool> {
        let mut changed = false;
        for (m, root) in &self.roots {
            if m != module {
                continue;
            }
            let mut nodes = data.unlink_module(module);
            let mut diff_roots = Vec::new();
            let res = apply_node(root, EditOp::Merge, &mut nodes, &mut diff_roots);
            data.set_module(module, nodes);
            res?;
            if !diff_roots.is_empty() {
                changed = true;
                if let Some(diff) = diff.as_deref_mut() {
                    diff.extend_module(module, diff_roots);
                }
            }
        }
        Ok(changed)
    }
}

fn data_from_edit(edit: &EditNode) -> DataNode {
    DataNode {
        name: edit.name.clone(),
        keys: edit.keys.clone(),
        value: edit.value.clone(),
        dflt: false,
        origin_cid: None,
        children: edit.children.iter().map(data_from_edit).collect(),
    }
}

fn diff_create(node: &DataNode) -> DiffNode {
    DiffNode {
        name: node.name.clone(),
        keys: node.keys.clone(),
        op: DiffOp::Create,
        value: node.value.clone(),
        prev_value: None,
        dflt: node.dflt,
        origin_cid: node.origin_cid,
        children: node.children.iter().map(diff_create).collect(),
    }
}

fn diff_delete(node: &DataNode) -> DiffNode {
    DiffNode {
        name: node.name.clone(),
        keys: node.keys.clone(),
        op: DiffOp::Delete,
        value: node.value.clone(),
        prev_value: None,
        dflt: node.dflt,
        origin_cid: node.origin_cid,
        children: node.children.iter().map(diff_delete).collect(),
    }
}

fn node_path(edit: &EditNode) -> String {
    let mut s = format!("/{}", edit.name);
    for (k, v) in &edit.keys {
        s.push_str(&format!("[{}='{}']", k, v));
    }
    s
}

/// Apply one edit node onto a sibling list. Emits diff nodes for effective
/// changes into `diff_out`.
fn apply_node(
    edit: &EditNode,
    inherited: EditOp,
    siblings: &mut Vec<DataNode>,
    diff_out: &mut Vec<DiffNode>,
) -> YdsResult<()> {
    let op = edit.op.unwrap_or(inherited);

    match op {
        EditOp::Purge => {
            let mut removed = Vec::new();
            siblings.retain(|n| {
                if n.name == edit.name {
                    removed.push(diff_delete(n));
                    false
                } else {
                    true
                }
            });
            diff_out.extend(removed);
            Ok(())
        }
        EditOp::Delete | EditOp::Remove => {
            match siblings
                .iter()
                .position(|n| n.same_instance(&edit.name, &edit.keys))
            {
                Some(idx) => {
                    let node = siblings.remove(idx);
                    diff_out.push(diff_delete(&node));
                    Ok(())
                }
                None if op == EditOp::Remove => Ok(()),
                None => Err(YdsError::NotFound {
                    msg: format!("Node \"{}\" to delete does not exist.", node_path(edit)),
                }),
            }
        }
        EditOp::Create => {
            if siblings
                .iter()
                .any(|n| n.same_instance(&edit.name, &edit.keys))
            {
                return Err(YdsError::Exists {
                    msg: format!("Node \"{}\" to create already exists.", node_path(edit)),
                });
            }
            let node = data_from_edit(edit);
            diff_out.push(diff_create(&node));
            siblings.push(node);
            Ok(())
        }
        EditOp::Replace => {
            match siblings
                .iter_mut()
                .find(|n| n.same_instance(&edit.name, &edit.keys))
            {
                Some(existing) => {
                    let new_node = data_from_edit(edit);
                    if *existing != new_node {
                        let mut diff = diff_delete(existing);
                        // A leaf replace keeps the node and records the
                        // previous value instead of delete+create.
                        if existing.children.is_empty() && new_node.children.is_empty() {
                            diff = DiffNode {
                                op: DiffOp::Replace,
                                prev_value: existing.value.clone(),
                                value: new_node.value.clone(),
                                children: Vec::new(),
                                ..diff
                            };
                        } else {
                            diff_out.push(diff);
                            diff = diff_create(&new_node);
                        }
                        diff_out.push(diff);
                        *existing = new_node;
                    }
                    Ok(())
                }
                None => {
                    let node = data_from_edit(edit);
                    diff_out.push(diff_create(&node));
                    siblings.push(node);
                    Ok(())
                }
            }
        }
        EditOp::Merge => {
            match siblings
                .iter_mut()
                .find(|n| n.same_instance(&edit.name, &edit.keys))
            {
                Some(existing) => {
                    if let Some(new_val) = &edit.value {
                        if existing.value.as_deref() != Some(new_val.as_str()) || existing.dflt {
                            diff_out.push(DiffNode {
                                name: existing.name.clone(),
                                keys: existing.keys.clone(),
                                op: DiffOp::Replace,
                                value: Some(new_val.clone()),
                                prev_value: existing.value.clone(),
                                dflt: false,
                                origin_cid: None,
                                children: Vec::new(),
                            });
                            existing.value = Some(new_val.clone());
                            existing.dflt = false;
                        }
                    }
                    let mut child_diffs = Vec::new();
                    for child in &edit.children {
                        apply_node(child, EditOp::Merge, &mut existing.children, &mut child_diffs)?;
                    }
                    if !child_diffs.is_empty() {
                        diff_out.push(DiffNode {
                            name: existing.name.clone(),
                            keys: existing.keys.clone(),
                            op: DiffOp::None,
                            value: None,
                            prev_value: None,
                            dflt: false,
                            origin_cid: None,
                            children: child_diffs,
                        });
                    }
                    Ok(())
                }
                None => {
                    let node = data_from_edit(edit);
                    diff_out.push(diff_create(&node));
                    siblings.push(node);
                    Ok(())
                }
            }
        }
        EditOp::None | EditOp::Ether => {
            match siblings
                .iter_mut()
                .find(|n| n.same_instance(&edit.name, &edit.keys))
            {
                Some(existing) => {
                    let mut child_diffs = Vec::new();
                    for child in &edit.children {
                        apply_node(child, op, &mut existing.children, &mut child_diffs)?;
                    }
                    if !child_diffs.is_empty() {
                        diff_out.push(DiffNode {
                            name: existing.name.clone(),
                            keys: existing.keys.clone(),
                            op: DiffOp::None,
                            value: None,
                            prev_value: None,
                            dflt: false,
                            origin_cid: None,
                            children: child_diffs,
                        });
                    }
                    Ok(())
                }
                None if op == EditOp::Ether => Ok(()),
                None => Err(YdsError::NotFound {
                    msg: format!("Node \"{}\" does not exist.", node_path(edit)),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(edit: &Edit, data: &mut DataForest) -> (bool, DiffTree) {
        let mut diff = DiffTree::new();
        let mut changed = false;
        for m in edit.modules() {
            changed |= edit.apply_module(m, data, Some(&mut diff)).unwrap();
        }
        (changed, diff)
    }

    #[test]
    fn test_merge_creates() {
        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:server/port").unwrap(), Some("80"), EditOp::Merge)
            .unwrap();
        let mut data = DataForest::new();
        let (changed, diff) = apply(&edit, &mut data);
        assert!(changed);
        let hit = data.find_one(&Path::parse("/m:server/port").unwrap()).unwrap();
        assert_eq!(hit.value.as_deref(), Some("80"));
        assert_eq!(diff.modules.len(), 1);
    }

    #[test]
    fn test_create_existing_fails() {
        let mut data = DataForest::new();
        data.set_module("m", vec![DataNode::leaf("x", "1")]);
        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:x").unwrap(), Some("2"), EditOp::Create)
            .unwrap();
        let err = edit
            .apply_module("m", &mut data, None)
            .unwrap_err();
        assert!(matches!(err, YdsError::Exists { .. }));
    }

    #[test]
    fn test_delete_missing_fails_remove_tolerates() {
        let mut data = DataForest::new();
        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:x").unwrap(), None, EditOp::Delete)
            .unwrap();
        assert!(matches!(
            edit.apply_module("m", &mut data, None).unwrap_err(),
            YdsError::NotFound { .. }
        ));

        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:x").unwrap(), None, EditOp::Remove)
            .unwrap();
        assert!(!edit.apply_module("m", &mut data, None).unwrap());
    }

    #[test]
    fn test_merge_value_change_records_prev() {
        let mut data = DataForest::new();
        data.set_module("m", vec![DataNode::leaf("x", "1")]);
        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:x").unwrap(), Some("2"), EditOp::Merge)
            .unwrap();
        let (changed, diff) = apply(&edit, &mut data);
        assert!(changed);
        let dn = &diff.modules["m"][0];
        assert_eq!(dn.op, DiffOp::Replace);
        assert_eq!(dn.prev_value.as_deref(), Some("1"));
        assert_eq!(dn.value.as_deref(), Some("2"));
    }

    #[test]
    fn test_merge_same_value_no_change() {
        let mut data = DataForest::new();
        data.set_module("m", vec![DataNode::leaf("x", "1")]);
        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:x").unwrap(), Some("1"), EditOp::Merge)
            .unwrap();
        let (changed, diff) = apply(&edit, &mut data);
        assert!(!changed);
        assert!(diff.modules.is_empty());
    }

    #[test]
    fn test_purge_removes_all_instances() {
        let mut data = DataForest::new();
        let mut a = DataNode::new("l");
        a.keys = vec![("k".into(), "1".into())];
        let mut b = DataNode::new("l");
        b.keys = vec![("k".into(), "2".into())];
        data.set_module("m", vec![a, b, DataNode::leaf("x", "1")]);

        let mut edit = Edit::new();
        edit.add(&Path::parse("/m:l").unwrap(), None, EditOp::Purge)
            .unwrap();
        let (changed, diff) = apply(&edit, &mut data);
        assert!(changed);
        assert_eq!(data.module_data("m").len(), 1);
        assert_eq!(diff.modules["m"].len(), 2);
    }
}
