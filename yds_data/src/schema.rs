//! Module schemas: typed nodes, dependency extraction, validation and
//! default fill.
//!
//! The schema model is deliberately small: enough structure for the
//! datastore engine to compute dependency closures, validate instance data
//! and materialize defaults. Schema construction is the caller's job; there
//! is no schema-language parsing here.

use crate::diff::{DiffNode, DiffOp};
use crate::path::Path;
use crate::tree::{DataForest, DataNode};
use serde::{Deserialize, Serialize};
use yds_common::{YdsError, YdsResult};

/// Leaf value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Arbitrary string.
    String,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// `true`/`false`.
    Boolean,
    /// Presence-only leaf.
    Empty,
    /// Reference to an arbitrary data node; the target module is known
    /// only from instance data.
    InstanceId,
}

impl ValueType {
    /// Check a canonical string value against this type.
    pub fn check(&self, value: &str) -> bool {
        match self {
            ValueType::String => true,
            ValueType::Int64 => value.parse::<i64>().is_ok(),
            ValueType::Uint64 => value.parse::<u64>().is_ok(),
            ValueType::Boolean => matches!(value, "true" | "false"),
            ValueType::Empty => value.is_empty(),
            ValueType::InstanceId => Path::parse(value).is_ok(),
        }
    }
}

/// Schema node kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Interior node. Non-presence containers materialize automatically.
    Container {
        /// Whether the container carries meaning by existing.
        presence: bool,
    },
    /// A single leaf.
    Leaf {
        /// Value type.
        ty: ValueType,
        /// Default value materialized when the leaf is absent.
        default: Option<String>,
        /// Whether the leaf must be present when its parent is.
        mandatory: bool,
    },
    /// Multi-instance leaf.
    LeafList {
        /// Value type.
        ty: ValueType,
    },
    /// Keyed list.
    List {
        /// Key leaf names, in order.
        keys: Vec<String>,
    },
    /// RPC or action.
    Rpc {
        /// Input subtree.
        input: Vec<SchemaNode>,
        /// Output subtree.
        output: Vec<SchemaNode>,
    },
    /// Notification.
    Notification,
}

/// One schema node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaNode {
    /// Node name.
    pub name: String,
    /// Kind and kind-specific attributes.
    pub kind: NodeKind,
    /// Whether the node is configuration (`true`) or state (`false`).
    pub config: bool,
    /// Absolute path of the referenced leaf, when this leaf is a leafref.
    pub leafref: Option<String>,
    /// Feature gating this node, if any.
    pub if_feature: Option<String>,
    /// Child schema nodes (empty for leaves and RPCs).
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    /// New config container.
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Container { presence: false },
            config: true,
            leafref: None,
            if_feature: None,
            children: Vec::new(),
        }
    }

    /// New config string leaf.
    pub fn leaf(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Leaf {
                ty,
                default: None,
                mandatory: false,
            },
            config: true,
            leafref: None,
            if_feature: None,
            children: Vec::new(),
        }
    }

    /// New keyed list.
    pub fn list(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::List { keys },
            config: true,
            leafref: None,
            if_feature: None,
            children: Vec::new(),
        }
    }

    /// Mark as state data.
    pub fn state(mut self) -> Self {
        self.config = false;
        self
    }

    /// Set a default value (leaves only).
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        if let NodeKind::Leaf { default, .. } = &mut self.kind {
            *default = Some(value.into());
        }
        self
    }

    /// Add children.
    pub fn with_children(mut self, children: Vec<SchemaNode>) -> Self {
        self.children = children;
        self
    }
}

/// Module dependency kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepType {
    /// Static reference (leafref).
    Ref,
    /// Instance-identifier; target module resolved from data.
    InstId,
}

/// One data dependency of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDep {
    /// Dependency kind.
    pub dep_type: DepType,
    /// Target module name; empty for instance-identifiers.
    pub target_module: String,
    /// Path of the node carrying the dependency.
    pub xpath: String,
}

/// Dependencies of one operation (RPC/action/notification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDep {
    /// Path identifying the operation.
    pub xpath: String,
    /// Input (also notification) dependencies.
    pub in_deps: Vec<DataDep>,
    /// Output dependencies.
    pub out_deps: Vec<DataDep>,
}

/// One module schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModule {
    /// Module name.
    pub name: String,
    /// Revision date, `YYYY-MM-DD`.
    pub revision: String,
    /// Enabled features.
    pub features: Vec<String>,
    /// Top-level schema nodes.
    pub nodes: Vec<SchemaNode>,
}

impl SchemaModule {
    /// New module without nodes.
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
            features: Vec::new(),
            nodes: Vec::new(),
        }
    }

    fn feature_on(&self, node: &SchemaNode) -> bool {
        match &node.if_feature {
            Some(f) => self.features.iter().any(|have| have == f),
            None => true,
        }
    }

    /// Data dependencies of this module: leafrefs into other modules and
    /// instance-identifier leaves anywhere in the tree.
    pub fn data_deps(&self) -> Vec<DataDep> {
        let mut out = Vec::new();
        for node in &self.nodes {
            collect_deps(self, node, &format!("/{}:{}", self.name, node.name), &mut out);
        }
        out
    }

    /// Dependencies of every operation defined by this module.
    pub fn op_deps(&self) -> Vec<OpDep> {
        let mut out = Vec::new();
        for node in &self.nodes {
            if let NodeKind::Rpc { input, output } = &node.kind {
                let xpath = format!("/{}:{}", self.name, node.name);
                let mut in_deps = Vec::new();
                let mut out_deps = Vec::new();
                for child in input {
                    collect_deps(self, child, &xpath, &mut in_deps);
                }
                for child in output {
                    collect_deps(self, child, &xpath, &mut out_deps);
                }
                out.push(OpDep {
                    xpath,
                    in_deps,
                    out_deps,
                });
            } else if matches!(node.kind, NodeKind::Notification) {
                let xpath = format!("/{}:{}", self.name, node.name);
                let mut in_deps = Vec::new();
                for child in &node.children {
                    collect_deps(self, child, &xpath, &mut in_deps);
                }
                out.push(OpDep {
                    xpath,
                    in_deps,
                    out_deps: Vec::new(),
                });
            }
        }
        out
    }

    /// Find an RPC or notification schema node by its operation path.
    pub fn find_op(&self, op_path: &str) -> Option<&SchemaNode> {
        let want = op_path
            .rsplit_once(':')
            .map(|(_, n)| n)
            .unwrap_or(op_path)
            .trim_start_matches('/');
        self.nodes.iter().find(|n| {
            n.name == want
                && matches!(n.kind, NodeKind::Rpc { .. } | NodeKind::Notification)
        })
    }

    /// Validate this module's instance data. `conventional` rejects state
    /// nodes; `full` is the whole loaded forest used to resolve leafrefs.
    pub fn validate(
        &self,
        nodes: &[DataNode],
        conventional: bool,
        full: &DataForest,
    ) -> YdsResult<()> {
        for node in nodes {
            self.validate_node(node, &self.nodes, &format!("/{}:", self.name), conventional, full)?;
        }
        // Mandatory top-level leaves.
        self.check_mandatory(&self.nodes, nodes, &format!("/{}:", self.name))?;
        Ok(())
    }

    fn validate_node(
        &self,
        data: &DataNode,
        schema_level: &[SchemaNode],
        parent_path: &str,
        conventional: bool,
        full: &DataForest,
    ) -> YdsResult<()> {
        let path = format!("{}{}", parent_path, data.name);
        let schema = schema_level
            .iter()
            .find(|s| s.name == data.name && self.feature_on(s))
            .ok_or_else(|| YdsError::ValidationFailed {
                msg: format!("Node \"{}\" not found in module \"{}\".", data.name, self.name),
                xpath: Some(path.clone()),
            })?;

        if conventional && !schema.config {
            return Err(YdsError::ValidationFailed {
                msg: "State data in a conventional datastore.".to_string(),
                xpath: Some(path),
            });
        }

        match &schema.kind {
            NodeKind::Leaf { ty, .. } => {
                let value = data.value.as_deref().unwrap_or("");
                if !ty.check(value) {
                    return Err(YdsError::ValidationFailed {
                        msg: format!("Invalid value \"{}\".", value),
                        xpath: Some(path),
                    });
                }
                if let Some(target) = &schema.leafref {
                    let target = Path::parse(target)?;
                    let found = full
                        .find(&target)
                        .iter()
                        .any(|n| n.value.as_deref() == Some(value));
                    if !found {
                        return Err(YdsError::ValidationFailed {
                            msg: format!("Leafref target \"{}\" = \"{}\" not found.", target, value),
                            xpath: Some(path),
                        });
                    }
                }
            }
            NodeKind::LeafList { ty } => {
                let value = data.value.as_deref().unwrap_or("");
                if !ty.check(value) {
                    return Err(YdsError::ValidationFailed {
                        msg: format!("Invalid value \"{}\".", value),
                        xpath: Some(path),
                    });
                }
            }
            NodeKind::List { keys } => {
                for key in keys {
                    if !data.keys.iter().any(|(k, _)| k == key) {
                        return Err(YdsError::ValidationFailed {
                            msg: format!("List instance without key \"{}\".", key),
                            xpath: Some(path),
                        });
                    }
                }
            }
            NodeKind::Container { .. } => {}
            NodeKind::Rpc { .. } | NodeKind::Notification => {
                return Err(YdsError::ValidationFailed {
                    msg: format!("Operation \"{}\" in a datastore.", data.name),
                    xpath: Some(path),
                });
            }
        }

        let child_path = format!("{}/", path);
        for child in &data.children {
            self.validate_node(child, &schema.children, &child_path, conventional, full)?;
        }
        self.check_mandatory(&schema.children, &data.children, &child_path)?;
        Ok(())
    }

    fn check_mandatory(
        &self,
        schema_level: &[SchemaNode],
        data_level: &[DataNode],
        parent_path: &str,
    ) -> YdsResult<()> {
        for schema in schema_level {
            if !self.feature_on(schema) {
                continue;
            }
            if let NodeKind::Leaf {
                mandatory: true, ..
            } = schema.kind
            {
                if !data_level.iter().any(|d| d.name == schema.name) {
                    return Err(YdsError::ValidationFailed {
                        msg: format!("Mandatory leaf \"{}\" missing.", schema.name),
                        xpath: Some(format!("{}{}", parent_path, schema.name)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate an operation tree (RPC input/output or a notification).
    pub fn validate_op(&self, op: &DataNode, output: bool) -> YdsResult<()> {
        let schema = self.find_op(&op.name).ok_or_else(|| YdsError::NotFound {
            msg: format!("Operation \"{}\" not in module \"{}\".", op.name, self.name),
        })?;
        let level: &[SchemaNode] = match &schema.kind {
            NodeKind::Rpc { input, output: out } => {
                if output {
                    out
                } else {
                    input
                }
            }
            NodeKind::Notification => &schema.children,
            _ => unreachable!(),
        };
        let empty = DataForest::new();
        let parent = format!("/{}:{}/", self.name, op.name);
        for child in &op.children {
            self.validate_node(child, level, &parent, false, &empty)?;
        }
        Ok(())
    }

    /// Materialize implicit defaults into `nodes`. Created nodes are marked
    /// default and reported as Create diff entries in `diff_out`.
    pub fn add_defaults(
        &self,
        nodes: &mut Vec<DataNode>,
        mut diff_out: Option<&mut Vec<DiffNode>>,
    ) {
        add_defaults_level(self, &self.nodes, nodes, diff_out.as_deref_mut(), false);
    }

    /// Materialize non-presence containers for operational data.
    pub fn add_np_containers(&self, nodes: &mut Vec<DataNode>) {
        add_defaults_level(self, &self.nodes, nodes, None, true);
    }
}

fn collect_deps(module: &SchemaModule, node: &SchemaNode, path: &str, out: &mut Vec<DataDep>) {
    if !module.feature_on(node) {
        return;
    }
    if let NodeKind::Leaf { ty, .. } = &node.kind {
        if *ty == ValueType::InstanceId {
            out.push(DataDep {
                dep_type: DepType::InstId,
                target_module: String::new(),
                xpath: path.to_string(),
            });
        }
    }
    if let Some(target) = &node.leafref {
        if let Ok(parsed) = Path::parse(target) {
            let target_module = parsed.module().to_string();
            if target_module != module.name {
                out.push(DataDep {
                    dep_type: DepType::Ref,
                    target_module,
                    xpath: path.to_string(),
                });
            }
        }
    }
    for child in &node.children {
        let child_path = format!("{}/{}", path, child.name);
        collect_deps(module, child, &child_path, out);
    }
}

fn add_defaults_level(
    module: &SchemaModule,
    schema_level: &[SchemaNode],
    data_level: &mut Vec<DataNode>,
    mut diff_out: Option<&mut Vec<DiffNode>>,
    np_only: bool,
) {
    for schema in schema_level {
        if !module.feature_on(schema) {
            continue;
        }
        match &schema.kind {
            NodeKind::Container { presence: false } => {
                let existed = data_level.iter().any(|d| d.name == schema.name);
                let pos = match data_level.iter().position(|d| d.name == schema.name) {
                    Some(p) => p,
                    None => {
                        let mut fresh = DataNode::new(schema.name.clone());
                        fresh.dflt = true;
                        data_level.push(fresh);
                        data_level.len() - 1
                    }
                };
                let mut child_diffs = Vec::new();
                let want_diff = diff_out.is_some();
                add_defaults_level(
                    module,
                    &schema.children,
                    &mut data_level[pos].children,
                    if want_diff { Some(&mut child_diffs) } else { None },
                    np_only,
                );
                if !existed && data_level[pos].children.is_empty() && !np_only {
                    // Nothing default below; drop the container again.
                    data_level.remove(pos);
                    continue;
                }
                if let Some(diff_out) = diff_out.as_deref_mut() {
                    if !existed {
                        diff_out.push(DiffNode {
                            name: schema.name.clone(),
                            keys: Vec::new(),
                            op: DiffOp::Create,
                            value: None,
                            prev_value: None,
                            dflt: true,
                            origin_cid: None,
                            children: child_diffs,
                        });
                    } else if !child_diffs.is_empty() {
                        diff_out.push(DiffNode {
                            name: schema.name.clone(),
                            keys: Vec::new(),
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
            NodeKind::Leaf {
                default: Some(value),
                ..
            } if !np_only => {
                if !data_level.iter().any(|d| d.name == schema.name) {
                    let mut leaf = DataNode::leaf(schema.name.clone(), value.clone());
                    leaf.dflt = true;
                    if let Some(diff_out) = diff_out.as_deref_mut() {
                        diff_out.push(DiffNode {
                            name: leaf.name.clone(),
                            keys: Vec::new(),
                            op: DiffOp::Create,
                            value: leaf.value.clone(),
                            prev_value: None,
                            dflt: true,
                            origin_cid: None,
                            children: Vec::new(),
                        });
                    }
                    data_level.push(leaf);
                }
            }
            NodeKind::List { .. } => {
                // Defaults inside existing list instances only.
                for data in data_level.iter_mut().filter(|d| d.name == schema.name) {
                    add_defaults_level(module, &schema.children, &mut data.children, None, np_only);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaModule {
        let mut m = SchemaModule::new("m", "2024-01-01");
        m.nodes = vec![
            SchemaNode::container("server").with_children(vec![
                SchemaNode::leaf("port", ValueType::Uint64).with_default("8080"),
                SchemaNode::leaf("name", ValueType::String),
            ]),
            SchemaNode::leaf("counter", ValueType::Uint64).state(),
        ];
        m
    }

    #[test]
    fn test_validate_ok() {
        let m = schema();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "80"));
        let full = DataForest::new();
        m.validate(&[server], true, &full).unwrap();
    }

    #[test]
    fn test_validate_unknown_node() {
        let m = schema();
        let bogus = DataNode::leaf("nope", "1");
        let err = m.validate(&[bogus], true, &DataForest::new()).unwrap_err();
        assert!(matches!(err, YdsError::ValidationFailed { .. }));
    }

    #[test]
    fn test_validate_bad_type() {
        let m = schema();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "not-a-number"));
        let err = m
            .validate(&[server], true, &DataForest::new())
            .unwrap_err();
        assert!(matches!(err, YdsError::ValidationFailed { .. }));
    }

    #[test]
    fn test_validate_rejects_state_in_conventional() {
        let m = schema();
        let counter = DataNode::leaf("counter", "42");
        let err = m
            .validate(&[counter.clone()], true, &DataForest::new())
            .unwrap_err();
        assert!(matches!(err, YdsError::ValidationFailed { .. }));
        // Allowed in the operational datastore.
        m.validate(&[counter], false, &DataForest::new()).unwrap();
    }

    #[test]
    fn test_add_defaults() {
        let m = schema();
        let mut nodes = Vec::new();
        let mut diffs = Vec::new();
        m.add_defaults(&mut nodes, Some(&mut diffs));
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "server");
        assert!(nodes[0].dflt);
        let port = nodes[0].find_child("port", &[]).unwrap();
        assert_eq!(port.value.as_deref(), Some("8080"));
        assert!(port.dflt);
        assert!(!diffs.is_empty());
    }

    #[test]
    fn test_defaults_do_not_override() {
        let m = schema();
        let mut server = DataNode::new("server");
        server.children.push(DataNode::leaf("port", "80"));
        let mut nodes = vec![server];
        m.add_defaults(&mut nodes, None);
        let port = nodes[0].find_child("port", &[]).unwrap();
        assert_eq!(port.value.as_deref(), Some("80"));
        assert!(!port.dflt);
    }

    #[test]
    fn test_data_deps() {
        let mut m = SchemaModule::new("m", "2024-01-01");
        let mut r = SchemaNode::leaf("peer", ValueType::String);
        r.leafref = Some("/n:hosts/name".to_string());
        m.nodes = vec![r, SchemaNode::leaf("target", ValueType::InstanceId)];
        let deps = m.data_deps();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].dep_type, DepType::Ref);
        assert_eq!(deps[0].target_module, "n");
        assert_eq!(deps[1].dep_type, DepType::InstId);
    }

    #[test]
    fn test_feature_gating() {
        let mut m = schema();
        let mut extra = SchemaNode::leaf("tls", ValueType::Boolean);
        extra.if_feature = Some("tls".to_string());
        m.nodes.push(extra);

        let leaf = DataNode::leaf("tls", "true");
        assert!(m.validate(&[leaf.clone()], true, &DataForest::new()).is_err());
        m.features.push("tls".to_string());
        m.validate(&[leaf], true, &DataForest::new()).unwrap();
    }
}
