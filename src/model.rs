//! Switch rulesets as delivered by the update channel.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a [`RuleNode`].
///
/// On the wire this is the `nodeType` string: `"AND"` or `"OR"` (case-insensitive) for logical
/// nodes, empty or absent for leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeType {
    /// A factor leaf.
    #[default]
    Leaf,
    /// Logical conjunction of the children.
    And,
    /// Logical disjunction of the children.
    Or,
}

impl NodeType {
    /// Returns `true` for factor leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeType::Leaf)
    }
}

impl TryFrom<String> for NodeType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Ok(NodeType::Leaf)
        } else if value.eq_ignore_ascii_case("AND") {
            Ok(NodeType::And)
        } else if value.eq_ignore_ascii_case("OR") {
            Ok(NodeType::Or)
        } else {
            Err(format!("unsupported node type {value:?}"))
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        match value {
            NodeType::Leaf => String::new(),
            NodeType::And => "AND".to_owned(),
            NodeType::Or => "OR".to_owned(),
        }
    }
}

/// A node of a switch's boolean expression tree.
///
/// A node is either logical (`AND`/`OR` over `children`) or a leaf naming a `factor` together
/// with its opaque `config`. Trees are immutable once installed and assumed to be acyclic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleNode {
    /// Node id, unique within the tree. Used in error details.
    #[serde(default)]
    pub id: u64,
    /// Whether this is a leaf or a logical node.
    #[serde(default, skip_serializing_if = "NodeType::is_leaf")]
    pub node_type: NodeType,
    /// Operands of a logical node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RuleNode>,
    /// Factor name of a leaf.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub factor: String,
    /// Passed verbatim to the factor dispatcher.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    /// Free-form note for operators.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl RuleNode {
    /// Create an `AND` node.
    pub fn and(children: impl IntoIterator<Item = RuleNode>) -> RuleNode {
        RuleNode {
            node_type: NodeType::And,
            children: children.into_iter().collect(),
            ..RuleNode::default()
        }
    }

    /// Create an `OR` node.
    pub fn or(children: impl IntoIterator<Item = RuleNode>) -> RuleNode {
        RuleNode {
            node_type: NodeType::Or,
            children: children.into_iter().collect(),
            ..RuleNode::default()
        }
    }

    /// Create a factor leaf.
    pub fn leaf(factor: impl Into<String>, config: Value) -> RuleNode {
        RuleNode {
            factor: factor.into(),
            config,
            ..RuleNode::default()
        }
    }

    /// Set the node id.
    pub fn with_id(mut self, id: u64) -> RuleNode {
        self.id = id;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> RuleNode {
        self.description = description.into();
        self
    }
}

/// A switch and its current ruleset.
///
/// Owned by the [`RuleRegistry`](crate::RuleRegistry) and replaced wholesale on every accepted
/// update, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchModel {
    /// Server-side id.
    #[serde(default)]
    pub id: u64,
    /// Unique switch name, the registry key.
    pub name: String,
    /// Namespace the switch belongs to.
    #[serde(default)]
    pub namespace_tag: String,
    /// Environment the ruleset was published for.
    #[serde(default, rename = "currentEnvTag")]
    pub env_tag: String,
    /// Monotonic ruleset version. The registry only accepts strictly newer versions.
    #[serde(default)]
    pub version: i64,
    /// Root of the rule tree. A switch without rules is closed.
    #[serde(default)]
    pub rules: Option<RuleNode>,
    /// Free-form note for operators.
    #[serde(default)]
    pub description: String,
    /// Cache factor results for contexts opted in with
    /// [`Context::use_cache`](crate::Context::use_cache).
    #[serde(default)]
    pub use_cache: bool,
    /// When the ruleset was last changed on the server.
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

impl SwitchModel {
    /// Create a switch with the given ruleset version and rule tree.
    pub fn new(name: impl Into<String>, version: i64, rules: RuleNode) -> SwitchModel {
        SwitchModel {
            id: 0,
            name: name.into(),
            namespace_tag: String::new(),
            env_tag: String::new(),
            version,
            rules: Some(rules),
            description: String::new(),
            use_cache: false,
            update_time: None,
        }
    }

    /// Enable or disable factor caching for this switch.
    pub fn with_cache(mut self, use_cache: bool) -> SwitchModel {
        self.use_cache = use_cache;
        self
    }

    /// Set the namespace and environment tags.
    pub fn with_tags(
        mut self,
        namespace_tag: impl Into<String>,
        env_tag: impl Into<String>,
    ) -> SwitchModel {
        self.namespace_tag = namespace_tag.into();
        self.env_tag = env_tag.into();
        self
    }
}
