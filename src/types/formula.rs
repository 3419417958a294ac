//! Formula tree — canonical in-memory form of a Content MathML expression.
//!
//! Nodes live in an arena owned by [`FormulaTree`] and are addressed by
//! [`NodeId`]. Parents own their children by listing their ids; the parent
//! link is a plain id, so walking up is O(1) and nothing is reference
//! counted. The root is always [`FormulaTree::ROOT`].
//!
//! A tree is built top-down by the query parser and is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Tag of the query-variable marker element.
pub const QVAR_TAG: &str = "mws:qvar";

/// XPath of every root node.
pub const ROOT_XPATH: &str = "/*[1]";

/// Namespace prefix stripped from Content MathML tags.
const MATHML_PREFIX: &str = "m:";

/// Compact node identifier (index into the arena).
pub type NodeId = u32;

/// Whether a node is a query variable or a fixed symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Var,
    Constant,
}

#[derive(Debug, Clone)]
struct FormulaNode {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    xpath: String,
    /// Position handed to the next child; never reused after a removal
    next_position: u32,
}

impl FormulaNode {
    fn new(parent: Option<NodeId>, xpath: String) -> Self {
        Self {
            tag: String::new(),
            attributes: BTreeMap::new(),
            text: String::new(),
            parent,
            children: Vec::new(),
            xpath,
            next_position: 1,
        }
    }
}

/// A formula tree: an arena of nodes rooted at [`FormulaTree::ROOT`].
///
/// `Clone` is a deep copy; the copy shares nothing with the original.
#[derive(Debug, Clone)]
pub struct FormulaTree {
    nodes: Vec<Option<FormulaNode>>,
    mode: bool,
}

impl FormulaTree {
    /// Id of the root node.
    pub const ROOT: NodeId = 0;

    /// Create a tree holding a single empty root node.
    ///
    /// `mode` is the parsing dialect flag; every node of the tree reports it.
    pub fn new_root(mode: bool) -> Self {
        Self {
            nodes: vec![Some(FormulaNode::new(None, ROOT_XPATH.to_string()))],
            mode,
        }
    }

    /// Dialect flag chosen at construction.
    pub fn mode(&self) -> bool {
        self.mode
    }

    /// Read-only view of the root.
    pub fn root(&self) -> NodeRef<'_> {
        NodeRef {
            tree: self,
            id: Self::ROOT,
            node: self.slot(Self::ROOT),
        }
    }

    /// Mutable view of the root.
    pub fn root_mut(&mut self) -> NodeMut<'_> {
        NodeMut {
            tree: self,
            id: Self::ROOT,
        }
    }

    /// Read-only view of a live node.
    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_>> {
        let node = self.nodes.get(id as usize)?.as_ref()?;
        Some(NodeRef { tree: self, id, node })
    }

    /// Mutable view of a live node.
    pub fn node_mut(&mut self, id: NodeId) -> Option<NodeMut<'_>> {
        match self.nodes.get(id as usize) {
            Some(Some(_)) => Some(NodeMut { tree: self, id }),
            _ => None,
        }
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Detach `id` from its parent and free it together with every descendant.
    ///
    /// Returns the number of nodes freed, or `None` if `id` is the root or
    /// not a live node. Remaining siblings keep their xpaths.
    pub fn remove_subtree(&mut self, id: NodeId) -> Option<usize> {
        let parent = self.nodes.get(id as usize)?.as_ref()?.parent?;
        self.slot_mut(parent).children.retain(|&c| c != id);

        let mut freed = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(current as usize).and_then(Option::take) {
                stack.extend(node.children);
                freed += 1;
            }
        }
        Some(freed)
    }

    fn slot(&self, id: NodeId) -> &FormulaNode {
        match self.nodes.get(id as usize) {
            Some(Some(node)) => node,
            _ => unreachable!("node {} is not live", id),
        }
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut FormulaNode {
        match self.nodes.get_mut(id as usize) {
            Some(Some(node)) => node,
            _ => unreachable!("node {} is not live", id),
        }
    }
}

/// Mutable handle used while building a tree.
pub struct NodeMut<'a> {
    tree: &'a mut FormulaTree,
    id: NodeId,
}

impl<'a> NodeMut<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Store the tag, stripping a leading `m:` prefix once.
    pub fn set_tag(&mut self, raw: &str) {
        let tag = raw.strip_prefix(MATHML_PREFIX).unwrap_or(raw);
        self.tree.slot_mut(self.id).tag = tag.to_string();
    }

    /// Insert an attribute; a repeated key overwrites the earlier value.
    pub fn add_attribute(&mut self, key: &str, value: &str) {
        self.tree
            .slot_mut(self.id)
            .attributes
            .insert(key.to_string(), value.to_string());
    }

    /// Append character data, dropping ASCII whitespace (`\v` included).
    /// Other Unicode spaces are kept: they are part of the node's meaning.
    pub fn append_text(&mut self, text: &str) {
        let node = self.tree.slot_mut(self.id);
        node.text.reserve(text.len());
        node.text.extend(text.chars().filter(|&c| !is_c_space(c)));
    }

    /// Append a new empty child and return its id.
    pub fn new_child(&mut self) -> NodeId {
        let child_id = self.tree.nodes.len() as NodeId;
        let parent = self.tree.slot_mut(self.id);
        let position = parent.next_position;
        parent.next_position += 1;
        parent.children.push(child_id);
        let xpath = format!("{}/*[{}]", parent.xpath, position);

        self.tree
            .nodes
            .push(Some(FormulaNode::new(Some(self.id), xpath)));
        child_id
    }
}

/// Read-only view of one node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a FormulaTree,
    id: NodeId,
    node: &'a FormulaNode,
}

impl<'a> std::fmt::Debug for NodeRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("tag", &self.node.tag)
            .field("xpath", &self.node.xpath)
            .finish()
    }
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tag(&self) -> &'a str {
        &self.node.tag
    }

    pub fn text_content(&self) -> &'a str {
        &self.node.text
    }

    pub fn mode(&self) -> bool {
        self.tree.mode
    }

    pub fn attributes(&self) -> &'a BTreeMap<String, String> {
        &self.node.attributes
    }

    pub fn get_attribute(&self, key: &str) -> Option<&'a str> {
        self.node.attributes.get(key).map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.node.parent.is_none()
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        self.node.parent.and_then(|p| self.tree.node(p))
    }

    /// Children in argument order.
    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        let node = self.node;
        node.children.iter().filter_map(move |&c| tree.node(c))
    }

    pub fn token_type(&self) -> TokenType {
        if self.node.tag == QVAR_TAG {
            TokenType::Var
        } else {
            TokenType::Constant
        }
    }

    pub fn is_var(&self) -> bool {
        self.token_type() == TokenType::Var
    }

    /// Name of a query variable (its text content).
    pub fn var_name(&self) -> Option<&'a str> {
        self.is_var().then_some(self.node.text.as_str())
    }

    /// Matching key used by the index layer.
    ///
    /// Text-derived meanings get a `#` prefix so `<ci>eq</ci>` and `<eq/>`
    /// stay distinct.
    pub fn meaning(&self) -> String {
        let node = self.node;
        if node.tag == QVAR_TAG {
            QVAR_TAG.to_string()
        } else if node.tag == "apply" || node.text.is_empty() {
            node.tag.clone()
        } else {
            format!("#{}", node.text)
        }
    }

    pub fn arity(&self) -> usize {
        self.node.children.len()
    }

    /// Number of nodes in this subtree, this one included.
    pub fn expr_size(&self) -> usize {
        1 + self.children().map(|c| c.expr_size()).sum::<usize>()
    }

    /// 0 for a leaf, otherwise one more than the deepest child.
    pub fn expr_depth(&self) -> usize {
        self.children()
            .map(|c| c.expr_depth() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn xpath(&self) -> &'a str {
        &self.node.xpath
    }

    /// XPath without the leading root selector.
    pub fn xpath_relative(&self) -> &'a str {
        self.node
            .xpath
            .strip_prefix(ROOT_XPATH)
            .unwrap_or(&self.node.xpath)
    }

    /// Order-sensitive structural equality on type, meaning and children.
    ///
    /// Variables are compared like any other node; no wildcard matching.
    pub fn equals(&self, other: &NodeRef<'_>) -> bool {
        if self.token_type() != other.token_type() {
            return false;
        }
        if self.meaning() != other.meaning() {
            return false;
        }
        if self.arity() != other.arity() {
            return false;
        }
        self.children()
            .zip(other.children())
            .all(|(a, b)| a.equals(&b))
    }

    /// Render the subtree as indented pseudo-XML.
    pub fn to_pretty_string(&self, indent: usize) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, indent);
        out
    }

    fn write_pretty(&self, out: &mut String, indent: usize) {
        let padding = " ".repeat(indent);
        let _ = write!(out, "{}<{} ", padding, self.node.tag);
        for (key, value) in &self.node.attributes {
            let _ = write!(out, "{}=\"{}\" ", key, value);
        }
        let _ = write!(out, ">{}", self.node.text);

        if !self.node.children.is_empty() {
            out.push('\n');
            for child in self.children() {
                child.write_pretty(out, indent + 2);
            }
            out.push_str(&padding);
        }
        let _ = writeln!(out, "</{}>", self.node.tag);
    }
}

/// The C locale's `isspace` set.
fn is_c_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
}
