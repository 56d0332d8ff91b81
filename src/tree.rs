use std::fmt;
use std::sync::Arc;

/// A node of the hierarchical input data.
///
/// Nodes are immutable once built and shared through `Arc`, so copies of a
/// sequence never clone the underlying tree. The storage engine proper is
/// out of scope; this is just enough structure for path navigation and for
/// context-dependent expressions to have something to focus on.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Node {
    name: String,
    value: Option<String>,
    children: Vec<Arc<Node>>,
}

impl Node {
    /// A leaf node carrying a textual value.
    pub fn leaf(name: &str, value: &str) -> Arc<Node> {
        Arc::new(Self {
            name: name.to_owned(),
            value: Some(value.to_owned()),
            children: Vec::new(),
        })
    }

    /// An inner node with the given children.
    pub fn element(name: &str, children: Vec<Arc<Node>>) -> Arc<Node> {
        Arc::new(Self {
            name: name.to_owned(),
            value: None,
            children,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    /// Direct children with the given name, in document order.
    pub fn select(&self, name: &str) -> Vec<Arc<Node>> {
        self.children
            .iter()
            .filter(|child| child.name == name)
            .cloned()
            .collect()
    }

    /// The concatenated text of this node and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(value) = &self.value {
            out.push_str(value);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.children.is_empty() {
            match &self.value {
                Some(value) => write!(f, "<{}>{}</{}>", self.name, value, self.name),
                None => write!(f, "<{}/>", self.name),
            }
        } else {
            write!(f, "<{}>", self.name)?;
            for child in &self.children {
                write!(f, "{child}")?;
            }
            write!(f, "</{}>", self.name)
        }
    }
}
