//! Named spawn points for replicas.
//!
//! Placement is nominal: a `Node` names where a replica conceptually lives,
//! and the name shows up in replica thread names and logs. Forwarding between
//! genuinely remote nodes is a transport concern outside this crate.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// A named place to spawn replicas on.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Node {
    name: Arc<str>,
}

impl Node {
    pub fn new(name: impl AsRef<str>) -> Self {
        Node { name: Arc::from(name.as_ref()) }
    }

    /// Generates a [`Vec`] of [`Node`]s based on an iterator of names.
    ///
    /// # Example
    ///
    /// ```
    /// use replicant::Node;
    /// let nodes = Node::vec_from(["a", "b", "c"]);
    /// ```
    pub fn vec_from<T>(names: impl IntoIterator<Item = T>) -> Vec<Node>
    where
        T: AsRef<str>,
    {
        names.into_iter().map(Node::new).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nodes_compare_by_name() {
        assert_eq!(Node::new("a"), Node::new("a"));
        assert_ne!(Node::new("a"), Node::new("b"));
        let names: Vec<_> = Node::vec_from(["x", "y"]).iter().map(|n| n.name().to_owned()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }
}
