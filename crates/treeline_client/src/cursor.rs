//! Iteration over children and subtrees.

use crate::error::ClientResult;
use crate::node::Node;

/// Steps one reusable cursor through the children of a node.
///
/// [`Children::advance`] lends the cursor until the next call, so each
/// child can be read or written without a fresh allocation. Clone the
/// yielded node to keep it.
#[derive(Debug)]
pub struct Children<'c> {
    cursor: Node<'c>,
    reverse: bool,
    done: bool,
}

impl<'c> Children<'c> {
    pub(crate) fn new(cursor: Node<'c>, reverse: bool) -> Self {
        Self {
            cursor,
            reverse,
            done: false,
        }
    }

    /// Moves to the next child, returning `None` once they are exhausted.
    pub fn advance(&mut self) -> ClientResult<Option<&Node<'c>>> {
        if self.done {
            return Ok(None);
        }
        match self.cursor.advance(self.reverse) {
            Ok(true) => Ok(Some(&self.cursor)),
            Ok(false) => {
                self.done = true;
                Ok(None)
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }
}

/// Depth-first iterator over the descendants of a node that have values.
///
/// Yields immutable snapshots in collation order and ends when the walk
/// leaves the subtree. An error ends the iteration after it is yielded.
#[derive(Debug)]
pub struct Tree<'c> {
    origin: Node<'c>,
    cursor: Option<Node<'c>>,
}

impl<'c> Tree<'c> {
    pub(crate) fn new(origin: Node<'c>) -> Self {
        Self {
            cursor: Some(origin.clone()),
            origin,
        }
    }
}

impl<'c> Iterator for Tree<'c> {
    type Item = ClientResult<Node<'c>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.take()?;
        match cursor.tree_next() {
            Ok(Some(next)) if next.is_below(&self.origin) => {
                self.cursor = Some(next.clone());
                Some(Ok(next))
            }
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Client, ClientConfig};
    use std::sync::Arc;
    use treeline_engine::MemoryEngine;

    fn client() -> Client {
        Client::init(Arc::new(MemoryEngine::new()), ClientConfig::default())
    }

    #[test]
    fn children_forward_and_reverse() {
        let client = client();
        let conn = client.conn();
        let root = conn.node("^c", &["p"]).unwrap();
        for sub in ["z", "1", "m", "-5"] {
            root.child(&[sub]).unwrap().set("").unwrap();
        }
        root.child(&["m", "deep"]).unwrap().set("").unwrap();
        conn.node("^c", &["q"]).unwrap().set("").unwrap();

        let mut forward = Vec::new();
        let mut children = root.children().unwrap();
        while let Some(child) = children.advance().unwrap() {
            assert!(child.is_mutable());
            forward.push(String::from_utf8(child.subscript(-1).unwrap()).unwrap());
        }
        assert_eq!(forward, ["-5", "1", "m", "z"]);
        assert!(children.advance().unwrap().is_none());

        let mut reverse = Vec::new();
        let mut children = root.children_rev().unwrap();
        while let Some(child) = children.advance().unwrap() {
            reverse.push(String::from_utf8(child.subscript(-1).unwrap()).unwrap());
        }
        forward.reverse();
        assert_eq!(reverse, forward);
    }

    #[test]
    fn children_can_write_through_the_cursor() {
        let client = client();
        let conn = client.conn();
        let root = conn.var("^w").unwrap();
        for sub in ["a", "b"] {
            root.child(&[sub]).unwrap().set("0").unwrap();
        }
        let mut children = root.children().unwrap();
        while let Some(child) = children.advance().unwrap() {
            child.incr("5").unwrap();
        }
        assert_eq!(root.child(&["a"]).unwrap().get().unwrap(), b"5");
        assert_eq!(root.child(&["b"]).unwrap().get().unwrap(), b"5");
    }

    #[test]
    fn empty_node_has_no_children() {
        let client = client();
        let conn = client.conn();
        let mut children = conn.var("^empty").unwrap().children().unwrap();
        assert!(children.advance().unwrap().is_none());
        assert_eq!(conn.var("^empty").unwrap().tree().count(), 0);
    }

    #[test]
    fn tree_stays_inside_the_subtree() {
        let client = client();
        let conn = client.conn();
        let root = conn.var("^t").unwrap();
        root.child(&["a"]).unwrap().set("1").unwrap();
        root.child(&["a", "1"]).unwrap().set("2").unwrap();
        root.child(&["a", "1", "x"]).unwrap().set("3").unwrap();
        root.child(&["b"]).unwrap().set("4").unwrap();

        let a = root.child(&["a"]).unwrap();
        let below: Vec<String> = a.tree().map(|n| n.unwrap().to_string()).collect();
        assert_eq!(below, ["^t(\"a\",1)", "^t(\"a\",1,\"x\")"]);

        let all: Vec<Vec<u8>> = root.tree().map(|n| n.unwrap().get().unwrap()).collect();
        assert_eq!(all, [b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }
}
