//! Variable trees.

use super::collate::Sub;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A subscript path below a variable name.
pub type Path = Vec<Sub>;

/// Nodes of one variable that hold a value, keyed by path.
pub type Tree = BTreeMap<Path, Vec<u8>>;

/// All variables, globals (`^name`) and locals alike.
#[derive(Debug, Clone, Default)]
pub struct Store {
    vars: BTreeMap<Vec<u8>, Tree>,
}

fn is_global(name: &[u8]) -> bool {
    name.first() == Some(&b'^')
}

fn is_below(key: &Path, prefix: &[Sub]) -> bool {
    key.len() > prefix.len() && key.starts_with(prefix)
}

impl Store {
    /// Returns the value at a node.
    pub fn get(&self, name: &[u8], path: &[Sub]) -> Option<&[u8]> {
        self.vars.get(name)?.get(path).map(Vec::as_slice)
    }

    /// Stores a value at a node.
    pub fn set(&mut self, name: &[u8], path: Path, value: Vec<u8>) {
        self.vars.entry(name.to_vec()).or_default().insert(path, value);
    }

    /// Returns 0, 1, 10 or 11 for a node.
    pub fn data(&self, name: &[u8], path: &[Sub]) -> u32 {
        let Some(tree) = self.vars.get(name) else {
            return 0;
        };
        let value = u32::from(tree.contains_key(path));
        let subtree = tree
            .range::<[Sub], _>((Bound::Excluded(path), Bound::Unbounded))
            .next()
            .is_some_and(|(k, _)| is_below(k, path));
        value + if subtree { 10 } else { 0 }
    }

    /// Removes the value at a node, leaving descendants.
    pub fn kill_node(&mut self, name: &[u8], path: &[Sub]) {
        if let Some(tree) = self.vars.get_mut(name) {
            tree.remove(path);
            if tree.is_empty() {
                self.vars.remove(name);
            }
        }
    }

    /// Removes a node and all its descendants.
    pub fn kill_tree(&mut self, name: &[u8], path: &[Sub]) {
        if path.is_empty() {
            self.vars.remove(name);
            return;
        }
        if let Some(tree) = self.vars.get_mut(name) {
            tree.retain(|k, _| !k.starts_with(path));
            if tree.is_empty() {
                self.vars.remove(name);
            }
        }
    }

    /// Removes every local variable not listed in `keep`.
    pub fn kill_locals_except(&mut self, keep: &[Vec<u8>]) {
        self.vars
            .retain(|name, _| is_global(name) || keep.iter().any(|k| k == name));
    }

    /// Finds the adjacent subscript at the depth of `path`'s last element.
    ///
    /// An empty last subscript starts the scan from the respective end.
    pub fn subscript_step(&self, name: &[u8], path: &[Sub], reverse: bool) -> Option<Vec<u8>> {
        let (last, prefix) = path.split_last()?;
        let tree = self.vars.get(name)?;
        let depth = prefix.len();
        let child_of = |k: &Path| is_below(k, prefix);

        let found = if reverse && last.is_empty() {
            // Everything below the prefix is a candidate.
            tree.range::<[Sub], _>((Bound::Excluded(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .last()
                .filter(|(k, _)| child_of(k))
                .map(|(k, _)| k[depth].clone())
        } else if reverse {
            tree.range::<[Sub], _>((Bound::Unbounded, Bound::Excluded(path)))
                .rev()
                .take_while(|(k, _)| k.starts_with(prefix))
                .find(|(k, _)| child_of(k))
                .map(|(k, _)| k[depth].clone())
        } else {
            tree.range::<[Sub], _>((Bound::Excluded(path), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .find(|(k, _)| child_of(k) && k[depth] > *last)
                .map(|(k, _)| k[depth].clone())
        };
        found
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
    }

    /// Finds the adjacent variable name of the same kind (global or local).
    pub fn name_step(&self, name: &[u8], reverse: bool) -> Option<Vec<u8>> {
        let global = is_global(name);
        let same_kind = |k: &&Vec<u8>| is_global(k) == global;
        let found = if reverse {
            self.vars
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(name)))
                .rev()
                .map(|(k, _)| k)
                .find(same_kind)
        } else {
            self.vars
                .range::<[u8], _>((Bound::Excluded(name), Bound::Unbounded))
                .map(|(k, _)| k)
                .find(same_kind)
        };
        found.cloned()
    }

    /// Finds the next node with a value in depth-first order.
    pub fn node_next(&self, name: &[u8], path: &[Sub]) -> Option<Path> {
        self.vars
            .get(name)?
            .range::<[Sub], _>((Bound::Excluded(path), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    /// Finds the previous node with a value; the unsubscripted root is never returned.
    pub fn node_previous(&self, name: &[u8], path: &[Sub]) -> Option<Path> {
        self.vars
            .get(name)?
            .range::<[Sub], _>((Bound::Unbounded, Bound::Excluded(path)))
            .next_back()
            .map(|(k, _)| k.clone())
            .filter(|k| !k.is_empty())
    }

    /// Copies the current globals.
    pub fn globals(&self) -> Vec<(Vec<u8>, Tree)> {
        self.vars
            .iter()
            .filter(|(k, _)| is_global(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replaces every global with `saved`.
    pub fn restore_globals(&mut self, saved: Vec<(Vec<u8>, Tree)>) {
        self.vars.retain(|k, _| !is_global(k));
        self.vars.extend(saved);
    }

    /// Copies the named locals, or every local when `names` is `None`.
    pub fn locals(&self, names: Option<&[Vec<u8>]>) -> Vec<(Vec<u8>, Option<Tree>)> {
        match names {
            None => self
                .vars
                .iter()
                .filter(|(k, _)| !is_global(k))
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            Some(names) => names
                .iter()
                .map(|n| (n.clone(), self.vars.get(n).cloned()))
                .collect(),
        }
    }

    /// Restores locals captured by [`Store::locals`].
    ///
    /// With `all` set, locals created since the capture are removed too.
    pub fn restore_locals(&mut self, saved: &[(Vec<u8>, Option<Tree>)], all: bool) {
        if all {
            self.vars.retain(|k, _| is_global(k));
        }
        for (name, tree) in saved {
            match tree {
                Some(tree) => {
                    self.vars.insert(name.clone(), tree.clone());
                }
                None => {
                    self.vars.remove(name);
                }
            }
        }
    }
}
