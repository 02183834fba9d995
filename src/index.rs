//! A generic, position-independent, AVL-balanced ordered index.
//!
//! Nodes live inside a shared memory segment that different processes may
//! map at different virtual addresses, so links between nodes cannot be raw
//! pointers: everything is stored as a byte offset relative to a `base`
//! pointer supplied by the caller at call time. [`IndexHeader`] is the
//! per-node linkage record; [`Ordered`] is the comparator/key contract a
//! caller's payload type implements to make its offsets usable as tree
//! nodes.
//!
//! The tree shape, rotations, and removal algorithm follow the classic
//! parent/left/right-pointer AVL tree, adapted to relative offsets and a
//! single explicit `root` cell instead of the call-by-pointer-to-pointer
//! re-rooting the original used.

use bytemuck::{Pod, Zeroable};

/// Sentinel meaning "no node" in a relative-offset link field.
const NIL: i64 = i64::MIN;

/// Per-node linkage, stored alongside (or embedded in) the caller's payload.
///
/// All three link fields are offsets relative to the node's own offset, not
/// absolute offsets: `parent_rel`, `left_rel`, `right_rel` added to a node's
/// own offset give the absolute offset of its parent/left/right child, or
/// [`NIL`] if absent. Relative encoding keeps the header's values
/// independent of where in the segment the tree as a whole happens to sit.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct IndexHeader {
    parent_rel: i64,
    left_rel: i64,
    right_rel: i64,
    depth: i32,
    _padding: i32,
}

impl IndexHeader {
    pub const EMPTY: IndexHeader = IndexHeader {
        parent_rel: NIL,
        left_rel: NIL,
        right_rel: NIL,
        depth: 0,
        _padding: 0,
    };
}

/// Absolute offset of a tree node within the segment. `0` is a legal offset
/// (the allocator's self-hosted root cell lives at offset 0), so "no node"
/// is represented with `Option<Offset>`, never a sentinel offset value.
pub type Offset = u64;

/// Access to node headers and ordering, provided by the caller.
///
/// The index itself never interprets payload bytes; it only needs to read
/// and write [`IndexHeader`]s at given offsets and compare two offsets'
/// keys. A buddy allocator's free list (see [`crate::alloc`]) implements
/// this over its `FreeNode` records, comparing by block address.
pub trait Ordered {
    fn header(&self, at: Offset) -> IndexHeader;
    fn set_header(&mut self, at: Offset, header: IndexHeader);
    /// `Less`/`Equal`/`Greater` of the node at `a` relative to the node at `b`.
    fn compare(&self, a: Offset, b: Offset) -> std::cmp::Ordering;
    /// Called after `at`'s subtree depth changes, so the caller can update
    /// any cached per-node summary (the buddy allocator's `size_mask`, for
    /// instance) that depends on the node's descendants.
    fn on_depth_changed(&mut self, _at: Offset) {}
}

fn rel(from: Offset, to: Offset) -> i64 {
    to as i64 - from as i64
}

fn apply(at: Offset, rel: i64) -> Option<Offset> {
    if rel == NIL {
        None
    } else {
        Some((at as i64 + rel) as Offset)
    }
}

pub fn parent<T: Ordered + ?Sized>(tree: &T, at: Offset) -> Option<Offset> {
    apply(at, tree.header(at).parent_rel)
}
pub fn left<T: Ordered + ?Sized>(tree: &T, at: Offset) -> Option<Offset> {
    apply(at, tree.header(at).left_rel)
}
pub fn right<T: Ordered + ?Sized>(tree: &T, at: Offset) -> Option<Offset> {
    apply(at, tree.header(at).right_rel)
}

fn set_parent<T: Ordered + ?Sized>(tree: &mut T, at: Offset, p: Option<Offset>) {
    let mut h = tree.header(at);
    h.parent_rel = p.map_or(NIL, |p| rel(at, p));
    tree.set_header(at, h);
}
fn set_left<T: Ordered + ?Sized>(tree: &mut T, at: Offset, l: Option<Offset>) {
    let mut h = tree.header(at);
    h.left_rel = l.map_or(NIL, |l| rel(at, l));
    tree.set_header(at, h);
}
fn set_right<T: Ordered + ?Sized>(tree: &mut T, at: Offset, r: Option<Offset>) {
    let mut h = tree.header(at);
    h.right_rel = r.map_or(NIL, |r| rel(at, r));
    tree.set_header(at, h);
}
fn depth<T: Ordered + ?Sized>(tree: &T, node: Option<Offset>) -> i32 {
    node.map_or(0, |n| tree.header(n).depth)
}

fn set_depth<T: Ordered + ?Sized>(tree: &mut T, at: Offset) {
    let d = 1 + depth(tree, left(tree, at)).max(depth(tree, right(tree, at)));
    let mut h = tree.header(at);
    h.depth = d;
    tree.set_header(at, h);
    tree.on_depth_changed(at);
    if let Some(p) = parent(tree, at) {
        set_depth(tree, p);
    }
}

fn balance<T: Ordered + ?Sized>(tree: &T, at: Offset) -> i32 {
    depth(tree, right(tree, at)) - depth(tree, left(tree, at))
}

/// Replace `old` (a child of `at_parent`, or the whole tree if `at_parent`
/// is `None`) with `new`.
fn replace_child<T: Ordered + ?Sized>(
    tree: &mut T,
    root: &mut Option<Offset>,
    at_parent: Option<Offset>,
    old: Offset,
    new: Option<Offset>,
) {
    match at_parent {
        None => *root = new,
        Some(p) => {
            if left(tree, p) == Some(old) {
                set_left(tree, p, new);
            } else {
                set_right(tree, p, new);
            }
        }
    }
    if let Some(new) = new {
        set_parent(tree, new, at_parent);
    }
}

fn rotate_left<T: Ordered + ?Sized>(tree: &mut T, root: &mut Option<Offset>, t: Offset) {
    let r = right(tree, t).expect("rotate_left requires a right child");
    let rl = left(tree, r);
    let p = parent(tree, t);
    set_left(tree, r, Some(t));
    set_right(tree, t, rl);
    if let Some(rl) = rl {
        set_parent(tree, rl, Some(t));
    }
    set_parent(tree, t, Some(r));
    replace_child(tree, root, p, t, Some(r));
    set_depth(tree, t);
}

fn rotate_right<T: Ordered + ?Sized>(tree: &mut T, root: &mut Option<Offset>, t: Offset) {
    let l = left(tree, t).expect("rotate_right requires a left child");
    let lr = right(tree, l);
    let p = parent(tree, t);
    set_right(tree, l, Some(t));
    set_left(tree, t, lr);
    if let Some(lr) = lr {
        set_parent(tree, lr, Some(t));
    }
    set_parent(tree, t, Some(l));
    replace_child(tree, root, p, t, Some(l));
    set_depth(tree, t);
}

fn rebalance<T: Ordered + ?Sized>(tree: &mut T, root: &mut Option<Offset>, mut t: Option<Offset>) {
    while let Some(node) = t {
        let b = balance(tree, node);
        if b == 2 {
            let r = right(tree, node).unwrap();
            if balance(tree, r) == -1 {
                rotate_right(tree, root, r);
            }
            rotate_left(tree, root, node);
        } else if b == -2 {
            let l = left(tree, node).unwrap();
            if balance(tree, l) == 1 {
                rotate_left(tree, root, l);
            }
            rotate_right(tree, root, node);
        }
        t = parent(tree, node);
    }
}

/// Insert `node` (freshly initialized with [`IndexHeader::EMPTY`] by the
/// caller) into the tree rooted at `*root`, rebalancing as needed.
pub fn insert<T: Ordered + ?Sized>(tree: &mut T, root: &mut Option<Offset>, node: Offset) {
    tree.set_header(node, IndexHeader::EMPTY);
    let mut cursor = *root;
    let mut parent_of_insertion = None;
    let mut went_left = false;
    while let Some(c) = cursor {
        parent_of_insertion = Some(c);
        if tree.compare(node, c) == std::cmp::Ordering::Less {
            went_left = true;
            cursor = left(tree, c);
        } else {
            went_left = false;
            cursor = right(tree, c);
        }
    }
    match parent_of_insertion {
        None => {
            *root = Some(node);
            set_depth(tree, node);
        }
        Some(p) => {
            if went_left {
                set_left(tree, p, Some(node));
            } else {
                set_right(tree, p, Some(node));
            }
            set_parent(tree, node, Some(p));
            set_depth(tree, node);
            rebalance(tree, root, Some(node));
        }
    }
}

/// Remove `node` from the tree rooted at `*root`.
pub fn remove<T: Ordered + ?Sized>(tree: &mut T, root: &mut Option<Offset>, node: Offset) {
    let p = parent(tree, node);
    let l = left(tree, node);
    let r = right(tree, node);

    let moved = match (l, r) {
        (Some(l), Some(r)) => {
            if depth(tree, Some(l)) >= depth(tree, Some(r)) {
                let mut s = right(tree, l);
                let moved = match s {
                    Some(mut s_node) => {
                        while let Some(next) = right(tree, s_node) {
                            s_node = next;
                        }
                        s = Some(s_node);
                        let s_parent = parent(tree, s_node).unwrap();
                        let s_left = left(tree, s_node);
                        set_right(tree, s_parent, s_left);
                        if let Some(sl) = s_left {
                            set_parent(tree, sl, Some(s_parent));
                        }
                        set_left(tree, s_node, Some(l));
                        set_parent(tree, l, Some(s_node));
                        s_parent
                    }
                    None => {
                        s = Some(l);
                        l
                    }
                };
                let s_node = s.unwrap();
                set_right(tree, s_node, Some(r));
                set_parent(tree, r, Some(s_node));
                replace_child(tree, root, p, node, Some(s_node));
                moved
            } else {
                let mut s = left(tree, r);
                let moved = match s {
                    Some(mut s_node) => {
                        while let Some(next) = left(tree, s_node) {
                            s_node = next;
                        }
                        s = Some(s_node);
                        let s_parent = parent(tree, s_node).unwrap();
                        let s_right = right(tree, s_node);
                        set_left(tree, s_parent, s_right);
                        if let Some(sr) = s_right {
                            set_parent(tree, sr, Some(s_parent));
                        }
                        set_right(tree, s_node, Some(r));
                        set_parent(tree, r, Some(s_node));
                        s_parent
                    }
                    None => {
                        s = Some(r);
                        r
                    }
                };
                let s_node = s.unwrap();
                set_left(tree, s_node, Some(l));
                set_parent(tree, l, Some(s_node));
                replace_child(tree, root, p, node, Some(s_node));
                moved
            }
        }
        (Some(l), None) => {
            replace_child(tree, root, p, node, Some(l));
            p.unwrap_or(l)
        }
        (None, Some(r)) => {
            replace_child(tree, root, p, node, Some(r));
            p.unwrap_or(r)
        }
        (None, None) => {
            replace_child(tree, root, p, node, None);
            match p {
                Some(p) => p,
                None => return,
            }
        }
    };
    set_depth(tree, moved);
    rebalance(tree, root, Some(moved));
}

/// Find the node comparing equal to `key_of`, if one exists.
///
/// `key_of` must compare the same way `tree.compare` would if `key_of` were
/// itself inserted as a node; callers typically pass a scratch offset
/// holding a probe value, or implement `compare` to special-case a
/// reserved probe slot.
pub fn search<T: Ordered + ?Sized>(tree: &T, root: Option<Offset>, key_of: Offset) -> Option<Offset> {
    let mut cursor = root;
    while let Some(c) = cursor {
        match tree.compare(key_of, c) {
            std::cmp::Ordering::Equal => return Some(c),
            std::cmp::Ordering::Less => cursor = left(tree, c),
            std::cmp::Ordering::Greater => cursor = right(tree, c),
        }
    }
    None
}

/// In-order traversal, for verification and tests.
pub fn in_order<T: Ordered + ?Sized>(tree: &T, root: Option<Offset>, out: &mut Vec<Offset>) {
    fn walk<T: Ordered + ?Sized>(tree: &T, node: Option<Offset>, out: &mut Vec<Offset>) {
        if let Some(n) = node {
            walk(tree, left(tree, n), out);
            out.push(n);
            walk(tree, right(tree, n), out);
        }
    }
    walk(tree, root, out);
}

/// Check AVL balance and depth-field consistency across the whole tree.
/// Returns the first offending node, if any.
pub fn verify_integrity<T: Ordered + ?Sized>(tree: &T, root: Option<Offset>) -> Option<Offset> {
    fn check<T: Ordered + ?Sized>(tree: &T, node: Option<Offset>) -> Result<i32, Offset> {
        match node {
            None => Ok(0),
            Some(n) => {
                let ld = check(tree, left(tree, n))?;
                let rd = check(tree, right(tree, n))?;
                if (ld - rd).abs() > 1 {
                    return Err(n);
                }
                let expected = 1 + ld.max(rd);
                if tree.header(n).depth != expected {
                    return Err(n);
                }
                Ok(expected)
            }
        }
    }
    check(tree, root).err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;
    use std::collections::HashMap;

    /// Minimal in-memory `Ordered` implementation for exercising the tree
    /// logic without a real mmap segment.
    struct TestTree {
        headers: HashMap<Offset, IndexHeader>,
        values: HashMap<Offset, i64>,
    }

    impl Ordered for TestTree {
        fn header(&self, at: Offset) -> IndexHeader {
            self.headers[&at]
        }
        fn set_header(&mut self, at: Offset, header: IndexHeader) {
            self.headers.insert(at, header);
        }
        fn compare(&self, a: Offset, b: Offset) -> Ordering {
            self.values[&a].cmp(&self.values[&b])
        }
    }

    fn build(values: &[i64]) -> (TestTree, Option<Offset>) {
        let mut tree = TestTree {
            headers: HashMap::new(),
            values: HashMap::new(),
        };
        let mut root = None;
        for (i, &v) in values.iter().enumerate() {
            let off = (i as u64 + 1) * 16;
            tree.values.insert(off, v);
            tree.headers.insert(off, IndexHeader::EMPTY);
            insert(&mut tree, &mut root, off);
        }
        (tree, root)
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let (tree, root) = build(&[5, 3, 8, 1, 4, 7, 9, 2, 6]);
        let mut out = Vec::new();
        in_order(&tree, root, &mut out);
        let sorted: Vec<i64> = out.iter().map(|o| tree.values[o]).collect();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(verify_integrity(&tree, root).is_none());
    }

    #[test]
    fn ascending_insert_stays_balanced() {
        let values: Vec<i64> = (0..1000).collect();
        let (tree, root) = build(&values);
        assert!(verify_integrity(&tree, root).is_none());
        let depth = tree.headers[&root.unwrap()].depth;
        assert!((depth as f64) < 2.0 * ((values.len() as f64).log2() + 1.0));
    }

    #[test]
    fn remove_leaf_and_internal_nodes() {
        let (mut tree, mut root) = build(&[5, 3, 8, 1, 4, 7, 9, 2, 6]);
        let target = *tree
            .values
            .iter()
            .find(|(_, &v)| v == 8)
            .unwrap()
            .0;
        remove(&mut tree, &mut root, target);
        let mut out = Vec::new();
        in_order(&tree, root, &mut out);
        let sorted: Vec<i64> = out.iter().map(|o| tree.values[o]).collect();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6, 7, 9]);
        assert!(verify_integrity(&tree, root).is_none());

        let root_off = root.unwrap();
        remove(&mut tree, &mut root, root_off);
        assert!(verify_integrity(&tree, root).is_none());
    }

    #[test]
    fn search_finds_present_and_absent_keys() {
        let (mut tree, root) = build(&[10, 20, 30, 40, 50]);
        let probe_present = 9999;
        tree.values.insert(probe_present, 30);
        tree.headers.insert(probe_present, IndexHeader::EMPTY);
        assert!(search(&tree, root, probe_present).is_some());

        let probe_absent = 9998;
        tree.values.insert(probe_absent, 99);
        tree.headers.insert(probe_absent, IndexHeader::EMPTY);
        assert!(search(&tree, root, probe_absent).is_none());
    }
}
