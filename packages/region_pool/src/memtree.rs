//! Best-fit cache of free memory fragments.
//!
//! Fragments are keyed by size in a red-black tree whose nodes live in the
//! first bytes of the free fragments themselves, so the cache needs no
//! allocation of its own. Same-size fragments chain off the resident node
//! through the block header's intrusive link and never trigger rebalancing.
//!
//! The tree is maintained in left-leaning form (Sedgewick), which keeps the
//! restructuring logic recursive and parent-pointer-free while preserving
//! the classic red-black guarantees: black root, no red-red edge, equal
//! black height on every path, O(log n) insert and fetch.

use std::ptr::NonNull;

use crate::block::{ALLOC_ALIGNMENT, BlockHeader};

/// Tree node written into the start of a free fragment. The embedded block
/// header carries the fragment size and the same-size chain link.
#[repr(C)]
pub(crate) struct MemtreeNode {
    pub(crate) block: BlockHeader,
    smaller: Option<NonNull<MemtreeNode>>,
    larger: Option<NonNull<MemtreeNode>>,
    red: bool,
}

/// Fragments smaller than this cannot hold a node and must be discarded by
/// the caller instead of inserted.
pub(crate) const MIN_FRAGMENT: usize = size_of::<MemtreeNode>();

/// A best-fit tree of free fragments. The tree borrows the fragments it
/// indexes; dropping it forgets them without releasing any memory, which is
/// exactly what pool clearing wants.
pub(crate) struct MemTree {
    root: Option<NonNull<MemtreeNode>>,
}

impl MemTree {
    pub(crate) const fn new() -> Self {
        Self { root: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Forgets every cached fragment. The backing memory is owned by
    /// whoever owns the blocks the fragments point into.
    pub(crate) fn clear(&mut self) {
        self.root = None;
    }

    /// Number of cached fragments, same-size chain members included.
    pub(crate) fn len(&self) -> usize {
        // SAFETY: Every node reachable from the root was inserted through
        // `insert` and is still owned by the tree.
        unsafe { count(self.root) }
    }

    /// Indexes the fragment starting at `mem` under its size.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least `size` bytes of unused memory aligned
    /// to [`ALLOC_ALIGNMENT`], with `size >= MIN_FRAGMENT`, and the
    /// fragment must stay untouched until it is returned by `fetch` or the
    /// tree is cleared.
    pub(crate) unsafe fn insert(&mut self, mem: NonNull<u8>, size: usize) {
        debug_assert!(size >= MIN_FRAGMENT, "fragment below the node minimum");
        debug_assert!(mem.as_ptr() as usize % ALLOC_ALIGNMENT == 0);

        let node = mem.cast::<MemtreeNode>();
        // SAFETY: The caller guarantees the fragment is writable, aligned
        // and large enough for a node.
        unsafe {
            node.as_ptr().write(MemtreeNode {
                block: BlockHeader { size, next: None },
                smaller: None,
                larger: None,
                red: true,
            });
            self.root = Some(insert_rec(self.root, node));
            (*self.root.unwrap_unchecked().as_ptr()).red = false;
        }
    }

    /// Removes and returns the smallest fragment of at least `size` bytes,
    /// or `None` when nothing cached is large enough. The returned header
    /// carries the fragment's full size; its link is cleared.
    pub(crate) fn fetch(&mut self, size: usize) -> Option<NonNull<BlockHeader>> {
        // SAFETY: All reachable nodes are live fragments owned by the tree.
        unsafe {
            let found = ceiling(self.root, size)?;

            // A same-size twin can be unchained without touching the tree
            // structure at all.
            if let Some(twin) = (*found.as_ptr()).block.next {
                (*found.as_ptr()).block.next = (*twin.as_ptr()).next;
                (*twin.as_ptr()).next = None;
                return Some(twin);
            }

            let key = (*found.as_ptr()).block.size;
            let root = self.root.unwrap_unchecked();
            if !is_red((*root.as_ptr()).smaller) && !is_red((*root.as_ptr()).larger) {
                (*root.as_ptr()).red = true;
            }
            let (new_root, removed) = delete_rec(root, key);
            if let Some(r) = new_root {
                (*r.as_ptr()).red = false;
            }
            self.root = new_root;

            debug_assert_eq!(removed, found);
            debug_assert!((*removed.as_ptr()).block.next.is_none());
            Some(removed.cast::<BlockHeader>())
        }
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) {
        // SAFETY: All reachable nodes are live fragments owned by the tree.
        unsafe {
            assert!(!is_red(self.root), "root must be black");
            check(self.root, 0, usize::MAX);
        }
    }
}

unsafe fn is_red(node: Option<NonNull<MemtreeNode>>) -> bool {
    // SAFETY: The caller guarantees `node`, when present, points at a live
    // tree node.
    node.is_some_and(|n| unsafe { (*n.as_ptr()).red })
}

unsafe fn count(node: Option<NonNull<MemtreeNode>>) -> usize {
    let Some(n) = node else { return 0 };
    // SAFETY: Caller guarantees the subtree is live; chains are live
    // fragments linked through their headers.
    unsafe {
        let mut total = 1;
        let mut chain = (*n.as_ptr()).block.next;
        while let Some(c) = chain {
            total += 1;
            chain = (*c.as_ptr()).next;
        }
        total + count((*n.as_ptr()).smaller) + count((*n.as_ptr()).larger)
    }
}

/// Best-fit lookup: the node with the smallest size >= `size`.
unsafe fn ceiling(
    mut node: Option<NonNull<MemtreeNode>>,
    size: usize,
) -> Option<NonNull<MemtreeNode>> {
    let mut best = None;
    // SAFETY: Caller guarantees all reachable nodes are live.
    unsafe {
        while let Some(n) = node {
            if (*n.as_ptr()).block.size >= size {
                best = Some(n);
                node = (*n.as_ptr()).smaller;
            } else {
                node = (*n.as_ptr()).larger;
            }
        }
    }
    best
}

unsafe fn rotate_left(h: NonNull<MemtreeNode>) -> NonNull<MemtreeNode> {
    // SAFETY: Caller guarantees `h` is live with a live right child (the
    // rotation is only requested when the right link is red).
    unsafe {
        let x = (*h.as_ptr()).larger.unwrap_unchecked();
        (*h.as_ptr()).larger = (*x.as_ptr()).smaller;
        (*x.as_ptr()).smaller = Some(h);
        (*x.as_ptr()).red = (*h.as_ptr()).red;
        (*h.as_ptr()).red = true;
        x
    }
}

unsafe fn rotate_right(h: NonNull<MemtreeNode>) -> NonNull<MemtreeNode> {
    // SAFETY: Caller guarantees `h` is live with a live left child.
    unsafe {
        let x = (*h.as_ptr()).smaller.unwrap_unchecked();
        (*h.as_ptr()).smaller = (*x.as_ptr()).larger;
        (*x.as_ptr()).larger = Some(h);
        (*x.as_ptr()).red = (*h.as_ptr()).red;
        (*h.as_ptr()).red = true;
        x
    }
}

unsafe fn color_flip(h: NonNull<MemtreeNode>) {
    // SAFETY: Only called when both children exist (two-child invariant of
    // the flip sites below).
    unsafe {
        (*h.as_ptr()).red = !(*h.as_ptr()).red;
        if let Some(l) = (*h.as_ptr()).smaller {
            (*l.as_ptr()).red = !(*l.as_ptr()).red;
        }
        if let Some(r) = (*h.as_ptr()).larger {
            (*r.as_ptr()).red = !(*r.as_ptr()).red;
        }
    }
}

/// Restores the left-leaning invariants on the way back up.
unsafe fn fix_up(mut h: NonNull<MemtreeNode>) -> NonNull<MemtreeNode> {
    // SAFETY: Caller guarantees the subtree rooted at `h` is live.
    unsafe {
        if is_red((*h.as_ptr()).larger) && !is_red((*h.as_ptr()).smaller) {
            h = rotate_left(h);
        }
        if is_red((*h.as_ptr()).smaller) {
            let l = (*h.as_ptr()).smaller.unwrap_unchecked();
            if is_red((*l.as_ptr()).smaller) {
                h = rotate_right(h);
            }
        }
        if is_red((*h.as_ptr()).smaller) && is_red((*h.as_ptr()).larger) {
            color_flip(h);
        }
        h
    }
}

unsafe fn insert_rec(
    h: Option<NonNull<MemtreeNode>>,
    node: NonNull<MemtreeNode>,
) -> NonNull<MemtreeNode> {
    let Some(h) = h else { return node };

    // SAFETY: Caller guarantees `h`'s subtree and `node` are live.
    unsafe {
        let hsize = (*h.as_ptr()).block.size;
        let nsize = (*node.as_ptr()).block.size;

        if nsize == hsize {
            // Same size: chain onto the resident node, no rebalancing.
            (*node.as_ptr()).block.next = (*h.as_ptr()).block.next;
            (*h.as_ptr()).block.next = Some(node.cast::<BlockHeader>());
            return h;
        }

        if nsize < hsize {
            (*h.as_ptr()).smaller = Some(insert_rec((*h.as_ptr()).smaller, node));
        } else {
            (*h.as_ptr()).larger = Some(insert_rec((*h.as_ptr()).larger, node));
        }

        fix_up(h)
    }
}

/// Makes sure the left child or one of its children is red before the
/// descent continues leftwards.
unsafe fn move_red_left(mut h: NonNull<MemtreeNode>) -> NonNull<MemtreeNode> {
    // SAFETY: Caller guarantees `h` is live; the descent invariant ensures
    // both children exist at this point.
    unsafe {
        color_flip(h);
        let r = (*h.as_ptr()).larger;
        if let Some(r) = r {
            if is_red((*r.as_ptr()).smaller) {
                (*h.as_ptr()).larger = Some(rotate_right(r));
                h = rotate_left(h);
                color_flip(h);
            }
        }
        h
    }
}

/// Mirror image of [`move_red_left`] for rightward descents.
unsafe fn move_red_right(mut h: NonNull<MemtreeNode>) -> NonNull<MemtreeNode> {
    // SAFETY: Caller guarantees `h` is live with both children present.
    unsafe {
        color_flip(h);
        if let Some(l) = (*h.as_ptr()).smaller {
            if is_red((*l.as_ptr()).smaller) {
                h = rotate_right(h);
                color_flip(h);
            }
        }
        h
    }
}

/// Removes and returns the minimum node of the subtree.
unsafe fn delete_min(mut h: NonNull<MemtreeNode>) -> (Option<NonNull<MemtreeNode>>, NonNull<MemtreeNode>) {
    // SAFETY: Caller guarantees the subtree is live.
    unsafe {
        if (*h.as_ptr()).smaller.is_none() {
            debug_assert!((*h.as_ptr()).larger.is_none());
            return (None, h);
        }

        let l = (*h.as_ptr()).smaller.unwrap_unchecked();
        if !is_red(Some(l)) && !is_red((*l.as_ptr()).smaller) {
            h = move_red_left(h);
        }

        let (new_left, removed) = delete_min((*h.as_ptr()).smaller.unwrap_unchecked());
        (*h.as_ptr()).smaller = new_left;
        (Some(fix_up(h)), removed)
    }
}

/// Removes the node whose size equals `size`, which must be present. The
/// removed node is unlinked structurally (its in-order successor takes its
/// place); fragment bytes are never copied.
unsafe fn delete_rec(
    mut h: NonNull<MemtreeNode>,
    size: usize,
) -> (Option<NonNull<MemtreeNode>>, NonNull<MemtreeNode>) {
    // SAFETY: Caller guarantees the subtree is live and contains `size`.
    unsafe {
        let removed;
        if size < (*h.as_ptr()).block.size {
            let l = (*h.as_ptr()).smaller;
            debug_assert!(l.is_some(), "key must be present in the tree");
            if !is_red(l) && !is_red((*l.unwrap_unchecked().as_ptr()).smaller) {
                h = move_red_left(h);
            }
            let (new_left, r) = delete_rec((*h.as_ptr()).smaller.unwrap_unchecked(), size);
            (*h.as_ptr()).smaller = new_left;
            removed = r;
        } else {
            if is_red((*h.as_ptr()).smaller) {
                h = rotate_right(h);
            }
            if size == (*h.as_ptr()).block.size && (*h.as_ptr()).larger.is_none() {
                debug_assert!((*h.as_ptr()).smaller.is_none());
                return (None, h);
            }
            {
                let r = (*h.as_ptr()).larger;
                debug_assert!(r.is_some(), "key must be present in the tree");
                if !is_red(r) && !is_red((*r.unwrap_unchecked().as_ptr()).smaller) {
                    h = move_red_right(h);
                }
            }
            if size == (*h.as_ptr()).block.size {
                // Promote the in-order successor into this node's position
                // so the matched fragment itself can be handed out.
                let (new_right, succ) = delete_min((*h.as_ptr()).larger.unwrap_unchecked());
                (*succ.as_ptr()).smaller = (*h.as_ptr()).smaller;
                (*succ.as_ptr()).larger = new_right;
                (*succ.as_ptr()).red = (*h.as_ptr()).red;
                (*h.as_ptr()).smaller = None;
                (*h.as_ptr()).larger = None;
                removed = h;
                h = succ;
            } else {
                let (new_right, r) = delete_rec((*h.as_ptr()).larger.unwrap_unchecked(), size);
                (*h.as_ptr()).larger = new_right;
                removed = r;
            }
        }
        (Some(fix_up(h)), removed)
    }
}

#[cfg(test)]
unsafe fn check(node: Option<NonNull<MemtreeNode>>, lo: usize, hi: usize) -> usize {
    let Some(n) = node else { return 1 };
    // SAFETY: Test-only walk over a live tree.
    unsafe {
        let size = (*n.as_ptr()).block.size;
        assert!(size > lo && size < hi, "binary search order violated");
        if (*n.as_ptr()).red {
            assert!(!is_red((*n.as_ptr()).smaller), "red-red edge");
            assert!(!is_red((*n.as_ptr()).larger), "red-red edge");
        }
        let lh = check((*n.as_ptr()).smaller, lo, size);
        let rh = check((*n.as_ptr()).larger, size, hi);
        assert_eq!(lh, rh, "black height mismatch");
        lh + usize::from(!(*n.as_ptr()).red)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::block::{align_up, raw_alloc, raw_free};

    /// Test fixture owning raw fragments so they outlive the tree.
    struct Fragments {
        regions: Vec<(NonNull<u8>, usize)>,
    }

    impl Fragments {
        fn new() -> Self {
            Self { regions: Vec::new() }
        }

        fn make(&mut self, size: usize) -> NonNull<u8> {
            let mem = raw_alloc(size).expect("test allocation");
            self.regions.push((mem, size));
            mem
        }
    }

    impl Drop for Fragments {
        fn drop(&mut self) {
            for &(mem, size) in &self.regions {
                // SAFETY: Allocated in `make` with this exact size.
                unsafe { raw_free(mem, size) };
            }
        }
    }

    #[test]
    fn empty_tree_fetches_nothing() {
        let mut tree = MemTree::new();
        assert!(tree.is_empty());
        assert!(tree.fetch(1).is_none());
    }

    #[test]
    fn single_fragment_round_trip() {
        let mut frags = Fragments::new();
        let mut tree = MemTree::new();
        let mem = frags.make(256);

        // SAFETY: 256 unused aligned bytes.
        unsafe { tree.insert(mem, 256) };
        assert_eq!(tree.len(), 1);

        let got = tree.fetch(100).expect("must fit");
        assert_eq!(got.as_ptr().cast::<u8>(), mem.as_ptr());
        // SAFETY: `got` heads the fragment we just fetched.
        unsafe { assert_eq!((*got.as_ptr()).size, 256) };
        assert!(tree.is_empty());
    }

    #[test]
    fn minimum_size_fragment_is_accepted() {
        let mut frags = Fragments::new();
        let mut tree = MemTree::new();
        let mem = frags.make(MIN_FRAGMENT);

        // SAFETY: Exactly MIN_FRAGMENT unused aligned bytes.
        unsafe { tree.insert(mem, MIN_FRAGMENT) };
        let got = tree.fetch(MIN_FRAGMENT).expect("exact fit");
        assert_eq!(got.as_ptr().cast::<u8>(), mem.as_ptr());
    }

    #[test]
    fn fetch_is_best_fit() {
        let mut frags = Fragments::new();
        let mut tree = MemTree::new();
        for size in [64, 512, 128, 2048, 256] {
            let mem = frags.make(size);
            // SAFETY: Fresh unused fragments of the stated sizes.
            unsafe { tree.insert(mem, size) };
        }
        tree.validate();

        // SAFETY: Headers of fetched fragments are live.
        unsafe {
            assert_eq!((*tree.fetch(100).unwrap().as_ptr()).size, 128);
            assert_eq!((*tree.fetch(100).unwrap().as_ptr()).size, 256);
            assert_eq!((*tree.fetch(1000).unwrap().as_ptr()).size, 2048);
        }
        assert!(tree.fetch(1000).is_none(), "nothing adequate remains");
        assert_eq!(tree.len(), 2);
        tree.validate();
    }

    #[test]
    fn equal_sizes_chain_without_rebalancing() {
        let mut frags = Fragments::new();
        let mut tree = MemTree::new();
        let first = frags.make(128);
        let second = frags.make(128);
        let third = frags.make(128);
        for mem in [first, second, third] {
            // SAFETY: Fresh unused 128-byte fragments.
            unsafe { tree.insert(mem, 128) };
        }
        assert_eq!(tree.len(), 3);
        tree.validate();

        // Chain members come back before the resident node, most recently
        // inserted first.
        assert_eq!(tree.fetch(128).unwrap().as_ptr().cast::<u8>(), third.as_ptr());
        assert_eq!(tree.fetch(128).unwrap().as_ptr().cast::<u8>(), second.as_ptr());
        assert_eq!(tree.fetch(128).unwrap().as_ptr().cast::<u8>(), first.as_ptr());
        assert!(tree.is_empty());
    }

    #[test]
    fn randomized_operations_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut frags = Fragments::new();
        let mut tree = MemTree::new();
        let mut live = 0_usize;

        for _ in 0..600 {
            if live == 0 || rng.random_range(0..3) > 0 {
                let size = align_up(rng.random_range(MIN_FRAGMENT..4096));
                let mem = frags.make(size);
                // SAFETY: Fresh unused fragment of `size` aligned bytes.
                unsafe { tree.insert(mem, size) };
                live += 1;
            } else {
                let want = rng.random_range(1..4096);
                let before = smallest_adequate(&tree, want);
                match tree.fetch(want) {
                    Some(got) => {
                        // SAFETY: `got` heads a live fetched fragment.
                        let size = unsafe { (*got.as_ptr()).size };
                        assert!(size >= want);
                        assert_eq!(Some(size), before, "best fit violated");
                        live -= 1;
                    }
                    None => assert_eq!(before, None),
                }
            }
            tree.validate();
            assert_eq!(tree.len(), live);
        }
    }

    /// Oracle for the best-fit property: probe ever-larger requests.
    fn smallest_adequate(tree: &MemTree, want: usize) -> Option<usize> {
        // SAFETY: Read-only walk over the live tree.
        unsafe { ceiling(tree.root, want).map(|n| (*n.as_ptr()).block.size) }
    }
}
