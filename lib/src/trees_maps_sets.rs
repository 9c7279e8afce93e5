/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Union-find over dense indices, used to track node merges (coalescing) in
//! the colorer.

use crate::data_structures::NodeIx;

//=============================================================================
// ToFromU32

// First, we need this.  You can store anything you like in a union-find, so
// long as it can be converted to and from a dense u32.

pub trait ToFromU32<T: Sized = Self> {
  fn to_u32(x: Self) -> u32;
  fn from_u32(x: u32) -> Self;
}
impl ToFromU32 for u32 {
  fn to_u32(x: u32) -> u32 {
    x
  }
  fn from_u32(x: u32) -> u32 {
    x
  }
}
impl ToFromU32 for NodeIx {
  fn to_u32(x: NodeIx) -> u32 {
    x.get()
  }
  fn from_u32(x: u32) -> NodeIx {
    NodeIx::new(x)
  }
}

//=============================================================================
// UnionFind

// Unlike the textbook union-find, merges here are directional: when |src| is
// merged into |dst|, |dst|'s representative stays the representative of the
// combined class.  The colorer relies on that, since the surviving node is the
// one that keeps its edges in the working graph.  Paths are compressed both
// on merges and on lookups, so chains never get long.

#[derive(Clone)]
pub struct UnionFind<T: ToFromU32> {
  parent: Vec<u32>,
  num_merges: u32,
  anchor: std::marker::PhantomData<T>,
}

impl<T: ToFromU32 + Copy> UnionFind<T> {
  pub fn new(size: usize) -> Self {
    let mut parent = Vec::with_capacity(size);
    for i in 0..size {
      parent.push(i as u32);
    }
    Self { parent, num_merges: 0, anchor: std::marker::PhantomData }
  }

  fn find_u32(&mut self, mut x: u32) -> u32 {
    let mut root = x;
    while self.parent[root as usize] != root {
      root = self.parent[root as usize];
    }
    // Second pass: point everything on the path directly at the root.
    while self.parent[x as usize] != root {
      let next = self.parent[x as usize];
      self.parent[x as usize] = root;
      x = next;
    }
    root
  }

  /// Returns the representative of |item|'s class.
  pub fn find(&mut self, item: T) -> T {
    T::from_u32(self.find_u32(T::to_u32(item)))
  }

  /// Merge |src|'s class into |dst|'s.  Returns false if they were already in
  /// the same class.
  pub fn union_into(&mut self, src: T, dst: T) -> bool {
    let src_root = self.find_u32(T::to_u32(src));
    let dst_root = self.find_u32(T::to_u32(dst));
    if src_root == dst_root {
      return false;
    }
    self.parent[src_root as usize] = dst_root;
    // Keep the path from |src| itself short as well.
    let src_u32 = T::to_u32(src);
    self.parent[src_u32 as usize] = dst_root;
    self.num_merges += 1;
    true
  }

  pub fn num_merges(&self) -> u32 {
    self.num_merges
  }
}

#[cfg(test)]
mod test_union_find {
  use super::*;

  #[test]
  fn union_is_directional() {
    let mut uf = UnionFind::<u32>::new(6);
    assert!(uf.union_into(3, 1));
    assert_eq!(uf.find(3), 1);
    assert!(uf.union_into(1, 5));
    assert_eq!(uf.find(3), 5);
    assert_eq!(uf.find(1), 5);
    assert!(!uf.union_into(3, 5));
    assert_eq!(uf.num_merges(), 2);
    assert_eq!(uf.parent[5], 5);
  }

  #[test]
  fn lookups_compress_paths() {
    let mut uf = UnionFind::<u32>::new(5);
    // Build a chain 0 -> 1 -> 2 -> 3 -> 4 by merging roots.
    uf.union_into(0, 1);
    uf.union_into(1, 2);
    uf.union_into(2, 3);
    uf.union_into(3, 4);
    assert_eq!(uf.find(0), 4);
    assert_eq!(uf.parent[0], 4);
    assert_eq!(uf.find(2), uf.find(0));
    assert_eq!(UnionFind::<u32>::new(2).find(1), 1);
  }

  #[test]
  fn works_over_node_indices() {
    let mut uf = UnionFind::<NodeIx>::new(3);
    uf.union_into(NodeIx::new(2), NodeIx::new(0));
    assert_eq!(uf.find(NodeIx::new(2)), NodeIx::new(0));
    assert_eq!(uf.parent.len(), 3);
  }
}
