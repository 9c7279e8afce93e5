/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Index;
use std::ops::IndexMut;
use std::slice::Iter;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

pub struct Set<T> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  #[inline(never)]
  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  #[inline(never)]
  pub fn card(&self) -> usize {
    self.set.len()
  }

  #[inline(never)]
  pub fn insert(&mut self, item: T) {
    self.set.insert(item);
  }

  #[inline(never)]
  pub fn delete(&mut self, item: T) {
    self.set.remove(&item);
  }

  #[inline(never)]
  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  #[inline(never)]
  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  #[inline(never)]
  pub fn union(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.insert(*item);
    }
  }

  #[inline(never)]
  pub fn to_vec(&self) -> Vec<T> {
    let mut res = Vec::<T>::new();
    for item in self.set.iter() {
      res.push(*item)
    }
    // Don't delete this.  It is important.
    res.sort_unstable();
    res
  }

  #[inline(never)]
  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }

  #[inline(never)]
  pub fn equals(&self, other: &Self) -> bool {
    self.set == other.set
  }

  #[inline(never)]
  pub fn iter(&self) -> std::collections::hash_set::Iter<T> {
    self.set.iter()
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Print the elements in a deterministic order.
    write!(fmt, "{:?}", self.to_vec())
  }
}

impl<T: Eq + Ord + Hash + Copy + Clone + fmt::Debug> Clone for Set<T> {
  #[inline(never)]
  fn clone(&self) -> Self {
    let mut res = Set::<T>::empty();
    for item in self.set.iter() {
      res.set.insert(item.clone());
    }
    res
  }
}

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in startEnt .dotdot( endPlus1Ent ) {
//   }
//
// until such time as |trait Step| is available in stable Rust.

pub trait PlusN {
  fn plus_n(&self, n: usize) -> Self;
}

#[derive(Clone, Copy)]
pub struct Range<T> {
  first: T,
  len: usize,
}

impl<T: Copy + PartialOrd + PlusN> IntoIterator for Range<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}

impl<T: Copy + Eq + Ord + PlusN> Range<T> {
  pub fn new(from: T, len: usize) -> Range<T> {
    Range { first: from, len }
  }
}

pub struct MyIterator<T> {
  range: Range<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusN> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.first.plus_n(self.range.len) {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_n(1);
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + Eq + Ord + Into<u32> + PlusN,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    // FIXME what if this overflows?
    self.vek.push(item);
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  // This is only needed for debug printing.
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $Type:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    // Firstly, the indexing type (TypeIx)
    pub enum $TypeIx {
      $TypeIx(u32),
    }
    impl $TypeIx {
      #[allow(dead_code)]
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        Self::$TypeIx(n)
      }
      #[allow(dead_code)]
      #[inline(always)]
      pub fn get(self) -> u32 {
        match self {
          $TypeIx::$TypeIx(n) => n,
        }
      }
      #[allow(dead_code)]
      #[inline(always)]
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx::$TypeIx(self.get() + delta)
      }
      #[allow(dead_code)]
      #[inline(always)]
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx::$TypeIx(self.get() - delta)
      }
      #[allow(dead_code)]
      pub fn dotdot(&self, last_plus1: $TypeIx) -> Range<$TypeIx> {
        let len = (last_plus1.get() - self.get()) as usize;
        Range::new(*self, len)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.get())
      }
    }
    impl PlusN for $TypeIx {
      #[inline(always)]
      fn plus_n(&self, n: usize) -> Self {
        self.plus(n as u32)
      }
    }
    impl Into<u32> for $TypeIx {
      #[inline(always)]
      fn into(self) -> u32 {
        self.get()
      }
    }
  };
}

generate_boilerplate!(InstIx, Inst, "i");

generate_boilerplate!(NodeIx, Node, "n");

//=============================================================================
// Temporaries and labels.

/// A virtual register.  Physical registers are temporaries too: the target's
/// register file creates them first, so they hold the lowest numbers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Temp(u32);

impl Temp {
  #[inline(always)]
  pub fn get(self) -> u32 {
    self.0
  }
  #[inline(always)]
  pub fn get_usize(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for Temp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "t{}", self.0)
  }
}

/// A code location.  Generated labels print as `L<n>`; named labels (function
/// entries, runtime routines, string literals) print as their name, and two
/// named labels with the same name are the same label.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Label(String);

impl Label {
  pub fn name(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.0)
  }
}

impl fmt::Display for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.0)
  }
}

/// Per-compilation source of fresh temporaries and labels.  Nothing is ever
/// recycled, so every number it hands out is unique within the compilation.
#[derive(Clone, Debug, Default)]
pub struct TempGen {
  next_temp: u32,
  next_label: u32,
}

impl TempGen {
  pub fn new() -> Self {
    Self { next_temp: 0, next_label: 0 }
  }

  pub fn new_temp(&mut self) -> Temp {
    let t = Temp(self.next_temp);
    self.next_temp += 1;
    t
  }

  pub fn new_label(&mut self) -> Label {
    let l = Label(format!("L{}", self.next_label));
    self.next_label += 1;
    l
  }

  pub fn named_label(&self, name: &str) -> Label {
    Label(name.to_string())
  }

  /// Number of temporaries handed out so far.
  pub fn num_temps(&self) -> u32 {
    self.next_temp
  }
}

#[test]
fn test_temp_gen_is_monotonic() {
  let mut gen = TempGen::new();
  let t0 = gen.new_temp();
  let t1 = gen.new_temp();
  assert!(t0 < t1);
  assert_eq!(gen.num_temps(), 2);
  let l0 = gen.new_label();
  let l1 = gen.new_label();
  assert_ne!(l0, l1);
  assert_eq!(format!("{:?}", l0), "L0");
  assert_eq!(gen.named_label("printi"), gen.named_label("printi"));
}

#[test]
fn test_set_to_vec_is_sorted() {
  let mut gen = TempGen::new();
  let ts: Vec<Temp> = (0..5).map(|_| gen.new_temp()).collect();
  let s = Set::from_vec(vec![ts[3], ts[0], ts[4], ts[0]]);
  assert_eq!(s.card(), 3);
  assert_eq!(s.to_vec(), vec![ts[0], ts[3], ts[4]]);
  assert_eq!(format!("{:?}", s), "[t0, t3, t4]");
}

#[test]
fn test_typed_ix_vec_range() {
  let mut v = TypedIxVec::<NodeIx, u32>::new();
  v.resize(4, 7);
  v[NodeIx::new(2)] = 9;
  let ixs: Vec<NodeIx> = NodeIx::new(0).dotdot(NodeIx::new(v.len())).into_iter().collect();
  assert_eq!(ixs.len(), 4);
  assert_eq!(v[ixs[2]], 9);
}
