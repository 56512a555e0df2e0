//! Sorted address ranges with binary search
//!
//! Modules, managed JIT symbols and loaded native images all cover a
//! `[base, base + size)` slice of a process's address space. They are kept in
//! vectors sorted by base and assumed non-overlapping, so "which item contains
//! this address" is a binary search shared by all of them.

use std::cmp::Ordering;

/// An item covering `[base, base + size)`.
pub trait AddressRange {
    fn base(&self) -> u64;

    fn size(&self) -> u32;

    /// One past the last covered address.
    fn end(&self) -> u64 {
        self.base().saturating_add(u64::from(self.size()))
    }

    /// Check if an address falls within this range
    fn contains(&self, address: u64) -> bool {
        address >= self.base() && address < self.end()
    }
}

/// Find the item containing `address` in `items`, sorted ascending by base.
///
/// Addresses below the first base or at/after the last end are rejected
/// without searching.
pub fn try_find<T: AddressRange>(items: &[T], address: u64) -> Option<&T> {
    let (first, last) = (items.first()?, items.last()?);
    if address < first.base() || address >= last.end() {
        return None;
    }

    items
        .binary_search_by(|item| {
            if address < item.base() {
                Ordering::Greater
            } else if address >= item.end() {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
        .ok()
        .map(|index| &items[index])
}

/// Sort `items` ascending by base.
pub fn sort_by_base<T: AddressRange>(items: &mut [T]) {
    items.sort_by_key(|item| item.base());
}
