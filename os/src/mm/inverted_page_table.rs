//! Inverted page table: every resident page of every process, by [`PageKey`].
//!
//! Entries exist only while the page holds a frame; eviction and teardown
//! remove them together with the frame, under the table-wide lock.

use alloc::{collections::BTreeMap, vec::Vec};

use super::{PageKey, Pid, TranslationEntry, VirtPageNum};

/// Global map from page to translation
#[derive(Default)]
pub struct InvertedPageTable {
    entries: BTreeMap<PageKey, TranslationEntry>,
}

impl InvertedPageTable {
    /// An empty table
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
    /// Number of resident pages
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Nothing is resident
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Copy of the entry for `key`
    pub fn lookup(&self, key: PageKey) -> Option<TranslationEntry> {
        self.entries.get(&key).copied()
    }
    /// The entry for `key`, for in-place bit updates
    pub fn lookup_mut(&mut self, key: PageKey) -> Option<&mut TranslationEntry> {
        self.entries.get_mut(&key)
    }
    /// Record the translation of `key`, returning the one it replaces.
    pub fn insert(&mut self, key: PageKey, entry: TranslationEntry) -> Option<TranslationEntry> {
        debug_assert_eq!(key.vpn, entry.vpn);
        self.entries.insert(key, entry)
    }
    /// Forget the translation of `key`.
    pub fn remove(&mut self, key: PageKey) -> Option<TranslationEntry> {
        self.entries.remove(&key)
    }
    /// OR a mirrored copy's referenced/dirty bits into the entry of `key`.
    ///
    /// Returns false unless the entry still maps the mirror's page to the
    /// mirror's frame; the mirror was stale then and its bits are meaningless.
    pub fn fold(&mut self, key: PageKey, mirror: &TranslationEntry) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.ppn == mirror.ppn && entry.vpn == mirror.vpn => {
                entry.fold(mirror);
                true
            }
            _ => false,
        }
    }
    /// Resident pages of one process
    pub fn keys_of(&self, pid: Pid) -> Vec<PageKey> {
        let first = PageKey::new(pid, VirtPageNum(0));
        let last = PageKey::new(pid, VirtPageNum(usize::MAX));
        self.entries.range(first..=last).map(|(key, _)| *key).collect()
    }
    /// All resident pages
    pub fn iter(&self) -> impl Iterator<Item = (&PageKey, &TranslationEntry)> {
        self.entries.iter()
    }
    /// Log the whole table
    pub fn dump(&self) {
        trace!("-----------page table dump---------");
        for (key, entry) in self.entries.iter() {
            trace!(
                "{}: {:?}, readOnly={}, dirty={}, used={}",
                key,
                entry.ppn,
                entry.read_only(),
                entry.dirty(),
                entry.referenced()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{EntryFlags, PhysPageNum};

    fn entry(vpn: usize, ppn: usize) -> TranslationEntry {
        TranslationEntry::new(VirtPageNum(vpn), PhysPageNum(ppn), EntryFlags::V)
    }

    #[test]
    fn keys_of_is_per_process() {
        let mut ipt = InvertedPageTable::new();
        ipt.insert(PageKey::new(1, VirtPageNum(0)), entry(0, 0));
        ipt.insert(PageKey::new(2, VirtPageNum(0)), entry(0, 1));
        ipt.insert(PageKey::new(1, VirtPageNum(7)), entry(7, 2));
        assert_eq!(
            ipt.keys_of(1),
            [PageKey::new(1, VirtPageNum(0)), PageKey::new(1, VirtPageNum(7))]
        );
        assert!(ipt.keys_of(3).is_empty());
    }

    #[test]
    fn fold_ignores_stale_mirrors() {
        let key = PageKey::new(1, VirtPageNum(4));
        let mut ipt = InvertedPageTable::new();
        ipt.insert(key, entry(4, 2));

        let mut stale = entry(4, 5);
        stale.touch(true);
        assert!(!ipt.fold(key, &stale));
        let mut other_page = entry(6, 2);
        other_page.touch(true);
        assert!(!ipt.fold(key, &other_page));
        assert!(!ipt.lookup(key).unwrap().dirty());

        let mut mirror = entry(4, 2);
        mirror.touch(true);
        assert!(ipt.fold(key, &mirror));
        assert!(ipt.lookup(key).unwrap().dirty());
        assert_eq!(ipt.remove(key).map(|e| e.ppn), Some(Some(PhysPageNum(2))));
        assert!(ipt.is_empty());
    }
}
