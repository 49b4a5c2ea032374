//! Document deletion bitmaps.
//!
//! Deletion is logical: a bit per document, per segment. Snapshots of a
//! partition share one [`DeletionMap`]; a forked branch gets a deep copy.
//!
//! Deletions made by writes also record the cursor of the write, so a reader
//! that only observes operations up to some cursor can ignore later ones.
//! Deletions without a stamp (offline builds, reclaims) are always visible.

use std::collections::BTreeMap;

use ahash::AHashMap;
use bit_vec::BitVec;
use parking_lot::RwLock;

use crate::index::segment::SegmentId;
use crate::index::version::Version;
use crate::oplog::Cursor;

#[derive(Debug, Default)]
pub struct DeletionMap {
    bitmaps: RwLock<AHashMap<SegmentId, BitVec>>,
    stamps: RwLock<AHashMap<(SegmentId, u32), Cursor>>,
}

impl DeletionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletions recorded by an offline build.
    pub fn from_version(version: &Version) -> Self {
        let map = Self::new();
        for entry in &version.deletions {
            for &local in &entry.docs {
                map.delete(entry.segment_id, local);
            }
        }
        map
    }

    /// Mark a document as deleted. Returns `true` if it was live.
    pub fn delete(&self, segment_id: SegmentId, local: u32) -> bool {
        let mut bitmaps = self.bitmaps.write();
        let bits = bitmaps.entry(segment_id).or_default();
        let idx = local as usize;
        if bits.len() <= idx {
            bits.grow(idx + 1 - bits.len(), false);
        }
        if bits.get(idx).unwrap_or(false) {
            return false;
        }
        bits.set(idx, true);
        true
    }

    /// Delete a document on behalf of the write at `cursor`.
    pub fn delete_at(&self, segment_id: SegmentId, local: u32, cursor: Cursor) -> bool {
        if self.is_deleted(segment_id, local) {
            return false;
        }
        // Stamp first: a reader that sees the bit must also see the stamp.
        self.stamps.write().insert((segment_id, local), cursor);
        self.delete(segment_id, local)
    }

    /// Whether a reader observing operations up to `cursor` sees the
    /// document as deleted.
    pub fn is_deleted_as_of(&self, segment_id: SegmentId, local: u32, cursor: Cursor) -> bool {
        self.is_deleted(segment_id, local)
            && self
                .stamps
                .read()
                .get(&(segment_id, local))
                .is_none_or(|&at| at <= cursor)
    }

    /// Clear a deletion mark. Only used to revert a reclaim.
    pub fn undelete(&self, segment_id: SegmentId, local: u32) {
        self.stamps.write().remove(&(segment_id, local));
        let mut bitmaps = self.bitmaps.write();
        if let Some(bits) = bitmaps.get_mut(&segment_id) {
            if (local as usize) < bits.len() {
                bits.set(local as usize, false);
            }
        }
    }

    pub fn is_deleted(&self, segment_id: SegmentId, local: u32) -> bool {
        self.bitmaps
            .read()
            .get(&segment_id)
            .and_then(|bits| bits.get(local as usize))
            .unwrap_or(false)
    }

    pub fn deleted_count(&self, segment_id: SegmentId) -> usize {
        self.bitmaps
            .read()
            .get(&segment_id)
            .map(|bits| bits.iter().filter(|b| *b).count())
            .unwrap_or(0)
    }

    pub fn total_deleted(&self) -> usize {
        self.bitmaps
            .read()
            .values()
            .map(|bits| bits.iter().filter(|b| *b).count())
            .sum()
    }

    pub fn segments(&self) -> Vec<SegmentId> {
        let mut ids: Vec<SegmentId> = self.bitmaps.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// A private copy.
    pub fn deep_clone(&self) -> Self {
        Self {
            bitmaps: RwLock::new(self.bitmaps.read().clone()),
            stamps: RwLock::new(self.stamps.read().clone()),
        }
    }

    /// Union the bits of `other` for the segments accepted by `filter`.
    /// Returns the number of newly deleted documents.
    pub fn merge_from(&self, other: &DeletionMap, filter: impl Fn(SegmentId) -> bool) -> usize {
        let theirs = other.bitmaps.read().clone();
        let mut ours = self.bitmaps.write();
        let mut added = 0;
        for (segment_id, mut bits) in theirs {
            if !filter(segment_id) {
                continue;
            }
            let target = ours.entry(segment_id).or_default();
            let before = target.iter().filter(|b| *b).count();
            if target.len() < bits.len() {
                target.grow(bits.len() - target.len(), false);
            } else if bits.len() < target.len() {
                bits.grow(target.len() - bits.len(), false);
            }
            target.or(&bits);
            added += target.iter().filter(|b| *b).count() - before;
        }
        added
    }

    /// Rename segments. Entries without a mapping are dropped.
    pub fn remap(&self, mapping: &BTreeMap<SegmentId, SegmentId>) -> Self {
        let bitmaps = self.bitmaps.read();
        let remapped = bitmaps
            .iter()
            .filter_map(|(id, bits)| mapping.get(id).map(|to| (*to, bits.clone())))
            .collect();
        Self {
            bitmaps: RwLock::new(remapped),
            stamps: RwLock::default(),
        }
    }

    /// Copy the entries of `other` accepted by `filter` into this map,
    /// replacing existing ones.
    pub fn absorb(&self, other: &DeletionMap, filter: impl Fn(SegmentId) -> bool) {
        let theirs = other.bitmaps.read();
        let mut ours = self.bitmaps.write();
        for (id, bits) in theirs.iter() {
            if filter(*id) {
                ours.insert(*id, bits.clone());
            }
        }
    }

    pub fn retain_segments(&self, keep: impl Fn(SegmentId) -> bool) {
        self.bitmaps.write().retain(|id, _| keep(*id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_and_query() {
        let map = DeletionMap::new();
        let seg = SegmentId::on_disk(1);
        assert!(map.delete(seg, 10));
        assert!(!map.delete(seg, 10));
        assert!(map.is_deleted(seg, 10));
        assert!(!map.is_deleted(seg, 9));
        assert!(!map.is_deleted(SegmentId::on_disk(2), 10));
        assert_eq!(map.deleted_count(seg), 1);

        map.undelete(seg, 10);
        assert!(!map.is_deleted(seg, 10));
        assert_eq!(map.total_deleted(), 0);
    }

    #[test]
    fn test_stamped_deletions_respect_cursor() {
        let map = DeletionMap::new();
        let seg = SegmentId::realtime(2);
        assert!(map.delete_at(seg, 0, 7));
        assert!(!map.delete_at(seg, 0, 9));
        assert!(map.delete(seg, 1));

        assert!(!map.is_deleted_as_of(seg, 0, 6));
        assert!(map.is_deleted_as_of(seg, 0, 7));
        assert!(map.is_deleted_as_of(seg, 1, 0));

        map.undelete(seg, 0);
        assert!(!map.is_deleted_as_of(seg, 0, 100));
        assert!(map.stamps.read().is_empty());
    }

    #[test]
    fn test_deep_clone_is_private() {
        let map = DeletionMap::new();
        let seg = SegmentId::realtime(0);
        map.delete(seg, 1);
        let fork = map.deep_clone();
        fork.delete(seg, 2);
        assert!(!map.is_deleted(seg, 2));
        assert!(fork.is_deleted(seg, 1));
    }

    #[test]
    fn test_merge_from_unions_bits() {
        let rt = SegmentId::realtime(3);
        let disk = SegmentId::on_disk(0);
        let live = DeletionMap::new();
        live.delete(rt, 7);
        live.delete(rt, 1);
        live.delete(disk, 0);

        let branch = DeletionMap::new();
        branch.delete(rt, 1);
        branch.delete(rt, 2);

        let added = branch.merge_from(&live, |id| id.is_realtime());
        assert_eq!(added, 1);
        assert!(branch.is_deleted(rt, 7));
        assert!(branch.is_deleted(rt, 2));
        assert!(!branch.is_deleted(disk, 0));
    }

    #[test]
    fn test_remap() {
        let map = DeletionMap::new();
        map.delete(SegmentId::realtime(5), 0);
        map.delete(SegmentId::realtime(6), 1);
        let mapping = BTreeMap::from([(SegmentId::realtime(5), SegmentId::realtime(2))]);
        let remapped = map.remap(&mapping);
        assert!(remapped.is_deleted(SegmentId::realtime(2), 0));
        assert_eq!(remapped.segments(), vec![SegmentId::realtime(2)]);
    }
}
