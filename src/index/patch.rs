//! Updatable-attribute patches.
//!
//! Updates never rewrite segment documents; they land in a [`PatchStore`]
//! overlay keyed by `(segment, local doc)`. Overwritten values stay resident
//! as wasted bytes until the store is compacted.

use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::index::segment::SegmentId;

type Fields = BTreeMap<String, String>;

#[derive(Debug, Default, Clone)]
struct PatchInner {
    patches: AHashMap<(SegmentId, u32), Fields>,
    used_bytes: u64,
    wasted_bytes: u64,
}

fn field_bytes(name: &str, value: &str) -> u64 {
    (name.len() + value.len() + 2 * std::mem::size_of::<String>()) as u64
}

#[derive(Debug, Default)]
pub struct PatchStore {
    inner: RwLock<PatchInner>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `fields` on a document. Returns `true` if anything changed.
    pub fn apply(&self, segment_id: SegmentId, local: u32, fields: &Fields) -> bool {
        let mut inner = self.inner.write();
        let mut used = 0;
        let mut wasted = 0;
        let entry = inner.patches.entry((segment_id, local)).or_default();
        let mut changed = false;
        for (name, value) in fields {
            match entry.get(name) {
                Some(old) if old == value => {}
                Some(old) => {
                    wasted += field_bytes(name, old);
                    used += field_bytes(name, value);
                    entry.insert(name.clone(), value.clone());
                    changed = true;
                }
                None => {
                    used += field_bytes(name, value);
                    entry.insert(name.clone(), value.clone());
                    changed = true;
                }
            }
        }
        inner.used_bytes += used;
        inner.wasted_bytes += wasted;
        changed
    }

    pub fn get(&self, segment_id: SegmentId, local: u32) -> Option<Fields> {
        self.inner.read().patches.get(&(segment_id, local)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().patches.is_empty()
    }

    /// Bytes held by current patch values.
    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_bytes
    }

    /// Bytes held by overwritten values.
    pub fn wasted_bytes(&self) -> u64 {
        self.inner.read().wasted_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        let inner = self.inner.read();
        inner.used_bytes + inner.wasted_bytes
    }

    pub fn deep_clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
        }
    }

    /// A copy without the wasted bytes.
    pub fn compacted(&self) -> Self {
        let mut inner = self.inner.read().clone();
        inner.wasted_bytes = 0;
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Rename segments. Patches without a mapping are dropped.
    pub fn remap(&self, mapping: &BTreeMap<SegmentId, SegmentId>) -> Self {
        let inner = self.inner.read();
        let mut out = PatchInner::default();
        for ((id, local), fields) in &inner.patches {
            if let Some(to) = mapping.get(id) {
                out.used_bytes += fields.iter().map(|(k, v)| field_bytes(k, v)).sum::<u64>();
                out.patches.insert((*to, *local), fields.clone());
            }
        }
        Self {
            inner: RwLock::new(out),
        }
    }

    /// Copy the patches of `other` for segments accepted by `filter`.
    pub fn absorb(&self, other: &PatchStore, filter: impl Fn(SegmentId) -> bool) {
        let theirs = other.inner.read();
        let mut ours = self.inner.write();
        for ((id, local), fields) in &theirs.patches {
            if filter(*id) {
                ours.used_bytes += fields.iter().map(|(k, v)| field_bytes(k, v)).sum::<u64>();
                ours.patches.insert((*id, *local), fields.clone());
            }
        }
    }

    /// Drop patches of segments rejected by `keep`. Their bytes are released.
    pub fn retain_segments(&self, keep: impl Fn(SegmentId) -> bool) {
        let mut inner = self.inner.write();
        let mut released = 0;
        inner.patches.retain(|(id, _), fields| {
            let kept = keep(*id);
            if !kept {
                released += fields.iter().map(|(k, v)| field_bytes(k, v)).sum::<u64>();
            }
            kept
        });
        inner.used_bytes = inner.used_bytes.saturating_sub(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: &str) -> Fields {
        BTreeMap::from([("price".to_string(), value.to_string())])
    }

    #[test]
    fn test_apply_tracks_waste() {
        let store = PatchStore::new();
        let seg = SegmentId::on_disk(0);
        assert!(store.apply(seg, 1, &fields("10")));
        let used = store.used_bytes();
        assert_eq!(store.wasted_bytes(), 0);

        // Same value again is a no-op.
        assert!(!store.apply(seg, 1, &fields("10")));
        assert_eq!(store.total_bytes(), used);

        assert!(store.apply(seg, 1, &fields("20")));
        assert!(store.wasted_bytes() > 0);
        assert_eq!(store.get(seg, 1).unwrap()["price"], "20");

        let compacted = store.compacted();
        assert_eq!(compacted.wasted_bytes(), 0);
        assert_eq!(compacted.get(seg, 1), store.get(seg, 1));
    }

    #[test]
    fn test_remap_and_retain() {
        let store = PatchStore::new();
        store.apply(SegmentId::realtime(4), 0, &fields("1"));
        store.apply(SegmentId::on_disk(1), 0, &fields("2"));

        let mapping = BTreeMap::from([(SegmentId::realtime(4), SegmentId::realtime(9))]);
        let remapped = store.remap(&mapping);
        assert_eq!(remapped.len(), 1);
        assert!(remapped.get(SegmentId::realtime(9), 0).is_some());

        store.retain_segments(|id| id.is_realtime());
        assert_eq!(store.len(), 1);
        assert!(store.get(SegmentId::on_disk(1), 0).is_none());
    }
}
