//! Dumped copies of sealed realtime segments.
//!
//! A sealed building segment is frozen into a [`BuiltSegment`] before a
//! reader switches to it. Dumping runs either on the caller's thread
//! ([`DumpContainer::flush`]) or on a background worker fed through a channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::index::partition_data::PartitionData;
use crate::index::segment::{BuildingSegment, BuiltSegment, SegmentId};

/// A dumped copy together with the sealed segment it was frozen from.
/// Realtime ids are renumbered by joins, so an id alone can name a
/// different segment later.
#[derive(Debug, Clone)]
struct DumpedCopy {
    source: Arc<BuildingSegment>,
    built: Arc<BuiltSegment>,
}

impl DumpedCopy {
    fn is_copy_of(&self, segment: &Arc<BuildingSegment>) -> bool {
        Arc::ptr_eq(&self.source, segment)
    }
}

type Dumped = Arc<RwLock<BTreeMap<SegmentId, DumpedCopy>>>;

#[derive(Debug)]
struct DumpWorker {
    sender: Option<Sender<Arc<BuildingSegment>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
pub struct DumpContainer {
    dumped: Dumped,
    worker: Option<DumpWorker>,
}

fn dump_into(dumped: &Dumped, segment: &Arc<BuildingSegment>) -> Arc<BuiltSegment> {
    if let Some(existing) = dumped.read().get(&segment.id()) {
        if existing.is_copy_of(segment) {
            return existing.built.clone();
        }
    }
    let built = Arc::new(segment.freeze());
    let mut dumped = dumped.write();
    match dumped.get(&segment.id()) {
        Some(existing) if existing.is_copy_of(segment) => existing.built.clone(),
        stale => {
            if stale.is_some() {
                log::debug!("replacing stale dumped copy of segment {}", segment.id());
            }
            dumped.insert(
                segment.id(),
                DumpedCopy {
                    source: segment.clone(),
                    built: built.clone(),
                },
            );
            built
        }
    }
}

impl DumpContainer {
    /// A container dumping on the caller's thread only.
    pub fn new() -> Self {
        Self {
            dumped: Arc::new(RwLock::new(BTreeMap::new())),
            worker: None,
        }
    }

    /// A container with a background dump worker.
    pub fn with_worker() -> Result<Self> {
        let dumped: Dumped = Arc::new(RwLock::new(BTreeMap::new()));
        let (sender, receiver) = unbounded::<Arc<BuildingSegment>>();
        let worker_dumped = dumped.clone();
        let handle = std::thread::Builder::new()
            .name("iris-dump".to_string())
            .spawn(move || {
                for segment in receiver {
                    let built = dump_into(&worker_dumped, &segment);
                    log::debug!(
                        "dumped realtime segment {} ({} docs)",
                        built.id(),
                        built.doc_count()
                    );
                }
            })?;
        Ok(Self {
            dumped,
            worker: Some(DumpWorker {
                sender: Some(sender),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    /// Hand a sealed segment to the worker. Without a worker this is a no-op
    /// and the segment waits for the next flush.
    pub fn submit(&self, segment: Arc<BuildingSegment>) {
        let Some(sender) = self.worker.as_ref().and_then(|w| w.sender.as_ref()) else {
            return;
        };
        if sender.send(segment).is_err() {
            log::warn!("dump worker is gone; segment will be dumped on flush");
        }
    }

    /// Dump one segment now.
    pub fn dump(&self, segment: &Arc<BuildingSegment>) -> Arc<BuiltSegment> {
        dump_into(&self.dumped, segment)
    }

    /// Dump every sealed segment of `data` that has no copy yet.
    /// Returns the ids of the newly dumped segments.
    pub fn flush(&self, data: &PartitionData) -> Vec<SegmentId> {
        let mut dumped = Vec::new();
        for segment in data.sealed_segments() {
            if !self.contains(&segment) {
                self.dump(&segment);
                dumped.push(segment.id());
            }
        }
        dumped
    }

    /// Forget the dumped copies of `ids`.
    pub fn discard(&self, ids: &[SegmentId]) {
        let mut dumped = self.dumped.write();
        for id in ids {
            dumped.remove(id);
        }
    }

    /// The dumped copy of `segment`, if one was frozen from it.
    pub fn get(&self, segment: &Arc<BuildingSegment>) -> Option<Arc<BuiltSegment>> {
        self.dumped
            .read()
            .get(&segment.id())
            .filter(|copy| copy.is_copy_of(segment))
            .map(|copy| copy.built.clone())
    }

    pub fn contains(&self, segment: &Arc<BuildingSegment>) -> bool {
        self.get(segment).is_some()
    }

    pub fn len(&self) -> usize {
        self.dumped.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dumped.read().is_empty()
    }

    /// Forget copies that `data` no longer holds as sealed segments.
    pub fn prune(&self, data: &PartitionData) -> usize {
        let sealed = data.sealed_segments();
        let mut dumped = self.dumped.write();
        let before = dumped.len();
        dumped.retain(|_, copy| sealed.iter().any(|s| copy.is_copy_of(s)));
        before - dumped.len()
    }
}

impl Default for DumpContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DumpContainer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            worker.sender.take();
            if let Some(handle) = worker.handle.lock().take() {
                if handle.join().is_err() {
                    log::error!("dump worker panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::index::document::{Document, StoredDoc};

    fn dumped_count(container: &DumpContainer, data: &PartitionData) -> usize {
        data.sealed_segments()
            .iter()
            .filter(|s| container.contains(s))
            .count()
    }

    fn sealed_data() -> PartitionData {
        let data = PartitionData::empty(0);
        data.building()
            .append(StoredDoc::new(Document::new("a"), 1));
        data.seal_building()
    }

    #[test]
    fn test_flush_dumps_sealed_segments_once() {
        let container = DumpContainer::new();
        let data = sealed_data();
        assert_eq!(dumped_count(&container, &data), 0);
        assert_eq!(container.flush(&data).len(), 1);
        assert!(container.flush(&data).is_empty());
        assert_eq!(dumped_count(&container, &data), 1);

        let (switched, _) = data.switch_dumped(|s| container.get(s));
        assert_eq!(container.prune(&switched), 1);
        assert!(container.is_empty());
    }

    #[test]
    fn test_copy_of_renumbered_segment_is_not_reused() {
        let container = DumpContainer::new();
        let old = sealed_data();
        container.flush(&old);

        // A different sealed segment that happens to reuse the same id.
        let new = sealed_data();
        let segment = new.sealed_segments()[0].clone();
        assert_eq!(segment.id(), old.sealed_segments()[0].id());
        assert!(container.get(&segment).is_none());
        assert_eq!(dumped_count(&container, &new), 0);

        assert_eq!(container.flush(&new), vec![segment.id()]);
        assert!(container.get(&segment).is_some());
        assert_eq!(container.prune(&old), 1);
        assert!(container.is_empty());
    }

    #[test]
    fn test_background_worker() {
        let container = DumpContainer::with_worker().unwrap();
        assert!(container.is_async());
        let data = sealed_data();
        for segment in data.sealed_segments() {
            container.submit(segment);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while container.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(container.len(), 1);
    }
}
