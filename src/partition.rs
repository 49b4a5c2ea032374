//! The online partition: live state, the write path and the reopen driver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::config::OnlineConfig;
use crate::error::{IrisError, Result};
use crate::index::directory::Directory;
use crate::index::document::Document;
use crate::index::dump::DumpContainer;
use crate::index::modifier::{ModifyMode, PartitionModifier};
use crate::index::partition_data::PartitionData;
use crate::index::reader::{PartitionReader, ReaderContainer};
use crate::index::segment::BuiltSegment;
use crate::index::version::{Version, VersionId};
use crate::memory::{MemoryQuotaController, MemoryReservation};
use crate::metrics::{NoopMetrics, ReopenMetrics};
use crate::oplog::{Cursor, Operation, OperationLog, OperationRecord};
use crate::reopen::context::{DataGuard, WriteToken};
use crate::reopen::{
    ChainCreator, DeciderInput, OpenStatus, ReopenContext, ReopenDecider, ReopenType,
};
use crate::schema::Schema;

/// The installed partition data and the reader serving it.
#[derive(Debug)]
pub struct LiveState {
    pub(crate) data: PartitionData,
    pub(crate) reader: Arc<PartitionReader>,
}

impl LiveState {
    pub fn data(&self) -> &PartitionData {
        &self.data
    }

    pub fn reader(&self) -> &Arc<PartitionReader> {
        &self.reader
    }
}

/// State shared between the partition handle and in-flight reopen contexts.
#[derive(Debug)]
pub(crate) struct PartitionCore {
    pub config: OnlineConfig,
    pub schema: Arc<Schema>,
    pub directory: Arc<dyn Directory>,
    pub memory: Arc<MemoryQuotaController>,
    pub metrics: Arc<dyn ReopenMetrics>,
    pub oplog: Arc<OperationLog>,
    /// Serializes writers against the locked reopen steps.
    pub data_lock: Arc<Mutex<()>>,
    live: RwLock<Arc<LiveState>>,
    pub readers: ReaderContainer,
    pub dump_container: DumpContainer,
    /// Set while a reopen context exists; writers defer sealing.
    pub reopening: AtomicBool,
    reopen_lock: Mutex<()>,
    /// Memory held by the loaded version.
    resident: Mutex<MemoryReservation>,
}

impl PartitionCore {
    pub fn live(&self) -> Arc<LiveState> {
        self.live.read().clone()
    }

    /// Swap in a new live state. Returns the one it replaced.
    pub fn install(&self, token: &WriteToken<'_>, state: LiveState) -> Arc<LiveState> {
        assert!(
            token.guards(&self.data_lock),
            "live state installed without the partition data lock"
        );
        std::mem::replace(&mut *self.live.write(), Arc::new(state))
    }

    pub fn restore_live(&self, token: &WriteToken<'_>, previous: Arc<LiveState>) {
        assert!(
            token.guards(&self.data_lock),
            "live state restored without the partition data lock"
        );
        *self.live.write() = previous;
    }
}

/// Load the on-disk segments of `version`, reusing the ones `reuse` already
/// holds.
pub(crate) fn load_version_data(
    directory: &dyn Directory,
    version: &Arc<Version>,
    reuse: Option<&PartitionData>,
) -> Result<PartitionData> {
    let segments = version
        .segments
        .par_iter()
        .map(|info| {
            let existing = reuse.and_then(|data| {
                data.on_disk_segments()
                    .iter()
                    .find(|s| s.info() == info)
                    .cloned()
            });
            if let Some(segment) = existing {
                return Ok(segment);
            }
            let segment = directory.load_segment(info.segment_id)?;
            if segment.info().doc_count != info.doc_count {
                return Err(IrisError::corruption(format!(
                    "segment {} holds {} documents, version {} expects {}",
                    info.segment_id,
                    segment.info().doc_count,
                    version.version_id,
                    info.doc_count
                )));
            }
            Ok(Arc::new(segment))
        })
        .collect::<Result<Vec<Arc<BuiltSegment>>>>()?;
    Ok(PartitionData::new(version.clone(), segments))
}

/// Builder for [`OnlinePartition`].
pub struct OnlinePartitionBuilder {
    config: OnlineConfig,
    schema: Arc<Schema>,
    directory: Arc<dyn Directory>,
    memory: Option<Arc<MemoryQuotaController>>,
    metrics: Option<Arc<dyn ReopenMetrics>>,
}

impl OnlinePartitionBuilder {
    pub fn memory(mut self, memory: Arc<MemoryQuotaController>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ReopenMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open the partition on `target`, or on the newest stored version when
    /// `target` is `None`. With no stored version the partition starts empty.
    pub fn open(self, target: Option<VersionId>) -> Result<OnlinePartition> {
        self.config.validate()?;
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(MemoryQuotaController::new(u64::MAX)));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetrics) as Arc<dyn ReopenMetrics>);

        let version = match target {
            Some(id) => Some(self.directory.load_version(id)?),
            None => self.directory.latest_version()?,
        };
        let data = match version {
            Some(version) => {
                if version.schema_id != self.schema.schema_id {
                    return Err(IrisError::invalid_argument(format!(
                        "version {} uses schema {}, partition uses {}",
                        version.version_id, version.schema_id, self.schema.schema_id
                    )));
                }
                load_version_data(self.directory.as_ref(), &Arc::new(version), None)?
            }
            None => PartitionData::empty(self.schema.schema_id),
        };

        let mem_bytes = data.version().mem_bytes();
        let Some(resident) = memory.try_reserve(mem_bytes) else {
            return Err(IrisError::index(format!(
                "version {} needs {mem_bytes} bytes, {} free",
                data.version().version_id,
                memory.free()
            )));
        };
        let dump_container = if self.config.enable_async_dump_segment {
            DumpContainer::with_worker()?
        } else {
            DumpContainer::new()
        };

        let reader = Arc::new(PartitionReader::new(data.clone(), self.schema.clone()));
        let readers = ReaderContainer::new();
        readers.add(reader.clone());
        let oplog = Arc::new(OperationLog::starting_after(data.applied_cursor()));
        log::info!(
            "opened partition '{}' on version {} ({} segments)",
            self.schema.name,
            data.version().version_id,
            data.on_disk_segments().len()
        );

        let core = PartitionCore {
            config: self.config,
            schema: self.schema,
            directory: self.directory,
            memory,
            metrics,
            oplog,
            data_lock: Arc::new(Mutex::new(())),
            live: RwLock::new(Arc::new(LiveState { data, reader })),
            readers,
            dump_container,
            reopening: AtomicBool::new(false),
            reopen_lock: Mutex::new(()),
            resident: Mutex::new(resident),
        };
        Ok(OnlinePartition {
            core: Arc::new(core),
        })
    }
}

/// A serving partition.
///
/// Readers go through [`OnlinePartition::reader`] and never block. Writes are
/// serialized by the partition data lock. [`OnlinePartition::reopen`] moves the
/// partition to another on-disk version while both keep running.
#[derive(Debug, Clone)]
pub struct OnlinePartition {
    core: Arc<PartitionCore>,
}

impl OnlinePartition {
    pub fn builder(
        config: OnlineConfig,
        schema: Arc<Schema>,
        directory: Arc<dyn Directory>,
    ) -> OnlinePartitionBuilder {
        OnlinePartitionBuilder {
            config,
            schema,
            directory,
            memory: None,
            metrics: None,
        }
    }

    /// Open a partition with no-op metrics.
    pub fn open(
        config: OnlineConfig,
        schema: Arc<Schema>,
        directory: Arc<dyn Directory>,
        memory: Arc<MemoryQuotaController>,
        target: Option<VersionId>,
    ) -> Result<Self> {
        Self::builder(config, schema, directory)
            .memory(memory)
            .open(target)
    }

    pub fn add_document(&self, document: Document) -> Result<Cursor> {
        self.write(Operation::Add { document })
    }

    pub fn update_document(
        &self,
        pk: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Result<Cursor> {
        self.write(Operation::Update {
            pk: pk.into(),
            fields,
        })
    }

    pub fn delete_document(&self, pk: impl Into<String>) -> Result<Cursor> {
        self.write(Operation::Delete { pk: pk.into() })
    }

    fn write(&self, operation: Operation) -> Result<Cursor> {
        let core = &self.core;
        let guard = core.data_lock.lock_arc();
        let live = core.live();
        let modifier = PartitionModifier::new(&live.data, &core.schema, ModifyMode::Live);
        modifier.check(&operation)?;

        let cursor = core.oplog.append(operation.clone());
        modifier.apply(&OperationRecord { cursor, operation })?;

        let building = live.data.building();
        if building.doc_count() as usize >= core.config.building_segment_max_docs
            && !core.reopening.load(Ordering::SeqCst)
        {
            self.seal_building(&guard, &live);
        }
        Ok(cursor)
    }

    fn seal_building(&self, guard: &DataGuard, live: &LiveState) {
        let core = &self.core;
        let building = live.data.building().clone();
        let sealed = live.data.seal_building();
        core.dump_container.submit(building.clone());
        let reader = Arc::new(PartitionReader::new(sealed.clone(), core.schema.clone()));
        core.readers.add(reader.clone());
        core.install(
            &WriteToken::new(guard),
            LiveState {
                data: sealed,
                reader,
            },
        );
        let evicted = core.readers.evict_unused();
        log::debug!(
            "sealed building segment {} at {} docs, {evicted} readers evicted",
            building.id(),
            building.doc_count()
        );
    }

    /// Move the partition to `target` (the newest stored version when `None`),
    /// or shed memory, depending on what the current state calls for.
    ///
    /// A failed attempt leaves the partition exactly as it was.
    pub fn reopen(&self, force: bool, target: Option<VersionId>) -> OpenStatus {
        let core = &self.core;
        let _serial = core.reopen_lock.lock();
        let started = Instant::now();

        let live = core.live();
        let resolved = match self.resolve_target(target, live.data.version()) {
            Ok(version) => version,
            Err(e) => {
                log::warn!("reopen target {target:?} could not be read: {e}");
                None
            }
        };
        let decision = ReopenDecider::new(&core.config, &core.schema).classify(&DeciderInput {
            data: &live.data,
            dump_container: &core.dump_container,
            memory: &core.memory,
            target: resolved.as_ref(),
            force,
        });
        let has_loaded_version = live.data.version().is_valid();
        drop(live);

        let reopen_type = decision.reopen_type;
        log::info!("reopen classified as {reopen_type}");
        let early = match reopen_type {
            ReopenType::NoNeed => Some(OpenStatus::Ok),
            ReopenType::Invalid | ReopenType::InconsistentSchema => Some(OpenStatus::Exception),
            ReopenType::UnableNormal | ReopenType::UnableForce => Some(OpenStatus::OutOfMemory),
            ReopenType::IndexRollback if !force => {
                log::warn!("rollback to an older version requires a forced reopen");
                Some(OpenStatus::Exception)
            }
            _ => None,
        };
        if let Some(status) = early {
            core.metrics
                .on_reopen(reopen_type, started.elapsed(), status == OpenStatus::Ok);
            return status;
        }
        let Some(version) = decision.version else {
            return OpenStatus::Exception;
        };

        let chain =
            ChainCreator::new(&core.config, core.schema.table_type).create(reopen_type, has_loaded_version);
        let mut ctx = self.create_reopen_context(version, reopen_type);
        let outcome = chain.execute(&mut ctx);
        let status = if outcome.succeeded {
            self.commit(&mut ctx);
            OpenStatus::Ok
        } else {
            ctx.failure()
                .map_or(OpenStatus::Exception, |failure| failure.status())
        };
        drop(ctx);

        core.metrics
            .on_reopen(reopen_type, started.elapsed(), status == OpenStatus::Ok);
        log::info!(
            "{reopen_type} finished with {status:?} in {:?}",
            started.elapsed()
        );
        status
    }

    fn resolve_target(
        &self,
        target: Option<VersionId>,
        loaded: &Arc<Version>,
    ) -> Result<Option<Arc<Version>>> {
        let directory = &self.core.directory;
        match target {
            Some(id) if id == loaded.version_id => Ok(Some(loaded.clone())),
            Some(id) => directory.load_version(id).map(|v| Some(Arc::new(v))),
            None => match directory.latest_version()? {
                Some(version) if version.version_id == loaded.version_id => Ok(Some(loaded.clone())),
                Some(version) => Ok(Some(Arc::new(version))),
                None => Ok(Some(loaded.clone())),
            },
        }
    }

    /// A context for driving a chain by hand. Holds the partition data lock
    /// until a step releases it or the context is dropped.
    pub fn create_reopen_context(
        &self,
        version: Arc<Version>,
        reopen_type: ReopenType,
    ) -> ReopenContext {
        ReopenContext::new(self.core.clone(), version, reopen_type)
    }

    fn commit(&self, ctx: &mut ReopenContext) {
        let core = &self.core;
        let live = core.live();
        let version = live.data.version();
        {
            let mut resident = core.resident.lock();
            resident.merge(ctx.take_reservation());
            resident.shrink_to(version.mem_bytes());
        }
        core.oplog.truncate_through(version.locator);
        let evicted = core.readers.evict_unused();
        let pruned = core.dump_container.prune(&live.data);
        log::debug!(
            "committed version {}: {evicted} readers evicted, {pruned} dumped segments pruned",
            version.version_id
        );
    }

    /// The reader serving the live state.
    pub fn reader(&self) -> Arc<PartitionReader> {
        self.core.live().reader.clone()
    }

    pub fn loaded_version(&self) -> Arc<Version> {
        self.core.live().data.version().clone()
    }

    pub fn partition_data(&self) -> PartitionData {
        self.core.live().data.clone()
    }

    pub fn reader_container(&self) -> &ReaderContainer {
        &self.core.readers
    }

    pub fn dump_container(&self) -> &DumpContainer {
        &self.core.dump_container
    }

    pub fn operation_log(&self) -> &Arc<OperationLog> {
        &self.core.oplog
    }

    pub fn memory_controller(&self) -> &Arc<MemoryQuotaController> {
        &self.core.memory
    }

    pub fn config(&self) -> &OnlineConfig {
        &self.core.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.core.schema
    }

    /// Memory held for the loaded version.
    pub fn resident_bytes(&self) -> u64 {
        self.core.resident.lock().bytes()
    }

    pub fn is_write_locked(&self) -> bool {
        self.core.data_lock.is_locked()
    }

    pub fn is_reopening(&self) -> bool {
        self.core.reopening.load(Ordering::SeqCst)
    }
}
