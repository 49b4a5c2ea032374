mod common;

use std::sync::Arc;

use iris_online::{
    Directory, FileDirectory, IrisError, OnlineConfig, OnlinePartition, OpenStatus,
    OperationReplayer, SegmentId, TableType, VersionId,
};
use tempfile::TempDir;

use common::{OfflineBuilder, doc, price, schema};

fn setup() -> (TempDir, Arc<FileDirectory>, OfflineBuilder) {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(FileDirectory::open(dir.path().join("index")).unwrap());
    let mut builder = OfflineBuilder::new(directory.clone(), TableType::Normal);
    let records = vec![
        add_record(1, "a", "10"),
        add_record(2, "b", "20"),
        add_record(3, "c", "30"),
    ];
    builder.build(&records, 1);
    (dir, directory, builder)
}

fn add_record(cursor: u64, pk: &str, value: &str) -> iris_online::OperationRecord {
    iris_online::OperationRecord {
        cursor,
        operation: iris_online::Operation::Add {
            document: doc(pk, value),
        },
    }
}

fn open(directory: &Arc<FileDirectory>) -> iris_online::Result<OnlinePartition> {
    OnlinePartition::builder(
        OnlineConfig::default(),
        schema(TableType::Normal),
        directory.clone(),
    )
    .open(None)
}

#[test]
fn test_reopen_through_files() {
    let (_dir, directory, mut builder) = setup();
    let partition = open(&directory).unwrap();
    assert_eq!(partition.reader().live_doc_count(), 3);

    partition.add_document(doc("d", "40")).unwrap();
    partition.update_document("a", price("11")).unwrap();
    let records = partition.operation_log().read_since(builder.locator(), usize::MAX);
    let version = builder.build(&records, 1);
    assert_eq!(directory.list_versions().unwrap(), [VersionId(0), VersionId(1)]);
    assert!(directory.version_path(version.version_id).exists());

    partition.delete_document("c").unwrap();
    assert_eq!(partition.reopen(false, None), OpenStatus::Ok);
    let reader = partition.reader();
    assert_eq!(reader.get("a").unwrap().field("price"), Some("11"));
    assert!(reader.contains("d"));
    assert!(!reader.contains("c"));

    // A fresh partition sees the same on-disk state.
    drop(partition);
    let reopened = open(&directory).unwrap();
    assert_eq!(reopened.loaded_version().version_id, VersionId(1));
    assert!(reopened.reader().contains("c"));
    assert_eq!(reopened.reader().get("a").unwrap().field("price"), Some("11"));
}

#[test]
fn test_corrupted_segment_fails_reopen() {
    let (_dir, directory, mut builder) = setup();
    let partition = open(&directory).unwrap();
    partition.add_document(doc("d", "40")).unwrap();
    let records = partition.operation_log().read_since(builder.locator(), usize::MAX);
    builder.build(&records, 1);

    let path = directory.segment_path(SegmentId::on_disk(1));
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let reader = partition.reader();
    assert_eq!(partition.reopen(false, None), OpenStatus::Exception);
    assert_eq!(partition.loaded_version().version_id, VersionId(0));
    assert!(Arc::ptr_eq(&reader, &partition.reader()));
    assert!(partition.reader().contains("d"));
    assert!(!partition.is_write_locked());

    let err = open(&directory).unwrap_err();
    assert!(matches!(err, IrisError::Corruption(_)), "{err}");
}

#[test]
fn test_missing_and_truncated_segments() {
    let (_dir, directory, _builder) = setup();
    let path = directory.segment_path(SegmentId::on_disk(0));

    std::fs::write(&path, [1u8, 2]).unwrap();
    let err = directory.load_segment(SegmentId::on_disk(0)).unwrap_err();
    assert!(matches!(err, IrisError::Corruption(_)));

    std::fs::remove_file(&path).unwrap();
    let err = directory.load_segment(SegmentId::on_disk(0)).unwrap_err();
    assert!(err.is_io_failure());
    assert!(open(&directory).is_err());
}
