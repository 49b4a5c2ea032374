mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use iris_online::{OnlineConfig, OpenStatus, OperationReplayer, TableType, VersionId};

use common::{Fixture, doc};

const WRITES: usize = 300;

fn initial() -> Vec<iris_online::Document> {
    vec![doc("a", "10"), doc("b", "20"), doc("c", "30")]
}

/// Writers and readers keep running while the partition reopens twice.
fn reopen_under_load(config: OnlineConfig) {
    let mut fixture = Fixture::new(TableType::Normal, &initial());
    let partition = fixture.open(config);
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let writer = partition.clone();
        s.spawn(move || {
            for i in 0..WRITES {
                writer
                    .add_document(doc(&format!("w{i}"), &i.to_string()))
                    .unwrap();
                if i % 7 == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let reader = partition.clone();
        let done = &done;
        s.spawn(move || {
            while !done.load(Ordering::SeqCst) {
                // Untouched documents stay visible through every swap.
                assert!(reader.reader().contains("c"));
                std::thread::yield_now();
            }
        });

        for expected in [VersionId(1), VersionId(2)] {
            while partition.operation_log().last_cursor() < 3 + WRITES as u64 / 3 {
                std::thread::yield_now();
            }
            let version = fixture.build_from(&partition, 2);
            assert_eq!(version.version_id, expected);
            assert_eq!(partition.reopen(false, None), OpenStatus::Ok);
            assert_eq!(partition.loaded_version().version_id, expected);
        }

        while partition.operation_log().last_cursor() < 3 + WRITES as u64 {
            std::thread::yield_now();
        }
        done.store(true, Ordering::SeqCst);
    });

    let reader = partition.reader();
    for i in 0..WRITES {
        let pk = format!("w{i}");
        assert_eq!(
            reader.get(&pk).map(|d| d.field("price").map(str::to_string)),
            Some(Some(i.to_string())),
            "{pk} lost"
        );
    }
    assert_eq!(reader.live_doc_count(), 3 + WRITES as u64);
    assert_eq!(reader.applied_cursor(), 3 + WRITES as u64);
    assert!(!partition.is_write_locked());
    assert!(!partition.is_reopening());
}

#[test]
fn test_join_reopen_under_load() {
    reopen_under_load(OnlineConfig::default());
}

#[test]
fn test_optimized_reopen_under_load() {
    let config = OnlineConfig::builder()
        .enable_optimized_reopen(true)
        .build()
        .unwrap();
    reopen_under_load(config);
}

#[test]
fn test_async_dump_reopen_under_load() {
    let config = OnlineConfig::builder()
        .enable_async_dump_segment(true)
        .building_segment_max_docs(16)
        .build()
        .unwrap();
    reopen_under_load(config);
}

#[test]
fn test_upserts_never_hide_document() {
    const UPSERTS: usize = 3000;
    let config = OnlineConfig::builder()
        .building_segment_max_docs(64)
        .build()
        .unwrap();
    let fixture = Fixture::new(TableType::Normal, &initial());
    let partition = fixture.open(config);
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let writer = partition.clone();
        let done = &done;
        s.spawn(move || {
            for i in 0..UPSERTS {
                writer.add_document(doc("a", &i.to_string())).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..3 {
            let reader = partition.clone();
            s.spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    // A snapshot stays consistent while writes and seals go on.
                    let snapshot = reader.reader();
                    for _ in 0..4 {
                        assert!(snapshot.contains("a"));
                    }
                }
            });
        }
    });

    let reader = partition.reader();
    let last = (UPSERTS - 1).to_string();
    assert_eq!(reader.get("a").unwrap().field("price"), Some(last.as_str()));
    assert_eq!(reader.live_doc_count(), 3);
}

#[test]
fn test_concurrent_reopen_calls_serialize() {
    let mut fixture = Fixture::new(TableType::Normal, &initial());
    let partition = fixture.open(OnlineConfig::default());
    partition.add_document(doc("d", "40")).unwrap();
    fixture.build_from(&partition, 1);

    let statuses: Vec<OpenStatus> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let partition = partition.clone();
                s.spawn(move || partition.reopen(false, None))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(statuses.iter().all(|s| *s == OpenStatus::Ok));
    assert_eq!(partition.loaded_version().version_id, VersionId(1));
    assert!(partition.reader().contains("d"));
}
