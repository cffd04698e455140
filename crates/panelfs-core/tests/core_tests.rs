use std::path::PathBuf;

use panelfs_core::{
    ArchiveFormat, CompressPayload, ErrorCode, RegistryError, TaskError, TaskFailure, TaskFilter,
    TaskKind, TaskPayload, TaskRecord, TaskRegistry, TaskStatus, TransferPayload,
};

fn move_payload() -> TaskPayload {
    TaskPayload::Move(TransferPayload {
        sources: vec![PathBuf::from("/srv/world"), PathBuf::from("/srv/plugins")],
        destination: PathBuf::from("/srv/archive"),
    })
}

#[test]
fn test_task_kind_parsing() {
    assert_eq!(TaskKind::parse("copy").unwrap(), TaskKind::Copy);
    assert_eq!(TaskKind::parse("Extract").unwrap(), TaskKind::Extract);
    assert!(matches!(
        TaskKind::parse("delete"),
        Err(TaskError::InvalidKind(name)) if name == "delete"
    ));
}

#[test]
fn test_create_request_deserializes() {
    let json = r#"{
        "type": "compress",
        "payload": {"sources": ["/srv/world"], "archive": "/srv/world.tgz", "format": "tgz"}
    }"#;
    let payload: TaskPayload = serde_json::from_str(json).unwrap();

    match payload {
        TaskPayload::Compress(CompressPayload { format, level, .. }) => {
            assert_eq!(format, ArchiveFormat::TarGz);
            assert_eq!(level, 6);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_record_serializes_flat() {
    let record = TaskRecord::new(move_payload());
    let json = serde_json::to_value(&record).unwrap();

    assert_eq!(json["type"], "move");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["progress"], 0);
    assert_eq!(json["payload"]["destination"], "/srv/archive");
    assert!(json.get("createdAt").is_some());
    assert!(json.get("error").is_none());

    let back: TaskRecord = serde_json::from_value(json).unwrap();
    assert_eq!(back, record);
}

#[test]
fn test_validation_rejects_relative_and_empty() {
    let registry = TaskRegistry::new();

    let relative = TaskPayload::Copy(TransferPayload {
        sources: vec![PathBuf::from("world")],
        destination: PathBuf::from("/srv/backup"),
    });
    assert!(matches!(
        registry.create(TaskKind::Copy, relative),
        Err(RegistryError::Invalid(TaskError::InvalidPath { .. }))
    ));

    let empty = TaskPayload::Copy(TransferPayload {
        sources: Vec::new(),
        destination: PathBuf::from("/srv/backup"),
    });
    assert!(matches!(
        registry.create(TaskKind::Copy, empty),
        Err(RegistryError::Invalid(TaskError::MissingField("sources")))
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_failed_record_carries_partial_lists() {
    let registry = TaskRegistry::new();
    let id = registry.create(TaskKind::Move, move_payload()).unwrap();
    registry.start(id).unwrap();
    registry.update_progress(id, 50, "Moving world");

    let failure = TaskFailure::new(ErrorCode::Fatal, "Permission denied")
        .at("/srv/plugins")
        .with_partial(vec![PathBuf::from("/srv/world")], vec![PathBuf::from("/srv/plugins")]);
    assert!(registry.fail(id, failure));

    let record = registry.get(id).unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.progress, 50);
    let error = record.error.unwrap();
    assert_eq!(error.completed, vec![PathBuf::from("/srv/world")]);
    assert_eq!(error.pending, vec![PathBuf::from("/srv/plugins")]);
    assert!(record.message.contains("1 of 2 entries completed"));
}

#[test]
fn test_terminal_states_are_final() {
    let registry = TaskRegistry::new();
    let id = registry.create(TaskKind::Move, move_payload()).unwrap();
    registry.start(id).unwrap();
    registry.complete(id);

    assert!(!registry.fail(id, TaskFailure::new(ErrorCode::Fatal, "late")));
    assert!(!registry.cancel(id).unwrap());
    assert_eq!(registry.get(id).unwrap().status, TaskStatus::Completed);
}

#[test]
fn test_list_orders_by_creation() {
    let registry = TaskRegistry::new();
    let first = registry.create(TaskKind::Move, move_payload()).unwrap();
    let second = registry.create(TaskKind::Move, move_payload()).unwrap();

    let ids: Vec<_> = registry
        .list(&TaskFilter::all())
        .into_iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first) && ids.contains(&second));

    let records = registry.list(&TaskFilter::all());
    assert!(records[0].created_at <= records[1].created_at);
}

#[test]
fn test_concurrent_updates_keep_progress_monotonic() {
    let registry = std::sync::Arc::new(TaskRegistry::new());
    let id = registry.create(TaskKind::Move, move_payload()).unwrap();
    registry.start(id).unwrap();

    let handles: Vec<_> = (0..8u8)
        .map(|worker| {
            let registry = std::sync::Arc::clone(&registry);
            std::thread::spawn(move || {
                for step in 0..10u8 {
                    registry.update_progress(id, worker * 10 + step, "working");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.get(id).unwrap().progress, 79);
}
