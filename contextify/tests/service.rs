//! Context service tests through the async request API

use contextify::{ContextService, ContextifyConfig, ServiceError};
use serde_json::json;

fn spawn_service() -> ContextService {
    ContextService::spawn(ContextifyConfig::default()).expect("Failed to spawn context service")
}

#[tokio::test]
async fn test_contexts_do_not_share_globals() {
    let service = spawn_service();

    let left = service.create(json!({ "side": "left" })).await.unwrap();
    let right = service.create(json!({ "side": "right" })).await.unwrap();
    assert_ne!(left, right);

    service
        .run(left, "var only_left = side.toUpperCase()", None)
        .await
        .unwrap();

    assert_eq!(
        service.run(right, "typeof only_left", None).await.unwrap(),
        json!("undefined")
    );
    assert_eq!(
        service.sandbox(left).await.unwrap(),
        json!({ "side": "left", "only_left": "LEFT" })
    );
    assert_eq!(
        service.sandbox(right).await.unwrap(),
        json!({ "side": "right" })
    );
}

#[tokio::test]
async fn test_errors_cross_the_worker_boundary() {
    let service = spawn_service();
    let id = service.create(json!({})).await.unwrap();

    match service.run(id, "if (", Some("input.js")).await {
        Err(ServiceError::Compile(compile)) => assert_eq!(compile.filename, "input.js"),
        other => panic!("expected a compile error, got {:?}", other),
    }

    match service.run(id, "throw new RangeError('out of range')", None).await {
        Err(ServiceError::Thrown(report)) => {
            assert_eq!(report.name.as_deref(), Some("RangeError"));
            assert_eq!(report.message, "out of range");
            assert_eq!(report.filename, "evalmachine.<anonymous>");
        }
        other => panic!("expected a thrown exception, got {:?}", other),
    }

    // The context keeps working after both failures
    assert_eq!(service.run(id, "2 ** 5", None).await.unwrap(), json!(32));
}

#[tokio::test]
async fn test_construction_error_for_non_object() {
    let service = spawn_service();

    let err = service.create(json!(17)).await;
    assert!(matches!(err, Err(ServiceError::Construction(_))), "{:?}", err);
}

#[tokio::test]
async fn test_unknown_context() {
    let service = spawn_service();
    let id = service.create(json!({})).await.unwrap();
    assert!(service.destroy(id).await.unwrap());

    assert_eq!(
        service.sandbox(id).await.unwrap_err(),
        ServiceError::UnknownContext(id)
    );
    assert!(!service.destroy(id).await.unwrap());
}

#[tokio::test]
async fn test_service_handle_is_shareable_across_tasks() {
    let service = spawn_service();
    let id = service.create(json!({ "hits": 0 })).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.run(id, "hits += 1", None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(service.sandbox(id).await.unwrap(), json!({ "hits": 8 }));
}

#[test]
fn test_memory_limit_applies_to_worker_engine() {
    let config = ContextifyConfig {
        memory_limit: Some(64 * 1024 * 1024),
        ..ContextifyConfig::default()
    };
    let service = ContextService::spawn(config).unwrap();
    let id = tokio_test::block_on(service.create(json!({ "ok": true }))).unwrap();
    assert_eq!(
        tokio_test::block_on(service.run(id, "ok", None)).unwrap(),
        json!(true)
    );
}
