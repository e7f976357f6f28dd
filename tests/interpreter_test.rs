mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::{catalog, describe, logo_url, png_bytes, RouteFetch};
use receipt_sync::markup::{InterpretError, Interpreter, ParseError};
use receipt_sync::model::{PrintOperation, ReceiptBody, TextStyle};
use receipt_sync::store::{ReceiptStore, StoreError};
use tempfile::tempdir;

async fn interpreter(fetch: &RouteFetch, dir: &std::path::Path) -> Interpreter {
    let store = ReceiptStore::open(dir).await.unwrap();
    Interpreter::new(catalog(fetch, 1), store)
}

fn kinds(ops: &[PrintOperation]) -> Vec<String> {
    ops.iter().map(describe).collect()
}

#[tokio::test]
async fn bold_text_then_cut() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let out = interp
        .interpret(&ReceiptBody::from_lines(["B;2;HELLO", "#fin#"]))
        .await
        .unwrap();

    assert_eq!(out.operations.len(), 2);
    match &out.operations[0] {
        PrintOperation::EmitText { content, style } => {
            assert_eq!(content, "HELLO");
            assert_eq!(
                *style,
                TextStyle { bold: true, height_unit: 2, ..TextStyle::default() }
            );
        }
        other => panic!("unexpected operation: {other:?}"),
    }
    assert!(matches!(out.operations[1], PrintOperation::Cut));
    assert!(out.warnings.is_empty());
}

#[tokio::test]
async fn malformed_record_yields_error_and_no_operations() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let err = interp
        .interpret(&ReceiptBody::from_lines(["X;notanumber;Y"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InterpretError::Malformed(ParseError::InvalidHeight { line: 1, ref value }) if value == "notanumber"
    ));
}

#[tokio::test]
async fn malformed_record_aborts_before_any_download() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let body = ReceiptBody::from_lines(["#url#http://cdn.test/a.png", "#logo#", "N;1"]);
    let err = interp.interpret(&body).await.unwrap_err();
    assert!(matches!(err, InterpretError::Malformed(ParseError::FieldCount { line: 3, found: 2 })));
    assert!(fetch.calls().is_empty());
}

#[tokio::test]
async fn inline_image_is_followed_by_blank_line() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let line = format!("#img#{}", STANDARD.encode(png_bytes(4, 4)));
    let out = interp
        .interpret(&ReceiptBody::from_lines([line.as_str(), "N;1;after"]))
        .await
        .unwrap();
    assert_eq!(kinds(&out.operations), vec!["image:inline", "text:N:1:", "text:N:1:after"]);
}

#[tokio::test]
async fn undecodable_inline_image_is_malformed() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let line = format!("#img#{}", STANDARD.encode(b"definitely not an image"));
    let err = interp
        .interpret(&ReceiptBody::from_lines(["N;1;a", line.as_str()]))
        .await
        .unwrap_err();
    assert!(matches!(err, InterpretError::Malformed(ParseError::InvalidImage { line: 2, .. })));
}

#[tokio::test]
async fn failed_url_image_is_skipped_with_warning() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    fetch.respond("http://cdn.test/ok.png", png_bytes(8, 2));
    fetch.fail("http://cdn.test/broken.png", 500);
    fetch.respond("http://cdn.test/garbage.png", b"<html>");
    let interp = interpreter(&fetch, td.path()).await;

    let body = ReceiptBody::from_lines([
        "N;1;top",
        "#url#http://cdn.test/broken.png",
        "#url#http://cdn.test/ok.png",
        "#url#http://cdn.test/garbage.png",
        "N;1;bottom",
        "#fin#",
    ]);
    let out = interp.interpret(&body).await.unwrap();
    assert_eq!(
        kinds(&out.operations),
        vec!["text:N:1:top", "image:url", "text:N:1:bottom", "cut"]
    );
    assert_eq!(out.warnings.len(), 2);
    assert!(out.warnings[0].contains("broken.png"));
    assert!(out.warnings[1].contains("garbage.png"));
}

#[tokio::test]
async fn logo_is_downloaded_once_then_served_from_cache() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    fetch.respond(logo_url(), png_bytes(16, 4));
    let interp = interpreter(&fetch, td.path()).await;

    let body = ReceiptBody::from_lines(["#logo#", "N;1;x"]);
    for _ in 0..3 {
        let out = interp.interpret(&body).await.unwrap();
        assert_eq!(kinds(&out.operations), vec!["image:logo", "text:N:1:x"]);
    }
    assert_eq!(fetch.calls_to(&logo_url()), 1);
    assert!(td.path().join("logo.jpg").exists());
}

#[tokio::test]
async fn missing_logo_is_skipped_and_retried_later() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let body = ReceiptBody::from_lines(["#logo#", "N;1;x"]);
    let out = interp.interpret(&body).await.unwrap();
    assert_eq!(kinds(&out.operations), vec!["text:N:1:x"]);
    assert_eq!(out.warnings.len(), 1);

    fetch.respond(logo_url(), png_bytes(16, 4));
    let out = interp.interpret(&body).await.unwrap();
    assert_eq!(kinds(&out.operations), vec!["image:logo", "text:N:1:x"]);
}

#[tokio::test]
async fn corrupt_cached_logo_is_discarded() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;
    std::fs::write(td.path().join("logo.jpg"), b"truncated").unwrap();

    let out = interp.interpret(&ReceiptBody::from_lines(["#logo#"])).await.unwrap();
    assert!(out.operations.is_empty());
    assert_eq!(out.warnings.len(), 1);
    assert!(!td.path().join("logo.jpg").exists());
}

#[tokio::test]
async fn logo_cache_write_failure_is_a_storage_error() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    fetch.respond(logo_url(), png_bytes(16, 4));
    let interp = interpreter(&fetch, td.path()).await;
    // The atomic write goes through this temp path; a directory there makes it fail.
    std::fs::create_dir(td.path().join(".logo.jpg.tmp")).unwrap();

    let err = interp
        .interpret(&ReceiptBody::from_lines(["#logo#", "N;1;x"]))
        .await
        .unwrap_err();
    assert!(matches!(err, InterpretError::Store(StoreError::Io { .. })));
    assert_eq!(fetch.calls_to(&logo_url()), 1);
}

#[tokio::test]
async fn unreadable_logo_cache_is_a_storage_error() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    fetch.respond(logo_url(), png_bytes(16, 4));
    let interp = interpreter(&fetch, td.path()).await;
    std::fs::create_dir(td.path().join("logo.jpg")).unwrap();

    let err = interp
        .interpret(&ReceiptBody::from_lines(["#logo#"]))
        .await
        .unwrap_err();
    assert!(matches!(err, InterpretError::Store(StoreError::Io { .. })));
    assert!(fetch.calls().is_empty());
}

#[tokio::test]
async fn records_after_cut_are_ignored() {
    let td = tempdir().unwrap();
    let fetch = RouteFetch::default();
    let interp = interpreter(&fetch, td.path()).await;

    let body = ReceiptBody::from_lines(["N;1;a", "", "#fin#", "not;even;a;record", "#logo#"]);
    let out = interp.interpret(&body).await.unwrap();
    assert_eq!(kinds(&out.operations), vec!["text:N:1:a", "cut"]);
    assert!(fetch.calls().is_empty());
}
