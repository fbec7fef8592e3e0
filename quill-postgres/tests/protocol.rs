//! Protocol-level tests driven through the pgwire handler traits with a
//! mock client: simple-query flows, transaction-block semantics, session
//! SET/SHOW dispatch and statement-cache invalidation.

mod common;

use common::*;
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::Response;
use pgwire::error::PgWireError;

fn assert_error_code(error: PgWireError, expected: &str) {
    match error {
        PgWireError::UserError(info) => assert_eq!(info.code(), expected),
        other => panic!("expected a user error, got {other}"),
    }
}

#[tokio::test]
async fn simple_query_round_trip() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    let responses =
        SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SELECT a1, a2 FROM a")
            .await
            .unwrap();
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0], Response::Query(_)));

    let responses = SimpleQueryHandler::do_query(
        service.as_ref(),
        &mut client,
        "INSERT INTO a VALUES (3, 'three')",
    )
    .await
    .unwrap();
    assert!(matches!(responses[0], Response::Execution(_)));
}

#[tokio::test]
async fn multiple_statements_answer_in_one_round_trip() {
    let service = setup_service().await;
    let mut client = MockClient::new();
    let responses =
        SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SELECT 1; SELECT 2;")
            .await
            .unwrap();
    assert_eq!(responses.len(), 2);
}

#[tokio::test]
async fn empty_query_yields_empty_response() {
    let service = setup_service().await;
    let mut client = MockClient::new();
    let responses = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "   ")
        .await
        .unwrap();
    assert!(matches!(responses[0], Response::EmptyQuery));
}

#[tokio::test]
async fn explicit_transaction_block_lifecycle() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    let begin = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "BEGIN")
        .await
        .unwrap();
    assert!(matches!(begin[0], Response::TransactionStart(_)));

    // Work inside the block sees its own writes.
    SimpleQueryHandler::do_query(
        service.as_ref(),
        &mut client,
        "INSERT INTO a VALUES (42, 'answer')",
    )
    .await
    .unwrap();

    let commit = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "COMMIT")
        .await
        .unwrap();
    assert!(matches!(commit[0], Response::TransactionEnd(_)));
}

#[tokio::test]
async fn failed_block_ignores_statements_until_rollback() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "BEGIN")
        .await
        .unwrap();
    // Binder failure marks the block must-abort.
    let err = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SELECT * FROM missing")
        .await
        .unwrap_err();
    assert_error_code(err, "42P01");

    let err = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SELECT 1")
        .await
        .unwrap_err();
    assert_error_code(err, "25P02");

    // COMMIT of a failed block reports ROLLBACK.
    let end = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "COMMIT")
        .await
        .unwrap();
    assert!(matches!(end[0], Response::TransactionEnd(_)));

    // The session is healthy again.
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SELECT 1")
        .await
        .unwrap();
}

#[tokio::test]
async fn set_and_show_are_rejected_inside_transaction_blocks() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    // Outside a block they work and do not open a transaction.
    let set = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SET timezone = 'PST'")
        .await
        .unwrap();
    assert!(matches!(set[0], Response::Execution(_)));
    let show = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SHOW timezone")
        .await
        .unwrap();
    assert!(matches!(show[0], Response::Query(_)));

    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "BEGIN")
        .await
        .unwrap();
    let err =
        SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SET timezone = 'UTC'")
            .await
            .unwrap_err();
    assert_error_code(err, "25001");
    let err = SimpleQueryHandler::do_query(service.as_ref(), &mut client, "SHOW timezone")
        .await
        .unwrap_err();
    assert_error_code(err, "25001");
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "ROLLBACK")
        .await
        .unwrap();
}

#[tokio::test]
async fn database_ddl_is_rejected_inside_transaction_blocks() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "BEGIN")
        .await
        .unwrap();
    let err =
        SimpleQueryHandler::do_query(service.as_ref(), &mut client, "CREATE DATABASE other")
            .await
            .unwrap_err();
    assert_error_code(err, "25001");
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "ROLLBACK")
        .await
        .unwrap();

    // Outside the block both directions work.
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "CREATE DATABASE other")
        .await
        .unwrap();
    assert!(service.catalog().get_database_oid("other").is_some());
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "DROP DATABASE other")
        .await
        .unwrap();
    assert!(service.catalog().get_database_oid("other").is_none());
}

#[tokio::test]
async fn ddl_invalidates_cached_plans() {
    let service = setup_service().await;
    let mut client = MockClient::new();

    let sql = "SELECT a1 FROM a";
    SimpleQueryHandler::do_query(service.as_ref(), &mut client, sql)
        .await
        .unwrap();
    let statement = service.cached_statement(sql).expect("statement is cached");
    let epoch_before = service.ddl_epoch();
    assert!(statement.has_plan_for_epoch(epoch_before));

    SimpleQueryHandler::do_query(service.as_ref(), &mut client, "CREATE INDEX a_idx ON a (a1)")
        .await
        .unwrap();
    let epoch_after = service.ddl_epoch();
    assert_ne!(epoch_before, epoch_after);
    // The old plan is stale now; the next bind produces a fresh one.
    assert!(!statement.has_plan_for_epoch(epoch_after));

    SimpleQueryHandler::do_query(service.as_ref(), &mut client, sql)
        .await
        .unwrap();
    assert!(statement.has_plan_for_epoch(epoch_after));
}

#[tokio::test]
async fn drop_if_exists_keeps_the_session_healthy() {
    let service = setup_service().await;
    let mut client = MockClient::new();
    let responses = SimpleQueryHandler::do_query(
        service.as_ref(),
        &mut client,
        "DROP TABLE IF EXISTS does_not_exist",
    )
    .await
    .unwrap();
    assert!(matches!(responses[0], Response::Execution(_)));
    // Without IF EXISTS the statement fails.
    let err = SimpleQueryHandler::do_query(
        service.as_ref(),
        &mut client,
        "DROP TABLE does_not_exist",
    )
    .await
    .unwrap_err();
    assert_error_code(err, "42P01");
}

#[tokio::test]
async fn explain_reports_the_plan() {
    let service = setup_service().await;
    let mut client = MockClient::new();
    let responses = SimpleQueryHandler::do_query(
        service.as_ref(),
        &mut client,
        "EXPLAIN SELECT a1 FROM a WHERE a1 > 1",
    )
    .await
    .unwrap();
    assert!(matches!(responses[0], Response::Query(_)));
}
