//! Shared harness for protocol-level tests: a mock pgwire client and a
//! session service over a freshly bootstrapped catalog.

use std::collections::HashMap;
use std::sync::Arc;

use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::{ClientInfo, PgWireConnectionState};
use pgwire::messages::response::TransactionStatus;
use pgwire::messages::startup::SecretKey;
use pgwire::messages::ProtocolVersion;

use quill_engine::ExecutionSettings;
use quill_postgres::{bootstrap_catalog, QuillSessionService};

pub struct MockClient {
    metadata: HashMap<String, String>,
    transaction_status: TransactionStatus,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            metadata: HashMap::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }
}

impl ClientInfo for MockClient {
    fn socket_addr(&self) -> std::net::SocketAddr {
        "127.0.0.1:5432".parse().unwrap()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::PROTOCOL3_0
    }

    fn set_protocol_version(&mut self, _version: ProtocolVersion) {}

    fn pid_and_secret_key(&self) -> (i32, SecretKey) {
        (0, SecretKey::I32(0))
    }

    fn set_pid_and_secret_key(&mut self, _pid: i32, _secret_key: SecretKey) {}

    fn state(&self) -> PgWireConnectionState {
        PgWireConnectionState::ReadyForQuery
    }

    fn set_state(&mut self, _new_state: PgWireConnectionState) {}

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn set_transaction_status(&mut self, new_status: TransactionStatus) {
        self.transaction_status = new_status;
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    fn client_certificates<'a>(&self) -> Option<&[rustls_pki_types::CertificateDer<'a>]> {
        None
    }
}

/// A session service over a fresh catalog with tables `a` and `b` created.
pub async fn setup_service() -> Arc<QuillSessionService> {
    let (catalog, db_oid) = bootstrap_catalog("quill");
    let service = Arc::new(QuillSessionService::new(
        catalog,
        db_oid,
        ExecutionSettings::default(),
    ));
    let mut client = MockClient::new();
    for sql in [
        "CREATE TABLE a (a1 INT, a2 VARCHAR(20))",
        "CREATE TABLE b (b1 INT, b2 VARCHAR(20))",
        "INSERT INTO a VALUES (1, 'one')",
        "INSERT INTO a VALUES (2, 'two')",
        "INSERT INTO b VALUES (1, 'uno')",
    ] {
        SimpleQueryHandler::do_query(service.as_ref(), &mut client, sql)
            .await
            .unwrap_or_else(|e| panic!("setup statement failed: {sql}: {e}"));
    }
    service
}
