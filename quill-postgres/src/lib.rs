//! Postgres wire protocol frontend for the quill engine: session handlers,
//! the per-connection statement cache, value encoding and the TCP/TLS
//! server loop.

mod encoding;
mod handlers;
mod statement;

use std::fs::File;
use std::io::{BufReader, Error as IOError, ErrorKind};
use std::sync::Arc;

use getset::{Getters, Setters, WithSetters};
use log::{info, warn};
use pgwire::api::PgWireServerHandlers;
use pgwire::tokio::process_socket;
use rustls_pemfile::{certs, pkcs8_private_keys};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use quill_catalog::{Catalog, DatabaseOid};
use quill_engine::ExecutionSettings;
use quill_storage::TransactionManager;

pub use encoding::{pg_type_of, schema_to_fields, sql_type_of};
pub use handlers::{HandlerFactory, Parser, QuillSessionService, SimpleStartupHandler};
pub use statement::{Statement, StatementCache};

/// re-exports
pub use pgwire;

#[derive(Getters, Setters, WithSetters, Debug)]
#[getset(get = "pub", set = "pub", set_with = "pub")]
pub struct ServerOptions {
    host: String,
    port: u16,
    database: String,
    tls_cert_path: Option<String>,
    tls_key_path: Option<String>,
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions::default()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "quill".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Create a catalog with the default database bootstrapped, ready to serve.
pub fn bootstrap_catalog(database: &str) -> (Arc<Catalog>, DatabaseOid) {
    let txn_manager = Arc::new(TransactionManager::new());
    let catalog = Arc::new(Catalog::new(txn_manager));
    let txn = catalog.txn_manager().begin();
    let db_oid = catalog
        .create_database(&txn, database)
        .expect("fresh catalog accepts the default database");
    catalog.txn_manager().commit(&txn);
    (catalog, db_oid)
}

/// Set up TLS configuration if certificate and key paths are provided.
fn setup_tls(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, IOError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert = certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<CertificateDer>, IOError>>()?;

    let key = pkcs8_private_keys(&mut BufReader::new(File::open(key_path)?))
        .map(|key| key.map(PrivateKeyDer::from))
        .collect::<Result<Vec<PrivateKeyDer>, IOError>>()?
        .into_iter()
        .next()
        .ok_or_else(|| IOError::new(ErrorKind::InvalidInput, "No private key found"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert, key)
        .map_err(|err| IOError::new(ErrorKind::InvalidInput, err))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve the catalog with the Postgres protocol.
pub async fn serve(
    catalog: Arc<Catalog>,
    db_oid: DatabaseOid,
    settings: ExecutionSettings,
    opts: &ServerOptions,
) -> Result<(), std::io::Error> {
    // Set up TLS if configured
    let tls_acceptor =
        if let (Some(cert_path), Some(key_path)) = (&opts.tls_cert_path, &opts.tls_key_path) {
            match setup_tls(cert_path, key_path) {
                Ok(acceptor) => {
                    info!("TLS enabled using cert: {cert_path} and key: {key_path}");
                    Some(acceptor)
                }
                Err(e) => {
                    warn!("Failed to setup TLS: {e}. Running without encryption.");
                    None
                }
            }
        } else {
            info!("TLS not configured. Running without encryption.");
            None
        };

    let server_addr = format!("{}:{}", opts.host, opts.port);
    let listener = TcpListener::bind(&server_addr).await?;
    if tls_acceptor.is_some() {
        info!("Listening on {server_addr} with TLS encryption");
    } else {
        info!("Listening on {server_addr} (unencrypted)");
    }

    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                // Session state (transaction, statement cache, temporary
                // namespace) is per connection, so each socket gets its own
                // handler factory.
                let factory = Arc::new(HandlerFactory::new(
                    Arc::clone(&catalog),
                    db_oid,
                    settings.clone(),
                ));
                let tls_acceptor_ref = tls_acceptor.clone();

                tokio::spawn(async move {
                    if let Err(e) = process_socket(socket, tls_acceptor_ref, factory).await {
                        warn!("Error processing socket: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("Error accept socket: {e}");
            }
        }
    }
}

/// Serve with custom pgwire handlers, for embedders that wrap or replace
/// the built-in session service.
pub async fn serve_with_handlers(
    handlers: Arc<impl PgWireServerHandlers + Sync + Send + 'static>,
    opts: &ServerOptions,
) -> Result<(), std::io::Error> {
    let server_addr = format!("{}:{}", opts.host, opts.port);
    let listener = TcpListener::bind(&server_addr).await?;
    info!("Listening on {server_addr} (unencrypted)");

    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                let factory_ref = handlers.clone();
                tokio::spawn(async move {
                    if let Err(e) = process_socket(socket, None, factory_ref).await {
                        warn!("Error processing socket: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("Error accept socket: {e}");
            }
        }
    }
}
