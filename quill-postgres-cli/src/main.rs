use std::fs;
use std::sync::Arc;

use env_logger::Env;
use log::info;
use structopt::StructOpt;

use quill_engine::{parse, ExecutionSettings};
use quill_postgres::{bootstrap_catalog, serve, QuillSessionService, ServerOptions};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "quill-postgres",
    about = "A Postgres-protocol interface for the quill database engine."
)]
struct Opt {
    /// SQL script to run at startup (schema definitions, COPY loads)
    #[structopt(long("init"))]
    init_script: Option<String>,
    /// Name of the default database
    #[structopt(long("database"), default_value = "quill")]
    database: String,
    /// Port the server listens to, default to 5432
    #[structopt(short, default_value = "5432")]
    port: u16,
    /// Host address the server listens to, default to 127.0.0.1
    #[structopt(long("host"), default_value = "127.0.0.1")]
    host: String,
    /// Path to TLS certificate file
    #[structopt(long("tls-cert"))]
    tls_cert: Option<String>,
    /// Path to TLS private key file
    #[structopt(long("tls-key"))]
    tls_key: Option<String>,
    /// Optimizer task budget in milliseconds
    #[structopt(long("optimizer-timeout-ms"), default_value = "5000")]
    optimizer_timeout_ms: u64,
    /// Enable parallel pipeline execution
    #[structopt(long("parallel"))]
    parallel: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let (catalog, db_oid) = bootstrap_catalog(&opt.database);

    let mut settings = ExecutionSettings::default();
    settings.set_optimizer_timeout_ms(opt.optimizer_timeout_ms);
    settings.set_parallel_execution(opt.parallel);

    if let Some(script_path) = &opt.init_script {
        let script = fs::read_to_string(script_path)
            .map_err(|e| format!("failed to read init script {script_path}: {e}"))?;
        run_init_script(&catalog, db_oid, settings.clone(), &script).await?;
        info!("Executed init script {script_path}");
    }

    let options = ServerOptions::new()
        .with_host(opt.host)
        .with_port(opt.port)
        .with_database(opt.database)
        .with_tls_cert_path(opt.tls_cert)
        .with_tls_key_path(opt.tls_key);

    serve(catalog, db_oid, settings, &options)
        .await
        .map_err(|e| format!("Failed to run server: {e}"))?;
    Ok(())
}

/// Run the init script through a throwaway session, one implicit
/// transaction per statement, stopping at the first failure.
async fn run_init_script(
    catalog: &Arc<quill_catalog::Catalog>,
    db_oid: quill_catalog::DatabaseOid,
    settings: ExecutionSettings,
    script: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Validate the script parses as a whole before executing any of it.
    parse(script).map_err(|e| format!("init script does not parse: {e}"))?;

    let service = QuillSessionService::new(Arc::clone(catalog), db_oid, settings);
    service
        .run_script(script)
        .map_err(|e| format!("init script failed: {e}"))?;
    Ok(())
}
