//! pgwire session handlers: the simple and extended query flows, statement
//! caching, transaction-block semantics and SET/SHOW dispatch, backed by
//! the quill engine's parse → bind → optimize → compile → run pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use pgwire::api::auth::noop::NoopStartupHandler;
use pgwire::api::auth::StartupHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{DescribePortalResponse, DescribeStatementResponse, Response, Tag};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::{ClientInfo, ErrorHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::TransactionStatus;
use sqlparser::ast::{self, Statement as SqlStatement};

use quill_catalog::{Catalog, CatalogAccessor, DatabaseOid, NamespaceOid};
use quill_engine::binder::params::promote_parameters;
use quill_engine::binder::statement::BoundStatement;
use quill_engine::binder::Binder;
use quill_engine::compiler::CompilationContext;
use quill_engine::exec::{ExecutableQuery, ExecutionContext};
use quill_engine::optimizer::{Optimizer, TrivialCostModel};
use quill_engine::{classify, parse, plan, ExecutionSettings, ParseResult, QueryError, QueryType};
use quill_storage::{SqlTypeId, SqlValue, TransactionContext};

use crate::encoding;
use crate::statement::{Statement, StatementCache};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Startup handler that accepts every client without authentication;
/// password-based flows are not part of this frontend.
pub struct SimpleStartupHandler;

#[async_trait]
impl NoopStartupHandler for SimpleStartupHandler {}

/// Per-connection handler factory. Construct one per accepted socket: the
/// session service it owns carries connection-scoped state (transaction,
/// statement cache, temporary namespace, session variables).
pub struct HandlerFactory {
    pub session_service: Arc<QuillSessionService>,
}

impl HandlerFactory {
    pub fn new(catalog: Arc<Catalog>, db_oid: DatabaseOid, settings: ExecutionSettings) -> Self {
        HandlerFactory {
            session_service: Arc::new(QuillSessionService::new(catalog, db_oid, settings)),
        }
    }
}

impl PgWireServerHandlers for HandlerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.session_service.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.session_service.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        Arc::new(SimpleStartupHandler)
    }

    fn error_handler(&self) -> Arc<impl ErrorHandler> {
        Arc::new(LoggingErrorHandler)
    }
}

struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error<C>(&self, _client: &C, error: &mut PgWireError)
    where
        C: ClientInfo,
    {
        info!("Sending error: {error}")
    }
}

fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_string(),
        code.to_string(),
        message.into(),
    )))
}

fn engine_error(error: QueryError) -> PgWireError {
    user_error(error.sqlstate(), error.to_string())
}

/// The pgwire handler backed by the quill catalog and engine.
pub struct QuillSessionService {
    catalog: Arc<Catalog>,
    db_oid: DatabaseOid,
    connection_id: u64,
    settings: Mutex<ExecutionSettings>,
    timezone: Mutex<String>,
    search_path: Mutex<String>,
    current_txn: Mutex<Option<Arc<TransactionContext>>>,
    statement_cache: Mutex<StatementCache>,
    temp_namespace: Mutex<Option<NamespaceOid>>,
    parser: Arc<Parser>,
}

impl QuillSessionService {
    pub fn new(catalog: Arc<Catalog>, db_oid: DatabaseOid, settings: ExecutionSettings) -> Self {
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::AcqRel);
        let service = QuillSessionService {
            catalog,
            db_oid,
            connection_id,
            settings: Mutex::new(settings),
            timezone: Mutex::new("UTC".to_string()),
            search_path: Mutex::new("public".to_string()),
            current_txn: Mutex::new(None),
            statement_cache: Mutex::new(StatementCache::new()),
            temp_namespace: Mutex::new(None),
            parser: Arc::new(Parser),
        };
        service.establish_temp_namespace();
        service
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn settings(&self) -> ExecutionSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Cached statement for a query text, if the session has prepared it.
    pub fn cached_statement(&self, sql: &str) -> Option<Arc<Statement>> {
        self.statement_cache.lock().unwrap().get(sql)
    }

    /// Current DDL epoch of the session's database.
    pub fn ddl_epoch(&self) -> u64 {
        self.catalog
            .get_database_catalog(self.db_oid)
            .map(|dbc| dbc.ddl_epoch())
            .unwrap_or(0)
    }

    /// Each connection gets a private temporary namespace, dropped when the
    /// session goes away.
    fn establish_temp_namespace(&self) {
        let txn_manager = Arc::clone(self.catalog.txn_manager());
        let txn = txn_manager.begin();
        let Some(dbc) = self.catalog.get_database_catalog(self.db_oid) else {
            txn_manager.abort(&txn);
            return;
        };
        match dbc.create_namespace(&txn, &format!("pg_temp_{}", self.connection_id)) {
            Ok(namespace) => {
                txn_manager.commit(&txn);
                *self.temp_namespace.lock().unwrap() = Some(namespace);
            }
            Err(e) => {
                warn!("could not create temporary namespace: {e}");
                txn_manager.abort(&txn);
            }
        }
    }

    fn in_transaction_block(&self) -> bool {
        self.current_txn.lock().unwrap().is_some()
    }

    /// The statement's transaction: the open block, or a fresh implicit
    /// transaction committed/aborted around this one statement.
    fn claim_txn(&self) -> (Arc<TransactionContext>, bool) {
        if let Some(txn) = self.current_txn.lock().unwrap().as_ref() {
            return (Arc::clone(txn), false);
        }
        (self.catalog.txn_manager().begin(), true)
    }

    fn accessor(&self, txn: &Arc<TransactionContext>) -> PgWireResult<CatalogAccessor> {
        self.catalog
            .accessor(self.db_oid, Arc::clone(txn))
            .ok_or_else(|| user_error("3D000", "database does not exist"))
    }

    // ---- transaction statements (bypass binder/optimizer/codegen) ----

    fn try_respond_transaction_statements<'a, C>(
        &self,
        client: &C,
        query_lower: &str,
    ) -> PgWireResult<Option<Response<'a>>>
    where
        C: ClientInfo,
    {
        match query_lower.trim().trim_end_matches(';') {
            "begin" | "begin transaction" | "begin work" | "start transaction" => {
                match client.transaction_status() {
                    TransactionStatus::Error => Err(user_error(
                        "25P02",
                        "current transaction is aborted, commands ignored until end of transaction block",
                    )),
                    TransactionStatus::Transaction => {
                        // Postgres ignores nested BEGIN with a warning.
                        warn!("BEGIN ignored: already in a transaction block");
                        Ok(Some(Response::Execution(Tag::new("BEGIN"))))
                    }
                    TransactionStatus::Idle => {
                        let txn = self.catalog.txn_manager().begin();
                        *self.current_txn.lock().unwrap() = Some(txn);
                        Ok(Some(Response::TransactionStart(Tag::new("BEGIN"))))
                    }
                }
            }
            "commit" | "commit transaction" | "commit work" | "end" | "end transaction" => {
                let taken = self.current_txn.lock().unwrap().take();
                match taken {
                    Some(txn) if txn.must_abort() => {
                        // COMMIT of a failed block rolls back.
                        self.catalog.txn_manager().abort(&txn);
                        Ok(Some(Response::TransactionEnd(Tag::new("ROLLBACK"))))
                    }
                    Some(txn) => {
                        self.catalog.txn_manager().commit(&txn);
                        Ok(Some(Response::TransactionEnd(Tag::new("COMMIT"))))
                    }
                    None => Ok(Some(Response::TransactionEnd(Tag::new("COMMIT")))),
                }
            }
            "rollback" | "rollback transaction" | "rollback work" | "abort" => {
                if let Some(txn) = self.current_txn.lock().unwrap().take() {
                    self.catalog.txn_manager().abort(&txn);
                }
                Ok(Some(Response::TransactionEnd(Tag::new("ROLLBACK"))))
            }
            _ => Ok(None),
        }
    }

    // ---- SET / SHOW ----

    fn handle_set_statement<'a>(
        &self,
        variable: &str,
        value: &str,
    ) -> PgWireResult<Response<'a>> {
        if self.in_transaction_block() {
            return Err(user_error(
                "25001",
                "SET is not allowed inside a transaction block",
            ));
        }
        let value = value.trim_matches('\'').trim_matches('"');
        match variable.to_lowercase().as_str() {
            "time_zone" | "timezone" => {
                *self.timezone.lock().unwrap() = value.to_string();
            }
            "search_path" => {
                *self.search_path.lock().unwrap() = value.to_string();
            }
            "compilation_mode" => {
                let mut settings = self.settings.lock().unwrap();
                match value.to_lowercase().as_str() {
                    "oneshot" | "one_shot" => {
                        settings.set_compilation_mode(quill_engine::CompilationMode::OneShot);
                    }
                    "interleaved" => {
                        settings.set_compilation_mode(quill_engine::CompilationMode::Interleaved);
                    }
                    other => {
                        return Err(user_error(
                            "22023",
                            format!("invalid compilation mode \"{other}\""),
                        ))
                    }
                }
            }
            "execution_mode" => {
                let mut settings = self.settings.lock().unwrap();
                match value.to_lowercase().as_str() {
                    "interpret" => {
                        settings.set_execution_mode(quill_engine::ExecutionMode::Interpret);
                    }
                    "jit" => {
                        settings.set_execution_mode(quill_engine::ExecutionMode::Jit);
                    }
                    "adaptive" => {
                        settings.set_execution_mode(quill_engine::ExecutionMode::Adaptive);
                    }
                    other => {
                        return Err(user_error(
                            "22023",
                            format!("invalid execution mode \"{other}\""),
                        ))
                    }
                }
            }
            "optimizer_timeout" | "task_execution_timeout" => {
                let millis: u64 = value
                    .trim_end_matches("ms")
                    .parse()
                    .map_err(|_| user_error("22023", "invalid timeout value"))?;
                self.settings.lock().unwrap().set_optimizer_timeout_ms(millis);
            }
            "parallel_execution" => {
                let enabled = matches!(value.to_lowercase().as_str(), "on" | "true" | "1");
                self.settings.lock().unwrap().set_parallel_execution(enabled);
            }
            other => {
                warn!("SET {other} is not recognized, statement ignored");
            }
        }
        Ok(Response::Execution(Tag::new("SET")))
    }

    fn show_response<'a>(&self, name: &str, value: &str) -> PgWireResult<Response<'a>> {
        Ok(Response::Query(encoding::single_column_response(
            name,
            [value.to_string()],
        )?))
    }

    fn handle_show_statement<'a>(&self, variable: &str) -> PgWireResult<Response<'a>> {
        if self.in_transaction_block() {
            return Err(user_error(
                "25001",
                "SHOW is not allowed inside a transaction block",
            ));
        }
        match variable.to_lowercase().as_str() {
            "time_zone" | "timezone" => {
                let timezone = self.timezone.lock().unwrap().clone();
                self.show_response("TimeZone", &timezone)
            }
            "server_version" => self.show_response("server_version", "15.0 (quill)"),
            "transaction_isolation" => {
                self.show_response("transaction_isolation", "snapshot isolation")
            }
            "search_path" => {
                let path = self.search_path.lock().unwrap().clone();
                self.show_response("search_path", &path)
            }
            "compilation_mode" => {
                let mode = match self.settings.lock().unwrap().compilation_mode() {
                    quill_engine::CompilationMode::OneShot => "oneshot",
                    quill_engine::CompilationMode::Interleaved => "interleaved",
                };
                self.show_response("compilation_mode", mode)
            }
            "execution_mode" => {
                let mode = match self.settings.lock().unwrap().execution_mode() {
                    quill_engine::ExecutionMode::Interpret => "interpret",
                    quill_engine::ExecutionMode::Jit => "jit",
                    quill_engine::ExecutionMode::Adaptive => "adaptive",
                };
                self.show_response("execution_mode", mode)
            }
            "databases" => {
                let names = self.catalog.database_names().join(", ");
                self.show_response("databases", &names)
            }
            other => self.show_response(other, ""),
        }
    }

    fn try_handle_structured_statement<'a>(
        &self,
        statement: &SqlStatement,
    ) -> PgWireResult<Option<Response<'a>>> {
        match statement {
            SqlStatement::SetVariable {
                variables, value, ..
            } => {
                let variable = match variables {
                    ast::OneOrManyWithParens::One(name) => name.to_string(),
                    ast::OneOrManyWithParens::Many(names) => names
                        .first()
                        .map(|n| n.to_string())
                        .unwrap_or_default(),
                };
                let value = value
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Ok(Some(self.handle_set_statement(&variable, &value)?))
            }
            SqlStatement::SetTimeZone { value, .. } => {
                Ok(Some(self.handle_set_statement("timezone", &value.to_string())?))
            }
            SqlStatement::ShowVariable { variable } => {
                let name = variable
                    .iter()
                    .map(|i| i.value.clone())
                    .collect::<Vec<_>>()
                    .join("_");
                Ok(Some(self.handle_show_statement(&name)?))
            }
            _ => Ok(None),
        }
    }

    // ---- CREATE/DROP DATABASE (outside the engine pipeline) ----

    fn try_handle_database_statement<'a>(
        &self,
        statement: &SqlStatement,
    ) -> PgWireResult<Option<Response<'a>>> {
        let query_type = classify(statement);
        if !matches!(
            query_type,
            QueryType::CreateDatabase | QueryType::DropDatabase
        ) {
            return Ok(None);
        }
        if self.in_transaction_block() {
            return Err(user_error(
                "25001",
                format!(
                    "{} cannot run inside a transaction block",
                    query_type.command_tag()
                ),
            ));
        }

        let txn_manager = Arc::clone(self.catalog.txn_manager());
        let txn = txn_manager.begin();
        let result = match statement {
            SqlStatement::CreateDatabase {
                db_name,
                if_not_exists,
                ..
            } => {
                let name = db_name.to_string();
                match self.catalog.create_database(&txn, &name) {
                    Ok(_) => Ok(()),
                    Err(quill_catalog::CatalogError::DuplicateDatabase(_)) if *if_not_exists => {
                        info!("database \"{name}\" already exists, skipping");
                        Ok(())
                    }
                    Err(e) => Err(QueryError::Catalog(e)),
                }
            }
            SqlStatement::Drop {
                names, if_exists, ..
            } => {
                let name = names
                    .first()
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                match self.catalog.drop_database(&txn, &name) {
                    Ok(true) => Ok(()),
                    Ok(false) if *if_exists => {
                        info!("database \"{name}\" does not exist, skipping");
                        Ok(())
                    }
                    Ok(false) => Err(QueryError::Catalog(
                        quill_catalog::CatalogError::UnknownDatabase(name),
                    )),
                    Err(e) => Err(QueryError::Catalog(e)),
                }
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                txn_manager.commit(&txn);
                Ok(Some(Response::Execution(Tag::new(
                    query_type.command_tag(),
                ))))
            }
            Err(e) => {
                txn_manager.abort(&txn);
                Err(engine_error(e))
            }
        }
    }

    // ---- statement preparation and execution ----

    fn prepare_statement(
        &self,
        sql: &str,
        declared_types: Vec<SqlTypeId>,
    ) -> PgWireResult<Arc<Statement>> {
        if let Some(statement) = self.statement_cache.lock().unwrap().get(sql) {
            return Ok(statement);
        }
        let parsed = parse(sql).map_err(engine_error)?;
        let query_type = parsed
            .statements
            .first()
            .map(classify)
            .unwrap_or(QueryType::Empty);
        let statement = Arc::new(Statement::new(
            sql.to_string(),
            parsed,
            query_type,
            declared_types,
        ));
        self.statement_cache
            .lock()
            .unwrap()
            .insert(Arc::clone(&statement));
        Ok(statement)
    }

    /// Bind, optimize and compile a statement, reusing the cached artifacts
    /// when no DDL invalidated them since the last bind.
    fn plan_statement(
        &self,
        accessor: &CatalogAccessor,
        statement: &Statement,
    ) -> Result<Planned, QueryError> {
        if statement.is_empty() {
            return Ok(Planned::Empty);
        }
        let current_epoch = accessor.ddl_epoch();
        if let Some(executable) = statement.cached_executable(current_epoch) {
            let cached = statement.cached.lock().unwrap();
            return Ok(Planned::Query {
                executable,
                output_schema: cached.output_schema.clone(),
                desired_param_types: cached.desired_param_types.clone(),
            });
        }
        // DDL moved the epoch since the last bind: drop the stale plan and
        // executable, keep the parse, and rebind below.
        statement.clear_cached_objects();

        let root = statement
            .root_statement()
            .ok_or_else(|| QueryError::Parse("empty statement".to_string()))?;
        let mut binder =
            Binder::with_param_types(accessor, statement.param_types().to_vec());
        let bound = binder.bind(root)?;
        let desired_param_types = binder.desired_param_types();

        if let BoundStatement::Explain(inner) = &bound {
            let transformed = plan::transform(inner)?;
            let optimizer = self.optimizer();
            let physical = optimizer.optimize(accessor, &transformed)?;
            return Ok(Planned::Explain {
                lines: physical.explain_lines(),
            });
        }

        let output_schema = bound.output_schema();
        let transformed = plan::transform(&bound)?;
        let optimizer = self.optimizer();
        let physical = Arc::new(optimizer.optimize(accessor, &transformed)?);
        let settings = self.settings();
        let executable = Arc::new(CompilationContext::compile(
            Arc::clone(&physical),
            accessor,
            settings,
            transformed.visible_columns,
        )?);

        {
            let mut cached = statement.cached.lock().unwrap();
            cached.ddl_epoch = current_epoch;
            cached.bound = Some(Arc::new(bound));
            cached.physical = Some(physical);
            cached.executable = Some(Arc::clone(&executable));
            cached.desired_param_types = desired_param_types.clone();
            cached.output_schema = output_schema.clone();
            cached.visible_columns = transformed.visible_columns;
        }
        Ok(Planned::Query {
            executable,
            output_schema,
            desired_param_types,
        })
    }

    fn optimizer(&self) -> Optimizer {
        let timeout = self.settings.lock().unwrap().optimizer_timeout_ms();
        Optimizer::new(Box::<TrivialCostModel>::default(), timeout)
    }

    /// Execute one non-transactional statement under the session's current
    /// (or a fresh implicit) transaction and build the wire response.
    fn execute_statement<'a, C>(
        &self,
        client: &C,
        statement: &Arc<Statement>,
        mut params: Vec<SqlValue>,
        format: &Format,
    ) -> PgWireResult<Response<'a>>
    where
        C: ClientInfo,
    {
        debug!("executing: {}", statement.query_text());
        let (txn, implicit) = self.claim_txn();

        // A failed explicit block ignores everything until Sync/ROLLBACK.
        if !implicit
            && (txn.must_abort() || client.transaction_status() == TransactionStatus::Error)
        {
            return Err(user_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        let result = self.execute_in_txn(&txn, statement, &mut params, format);
        match result {
            Ok(response) => {
                if implicit {
                    self.catalog.txn_manager().commit(&txn);
                }
                Ok(response)
            }
            Err(e) => {
                if implicit {
                    // Bind or execution failure in an implicit transaction
                    // marks must-abort and ends the transaction; the next
                    // ReadyForQuery reports idle.
                    txn.set_must_abort();
                    self.catalog.txn_manager().abort(&txn);
                } else {
                    txn.set_must_abort();
                }
                Err(e)
            }
        }
    }

    fn execute_in_txn<'a>(
        &self,
        txn: &Arc<TransactionContext>,
        statement: &Arc<Statement>,
        params: &mut Vec<SqlValue>,
        format: &Format,
    ) -> PgWireResult<Response<'a>> {
        let accessor = self.accessor(txn)?;
        let planned = self
            .plan_statement(&accessor, statement)
            .map_err(engine_error)?;

        match planned {
            Planned::Empty => Ok(Response::EmptyQuery),
            Planned::Explain { lines } => {
                // EXPLAIN gets its dedicated single-column description.
                Ok(Response::Query(encoding::single_column_response(
                    "QUERY PLAN",
                    lines,
                )?))
            }
            Planned::Query {
                executable,
                output_schema,
                desired_param_types,
            } => {
                promote_parameters(params, &desired_param_types).map_err(engine_error)?;
                let settings = self.settings();
                let execution_mode = settings.execution_mode();
                let ctx = ExecutionContext::new(&accessor, std::mem::take(params), settings);
                executable.run(&ctx, execution_mode).map_err(engine_error)?;

                let query_type = statement.query_type();
                match query_type {
                    QueryType::Select => {
                        let fields = encoding::schema_to_fields(&output_schema, format);
                        let rows = ctx.take_output();
                        Ok(Response::Query(encoding::encode_rows(fields, rows)?))
                    }
                    QueryType::Insert => Ok(Response::Execution(
                        Tag::new("INSERT")
                            .with_oid(0)
                            .with_rows(ctx.rows_affected() as usize),
                    )),
                    QueryType::Update | QueryType::Delete | QueryType::Copy => {
                        Ok(Response::Execution(
                            Tag::new(query_type.command_tag())
                                .with_rows(ctx.rows_affected() as usize),
                        ))
                    }
                    _ => Ok(Response::Execution(Tag::new(query_type.command_tag()))),
                }
            }
        }
    }

    /// Run a SQL script outside any client connection, one implicit
    /// transaction per statement. Used by bootstrap tooling; transaction
    /// control statements are not supported here.
    pub fn run_script(&self, script: &str) -> Result<(), QueryError> {
        let parsed = parse(script)?;
        for sql_statement in &parsed.statements {
            if matches!(
                classify(sql_statement),
                QueryType::Begin | QueryType::Commit | QueryType::Rollback
            ) {
                return Err(QueryError::NotImplemented(
                    "transaction control in bootstrap scripts".to_string(),
                ));
            }
            if let Ok(Some(_)) = self.try_handle_structured_statement(sql_statement) {
                continue;
            }
            let text = sql_statement.to_string();
            let statement = self.prepare_statement(&text, Vec::new()).map_err(|e| {
                QueryError::Parse(format!("could not prepare \"{text}\": {e}"))
            })?;

            let txn = self.catalog.txn_manager().begin();
            let result = (|| -> Result<(), QueryError> {
                let accessor = self
                    .catalog
                    .accessor(self.db_oid, Arc::clone(&txn))
                    .ok_or_else(|| {
                        QueryError::Catalog(quill_catalog::CatalogError::UnknownDatabase(
                            "current".to_string(),
                        ))
                    })?;
                match self.plan_statement(&accessor, &statement)? {
                    Planned::Query { executable, .. } => {
                        let settings = self.settings();
                        let mode = settings.execution_mode();
                        let ctx = ExecutionContext::new(&accessor, Vec::new(), settings);
                        executable.run(&ctx, mode)
                    }
                    _ => Ok(()),
                }
            })();
            match result {
                Ok(()) => {
                    self.catalog.txn_manager().commit(&txn);
                }
                Err(e) => {
                    self.catalog.txn_manager().abort(&txn);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Bind-only pass for Describe messages.
    fn describe_statement(
        &self,
        statement: &Statement,
    ) -> Result<(Vec<SqlTypeId>, Vec<(String, SqlTypeId)>), QueryError> {
        if statement.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let txn_manager = Arc::clone(self.catalog.txn_manager());
        let txn = txn_manager.begin();
        let accessor = self
            .catalog
            .accessor(self.db_oid, Arc::clone(&txn))
            .ok_or_else(|| {
                QueryError::Catalog(quill_catalog::CatalogError::UnknownDatabase(
                    "current".to_string(),
                ))
            })?;
        let result = (|| {
            let root = statement
                .root_statement()
                .ok_or_else(|| QueryError::Parse("empty statement".to_string()))?;
            let mut binder =
                Binder::with_param_types(&accessor, statement.param_types().to_vec());
            let bound = binder.bind(root)?;
            Ok((binder.desired_param_types(), bound.output_schema()))
        })();
        txn_manager.abort(&txn);
        if let Ok((desired, output)) = &result {
            let mut cached = statement.cached.lock().unwrap();
            if cached.desired_param_types.is_empty() {
                cached.desired_param_types = desired.clone();
            }
            if cached.output_schema.is_empty() {
                cached.output_schema = output.clone();
            }
        }
        result
    }
}

impl Drop for QuillSessionService {
    fn drop(&mut self) {
        // Drop the connection's temporary namespace.
        if let Some(namespace) = self.temp_namespace.lock().unwrap().take() {
            let txn_manager = Arc::clone(self.catalog.txn_manager());
            let txn = txn_manager.begin();
            if let Some(dbc) = self.catalog.get_database_catalog(self.db_oid) {
                if dbc.drop_namespace(&txn, namespace).is_ok() {
                    txn_manager.commit(&txn);
                    return;
                }
            }
            txn_manager.abort(&txn);
        }
    }
}

enum Planned {
    Empty,
    Explain {
        lines: Vec<String>,
    },
    Query {
        executable: Arc<ExecutableQuery>,
        output_schema: Vec<(String, SqlTypeId)>,
        desired_param_types: Vec<SqlTypeId>,
    },
}

#[async_trait]
impl SimpleQueryHandler for QuillSessionService {
    async fn do_query<'a, C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response<'a>>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        debug!("Received query: {query}");
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }

        // Transaction commands first: ABORT and friends trip the parser.
        let query_lower = trimmed.to_lowercase();
        if let Some(response) = self.try_respond_transaction_statements(client, &query_lower)? {
            return Ok(vec![response]);
        }

        let parsed = parse(query).map_err(engine_error)?;
        let mut responses = Vec::with_capacity(parsed.statements.len());
        for sql_statement in &parsed.statements {
            if let Some(response) = self.try_handle_structured_statement(sql_statement)? {
                responses.push(response);
                continue;
            }
            if let Some(response) = self.try_handle_database_statement(sql_statement)? {
                responses.push(response);
                continue;
            }
            let text = sql_statement.to_string();
            if let Some(response) =
                self.try_respond_transaction_statements(client, &text.to_lowercase())?
            {
                responses.push(response);
                continue;
            }
            let statement = self.prepare_statement(&text, Vec::new())?;
            responses.push(self.execute_statement(
                client,
                &statement,
                Vec::new(),
                &Format::UnifiedText,
            )?);
        }
        Ok(responses)
    }
}

#[async_trait]
impl ExtendedQueryHandler for QuillSessionService {
    type Statement = Arc<Statement>;
    type QueryParser = Parser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.parser.clone()
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = &target.statement;
        let (param_types, output_schema) =
            self.describe_statement(statement).map_err(engine_error)?;
        let params: Vec<Type> = param_types
            .iter()
            .map(|t| encoding::pg_type_of(*t))
            .collect();
        let fields = encoding::schema_to_fields(&output_schema, &Format::UnifiedBinary);
        Ok(DescribeStatementResponse::new(params, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = &target.statement.statement;
        let (_, output_schema) = self.describe_statement(statement).map_err(engine_error)?;
        let fields = encoding::schema_to_fields(&output_schema, &target.result_column_format);
        Ok(DescribePortalResponse::new(fields))
    }

    async fn do_query<'a, C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response<'a>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = Arc::clone(&portal.statement.statement);
        debug!("Received execute extended query: {}", statement.query_text());

        if statement.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        let root = statement.root_statement().cloned();
        if let Some(root) = &root {
            if let Some(response) = self.try_handle_structured_statement(root)? {
                return Ok(response);
            }
            if let Some(response) = self.try_handle_database_statement(root)? {
                return Ok(response);
            }
        }
        if statement.query_type().is_transactional() {
            let lowered = statement.query_text().to_lowercase();
            if let Some(response) = self.try_respond_transaction_statements(client, &lowered)? {
                return Ok(response);
            }
        }

        let mut desired = statement.desired_param_types();
        if desired.is_empty() && portal.parameter_len() > 0 {
            // No declared types and no Describe yet: a bind-only pass
            // resolves the desired parameter types first.
            let (inferred, _) = self.describe_statement(&statement).map_err(engine_error)?;
            desired = inferred;
        }
        let params = encoding::decode_parameters(portal, &desired)?;
        self.execute_statement(client, &statement, params, &portal.result_column_format)
    }
}

/// Extended-protocol statement parser: parse and classify only; binding
/// happens lazily at Describe/Execute under a live transaction.
pub struct Parser;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementCache;

    fn service() -> QuillSessionService {
        let (catalog, db_oid) = crate::bootstrap_catalog("quill");
        QuillSessionService::new(catalog, db_oid, ExecutionSettings::default())
    }

    #[test]
    fn structured_set_updates_session_state() {
        let service = service();
        let statements = parse("SET timezone = 'PST'").unwrap();
        let response = service
            .try_handle_structured_statement(&statements.statements[0])
            .unwrap();
        assert!(response.is_some());
        assert_eq!(*service.timezone.lock().unwrap(), "PST");

        let statements = parse("SET execution_mode = 'jit'").unwrap();
        service
            .try_handle_structured_statement(&statements.statements[0])
            .unwrap();
        assert_eq!(
            service.settings().execution_mode(),
            quill_engine::ExecutionMode::Jit
        );
    }

    #[test]
    fn structured_show_produces_a_query_response() {
        let service = service();
        let statements = parse("SHOW server_version").unwrap();
        let response = service
            .try_handle_structured_statement(&statements.statements[0])
            .unwrap();
        assert!(matches!(response, Some(Response::Query(_))));
    }

    #[test]
    fn prepare_statement_reuses_cached_parse() {
        let service = service();
        let first = service.prepare_statement("SELECT 1", Vec::new()).unwrap();
        let second = service.prepare_statement("SELECT 1", Vec::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn describe_infers_parameter_and_output_types() {
        let service = service();
        // A table to describe against.
        let txn = service.catalog.txn_manager().begin();
        let dbc = service.catalog.get_database_catalog(service.db_oid).unwrap();
        dbc.create_table(
            &txn,
            quill_catalog::postgres::DEFAULT_NAMESPACE_OID,
            "t",
            quill_catalog::Schema::new(vec![
                quill_catalog::Column::new("x", SqlTypeId::Integer, false),
                quill_catalog::Column::new("y", SqlTypeId::Varchar, true),
            ]),
        )
        .unwrap();
        service.catalog.txn_manager().commit(&txn);

        let statement = service
            .prepare_statement("SELECT y FROM t WHERE x = $1", Vec::new())
            .unwrap();
        let (params, output) = service.describe_statement(&statement).unwrap();
        assert_eq!(params, vec![SqlTypeId::Integer]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].1, SqlTypeId::Varchar);
    }

    #[test]
    fn statement_cache_default_capacity_is_bounded() {
        let mut cache = StatementCache::with_capacity(4);
        for i in 0..16 {
            let sql = format!("SELECT {i}");
            let parsed = parse(&sql).unwrap();
            cache.insert(Arc::new(Statement::new(
                sql,
                parsed,
                QueryType::Select,
                Vec::new(),
            )));
        }
        assert!(cache.len() <= 4);
    }
}

#[async_trait]
impl QueryParser for Parser {
    type Statement = Arc<Statement>;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        types: &[Type],
    ) -> PgWireResult<Self::Statement> {
        debug!("Received parse extended query: {sql}");
        let parsed = if sql.trim().is_empty() {
            ParseResult {
                statements: Vec::new(),
            }
        } else {
            parse(sql).map_err(engine_error)?
        };
        let query_type = parsed
            .statements
            .first()
            .map(classify)
            .unwrap_or(QueryType::Empty);
        let declared: Vec<SqlTypeId> = types.iter().map(encoding::sql_type_of).collect();
        Ok(Arc::new(Statement::new(
            sql.to_string(),
            parsed,
            query_type,
            declared,
        )))
    }
}
