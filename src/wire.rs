use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::VetBookAuthSource;
use crate::catalog;
use crate::engine::{Engine, EngineError, ValidationError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

const TIMESTAMP_OUT: &str = "%Y-%m-%d %H:%M:%S";

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = VetBookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct VetBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<VetBookQueryParser>,
}

impl VetBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(VetBookQueryParser),
        }
    }

    /// Parse, execute, and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let start = Instant::now();
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);

        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertAppointment { draft, returning } => {
                let booked = engine.create(draft).await.map_err(engine_err)?;
                if returning {
                    appointment_rows(vec![booked])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateAppointment { id, draft } => {
                engine.update(id, draft).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelAppointment { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointments { id: None } => appointment_rows(engine.list_all()),
            Command::SelectAppointments { id: Some(id) } => {
                appointment_rows(engine.get(id).into_iter().collect())
            }
            Command::SelectCancelled { from, to } => {
                let rows = match (from, to) {
                    (Some(from), Some(to)) => {
                        let (start, end) = day_bounds(from, to);
                        engine.list_cancelled(start, end)
                    }
                    _ => Vec::new(),
                };
                appointment_rows(rows)
            }
            Command::SelectAgenda { veterinarian, day } => {
                appointment_rows(engine.agenda(&veterinarian, day))
            }
            Command::SelectSuggestion {
                veterinarian,
                date_time,
            } => {
                let suggested = engine.suggest_available_time(&veterinarian, date_time);
                suggestion_row(&veterinarian, date_time, suggested)
            }
            Command::SelectVeterinarians => name_rows("veterinarian", catalog::VETERINARIANS),
            Command::SelectSpecies => name_rows("species", catalog::SPECIES),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    [
        "id",
        "animal_name",
        "species",
        "owner_name",
        "phone",
        "veterinarian",
        "date_time",
        "status",
        "created_at",
        "modified_at",
        "cancelled_at",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn suggestion_schema() -> Vec<FieldInfo> {
    vec![
        text_field("veterinarian"),
        text_field("requested"),
        text_field("suggested"),
    ]
}

fn schema_for_table(table: &str) -> Vec<FieldInfo> {
    match table {
        "appointments" | "cancelled_appointments" | "agenda" => appointment_schema(),
        "suggestions" => suggestion_schema(),
        "veterinarians" => vec![text_field("veterinarian")],
        "species" => vec![text_field("species")],
        _ => vec![],
    }
}

fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    sql::returned_table(sql)
        .map(|t| schema_for_table(&t))
        .unwrap_or_default()
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_OUT).to_string()
}

fn appointment_rows(appointments: Vec<Appointment>) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.animal_name)?;
            encoder.encode_field(&a.species)?;
            encoder.encode_field(&a.owner_name)?;
            encoder.encode_field(&a.phone)?;
            encoder.encode_field(&a.veterinarian)?;
            encoder.encode_field(&format_ts(a.date_time))?;
            encoder.encode_field(&a.status.to_string())?;
            encoder.encode_field(&format_ts(a.created_at))?;
            encoder.encode_field(&a.modified_at.map(format_ts))?;
            encoder.encode_field(&a.cancelled_at.map(format_ts))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn suggestion_row(
    veterinarian: &str,
    requested: NaiveDateTime,
    suggested: NaiveDateTime,
) -> PgWireResult<Response> {
    let schema = Arc::new(suggestion_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&veterinarian.to_string())?;
    encoder.encode_field(&format_ts(requested))?;
    encoder.encode_field(&format_ts(suggested))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn name_rows(column: &str, names: &'static [&'static str]) -> PgWireResult<Response> {
    let schema = Arc::new(vec![text_field(column)]);
    let rows: Vec<PgWireResult<_>> = names
        .iter()
        .map(|name| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&name.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for VetBookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VetBookQueryParser;

#[async_trait]
impl QueryParser for VetBookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VetBookHandler {
    type Statement = String;
    type QueryParser = VetBookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass, so placeholders inside quoted text (bound
/// values included) stay as they are.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let param = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                match param {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
                continue;
            }
            None => {}
        }
        out.push(c);
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VetBookFactory {
    handler: Arc<VetBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VetBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VetBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = VetBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VetBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VetBookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(ValidationError::NotFound(_)) => "P0002",
        EngineError::Validation(_) => "P0001",
        EngineError::InvalidField(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
