use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::stream;
use futures::Sink;
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
use tracing::{debug, warn};

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, execute, and record RED metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            debug!("rejected statement: {e}");
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                if matches!(e, EngineError::Internal(_)) {
                    warn!("{label} failed: {e}");
                } else {
                    debug!("{label} rejected: {e}");
                }
                e.kind()
            }
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertWindow {
                coach_id,
                day,
                start_time,
                end_time,
                returning,
            } => {
                let window = engine
                    .add_availability(coach_id, &day, &start_time, &end_time)
                    .await?;
                Ok(if returning {
                    windows_response(std::slice::from_ref(&window))
                } else {
                    Response::Execution(Tag::new("INSERT").with_rows(1))
                })
            }
            Command::SelectWindows { coach_id } => {
                let windows = engine.list_windows(coach_id).await;
                Ok(windows_response(&windows))
            }
            Command::SelectSlots { coach_id, date } => {
                let slots = engine.available_slots(coach_id, date).await;
                Ok(slots_response(coach_id, &slots))
            }
            Command::InsertBooking {
                user_id,
                coach_id,
                datetime,
                returning,
            } => {
                let booking = engine.book_slot(user_id, coach_id, datetime).await?;
                Ok(if returning {
                    bookings_response(std::slice::from_ref(&booking))
                } else {
                    Response::Execution(Tag::new("INSERT").with_rows(1))
                })
            }
            Command::SelectBookings { user_id } => {
                let bookings = engine.user_bookings(user_id)?;
                Ok(bookings_response(&bookings))
            }
            Command::DeleteBooking { id, user_id } => {
                engine.cancel_booking(id, user_id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Row layouts ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn window_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int8_field("coach_id"),
        text_field("day"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![int8_field("coach_id"), text_field("start_time")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int8_field("user_id"),
        int8_field("coach_id"),
        text_field("start_time"),
        text_field("created_at"),
    ]
}

fn schema_for(shape: Option<RowShape>) -> Vec<FieldInfo> {
    match shape {
        Some(RowShape::Windows) => window_schema(),
        Some(RowShape::Slots) => slot_schema(),
        Some(RowShape::Bookings) => booking_schema(),
        None => vec![],
    }
}

/// Instants go out as RFC 3339 in UTC, e.g. `2030-01-07T09:00:00Z`.
fn rfc3339(t: &Instant) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Ids render as INT8; one past `i64::MAX` can only come from a direct
/// engine caller and fails the row instead of wrapping negative.
fn int8(id: u64) -> PgWireResult<i64> {
    i64::try_from(id).map_err(|_| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22003".into(),
            format!("id {id} out of range for int8"),
        )))
    })
}

fn windows_response(windows: &[AvailabilityWindow]) -> Response {
    let schema = Arc::new(window_schema());
    let rows: Vec<PgWireResult<_>> = windows
        .iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.id.to_string())?;
            encoder.encode_field(&int8(w.coach_id)?)?;
            encoder.encode_field(&w.day)?;
            encoder.encode_field(&w.start_time)?;
            encoder.encode_field(&w.end_time)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slots_response(coach_id: CoachId, slots: &[Instant]) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&int8(coach_id)?)?;
            encoder.encode_field(&rfc3339(slot))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&int8(b.user_id)?)?;
            encoder.encode_field(&int8(b.coach_id)?)?;
            encoder.encode_field(&rfc3339(&b.start_time))?;
            encoder.encode_field(&rfc3339(&b.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(schema_for(sql::row_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let params: Vec<Option<String>> = portal
            .parameters
            .iter()
            .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
            .collect();
        let sql = substitute_params(&portal.statement.statement, &params);
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
            schema_for(sql::row_shape(&target.statement)),
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
        Ok(DescribePortalResponse::new(schema_for(sql::row_shape(
            &target.statement.statement,
        ))))
    }
}

/// `$N` placeholders in `sql`: byte range and 1-based parameter index.
/// Text inside single-quoted literals is never a placeholder; an escaped
/// `''` toggles twice and stays inside the literal.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_literal = !in_literal;
        }
        if in_literal || bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start + 1..i].parse::<usize>() {
            found.push((start..i, n));
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace `$1, $2, ...` with bound values as quoted text literals in one
/// left-to-right pass, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            // Unbound: leave as written and let the parser reject it.
            None => out.push_str(&sql[range.clone()]),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::BadRequest(_) => "22023",
        EngineError::Conflict(_) => "23505",
        EngineError::Internal(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.message().to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        SqlError::TooLong(_) => "54000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
