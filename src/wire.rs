use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NoticeResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPassword;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, DeliveryFilter, SqlError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Result of one command: the wire responses plus notices to send first.
struct Outcome {
    responses: Vec<Response>,
    notices: Vec<String>,
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Self { responses: vec![response], notices: Vec::new() }
    }
}

pub struct SlotwiseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine, query_parser: Arc::new(SlotwiseQueryParser) }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Outcome> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Outcome, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { id, name, email, address, country_code } => {
                engine
                    .create_user(id, &name, &email, &address, &country_code)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)).into())
            }
            Command::InsertDelivery { id, user_id, timeslot_id } => {
                engine.book_with_id(id, user_id, timeslot_id).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)).into())
            }
            Command::DeleteDelivery { id } => {
                engine.cancel(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)).into())
            }
            Command::CompleteDelivery { id } => {
                engine.complete(id).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)).into())
            }
            Command::SelectAvailability { user_id, week_start } => {
                let report = engine.availability(user_id, week_start).await?;
                let notices = report.warnings.iter().map(warning_text).collect();
                let response = encode_availability(&report.slots).map_err(wire_encode_err)?;
                Ok(Outcome { responses: vec![response], notices })
            }
            Command::SelectDeliveries { filter } => {
                let rows = match filter {
                    DeliveryFilter::Date(date) => engine.daily_deliveries(date),
                    DeliveryFilter::WeekFrom(start) => engine.weekly_deliveries(start)?,
                };
                Ok(encode_deliveries(&rows).map_err(wire_encode_err)?.into())
            }
            Command::SelectTimeslots { date } => {
                let rows = engine.list_timeslots(date).await;
                Ok(encode_timeslots(&rows).map_err(wire_encode_err)?.into())
            }
        }
    }
}

fn warning_text(w: &AvailabilityWarning) -> String {
    match w {
        AvailabilityWarning::HolidayLookupFailed { country_code, reason } => {
            format!("holidays for {country_code} unavailable, none applied: {reason}")
        }
        AvailabilityWarning::AddressUnresolved { reason } => {
            format!("address could not be resolved, no timeslots offered: {reason}")
        }
    }
}

fn wire_encode_err(e: PgWireError) -> EngineError {
    EngineError::InvariantViolation(format!("row encoding failed: {e}"))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("timeslot_id"), text_field("start"), text_field("end")]
}

fn deliveries_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("timeslot_id"),
        int_field("courier_id"),
        text_field("user_id"),
        text_field("date"),
        text_field("status"),
    ]
}

fn timeslots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int_field("courier_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        int_field("scheduled"),
        text_field("status"),
        text_field("supported_addresses"),
    ]
}

/// Schema of a statement's result, judged from its FROM table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return Vec::new();
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("DELIVERIES") {
        deliveries_schema()
    } else if upper.contains("TIMESLOTS") {
        timeslots_schema()
    } else {
        Vec::new()
    }
}

fn encode_availability(slots: &[TimeslotSummary]) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let mut rows = Vec::with_capacity(slots.len());
    for slot in slots {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&slot.timeslot_id.to_string())?;
        encoder.encode_field(&slot.start.format(TIMESTAMP_FORMAT).to_string())?;
        encoder.encode_field(&slot.end.format(TIMESTAMP_FORMAT).to_string())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_deliveries(deliveries: &[Delivery]) -> PgWireResult<Response> {
    let schema = Arc::new(deliveries_schema());
    let mut rows = Vec::with_capacity(deliveries.len());
    for d in deliveries {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&d.id.to_string())?;
        encoder.encode_field(&d.timeslot_id.to_string())?;
        encoder.encode_field(&(d.courier_id as i32))?;
        encoder.encode_field(&d.user_id.to_string())?;
        encoder.encode_field(&d.date.to_string())?;
        encoder.encode_field(&d.status.as_str().to_string())?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_timeslots(timeslots: &[Timeslot]) -> PgWireResult<Response> {
    let schema = Arc::new(timeslots_schema());
    let mut rows = Vec::with_capacity(timeslots.len());
    for ts in timeslots {
        let cities: Vec<&str> = ts.supported_addresses.iter().map(String::as_str).collect();
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&ts.id.to_string())?;
        encoder.encode_field(&(ts.courier_id as i32))?;
        encoder.encode_field(&ts.date.to_string())?;
        encoder.encode_field(&ts.start.format(TIMESTAMP_FORMAT).to_string())?;
        encoder.encode_field(&ts.end.format(TIMESTAMP_FORMAT).to_string())?;
        encoder.encode_field(&(ts.scheduled as i32))?;
        encoder.encode_field(&ts.status.as_str().to_string())?;
        encoder.encode_field(&cities.join(", "))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

async fn send_notices<C>(client: &mut C, notices: Vec<String>) -> PgWireResult<()>
where
    C: Sink<PgWireBackendMessage> + Unpin + Send,
    PgWireError: From<C::Error>,
{
    for message in notices {
        let info = ErrorInfo::new("WARNING".into(), "01000".into(), message);
        client
            .send(PgWireBackendMessage::NoticeResponse(NoticeResponse::from(info)))
            .await?;
    }
    Ok(())
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let outcome = self.run(query).await?;
        send_notices(client, outcome.notices).await?;
        Ok(outcome.responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
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
        let outcome = self.run(&sql).await?;
        send_notices(client, outcome.notices).await?;
        outcome
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("command produced no response".into()))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
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

/// Inline bound parameters as quoted text. Highest index first so `$1`
/// never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(engine: Arc<Engine>, password: &str) -> Self {
        Self {
            handler: Arc::new(SlotwiseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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
    factory: SlotwiseFactory,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine error: XX000 for defects, P0002 for missing
/// records, P0001 for rejected requests.
pub fn sqlstate(e: &EngineError) -> &'static str {
    if e.is_defect() || matches!(e, EngineError::WalError(_)) {
        "XX000"
    } else if e.is_not_found() {
        "P0002"
    } else {
        "P0001"
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[test]
    fn sqlstate_classes() {
        let id = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2021, 7, 19).unwrap();
        assert_eq!(sqlstate(&EngineError::SlotUnavailable(id)), "P0001");
        assert_eq!(sqlstate(&EngineError::DeliveryCompleted(id)), "P0001");
        assert_eq!(sqlstate(&EngineError::DeliveryNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::UserNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::CapacityExceeded(1, date)), "XX000");
        assert_eq!(sqlstate(&EngineError::InvariantViolation("x".into())), "XX000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "XX000");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM timeslots"), 0);
        assert_eq!(count_params("INSERT INTO deliveries VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("x = $2 AND y = $10 AND z = $"), 10);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM availability WHERE user_id = $1").len(), 3);
        assert_eq!(result_schema("select * from deliveries where date = $1").len(), 6);
        assert_eq!(result_schema("SELECT * FROM timeslots").len(), 8);
        assert!(result_schema("DELETE FROM deliveries WHERE id = $1").is_empty());
    }
}
