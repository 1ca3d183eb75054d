use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use tracing::{debug, error};

use crate::auth::FieldbookAuthSource;
use crate::model::*;
use crate::observability;
use crate::service::{ServiceError, ServiceResult, Services};
use crate::sql::{self, BookingFilter, Command, FieldFilter, PaymentFilter, SqlError};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct FieldbookHandler {
    services: Arc<Services>,
    query_parser: Arc<FieldbookQueryParser>,
}

impl FieldbookHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            query_parser: Arc::new(FieldbookQueryParser),
        }
    }

    /// Parse, execute, and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(
                    observability::QUERIES_TOTAL,
                    "command" => "unparsed",
                    "status" => "syntax_error"
                )
                .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result.map_err(service_err)
    }

    async fn execute_command(&self, cmd: Command) -> ServiceResult<Response> {
        let fields = &self.services.fields;
        let bookings = &self.services.bookings;
        match cmd {
            Command::InsertField { owner_id, input } => {
                let field = fields.create_field(owner_id, input).await?;
                Ok(field_rows(vec![field]))
            }
            Command::UpdateField {
                id,
                owner_id,
                changes,
            } => {
                let current = fields.get_field(id).await?;
                let field = fields
                    .update_field(id, owner_id, changes.apply_to(&current))
                    .await?;
                Ok(field_rows(vec![field]))
            }
            Command::DeleteField { id, owner_id } => {
                fields.delete_field(id, owner_id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFields(filter) => {
                let rows = match filter {
                    FieldFilter::All => fields.list_fields().await?,
                    FieldFilter::Id(id) => vec![fields.get_field(id).await?],
                    FieldFilter::Owner(owner_id) => fields.list_fields_by_owner(owner_id).await?,
                };
                Ok(field_rows(rows))
            }
            Command::SetupSchedules {
                field_id,
                owner_id,
                entries,
            } => {
                let schedules = fields.setup_schedules(field_id, owner_id, entries).await?;
                Ok(schedule_rows(schedules))
            }
            Command::SelectSchedules { field_id } => {
                Ok(schedule_rows(fields.get_schedule(field_id).await?))
            }
            Command::SelectSlots { field_id, date } => {
                Ok(slot_rows(fields.find_available_slots(field_id, date).await?))
            }
            Command::SelectConflicts { field_id, span } => {
                Ok(booking_rows(bookings.find_conflicts(field_id, span).await?))
            }
            Command::InsertBooking(req) => Ok(booking_rows(vec![bookings.create(req).await?])),
            Command::SelectBookings(filter) => {
                let rows = match filter {
                    BookingFilter::Id(id) => vec![bookings.get(id).await?],
                    BookingFilter::User(user_id) => bookings.list_for_user(user_id).await?,
                    BookingFilter::Field(field_id) => bookings.list_for_field(field_id).await?,
                };
                Ok(booking_rows(rows))
            }
            Command::ConfirmBooking { id } => Ok(booking_rows(vec![bookings.confirm(id).await?])),
            Command::CompleteBooking { id } => {
                Ok(booking_rows(vec![bookings.complete(id).await?]))
            }
            Command::CancelBooking { id, user_id } => {
                Ok(booking_rows(vec![bookings.cancel(user_id, id).await?]))
            }
            Command::SelectPayments(filter) => {
                let payment = match filter {
                    PaymentFilter::Booking(id) => bookings.payment_for(id).await?,
                    PaymentFilter::Transaction(tx) => bookings.payment_by_transaction(&tx).await?,
                };
                Ok(payment_rows(vec![payment]))
            }
            Command::SettlePayment {
                transaction_id,
                status,
            } => {
                let payment = match status {
                    PaymentStatus::Success => bookings.payment_succeeded(&transaction_id).await?,
                    PaymentStatus::Failed => bookings.payment_failed(&transaction_id).await?,
                    PaymentStatus::Pending => {
                        return Err(ServiceError::invalid("cannot reset a payment to pending"));
                    }
                };
                Ok(payment_rows(vec![payment]))
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn fmt_ts(ts: Ts) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn field_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("owner_id", Type::INT8),
        column("name", Type::VARCHAR),
        column("address", Type::VARCHAR),
        column("description", Type::VARCHAR),
        column("image_url", Type::VARCHAR),
        column("price_per_hour", Type::INT8),
        column("created_at", Type::TIMESTAMP),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("field_id", Type::INT8),
        column("day_of_week", Type::INT8),
        column("day_name", Type::VARCHAR),
        column("open_time", Type::VARCHAR),
        column("close_time", Type::VARCHAR),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        column("start_time", Type::TIMESTAMP),
        column("end_time", Type::TIMESTAMP),
        column("available", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("user_id", Type::INT8),
        column("field_id", Type::INT8),
        column("start_time", Type::TIMESTAMP),
        column("end_time", Type::TIMESTAMP),
        column("total_price", Type::INT8),
        column("status", Type::VARCHAR),
        column("payment_id", Type::INT8),
        column("created_at", Type::TIMESTAMP),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("booking_id", Type::INT8),
        column("amount", Type::INT8),
        column("gateway", Type::VARCHAR),
        column("transaction_id", Type::VARCHAR),
        column("status", Type::VARCHAR),
        column("created_at", Type::TIMESTAMP),
        column("updated_at", Type::TIMESTAMP),
    ]
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn field_rows(fields: Vec<Field>) -> Response {
    rows_response(field_schema(), fields, |enc, f| {
        enc.encode_field(&f.id)?;
        enc.encode_field(&f.owner_id)?;
        enc.encode_field(&f.name)?;
        enc.encode_field(&f.address)?;
        enc.encode_field(&f.description)?;
        enc.encode_field(&f.image_url)?;
        enc.encode_field(&f.price_per_hour)?;
        enc.encode_field(&fmt_ts(f.created_at))
    })
}

fn schedule_rows(schedules: Vec<WeeklySchedule>) -> Response {
    rows_response(schedule_schema(), schedules, |enc, s| {
        enc.encode_field(&s.id)?;
        enc.encode_field(&s.field_id)?;
        enc.encode_field(&s.day.index())?;
        enc.encode_field(&s.day.name().to_string())?;
        enc.encode_field(&s.open.format("%H:%M").to_string())?;
        enc.encode_field(&s.close.format("%H:%M").to_string())
    })
}

fn slot_rows(slots: Vec<TimeSlot>) -> Response {
    rows_response(slot_schema(), slots, |enc, slot| {
        enc.encode_field(&fmt_ts(slot.span.start))?;
        enc.encode_field(&fmt_ts(slot.span.end))?;
        enc.encode_field(&slot.available)
    })
}

fn booking_rows(reservations: Vec<Reservation>) -> Response {
    rows_response(booking_schema(), reservations, |enc, r| {
        enc.encode_field(&r.id)?;
        enc.encode_field(&r.user_id)?;
        enc.encode_field(&r.field_id)?;
        enc.encode_field(&fmt_ts(r.span.start))?;
        enc.encode_field(&fmt_ts(r.span.end))?;
        enc.encode_field(&r.total_price)?;
        enc.encode_field(&r.status.to_string())?;
        enc.encode_field(&r.payment_id)?;
        enc.encode_field(&fmt_ts(r.created_at))
    })
}

fn payment_rows(payments: Vec<Payment>) -> Response {
    rows_response(payment_schema(), payments, |enc, p| {
        enc.encode_field(&p.id)?;
        enc.encode_field(&p.reservation_id)?;
        enc.encode_field(&p.amount)?;
        enc.encode_field(&p.gateway)?;
        enc.encode_field(&p.transaction_id)?;
        enc.encode_field(&p.status.as_str().to_string())?;
        enc.encode_field(&fmt_ts(p.created_at))?;
        enc.encode_field(&fmt_ts(p.updated_at))
    })
}

/// Result columns a statement will produce, judged from its target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    if words.first() == Some(&"delete") {
        let cancels_booking = words.windows(2).any(|w| w == ["from", "bookings"]);
        return if cancels_booking { booking_schema() } else { vec![] };
    }
    let table = words
        .windows(2)
        .find(|w| matches!(w[0], "from" | "into" | "update"))
        .map(|w| w[1]);
    match table {
        Some("fields") => field_schema(),
        Some("schedules") => schedule_schema(),
        Some("slots") => slot_schema(),
        Some("bookings" | "conflicts") => booking_schema(),
        Some("payments") => payment_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FieldbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        debug!(query, "simple query");
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FieldbookQueryParser;

#[async_trait]
impl QueryParser for FieldbookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FieldbookHandler {
    type Statement = String;
    type QueryParser = FieldbookQueryParser;

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
        debug!(query = %sql, "extended query");
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute `$1, $2, ...` with bound parameter values as quoted text.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FieldbookFactory {
    handler: Arc<FieldbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FieldbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FieldbookFactory {
    pub fn new(services: Arc<Services>, password: String) -> Self {
        Self {
            handler: Arc::new(FieldbookHandler::new(services)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                FieldbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FieldbookFactory {
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
    services: Arc<Services>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FieldbookFactory::new(services, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &ServiceError) -> &'static str {
    match e {
        ServiceError::InvalidInput(_) => "22023",
        ServiceError::NotFound(_) => "P0002",
        ServiceError::Unauthorized(_) => "42501",
        ServiceError::SlotUnavailable { .. } => "23P01",
        ServiceError::CancellationWindowClosed => "55P04",
        ServiceError::InvalidStateTransition { .. } => "55000",
        ServiceError::StoreFailure { .. } => "58030",
    }
}

fn service_err(e: ServiceError) -> PgWireError {
    if let ServiceError::StoreFailure { .. } = e {
        error!("store failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
