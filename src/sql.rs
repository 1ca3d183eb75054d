use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;
use crate::service::{BookingRequest, FieldInput, ScheduleInput};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertField {
        owner_id: Id,
        input: FieldInput,
    },
    UpdateField {
        id: Id,
        owner_id: Id,
        changes: FieldChanges,
    },
    DeleteField {
        id: Id,
        owner_id: Id,
    },
    SelectFields(FieldFilter),
    /// Bulk replace of a field's weekly schedule, one row per day.
    SetupSchedules {
        field_id: Id,
        owner_id: Id,
        entries: Vec<ScheduleInput>,
    },
    SelectSchedules {
        field_id: Id,
    },
    SelectSlots {
        field_id: Id,
        date: NaiveDate,
    },
    SelectConflicts {
        field_id: Id,
        span: Span,
    },
    InsertBooking(BookingRequest),
    SelectBookings(BookingFilter),
    ConfirmBooking {
        id: Id,
    },
    CompleteBooking {
        id: Id,
    },
    CancelBooking {
        id: Id,
        user_id: Id,
    },
    SelectPayments(PaymentFilter),
    /// Payment gateway callback.
    SettlePayment {
        transaction_id: String,
        status: PaymentStatus,
    },
}

/// Columns present in an `UPDATE fields SET ...`; the rest keep their values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FieldChanges {
    pub name: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub price_per_hour: Option<i64>,
}

impl FieldChanges {
    pub fn apply_to(self, field: &Field) -> FieldInput {
        FieldInput {
            name: self.name.unwrap_or_else(|| field.name.clone()),
            address: self.address.unwrap_or_else(|| field.address.clone()),
            description: self.description.unwrap_or_else(|| field.description.clone()),
            image_url: self.image_url.unwrap_or_else(|| field.image_url.clone()),
            price_per_hour: self.price_per_hour.unwrap_or(field.price_per_hour),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFilter {
    All,
    Id(Id),
    Owner(Id),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Id),
    User(Id),
    Field(Id),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFilter {
    Booking(Id),
    Transaction(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const FIELD_COLUMNS: &[&str] = &[
    "owner_id",
    "name",
    "address",
    "price_per_hour",
    "description",
    "image_url",
];
const SCHEDULE_COLUMNS: &[&str] = &[
    "field_id",
    "owner_id",
    "day_of_week",
    "open_time",
    "close_time",
];
const BOOKING_COLUMNS: &[&str] = &["user_id", "field_id", "start_time", "duration_hours"];

/// One VALUES row addressed by column name. Without an explicit column list
/// the table's default column order applies.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(columns: &[ast::Ident], defaults: &[&str], values: &'a [Expr]) -> Self {
        let columns = if columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        Self { columns, values }
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn text_or_empty(&self, column: &str) -> Result<String, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => parse_text(expr),
            _ => Ok(String::new()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "fields" => {
            let row = Row::new(&insert.columns, FIELD_COLUMNS, single_row(&rows, "fields")?);
            Ok(Command::InsertField {
                owner_id: parse_i64(row.require("owner_id")?)?,
                input: FieldInput {
                    name: parse_text(row.require("name")?)?,
                    address: parse_text(row.require("address")?)?,
                    price_per_hour: parse_i64(row.require("price_per_hour")?)?,
                    description: row.text_or_empty("description")?,
                    image_url: row.text_or_empty("image_url")?,
                },
            })
        }
        "schedules" => {
            let mut target: Option<(Id, Id)> = None;
            let mut entries = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = Row::new(&insert.columns, SCHEDULE_COLUMNS, values);
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let field_id = parse_i64(row.require("field_id")?).map_err(at_row)?;
                let owner_id = parse_i64(row.require("owner_id")?).map_err(at_row)?;
                match target {
                    None => target = Some((field_id, owner_id)),
                    Some(t) if t != (field_id, owner_id) => {
                        return Err(SqlError::Parse(
                            "all schedule rows must share field_id and owner_id".into(),
                        ));
                    }
                    Some(_) => {}
                }
                entries.push(ScheduleInput {
                    day_of_week: parse_i64(row.require("day_of_week")?).map_err(at_row)?,
                    open_time: parse_text(row.require("open_time")?).map_err(at_row)?,
                    close_time: parse_text(row.require("close_time")?).map_err(at_row)?,
                });
            }
            let (field_id, owner_id) =
                target.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::SetupSchedules {
                field_id,
                owner_id,
                entries,
            })
        }
        "bookings" => {
            let row = Row::new(&insert.columns, BOOKING_COLUMNS, single_row(&rows, "bookings")?);
            Ok(Command::InsertBooking(BookingRequest {
                user_id: parse_i64(row.require("user_id")?)?,
                field_id: parse_i64(row.require("field_id")?)?,
                start: parse_timestamp(row.require("start_time")?)?,
                duration_hours: parse_i64(row.require("duration_hours")?)?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::WrongArity(table, 1, rows.len())),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = Filters::from_selection(selection)?;

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &assignment.value));
    }

    match table.as_str() {
        "fields" => {
            let mut changes = FieldChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "address" => changes.address = Some(parse_text(value)?),
                    "description" => changes.description = Some(parse_text(value)?),
                    "image_url" => changes.image_url = Some(parse_text(value)?),
                    "price_per_hour" => changes.price_per_hour = Some(parse_i64(value)?),
                    _ => {
                        return Err(SqlError::Unsupported(format!(
                            "cannot update column {column}"
                        )));
                    }
                }
            }
            Ok(Command::UpdateField {
                id: filters.require_i64("id")?,
                owner_id: filters.require_i64("owner_id")?,
                changes,
            })
        }
        "bookings" => {
            let status = status_assignment(&set)?;
            let id = filters.require_i64("id")?;
            match ReservationStatus::parse(&status) {
                Some(ReservationStatus::Confirmed) => Ok(Command::ConfirmBooking { id }),
                Some(ReservationStatus::Completed) => Ok(Command::CompleteBooking { id }),
                Some(ReservationStatus::Cancelled) => Ok(Command::CancelBooking {
                    id,
                    user_id: filters.require_i64("user_id")?,
                }),
                _ => Err(SqlError::Unsupported(format!("cannot set booking status to {status:?}"))),
            }
        }
        "payments" => {
            let status = status_assignment(&set)?;
            match PaymentStatus::parse(&status) {
                Some(status @ (PaymentStatus::Success | PaymentStatus::Failed)) => {
                    Ok(Command::SettlePayment {
                        transaction_id: filters.require_text("transaction_id")?,
                        status,
                    })
                }
                _ => Err(SqlError::Unsupported(format!("cannot set payment status to {status:?}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// The value of a lone `SET status = '...'`.
fn status_assignment(set: &[(String, &Expr)]) -> Result<String, SqlError> {
    match set {
        [(column, value)] if column == "status" => parse_text(value),
        _ => Err(SqlError::Unsupported("only `SET status = ...` is supported".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "fields" => Ok(Command::DeleteField {
            id: filters.require_i64("id")?,
            owner_id: filters.require_i64("owner_id")?,
        }),
        // Bookings are never removed, only cancelled.
        "bookings" => Ok(Command::CancelBooking {
            id: filters.require_i64("id")?,
            user_id: filters.require_i64("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "fields" => {
            let filter = if let Some(id) = filters.i64("id")? {
                FieldFilter::Id(id)
            } else if let Some(owner_id) = filters.i64("owner_id")? {
                FieldFilter::Owner(owner_id)
            } else {
                FieldFilter::All
            };
            Ok(Command::SelectFields(filter))
        }
        "schedules" => Ok(Command::SelectSchedules {
            field_id: filters.require_i64("field_id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            field_id: filters.require_i64("field_id")?,
            date: parse_date(filters.require("date")?)?,
        }),
        "conflicts" => {
            let start = parse_timestamp(filters.require("start_time")?)?;
            let end = parse_timestamp(filters.require("end_time")?)?;
            if start >= end {
                return Err(SqlError::Parse("start_time must be before end_time".into()));
            }
            Ok(Command::SelectConflicts {
                field_id: filters.require_i64("field_id")?,
                span: Span::new(start, end),
            })
        }
        "bookings" => {
            let filter = if let Some(id) = filters.i64("id")? {
                BookingFilter::Id(id)
            } else if let Some(user_id) = filters.i64("user_id")? {
                BookingFilter::User(user_id)
            } else if let Some(field_id) = filters.i64("field_id")? {
                BookingFilter::Field(field_id)
            } else {
                return Err(SqlError::MissingFilter("id, user_id or field_id"));
            };
            Ok(Command::SelectBookings(filter))
        }
        "payments" => {
            let filter = if let Some(booking_id) = filters.i64("booking_id")? {
                PaymentFilter::Booking(booking_id)
            } else if let Some(expr) = filters.get("transaction_id") {
                PaymentFilter::Transaction(parse_text(expr)?)
            } else {
                return Err(SqlError::MissingFilter("booking_id or transaction_id"));
            };
            Ok(Command::SelectPayments(filter))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE ─────────────────────────────────────────────────────

/// `column = value` terms of a WHERE clause joined by AND.
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_eq_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64).transpose()
    }

    fn require_i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.require(column)?)
    }

    fn require_text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text(self.require(column)?)
    }
}

fn collect_eq_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_terms(left, out)?;
            collect_eq_terms(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_terms(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_timestamp(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let text = parse_text(expr)?;
    let trimmed = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| {
            SqlError::Parse(format!(
                "bad timestamp {text:?}, expected YYYY-MM-DD HH:MM[:SS]"
            ))
        })
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {text:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} row(s), got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
}
