use chrono::{DateTime, NaiveDate, Utc};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::{MAX_FIELD_LEN, MAX_SQL_LEN};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWindow {
        coach_id: CoachId,
        day: String,
        start_time: String,
        end_time: String,
        returning: bool,
    },
    SelectWindows {
        coach_id: CoachId,
    },
    SelectSlots {
        coach_id: CoachId,
        date: NaiveDate,
    },
    InsertBooking {
        user_id: UserId,
        coach_id: CoachId,
        datetime: Instant,
        returning: bool,
    },
    SelectBookings {
        user_id: UserId,
    },
    DeleteBooking {
        id: Ulid,
        user_id: UserId,
    },
}

const WINDOW_COLUMNS: [&str; 4] = ["coach_id", "day", "start_time", "end_time"];
const BOOKING_COLUMNS: [&str; 3] = ["user_id", "coach_id", "datetime"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "availability" => {
            let row = InsertRow::new(insert, "availability", &WINDOW_COLUMNS)?;
            Ok(Command::InsertWindow {
                coach_id: row.id("coach_id")?,
                day: row.text("day")?,
                start_time: row.text("start_time")?,
                end_time: row.text("end_time")?,
                returning,
            })
        }
        "bookings" => {
            let row = InsertRow::new(insert, "bookings", &BOOKING_COLUMNS)?;
            let datetime = match row.get("datetime") {
                Some(expr) => parse_datetime(expr)?,
                None => return Err(SqlError::MissingColumn("datetime")),
            };
            Ok(Command::InsertBooking {
                user_id: row.id("user_id")?,
                coach_id: row.id("coach_id")?,
                datetime,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::collect(delete.selection.as_ref(), &["id", "user_id"])?;
    Ok(Command::DeleteBooking {
        id: parse_ulid(filters.require("id")?)?,
        user_id: parse_id(filters.require("user_id")?)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let selection = select.selection.as_ref();

    match table.as_str() {
        "availability" => {
            let filters = Filters::collect(selection, &["coach_id"])?;
            Ok(Command::SelectWindows {
                coach_id: parse_id(filters.require("coach_id")?)?,
            })
        }
        "slots" => {
            let filters = Filters::collect(selection, &["coach_id", "date"])?;
            Ok(Command::SelectSlots {
                coach_id: parse_id(filters.require("coach_id")?)?,
                date: parse_date(filters.require("date")?)?,
            })
        }
        "bookings" => {
            let filters = Filters::collect(selection, &["user_id"])?;
            Ok(Command::SelectBookings {
                user_id: parse_id(filters.require("user_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Row layout a statement produces, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Windows,
    Slots,
    Bookings,
}

/// Result row layout of `sql` without binding its values, so statements
/// with `$n` placeholders can be described before execution.
pub fn row_shape(sql: &str) -> Option<RowShape> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let (table, produces_rows) = match stmts.first()? {
        Statement::Insert(insert) => (insert_table_name(insert).ok()?, insert.returning.is_some()),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => (table_factor_name(&select.from.first()?.relation).ok()?, true),
            _ => return None,
        },
        _ => return None,
    };
    if !produces_rows {
        return None;
    }
    match table.as_str() {
        "availability" => Some(RowShape::Windows),
        "slots" => Some(RowShape::Slots),
        "bookings" => Some(RowShape::Bookings),
        _ => None,
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// The single VALUES row of an INSERT, addressable by column name.
/// Without an explicit column list, values bind to `default_columns` in order.
struct InsertRow<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        default_columns: &[&'static str],
    ) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns
            .iter()
            .find(|c| !default_columns.contains(&c.as_str()))
        {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// An omitted id column reads as 0, which the engine rejects as missing.
    fn id(&self, column: &str) -> Result<u64, SqlError> {
        self.get(column).map_or(Ok(0), parse_id)
    }

    /// An omitted text column reads as empty, which the engine rejects.
    fn text(&self, column: &str) -> Result<String, SqlError> {
        self.get(column).map_or(Ok(String::new()), parse_text)
    }
}

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// `col = value` conjuncts of a WHERE clause.
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut pairs = Vec::new();
        if let Some(expr) = selection {
            collect_eq(expr, &mut pairs)?;
        }
        if let Some((col, _)) = pairs.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(col.clone()));
        }
        Ok(Self { pairs })
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.pairs
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
            .ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_eq<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq(left, out)?;
                collect_eq(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

/// Literal text of a string or number, `None` for NULL.
fn literal(expr: &Expr) -> Result<Option<&str>, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.as_str())),
        Some(Value::Null) => Ok(None),
        Some(other) => Err(SqlError::InvalidValue(format!("unexpected literal {other}"))),
        None => Err(SqlError::InvalidValue(format!("expected a literal, got {expr}"))),
    }
}

/// Coach and user ids: non-negative and within INT8 so they render back
/// losslessly. NULL reads as 0 (missing).
fn parse_id(expr: &Expr) -> Result<u64, SqlError> {
    let Some(s) = literal(expr)? else {
        return Ok(0);
    };
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| SqlError::InvalidValue(format!("bad id: {s}")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    let s = literal(expr)?.unwrap_or_default();
    if s.len() > MAX_FIELD_LEN {
        return Err(SqlError::InvalidValue(format!(
            "value longer than {MAX_FIELD_LEN} bytes"
        )));
    }
    Ok(s.to_string())
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal(expr)?.ok_or_else(|| SqlError::InvalidValue("id must not be NULL".into()))?;
    Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad booking id: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal(expr)?.ok_or_else(|| SqlError::InvalidValue("date must not be NULL".into()))?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("date must be YYYY-MM-DD: {s}")))
}

/// RFC 3339 with an explicit offset, brought into UTC.
fn parse_datetime(expr: &Expr) -> Result<Instant, SqlError> {
    let s = literal(expr)?
        .ok_or_else(|| SqlError::InvalidValue("datetime must not be NULL".into()))?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SqlError::InvalidValue(format!("datetime must be RFC 3339: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// A well-formed statement carrying a malformed literal.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(n) => write!(f, "statement too long: {n} bytes"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_insert_window() {
        let sql = "INSERT INTO availability (coach_id, day, start_time, end_time) \
                   VALUES (1, 'monday', '09:00', '10:00')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertWindow {
                coach_id: 1,
                day: "monday".into(),
                start_time: "09:00".into(),
                end_time: "10:00".into(),
                returning: false,
            }
        );
    }

    #[test]
    fn insert_columns_in_any_order() {
        let sql = "INSERT INTO availability (day, end_time, start_time, coach_id) \
                   VALUES ('Friday', '18:00', '17:00', '3') RETURNING *";
        match parse_sql(sql).unwrap() {
            Command::InsertWindow { coach_id, day, start_time, end_time, returning } => {
                assert_eq!(coach_id, 3);
                assert_eq!(day, "Friday");
                assert_eq!(start_time, "17:00");
                assert_eq!(end_time, "18:00");
                assert!(returning);
            }
            other => panic!("expected InsertWindow, got {other:?}"),
        }
    }

    #[test]
    fn insert_without_column_list_is_positional() {
        let sql = "INSERT INTO availability VALUES (2, 'Tuesday', '08:00', '09:00')";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::InsertWindow { coach_id: 2, .. }
        ));
    }

    #[test]
    fn omitted_coach_id_reads_as_missing() {
        let sql = "INSERT INTO availability (day, start_time, end_time) \
                   VALUES ('Monday', '09:00', '10:00')";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::InsertWindow { coach_id: 0, .. }
        ));
    }

    #[test]
    fn parse_insert_booking_converts_to_utc() {
        let sql = "INSERT INTO bookings (user_id, coach_id, datetime) \
                   VALUES (5, 1, '2030-01-07T11:00:00+02:00')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertBooking {
                user_id: 5,
                coach_id: 1,
                datetime: Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap(),
                returning: false,
            }
        );
    }

    #[test]
    fn booking_requires_datetime() {
        let sql = "INSERT INTO bookings (user_id, coach_id) VALUES (5, 1)";
        assert_eq!(parse_sql(sql).unwrap_err(), SqlError::MissingColumn("datetime"));
    }

    #[test]
    fn booking_rejects_bad_datetime() {
        for bad in ["2030-01-07 09:00", "tomorrow", "2030-01-07T09:00:00"] {
            let sql = format!("INSERT INTO bookings VALUES (5, 1, '{bad}')");
            assert!(
                matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn parse_select_slots() {
        let sql = "SELECT * FROM slots WHERE coach_id = 1 AND date = '2030-01-07'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectSlots {
                coach_id: 1,
                date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            }
        );
    }

    #[test]
    fn select_slots_needs_both_filters() {
        let sql = "SELECT * FROM slots WHERE coach_id = 1";
        assert_eq!(parse_sql(sql).unwrap_err(), SqlError::MissingFilter("date"));
        let sql = "SELECT * FROM slots WHERE coach_id = 1 AND date = '07/01/2030'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_select_windows_and_bookings() {
        assert_eq!(
            parse_sql("SELECT * FROM availability WHERE coach_id = 7").unwrap(),
            Command::SelectWindows { coach_id: 7 }
        );
        assert_eq!(
            parse_sql("select * from bookings where (user_id = '5')").unwrap(),
            Command::SelectBookings { user_id: 5 }
        );
    }

    #[test]
    fn parse_delete_booking() {
        let sql = "DELETE FROM bookings WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV' AND user_id = 5";
        match parse_sql(sql).unwrap() {
            Command::DeleteBooking { id, user_id } => {
                assert_eq!(id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
                assert_eq!(user_id, 5);
            }
            other => panic!("expected DeleteBooking, got {other:?}"),
        }
    }

    #[test]
    fn delete_requires_user() {
        let sql = "DELETE FROM bookings WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'";
        assert_eq!(parse_sql(sql).unwrap_err(), SqlError::MissingFilter("user_id"));
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(matches!(
            parse_sql("SELECT * FROM coaches WHERE id = 1"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE user_id > 1"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE coach_id = 1"),
            Err(SqlError::UnknownColumn(_))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM availability WHERE coach_id = 1"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql("DROP TABLE bookings"), Err(SqlError::Unsupported(_))));
        assert!(matches!(parse_sql("NOT SQL AT ALL"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn rejects_arity_mismatch_and_bad_ids() {
        let sql = "INSERT INTO availability (coach_id, day) VALUES (1, 'Monday', '09:00')";
        assert_eq!(parse_sql(sql).unwrap_err(), SqlError::WrongArity("availability", 2, 3));
        let sql = "SELECT * FROM availability WHERE coach_id = 'abc'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
        let sql = "DELETE FROM bookings WHERE id = 'nope' AND user_id = 5";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn rejects_oversized_input() {
        let sql = format!("SELECT * FROM bookings WHERE user_id = {}", "1".repeat(MAX_SQL_LEN));
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooLong(_))));

        let day = "x".repeat(MAX_FIELD_LEN + 1);
        let sql = format!("INSERT INTO availability VALUES (1, '{day}', '09:00', '10:00')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn negative_ids_are_rejected() {
        let sql = "SELECT * FROM bookings WHERE user_id = '-5'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn row_shapes() {
        assert_eq!(
            row_shape("SELECT * FROM slots WHERE coach_id = $1 AND date = $2"),
            Some(RowShape::Slots)
        );
        assert_eq!(
            row_shape("INSERT INTO bookings VALUES ($1, $2, $3) RETURNING *"),
            Some(RowShape::Bookings)
        );
        assert_eq!(row_shape("INSERT INTO bookings VALUES ($1, $2, $3)"), None);
        assert_eq!(row_shape("DELETE FROM bookings WHERE id = $1 AND user_id = $2"), None);
        assert_eq!(row_shape("garbage"), None);
    }

    #[test]
    fn empty_input() {
        assert_eq!(parse_sql("").unwrap_err(), SqlError::Empty);
    }
}
