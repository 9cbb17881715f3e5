use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::AppointmentDraft;

/// Writable columns of `appointments`, in positional INSERT order.
pub const APPOINTMENT_COLUMNS: [&str; 6] = [
    "animal_name",
    "species",
    "owner_name",
    "phone",
    "veterinarian",
    "date_time",
];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAppointment {
        draft: AppointmentDraft,
        returning: bool,
    },
    UpdateAppointment {
        id: Ulid,
        draft: AppointmentDraft,
    },
    CancelAppointment {
        id: Ulid,
    },
    SelectAppointments {
        id: Option<Ulid>,
    },
    /// `None` on either side yields an empty report.
    SelectCancelled {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectAgenda {
        veterinarian: String,
        day: NaiveDate,
    },
    SelectSuggestion {
        veterinarian: String,
        date_time: NaiveDateTime,
    },
    SelectVeterinarians,
    SelectSpecies,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows a statement sends back, if any. Works on statements
/// that still carry `$n` placeholders.
pub fn returned_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok(),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let values = extract_insert_values(insert)?;
    let expected = if insert.columns.is_empty() {
        APPOINTMENT_COLUMNS.len()
    } else {
        insert.columns.len()
    };
    if values.len() != expected {
        return Err(SqlError::WrongArity("appointments", expected, values.len()));
    }

    // Without a column list, values follow APPOINTMENT_COLUMNS order.
    let mut columns: HashMap<&str, &Expr> = HashMap::new();
    if insert.columns.is_empty() {
        columns.extend(APPOINTMENT_COLUMNS.iter().copied().zip(values));
    } else {
        for (ident, value) in insert.columns.iter().zip(values) {
            assign_column(&mut columns, ident.value.to_lowercase(), value)?;
        }
    }

    Ok(Command::InsertAppointment {
        draft: draft_from_columns(&columns)?,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "appointments" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut columns: HashMap<&str, &Expr> = HashMap::new();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(target) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let col = object_name_last(target).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        assign_column(&mut columns, col, &assignment.value)?;
    }

    Ok(Command::UpdateAppointment {
        id: extract_where_id(selection)?,
        draft: draft_from_columns(&columns)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::CancelAppointment {
        id: extract_where_id(&delete.selection)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters);
    }

    match table.as_str() {
        "appointments" => {
            let id = match find_filter(&filters, "id", ast::BinaryOperator::Eq) {
                Some(expr) => Some(parse_ulid_expr(expr)?),
                None => None,
            };
            Ok(Command::SelectAppointments { id })
        }
        "cancelled_appointments" => {
            let from = find_filter(&filters, "cancelled_on", ast::BinaryOperator::GtEq)
                .map(parse_date_expr)
                .transpose()?;
            let to = find_filter(&filters, "cancelled_on", ast::BinaryOperator::LtEq)
                .map(parse_date_expr)
                .transpose()?;
            Ok(Command::SelectCancelled { from, to })
        }
        "agenda" => Ok(Command::SelectAgenda {
            veterinarian: parse_string_expr(
                find_filter(&filters, "veterinarian", ast::BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("veterinarian"))?,
            )?,
            day: parse_date_expr(
                find_filter(&filters, "day", ast::BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("day"))?,
            )?,
        }),
        "suggestions" => Ok(Command::SelectSuggestion {
            veterinarian: parse_string_expr(
                find_filter(&filters, "veterinarian", ast::BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("veterinarian"))?,
            )?,
            date_time: parse_timestamp_expr(
                find_filter(&filters, "date_time", ast::BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("date_time"))?,
            )?,
        }),
        "veterinarians" => Ok(Command::SelectVeterinarians),
        "species" => Ok(Command::SelectSpecies),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One `column <op> value` comparison out of a WHERE clause.
struct Filter<'a> {
    column: String,
    op: ast::BinaryOperator,
    value: &'a Expr,
}

/// Flatten AND-ed comparisons. `x BETWEEN a AND b` becomes `x >= a` and
/// `x <= b`. Anything else is ignored.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out);
            collect_filters(right, out);
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(column) = expr_column_name(left) {
                out.push(Filter {
                    column,
                    op: op.clone(),
                    value: right,
                });
            }
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            if let Some(column) = expr_column_name(expr) {
                out.push(Filter {
                    column: column.clone(),
                    op: ast::BinaryOperator::GtEq,
                    value: low,
                });
                out.push(Filter {
                    column,
                    op: ast::BinaryOperator::LtEq,
                    value: high,
                });
            }
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        _ => {}
    }
}

fn find_filter<'a>(filters: &[Filter<'a>], column: &str, op: ast::BinaryOperator) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|f| f.column == column && f.op == op)
        .map(|f| f.value)
}

/// Record `value` for a writable column, once.
fn assign_column<'a>(
    columns: &mut HashMap<&'static str, &'a Expr>,
    name: String,
    value: &'a Expr,
) -> Result<(), SqlError> {
    let known = APPOINTMENT_COLUMNS
        .iter()
        .copied()
        .find(|c| *c == name)
        .ok_or_else(|| SqlError::UnknownColumn(name))?;
    if columns.insert(known, value).is_some() {
        return Err(SqlError::DuplicateColumn(known));
    }
    Ok(())
}

fn draft_from_columns(columns: &HashMap<&str, &Expr>) -> Result<AppointmentDraft, SqlError> {
    let text = |name: &'static str| -> Result<String, SqlError> {
        let expr = columns.get(name).ok_or(SqlError::MissingColumn(name))?;
        parse_string_expr(expr)
    };
    let date_time = columns
        .get("date_time")
        .ok_or(SqlError::MissingColumn("date_time"))?;

    Ok(AppointmentDraft {
        animal_name: text("animal_name")?,
        species: text("species")?,
        owner_name: text("owner_name")?,
        phone: text("phone")?,
        veterinarian: text("veterinarian")?,
        date_time: parse_timestamp_expr(date_time)?,
    })
}

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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
        // 'x'::date, 'x'::timestamp
        Expr::Cast { expr, .. } => extract_value(expr),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_timestamp_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_timestamp(&s)
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, SqlError> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    DuplicateColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown or read-only column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::DuplicateColumn(col) => write!(f, "column given twice: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
