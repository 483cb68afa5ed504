use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SessionUpdate;
use crate::model::*;

/// Parsed command from SQL input.
///
/// The SQL surface trusts its caller. Every connection that passes the shared
/// password may issue any command, including privileged cancellations, so it
/// is meant for front-desk software and not for members' own devices.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    },
    InsertClient {
        id: Ulid,
        name: Option<String>,
    },
    InsertPass {
        id: Ulid,
        client_id: Ulid,
        total_credits: u32,
        valid_from: Ms,
        valid_until: Ms,
    },
    InsertClass {
        id: Ulid,
        room_id: Ulid,
        trainer_id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
        price_cents: i64,
        credits_required: Option<u32>,
        name: Option<String>,
    },
    CompleteClass {
        id: Ulid,
    },
    DeleteClass {
        id: Ulid,
    },
    InsertSession {
        id: Ulid,
        room_id: Ulid,
        staff_id: Ulid,
        client_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    },
    UpdateSession {
        id: Ulid,
        update: SessionUpdate,
    },
    /// `UPDATE sessions SET status = ...`: completed / no_show / cancelled.
    SetSessionStatus {
        id: Ulid,
        status: SessionStatus,
        attended: bool,
    },
    DeleteSession {
        id: Ulid,
    },
    InsertRegistration {
        occurrence_id: Ulid,
        client_id: Ulid,
    },
    MarkAttendance {
        occurrence_id: Ulid,
        client_id: Ulid,
        attended: bool,
    },
    DeleteRegistration {
        occurrence_id: Ulid,
        client_id: Ulid,
        /// Asserted by the caller (`AND privileged = true`); lifts the
        /// cancellation lock window. Not checked against any role.
        privileged: bool,
    },
    InsertDeduction {
        client_id: Ulid,
        reason: Option<String>,
    },
    InsertRefund {
        client_id: Ulid,
        count: u32,
        pass_id: Option<Ulid>,
    },
    InsertPayment {
        client_id: Ulid,
        amount_cents: i64,
    },
    SelectResources {
        kind: Option<ResourceKind>,
    },
    SelectCalendar {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectSession {
        id: Ulid,
    },
    SelectClass {
        id: Ulid,
    },
    SelectRegistrations {
        occurrence_id: Ulid,
    },
    SelectAudit {
        occurrence_id: Ulid,
    },
    SelectCredits {
        client_id: Ulid,
    },
    SelectPasses {
        client_id: Ulid,
    },
}

/// Parse a single statement. Batches go through [`parse_batch`].
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut cmds = parse_batch(sql)?;
    if cmds.len() > 1 {
        return Err(SqlError::MultipleStatements(cmds.len()));
    }
    cmds.pop().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement. Nothing is returned unless all of
/// them parse, so a bad statement late in a batch rejects the whole batch.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let optional = |i: usize| values.get(i);

    match table.as_str() {
        "rooms" | "staff" => {
            arity("resources", &values, 1)?;
            let kind = if table == "rooms" { ResourceKind::Room } else { ResourceKind::Staff };
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                kind,
                name: optional(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "clients" => {
            arity("clients", &values, 1)?;
            Ok(Command::InsertClient {
                id: parse_ulid(&values[0])?,
                name: optional(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "passes" => {
            arity("passes", &values, 5)?;
            Ok(Command::InsertPass {
                id: parse_ulid(&values[0])?,
                client_id: parse_ulid(&values[1])?,
                total_credits: parse_u32(&values[2])?,
                valid_from: parse_i64(&values[3])?,
                valid_until: parse_i64(&values[4])?,
            })
        }
        "classes" => {
            arity("classes", &values, 7)?;
            Ok(Command::InsertClass {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                trainer_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
                capacity: parse_u32(&values[5])?,
                price_cents: parse_i64(&values[6])?,
                credits_required: optional(7).map(parse_u32_or_null).transpose()?.flatten(),
                name: optional(8).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "sessions" => {
            arity("sessions", &values, 6)?;
            Ok(Command::InsertSession {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                staff_id: parse_ulid(&values[2])?,
                client_id: parse_ulid_or_null(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
            })
        }
        "registrations" => {
            arity("registrations", &values, 2)?;
            Ok(Command::InsertRegistration {
                occurrence_id: parse_ulid(&values[0])?,
                client_id: parse_ulid(&values[1])?,
            })
        }
        "credit_deductions" => {
            arity("credit_deductions", &values, 1)?;
            Ok(Command::InsertDeduction {
                client_id: parse_ulid(&values[0])?,
                reason: optional(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "credit_refunds" => {
            arity("credit_refunds", &values, 2)?;
            Ok(Command::InsertRefund {
                client_id: parse_ulid(&values[0])?,
                count: parse_u32(&values[1])?,
                pass_id: optional(2).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "payments" => {
            arity("payments", &values, 2)?;
            Ok(Command::InsertPayment {
                client_id: parse_ulid(&values[0])?,
                amount_cents: parse_i64(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;

    match table.as_str() {
        "classes" => Ok(Command::DeleteClass { id: filters.ulid("id")? }),
        "sessions" => Ok(Command::DeleteSession { id: filters.ulid("id")? }),
        "registrations" => Ok(Command::DeleteRegistration {
            occurrence_id: filters.ulid("occurrence_id")?,
            client_id: filters.ulid("client_id")?,
            privileged: filters.bool("privileged")?.unwrap_or(false),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = Filters::from_selection(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }
    let status = set
        .iter()
        .find(|(c, _)| c == "status")
        .map(|(_, v)| parse_string(v))
        .transpose()?;

    match table.as_str() {
        "sessions" => {
            let id = filters.ulid("id")?;
            if let Some(status) = status {
                let attended = set
                    .iter()
                    .find(|(c, _)| c == "attended")
                    .map(|(_, v)| parse_bool(v))
                    .transpose()?;
                let (status, attended) = match status.as_str() {
                    "completed" => (SessionStatus::Completed, attended.unwrap_or(true)),
                    "no_show" => (SessionStatus::NoShow, false),
                    "cancelled" => (SessionStatus::Cancelled, false),
                    other => return Err(SqlError::Parse(format!("bad session status: {other}"))),
                };
                if set.iter().any(|(c, _)| c != "status" && c != "attended") {
                    return Err(SqlError::Unsupported("status change mixed with reschedule".into()));
                }
                return Ok(Command::SetSessionStatus { id, status, attended });
            }
            let mut update = SessionUpdate::default();
            for (column, value) in &set {
                match column.as_str() {
                    "room_id" => update.room_id = Some(parse_ulid(value)?),
                    "staff_id" => update.staff_id = Some(parse_ulid(value)?),
                    "client_id" => update.client_id = Some(parse_ulid(value)?),
                    "start" => update.start = Some(parse_i64(value)?),
                    "end" => update.end = Some(parse_i64(value)?),
                    other => return Err(SqlError::Parse(format!("sessions: cannot set {other}"))),
                }
            }
            Ok(Command::UpdateSession { id, update })
        }
        "classes" => match status.as_deref() {
            Some("completed") => Ok(Command::CompleteClass { id: filters.ulid("id")? }),
            Some("cancelled") => Ok(Command::DeleteClass { id: filters.ulid("id")? }),
            _ => Err(SqlError::Unsupported("classes: only status can be set".into())),
        },
        "registrations" => {
            let attended = match status.as_deref() {
                Some("attended") => true,
                Some("no_show") => false,
                _ => return Err(SqlError::Unsupported("registrations: status must be attended or no_show".into())),
            };
            Ok(Command::MarkAttendance {
                occurrence_id: filters.ulid("occurrence_id")?,
                client_id: filters.ulid("client_id")?,
                attended,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources { kind: None }),
        "rooms" => Ok(Command::SelectResources { kind: Some(ResourceKind::Room) }),
        "staff" => Ok(Command::SelectResources { kind: Some(ResourceKind::Staff) }),
        "calendar" => Ok(Command::SelectCalendar {
            resource_id: filters.ulid("resource_id")?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: filters.ulid("resource_id")?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_id: filters.opt_ulid("exclude_id")?,
        }),
        "sessions" => Ok(Command::SelectSession { id: filters.ulid("id")? }),
        "classes" => Ok(Command::SelectClass { id: filters.ulid("id")? }),
        "registrations" => Ok(Command::SelectRegistrations {
            occurrence_id: filters.ulid("occurrence_id")?,
        }),
        "audit_log" => Ok(Command::SelectAudit {
            occurrence_id: filters.ulid("occurrence_id")?,
        }),
        "credits" => Ok(Command::SelectCredits {
            client_id: filters.ulid("client_id")?,
        }),
        "passes" => Ok(Command::SelectPasses {
            client_id: filters.ulid("client_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms plus the `start >= n` / `"end" <= n` window, ANDed together.
#[derive(Debug, Default)]
struct Filters {
    eq: Vec<(String, Expr)>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        self.eq.push((col, (**right).clone()));
                    }
                }
                ast::BinaryOperator::GtEq => {
                    if expr_column_name(left).as_deref() == Some("start") {
                        self.start = Some(parse_i64_expr(right)?);
                    }
                }
                ast::BinaryOperator::LtEq => {
                    if expr_column_name(left).as_deref() == Some("end") {
                        self.end = Some(parse_i64_expr(right)?);
                    }
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.eq.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }

    fn bool(&self, col: &'static str) -> Result<Option<bool>, SqlError> {
        self.get(col).map(parse_bool).transpose()
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.to_lowercase()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    MultipleStatements(usize),
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::MultipleStatements(n) => {
                write!(f, "expected one statement, got {n}")
            }
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
