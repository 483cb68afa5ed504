use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::StudioAuthSource;
use crate::engine::{ClassInput, Engine, EngineError, ErrorKind, SessionInput};
use crate::model::{Actor, ResourceKind, SessionStatus, Span};
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct StudioHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StudioQueryParser>,
}

fn ok_tag(tag: &str) -> Vec<Response> {
    vec![Response::Execution(Tag::new(tag).with_rows(1))]
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Vec<Response> {
    vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))]
}

impl StudioHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StudioQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run every statement of a simple-query batch in order. The whole
    /// batch is parsed up front; execution stops at the first failing
    /// statement, after the responses of the statements that already ran.
    async fn run_batch(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            match self.run(engine, cmd).await {
                Ok(mut out) => responses.append(&mut out),
                Err(PgWireError::UserError(info)) if !responses.is_empty() => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }

    /// Execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn resource_kind(&self, engine: &Engine, id: Ulid) -> PgWireResult<ResourceKind> {
        engine.resource_kind(id).await.ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "02000".into(),
                format!("resource not found: {id}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertResource { id, kind, name } => {
                engine.create_resource(id, kind, name).await.map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::InsertClient { id, name } => {
                engine.create_client(id, name).await.map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::InsertPass {
                id,
                client_id,
                total_credits,
                valid_from,
                valid_until,
            } => {
                engine
                    .create_pass(id, client_id, total_credits, valid_from, valid_until)
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::InsertClass {
                id,
                room_id,
                trainer_id,
                start,
                end,
                capacity,
                price_cents,
                credits_required,
                name,
            } => {
                engine
                    .create_class(ClassInput {
                        id,
                        room_id,
                        trainer_id,
                        name,
                        span: Span { start, end },
                        capacity,
                        price_cents,
                        credits_required,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::CompleteClass { id } => {
                engine.complete_class(id).await.map_err(engine_err)?;
                Ok(ok_tag("UPDATE"))
            }
            Command::DeleteClass { id } => {
                engine.cancel_class(id, Actor::system()).await.map_err(engine_err)?;
                Ok(ok_tag("DELETE"))
            }
            Command::InsertSession {
                id,
                room_id,
                staff_id,
                client_id,
                start,
                end,
            } => {
                engine
                    .create_session(SessionInput {
                        id,
                        room_id,
                        staff_id,
                        client_id,
                        span: Span { start, end },
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::UpdateSession { id, update } => {
                engine.update_session(id, update).await.map_err(engine_err)?;
                Ok(ok_tag("UPDATE"))
            }
            Command::SetSessionStatus { id, status, attended } => {
                let result = match status {
                    SessionStatus::Completed => engine.complete_session(id, attended).await,
                    SessionStatus::NoShow => engine.mark_session_no_show(id).await,
                    SessionStatus::Cancelled => engine.cancel_session(id).await,
                    SessionStatus::Scheduled => {
                        return Err(sql_err(SqlError::Parse(
                            "sessions cannot be set back to scheduled".into(),
                        )));
                    }
                };
                result.map_err(engine_err)?;
                Ok(ok_tag("UPDATE"))
            }
            Command::DeleteSession { id } => {
                engine.cancel_session(id).await.map_err(engine_err)?;
                Ok(ok_tag("DELETE"))
            }
            Command::InsertRegistration { occurrence_id, client_id } => {
                engine
                    .book_class(occurrence_id, client_id, Actor::member(client_id))
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::MarkAttendance {
                occurrence_id,
                client_id,
                attended,
            } => {
                engine
                    .mark_attendance(occurrence_id, client_id, attended, Actor::system())
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("UPDATE"))
            }
            Command::DeleteRegistration {
                occurrence_id,
                client_id,
                privileged,
            } => {
                let actor = if privileged {
                    Actor::system()
                } else {
                    Actor::member(client_id)
                };
                engine
                    .cancel_class_booking(occurrence_id, client_id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("DELETE"))
            }
            Command::InsertDeduction { client_id, reason } => {
                let reason = reason.as_deref().unwrap_or("manual deduction");
                engine.deduct_credit(client_id, reason).await.map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::InsertRefund {
                client_id,
                count,
                pass_id,
            } => {
                let outcome = engine
                    .refund_credit(client_id, count, "manual refund", pass_id)
                    .await
                    .map_err(engine_err)?;
                let applied = if outcome.applied() > 0 { 1 } else { 0 };
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(applied))])
            }
            Command::InsertPayment { client_id, amount_cents } => {
                engine
                    .settle_unpaid(client_id, amount_cents)
                    .await
                    .map_err(engine_err)?;
                Ok(ok_tag("INSERT"))
            }
            Command::SelectResources { kind } => {
                let schema = Arc::new(resources_schema());
                let rows = engine
                    .list_resources(kind)
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.kind.as_str())?;
                        encoder.encode_field(&r.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectCalendar { resource_id, start, end } => {
                let kind = self.resource_kind(engine, resource_id).await?;
                let entries = engine
                    .calendar(kind, resource_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rid = resource_id.to_string();
                let rows = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.kind.as_str())?;
                        encoder.encode_field(&e.span.start)?;
                        encoder.encode_field(&e.span.end)?;
                        encoder.encode_field(&e.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude_id,
            } => {
                let kind = self.resource_kind(engine, resource_id).await?;
                let check = engine
                    .check_conflict(kind, resource_id, Span { start, end }, exclude_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflicts_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                let d = check.details.as_ref();
                encoder.encode_field(&check.conflict)?;
                encoder.encode_field(&d.map(|d| d.conflict_type.as_str()))?;
                encoder.encode_field(&d.map(|d| d.entity_id.to_string()))?;
                encoder.encode_field(&d.map(|d| d.entity_kind.as_str()))?;
                encoder.encode_field(&d.map(|d| d.start))?;
                encoder.encode_field(&d.map(|d| d.end))?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectSession { id } => {
                let s = engine.get_session(id).map_err(engine_err)?;
                let schema = Arc::new(sessions_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&s.id.to_string())?;
                encoder.encode_field(&s.room_id.to_string())?;
                encoder.encode_field(&s.staff_id.to_string())?;
                encoder.encode_field(&s.client_id.map(|c| c.to_string()))?;
                encoder.encode_field(&s.span.start)?;
                encoder.encode_field(&s.span.end)?;
                encoder.encode_field(&s.status.as_str())?;
                encoder.encode_field(&s.attended)?;
                encoder.encode_field(&s.external_ref)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectClass { id } => {
                let c = engine.get_class(id).await.map_err(engine_err)?;
                let regs = engine.list_registrations(id).await.map_err(engine_err)?;
                let booked = regs.iter().filter(|r| r.status.takes_seat()).count() as i64;
                let waitlisted = regs
                    .iter()
                    .filter(|r| r.status == crate::model::RegistrationStatus::Waitlist)
                    .count() as i64;
                let schema = Arc::new(classes_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&c.id.to_string())?;
                encoder.encode_field(&c.room_id.to_string())?;
                encoder.encode_field(&c.trainer_id.to_string())?;
                encoder.encode_field(&c.name)?;
                encoder.encode_field(&c.span.start)?;
                encoder.encode_field(&c.span.end)?;
                encoder.encode_field(&(c.capacity as i64))?;
                encoder.encode_field(&c.price_cents)?;
                encoder.encode_field(&(c.credits_required as i64))?;
                encoder.encode_field(&c.status.as_str())?;
                encoder.encode_field(&booked)?;
                encoder.encode_field(&waitlisted)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectRegistrations { occurrence_id } => {
                let regs = engine
                    .list_registrations(occurrence_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(registrations_schema());
                let rows = regs
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.occurrence_id.to_string())?;
                        encoder.encode_field(&r.client_id.to_string())?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.payment_status.as_str())?;
                        encoder.encode_field(&(r.credits_used as i64))?;
                        encoder.encode_field(&r.booked_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectAudit { occurrence_id } => {
                let entries = engine.audit_log(occurrence_id).await.map_err(engine_err)?;
                let schema = Arc::new(audit_schema());
                let rows = entries
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.at)?;
                        encoder.encode_field(&a.actor.id.map(|id| id.to_string()))?;
                        encoder.encode_field(&a.actor.privileged)?;
                        encoder.encode_field(&a.action.as_str())?;
                        encoder.encode_field(&a.registration_id.to_string())?;
                        encoder.encode_field(&a.before.map(|b| b.status.as_str()))?;
                        encoder.encode_field(&a.after.status.as_str())?;
                        encoder.encode_field(&a.after.payment_status.as_str())?;
                        encoder.encode_field(&(a.after.credits_used as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectCredits { client_id } => {
                let info = engine.client_info(client_id).await.map_err(engine_err)?;
                let next = engine
                    .get_available_pass(client_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(credits_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&info.id.to_string())?;
                encoder.encode_field(&info.name)?;
                encoder.encode_field(&(info.available_credits as i64))?;
                encoder.encode_field(&(info.available_credits > 0))?;
                encoder.encode_field(&next.map(|p| p.id.to_string()))?;
                encoder.encode_field(&info.unpaid_balance_cents)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectPasses { client_id } => {
                let passes = engine.list_passes(client_id).await.map_err(engine_err)?;
                let schema = Arc::new(passes_schema());
                let rows = passes
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.client_id.to_string())?;
                        encoder.encode_field(&(p.total_credits as i64))?;
                        encoder.encode_field(&(p.credits_left as i64))?;
                        encoder.encode_field(&p.valid_from)?;
                        encoder.encode_field(&p.valid_until)?;
                        encoder.encode_field(&p.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("name", Type::VARCHAR),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("entry_id", Type::VARCHAR),
        field("entry_kind", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("conflict", Type::BOOL),
        field("conflict_type", Type::VARCHAR),
        field("entity_id", Type::VARCHAR),
        field("entity_kind", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("staff_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("attended", Type::BOOL),
        field("external_ref", Type::VARCHAR),
    ]
}

fn classes_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("trainer_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("capacity", Type::INT8),
        field("price_cents", Type::INT8),
        field("credits_required", Type::INT8),
        field("status", Type::VARCHAR),
        field("booked", Type::INT8),
        field("waitlisted", Type::INT8),
    ]
}

fn registrations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("occurrence_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("credits_used", Type::INT8),
        field("booked_at", Type::INT8),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("at", Type::INT8),
        field("actor_id", Type::VARCHAR),
        field("privileged", Type::BOOL),
        field("action", Type::VARCHAR),
        field("registration_id", Type::VARCHAR),
        field("status_before", Type::VARCHAR),
        field("status_after", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("credits_used", Type::INT8),
    ]
}

fn credits_schema() -> Vec<FieldInfo> {
    vec![
        field("client_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("available_credits", Type::INT8),
        field("has_credits", Type::BOOL),
        field("next_pass_id", Type::VARCHAR),
        field("unpaid_balance_cents", Type::INT8),
    ]
}

fn passes_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("total_credits", Type::INT8),
        field("credits_left", Type::INT8),
        field("valid_from", Type::INT8),
        field("valid_until", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

/// Columns a SELECT returns, keyed on the table after FROM. Empty for
/// anything that is not a SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';'))
        .unwrap_or("");
    match table {
        "resources" | "rooms" | "staff" => resources_schema(),
        "calendar" => calendar_schema(),
        "conflicts" => conflicts_schema(),
        "sessions" => sessions_schema(),
        "classes" => classes_schema(),
        "registrations" => registrations_schema(),
        "audit_log" => audit_schema(),
        "credits" => credits_schema(),
        "passes" => passes_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StudioHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run_batch(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StudioQueryParser;

#[async_trait]
impl QueryParser for StudioQueryParser {
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
impl ExtendedQueryHandler for StudioHandler {
    type Statement = String;
    type QueryParser = StudioQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd)
            .await?
            .pop()
            .ok_or_else(|| {
                PgWireError::UserError(Box::new(ErrorInfo::new(
                    "ERROR".into(),
                    "XX000".into(),
                    "statement produced no response".into(),
                )))
            })
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

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StudioFactory {
    handler: Arc<StudioHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StudioAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StudioFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(StudioHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StudioAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StudioFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(StudioFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Conflict => "23P01",
        ErrorKind::Policy => "P0001",
        ErrorKind::NotFound => "02000",
        ErrorKind::TransientStore => "40001",
        ErrorKind::Invalid => "22023",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(e.kind()).into(),
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

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM passes WHERE client_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO passes VALUES ($1, $2, $10, $3)"), 10);
        assert_eq!(count_params("SELECT '$' FROM rooms"), 0);
    }

    #[test]
    fn schema_follows_table() {
        let cols: Vec<String> = result_schema("SELECT * FROM registrations WHERE occurrence_id = $1")
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(cols[0], "id");
        assert!(cols.contains(&"payment_status".to_string()));
        assert_eq!(result_schema("select * from rooms").len(), 3);
        assert_eq!(result_schema("SELECT * FROM \"calendar\" WHERE resource_id = '1'").len(), 6);
        assert!(result_schema("INSERT INTO rooms (id) VALUES ('x')").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn error_kinds_map_to_sqlstates() {
        let locked = EngineError::CancellationLocked {
            occurrence_id: Ulid::new(),
            starts_in_ms: 60_000,
            window_hours: 12,
        };
        assert_eq!(sqlstate(locked.kind()), "P0001");
        assert_eq!(sqlstate(EngineError::LockTimeout("occurrence").kind()), "40001");
        assert_eq!(sqlstate(EngineError::NoCreditsAvailable(Ulid::new()).kind()), "P0001");
        assert_eq!(
            sqlstate(EngineError::NotFound(crate::engine::Entity::Class, Ulid::new()).kind()),
            "02000"
        );
        assert_eq!(sqlstate(EngineError::InvalidInput("x").kind()), "22023");
    }
}
