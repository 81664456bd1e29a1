use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::auth::BoxOfficeAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes. Each connection gets its
/// own handler, which owns that connection's LISTEN subscriptions.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(BoxOfficeFactory::new(tenants, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct BoxOfficeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BoxOfficeQueryParser>,
    /// LISTENed sessions. Dropped with the connection.
    subscriptions: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl BoxOfficeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BoxOfficeQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Drain every pending event on this connection's channels.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        let mut closed = Vec::new();
        for (session_id, rx) in subs.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => out.push(NotificationResponse::new(
                            0,
                            sql::session_channel(*session_id),
                            payload,
                        )),
                        Err(e) => tracing::warn!("cannot encode notification: {e}"),
                    },
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        tracing::warn!("listener on session {session_id} skipped {n} events");
                    }
                    Err(broadcast::error::TryRecvError::Closed) => {
                        closed.push(*session_id);
                        break;
                    }
                }
            }
        }
        for session_id in closed {
            subs.remove(&session_id);
        }
        out
    }

    async fn feed_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notification in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }

    /// Parse, execute and record metrics for one statement.
    /// `format` carries the result column formats an extended-protocol client asked for.
    async fn run(
        &self,
        engine: &Engine,
        query: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertExperience { id, name, description, status } => {
                engine
                    .create_experience(id, name, description, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateExperience { id, name, description, status } => {
                engine
                    .update_experience(id, name, description, status)
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteExperience { id } => {
                engine.delete_experience(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertTicketType { id, experience_id, name, price } => {
                engine
                    .create_ticket_type(id, experience_id, name, price)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateTicketType { id, name, price } => {
                engine
                    .update_ticket_type(id, name, price)
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteTicketType { id } => {
                engine.delete_ticket_type(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertEvent { id, experience_id, name, start, end, schedule } => {
                let generated = engine
                    .create_event(id, experience_id, name, Span { start, end }, schedule)
                    .await
                    .map_err(engine_err)?;
                // The event row plus its generated sessions.
                Ok(inserted(1 + generated))
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertSession { id, event_id, start, end, capacity } => {
                engine
                    .create_session(id, event_id, Span { start, end }, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateSessionCapacity { id, capacity } => {
                engine
                    .update_session_capacity(id, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::CancelSession { id } => {
                engine.cancel_session(id).await.map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteSession { id } => {
                engine.delete_session(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertGuest { id, guest } => {
                engine.register_guest(id, guest).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateGuest { id, name, phone } => {
                engine.update_guest(id, name, phone).await.map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteGuest { id } => {
                engine.delete_guest(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertHold { id, session_id, items, expires_at } => {
                let expires_at =
                    expires_at.unwrap_or_else(|| now_ms() + self.tenant_manager.hold_ttl_ms());
                engine
                    .place_hold(id, session_id, &items, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteHold { id } => {
                engine.release_hold(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::ConfirmHold { id, hold_id, guest } => {
                engine
                    .confirm_hold(id, hold_id, guest)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBooking { id, session_id, items, guest } => {
                engine
                    .create_booking(id, session_id, &items, guest)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectExperiences { status } => {
                let rows = engine.list_experiences(status);
                rows_response(with_format(experience_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.name)?;
                    enc.encode_field(&x.description)?;
                    enc.encode_field(&x.status.as_str().to_string())?;
                    enc.encode_field(&(x.event_count as i64))?;
                    enc.encode_field(&(x.ticket_type_count as i64))
                })
            }
            Command::SelectTicketTypes { experience_id } => {
                let rows = engine.list_ticket_types(experience_id);
                rows_response(with_format(ticket_type_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.experience_id.to_string())?;
                    enc.encode_field(&x.name)?;
                    enc.encode_field(&x.price.to_string())
                })
            }
            Command::SelectEvents { experience_id } => {
                let rows = engine.list_events(experience_id);
                rows_response(with_format(event_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.experience_id.to_string())?;
                    enc.encode_field(&x.name)?;
                    enc.encode_field(&x.start)?;
                    enc.encode_field(&x.end)?;
                    enc.encode_field(&(x.session_count as i64))
                })
            }
            Command::SelectSessions { filter } => {
                let rows = engine.list_sessions(&filter).await;
                rows_response(with_format(session_schema(), format), &rows, encode_session)
            }
            Command::SelectAvailability { experience_id, start, end, quantity } => {
                let rows = engine
                    .availability(experience_id, start, end, quantity)
                    .await
                    .map_err(engine_err)?;
                rows_response(with_format(session_schema(), format), &rows, encode_session)
            }
            Command::SelectHolds { session_id } => {
                let rows = engine.list_holds(session_id).await;
                rows_response(with_format(hold_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.session_id.to_string())?;
                    enc.encode_field(&x.tickets)?;
                    enc.encode_field(&i64::from(x.quantity))?;
                    enc.encode_field(&x.total.to_string())?;
                    enc.encode_field(&x.expires_at)
                })
            }
            Command::SelectBookings { filter } => {
                let rows = engine.list_bookings(&filter).await;
                rows_response(with_format(booking_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.session_id.to_string())?;
                    enc.encode_field(&x.guest_id.to_string())?;
                    enc.encode_field(&x.tickets)?;
                    enc.encode_field(&i64::from(x.quantity))?;
                    enc.encode_field(&x.total.to_string())?;
                    enc.encode_field(&x.status.as_str().to_string())?;
                    enc.encode_field(&x.created_at)
                })
            }
            Command::SelectGuests { email } => {
                let rows = engine.list_guests(email.as_deref()).await;
                rows_response(with_format(guest_schema(), format), &rows, |enc, x| {
                    enc.encode_field(&x.id.to_string())?;
                    enc.encode_field(&x.name)?;
                    enc.encode_field(&x.email)?;
                    enc.encode_field(&x.phone)?;
                    enc.encode_field(&(x.bookings as i64))?;
                    enc.encode_field(&x.total_spent.to_string())
                })
            }
            Command::SelectSummary => {
                let summary = engine.summary().await;
                rows_response(with_format(summary_schema(), format), &[summary], |enc, s| {
                    enc.encode_field(&(s.experiences as i64))?;
                    enc.encode_field(&(s.published_experiences as i64))?;
                    enc.encode_field(&(s.events as i64))?;
                    enc.encode_field(&(s.sessions as i64))?;
                    enc.encode_field(&(s.upcoming_sessions as i64))?;
                    enc.encode_field(&(s.guests as i64))?;
                    enc.encode_field(&(s.bookings_confirmed as i64))?;
                    enc.encode_field(&(s.bookings_cancelled as i64))?;
                    enc.encode_field(&(s.tickets_sold as i64))?;
                    enc.encode_field(&s.revenue.to_string())
                })
            }
            Command::Listen { session_id } => {
                if engine.get_session(&session_id).is_none() {
                    return Err(engine_err(EngineError::NotFound(session_id)));
                }
                let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                subs.entry(session_id)
                    .or_insert_with(|| engine.notify.subscribe(session_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { session_id } => {
                self.subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&session_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_session(enc: &mut DataRowEncoder, x: &SessionInfo) -> PgWireResult<()> {
    enc.encode_field(&x.id.to_string())?;
    enc.encode_field(&x.event_id.to_string())?;
    enc.encode_field(&x.experience_id.to_string())?;
    enc.encode_field(&x.start)?;
    enc.encode_field(&x.end)?;
    enc.encode_field(&i64::from(x.capacity))?;
    enc.encode_field(&i64::from(x.booked))?;
    enc.encode_field(&i64::from(x.held))?;
    enc.encode_field(&i64::from(x.remaining))?;
    enc.encode_field(&x.cancelled)
}

// ── Result schemas ───────────────────────────────────────────────

/// Re-tag columns with the formats requested at Bind. Simple queries stay text.
fn with_format(schema: Vec<FieldInfo>, format: Option<&Format>) -> Vec<FieldInfo> {
    let Some(format) = format else { return schema };
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(f.name().into(), None, None, f.datatype().clone(), format.format_for(i))
        })
        .collect()
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn experience_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("event_count", Type::INT8),
        field("ticket_type_count", Type::INT8),
    ]
}

fn ticket_type_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("experience_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("price", Type::VARCHAR),
    ]
}

fn event_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("experience_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("session_count", Type::INT8),
    ]
}

fn session_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::VARCHAR),
        field("experience_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("capacity", Type::INT8),
        field("booked", Type::INT8),
        field("held", Type::INT8),
        field("remaining", Type::INT8),
        field("cancelled", Type::BOOL),
    ]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("session_id", Type::VARCHAR),
        field("tickets", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("total", Type::VARCHAR),
        field("expires_at", Type::INT8),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("session_id", Type::VARCHAR),
        field("guest_id", Type::VARCHAR),
        field("tickets", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("total", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn guest_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("bookings", Type::INT8),
        field("total_spent", Type::VARCHAR),
    ]
}

fn summary_schema() -> Vec<FieldInfo> {
    vec![
        field("experiences", Type::INT8),
        field("published_experiences", Type::INT8),
        field("events", Type::INT8),
        field("sessions", Type::INT8),
        field("upcoming_sessions", Type::INT8),
        field("guests", Type::INT8),
        field("bookings_confirmed", Type::INT8),
        field("bookings_cancelled", Type::INT8),
        field("tickets_sold", Type::INT8),
        field("revenue", Type::VARCHAR),
    ]
}

/// Result columns for a statement, empty for anything but a SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("experiences") => experience_schema(),
        Some("ticket_types") => ticket_type_schema(),
        Some("events") => event_schema(),
        Some("sessions") | Some("availability") => session_schema(),
        Some("holds") => hold_schema(),
        Some("bookings") => booking_schema(),
        Some("guests") => guest_schema(),
        Some("summary") => summary_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BoxOfficeHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = self.run(&engine, query, None).await;
        self.feed_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BoxOfficeQueryParser;

#[async_trait]
impl QueryParser for BoxOfficeQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(with_format(result_schema(stmt), column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BoxOfficeHandler {
    type Statement = String;
    type QueryParser = BoxOfficeQueryParser;

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
        let result = self.run(&engine, &sql, Some(&portal.result_column_format)).await;
        self.feed_notifications(client).await?;
        result
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
        Ok(DescribePortalResponse::new(with_format(
            result_schema(&target.statement.statement),
            Some(&target.result_column_format),
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)` in order of appearance.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote inside a literal reads as close-then-open.
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    out.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters[..])
}

/// Replace each placeholder once, left to right. Bound text is never
/// rescanned, so a `$` inside a value stays literal.
fn bind_text_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BoxOfficeFactory {
    handler: Arc<BoxOfficeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<BoxOfficeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BoxOfficeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = BoxOfficeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BoxOfficeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BoxOfficeFactory {
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

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::CapacityExceeded { .. } | EngineError::CapacityBelowCommitted { .. } => {
            "53400"
        }
        EngineError::NotFound(_) => "02000",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM holds"), 0);
        assert_eq!(count_params("INSERT INTO holds VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM sessions WHERE event_id = $12"), 12);
    }

    #[test]
    fn bind_quotes_and_escapes() {
        let params = vec![Some(b"O'Brien".to_vec()), None];
        assert_eq!(
            bind_text_params("UPDATE guests SET name = $1, phone = $2", &params[..]),
            "UPDATE guests SET name = 'O''Brien', phone = NULL"
        );
    }

    #[test]
    fn bind_does_not_clobber_double_digit_placeholders() {
        let params: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        let sql = bind_text_params("$1 $10", &params[..]);
        assert_eq!(sql, "'1' '10'");
    }

    #[test]
    fn bound_dollar_text_is_not_rebound() {
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let params = vec![
            Some(id.as_bytes().to_vec()),
            Some(b"Harbour cruise".to_vec()),
            Some(b"Only $15 per person, $1 off with $2".to_vec()),
        ];
        let sql = bind_text_params(
            "INSERT INTO experiences (id, name, description) VALUES ($1, $2, $3)",
            &params[..],
        );
        assert_eq!(
            sql,
            format!(
                "INSERT INTO experiences (id, name, description) VALUES ('{id}', 'Harbour cruise', 'Only $15 per person, $1 off with $2')"
            )
        );
        match sql::parse_sql(&sql).unwrap() {
            Command::InsertExperience { description, .. } => {
                assert_eq!(description.as_deref(), Some("Only $15 per person, $1 off with $2"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let params = vec![Some(b"x".to_vec())];
        assert_eq!(
            bind_text_params("SELECT * FROM guests WHERE name = 'it''s $1' AND email = $1", &params[..]),
            "SELECT * FROM guests WHERE name = 'it''s $1' AND email = 'x'"
        );
        assert_eq!(count_params("SELECT '$9', \"$8\" FROM t WHERE a = $2"), 2);
        // Out-of-range placeholders are kept for the parser to reject.
        assert_eq!(bind_text_params("VALUES ($1, $3)", &params[..]), "VALUES ('x', $3)");
    }

    #[test]
    fn capacity_errors_get_their_own_sqlstate() {
        let full = EngineError::CapacityExceeded { requested: 3, remaining: 1 };
        assert_eq!(engine_sqlstate(&full), "53400");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(Ulid::nil())), "02000");
        assert_eq!(engine_sqlstate(&EngineError::InvalidSpan), "P0001");
    }

    #[test]
    fn describe_schema_follows_select_table() {
        assert_eq!(result_schema("SELECT * FROM availability WHERE experience_id = $1").len(), 10);
        assert_eq!(result_schema("SELECT * FROM summary").len(), 10);
        assert!(result_schema("INSERT INTO holds VALUES ($1, $2, $3)").is_empty());
    }
}
