use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, SessionFilter};
use crate::model::*;
use crate::schedule;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertExperience {
        id: Ulid,
        name: String,
        description: Option<String>,
        status: ExperienceStatus,
    },
    UpdateExperience {
        id: Ulid,
        name: Option<String>,
        /// `Some(None)` clears the description.
        description: Option<Option<String>>,
        status: Option<ExperienceStatus>,
    },
    DeleteExperience {
        id: Ulid,
    },
    InsertTicketType {
        id: Ulid,
        experience_id: Ulid,
        name: String,
        price: Money,
    },
    UpdateTicketType {
        id: Ulid,
        name: Option<String>,
        price: Option<Money>,
    },
    DeleteTicketType {
        id: Ulid,
    },
    InsertEvent {
        id: Ulid,
        experience_id: Ulid,
        name: String,
        start: Ms,
        end: Ms,
        schedule: Option<Schedule>,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertSession {
        id: Ulid,
        event_id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
    },
    UpdateSessionCapacity {
        id: Ulid,
        capacity: u32,
    },
    CancelSession {
        id: Ulid,
    },
    DeleteSession {
        id: Ulid,
    },
    InsertGuest {
        id: Ulid,
        guest: GuestDetails,
    },
    UpdateGuest {
        id: Ulid,
        name: Option<String>,
        phone: Option<Option<String>>,
    },
    DeleteGuest {
        id: Ulid,
    },
    InsertHold {
        id: Ulid,
        session_id: Ulid,
        items: Vec<CartItem>,
        /// `None` means the server's default checkout TTL.
        expires_at: Option<Ms>,
    },
    DeleteHold {
        id: Ulid,
    },
    ConfirmHold {
        id: Ulid,
        hold_id: Ulid,
        guest: GuestDetails,
    },
    InsertBooking {
        id: Ulid,
        session_id: Ulid,
        items: Vec<CartItem>,
        guest: GuestDetails,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectExperiences {
        status: Option<ExperienceStatus>,
    },
    SelectTicketTypes {
        experience_id: Option<Ulid>,
    },
    SelectEvents {
        experience_id: Option<Ulid>,
    },
    SelectSessions {
        filter: SessionFilter,
    },
    SelectAvailability {
        experience_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    },
    SelectHolds {
        session_id: Option<Ulid>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectGuests {
        email: Option<String>,
    },
    SelectSummary,
    Listen {
        session_id: Ulid,
    },
    Unlisten {
        session_id: Ulid,
    },
    UnlistenAll,
}

/// LISTEN channel for a session's events.
pub fn session_channel(session_id: Ulid) -> String {
    format!("session_{session_id}")
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let session_id = parse_channel(&trimmed[7..])?;
        return Ok(Command::Listen { session_id });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        let session_id = parse_channel(channel)?;
        return Ok(Command::Unlisten { session_id });
    }

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
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table named in a SELECT's FROM clause. Used to describe result columns
/// of prepared statements before their parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn parse_channel(channel: &str) -> Result<Ulid, SqlError> {
    let channel = channel.trim().trim_matches('"');
    let id = channel
        .strip_prefix("session_")
        .ok_or_else(|| SqlError::Parse(format!("invalid channel: {channel} (expected session_<id>)")))?;
    Ulid::from_string(id).map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))
}

// ── INSERT ────────────────────────────────────────────────────

/// Insertable tables and their column order for a bare `VALUES` list.
fn table_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    let def: (&'static str, &'static [&'static str]) = match table {
        "experiences" => ("experiences", &["id", "name", "description", "status"]),
        "ticket_types" => ("ticket_types", &["id", "experience_id", "name", "price"]),
        "events" => (
            "events",
            &[
                "id",
                "experience_id",
                "name",
                "start",
                "end",
                "days",
                "times",
                "duration",
                "capacity",
                "utc_offset",
            ],
        ),
        "sessions" => ("sessions", &["id", "event_id", "start", "end", "capacity"]),
        "guests" => ("guests", &["id", "name", "email", "phone"]),
        "holds" => ("holds", &["id", "session_id", "tickets", "expires_at"]),
        "bookings" => (
            "bookings",
            &["id", "session_id", "tickets", "name", "email", "phone", "hold_id"],
        ),
        _ => return None,
    };
    Some(def)
}

/// One INSERT row with its values keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    /// The column's value, or `None` when it is absent or NULL.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, e)| *e)
            .filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(self.require(column)?)
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string).transpose()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(column)?)
    }

    fn ms(&self, column: &'static str) -> Result<Ms, SqlError> {
        parse_ms(self.require(column)?)
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.require(column)?)
    }

    fn guest(&self) -> Result<GuestDetails, SqlError> {
        Ok(GuestDetails {
            name: self.string("name")?,
            email: self.string("email")?,
            phone: self.opt_string("phone")?,
        })
    }

    fn cart(&self) -> Result<Vec<CartItem>, SqlError> {
        parse_cart(&self.string("tickets")?)
    }
}

fn insert_row<'a>(insert: &'a ast::Insert, table: &str) -> Result<Row<'a>, SqlError> {
    let (table, canonical) =
        table_columns(table).ok_or_else(|| SqlError::UnknownTable(table.to_string()))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<&'static str> = if insert.columns.is_empty() {
        if values.len() > canonical.len() {
            return Err(SqlError::Parse(format!(
                "{table}: expected at most {} values, got {}",
                canonical.len(),
                values.len()
            )));
        }
        canonical[..values.len()].to_vec()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} columns but {} values",
                insert.columns.len(),
                values.len()
            )));
        }
        insert
            .columns
            .iter()
            .map(|ident| {
                let name = ident.value.to_lowercase();
                canonical
                    .iter()
                    .copied()
                    .find(|c| *c == name)
                    .ok_or_else(|| SqlError::Unsupported(format!("unknown column {table}.{name}")))
            })
            .collect::<Result<_, _>>()?
    };

    Ok(Row {
        table,
        values: columns.into_iter().zip(values.iter()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match row.table {
        "experiences" => Ok(Command::InsertExperience {
            id: row.ulid("id")?,
            name: row.string("name")?,
            description: row.opt_string("description")?,
            status: row
                .get("status")
                .map(parse_status)
                .transpose()?
                .unwrap_or(ExperienceStatus::Draft),
        }),
        "ticket_types" => Ok(Command::InsertTicketType {
            id: row.ulid("id")?,
            experience_id: row.ulid("experience_id")?,
            name: row.string("name")?,
            price: parse_money(row.require("price")?)?,
        }),
        "events" => {
            let schedule = match (row.get("days"), row.get("times")) {
                (None, None) => None,
                (Some(days), Some(times)) => Some(Schedule {
                    days: schedule::parse_days(&parse_string(days)?)
                        .map_err(|e| SqlError::Parse(e.to_string()))?,
                    times: schedule::parse_times(&parse_string(times)?)
                        .map_err(|e| SqlError::Parse(e.to_string()))?,
                    duration_min: row.u32("duration")?,
                    capacity: row.u32("capacity")?,
                    utc_offset_min: row
                        .get("utc_offset")
                        .map(parse_i32)
                        .transpose()?
                        .unwrap_or(0),
                }),
                (Some(_), None) => return Err(SqlError::MissingColumn("events", "times")),
                (None, Some(_)) => return Err(SqlError::MissingColumn("events", "days")),
            };
            Ok(Command::InsertEvent {
                id: row.ulid("id")?,
                experience_id: row.ulid("experience_id")?,
                name: row.string("name")?,
                start: row.ms("start")?,
                end: row.ms("end")?,
                schedule,
            })
        }
        "sessions" => Ok(Command::InsertSession {
            id: row.ulid("id")?,
            event_id: row.ulid("event_id")?,
            start: row.ms("start")?,
            end: row.ms("end")?,
            capacity: row.u32("capacity")?,
        }),
        "guests" => Ok(Command::InsertGuest {
            id: row.ulid("id")?,
            guest: row.guest()?,
        }),
        "holds" => Ok(Command::InsertHold {
            id: row.ulid("id")?,
            session_id: row.ulid("session_id")?,
            items: row.cart()?,
            expires_at: row.get("expires_at").map(parse_ms).transpose()?,
        }),
        "bookings" => {
            if row.get("hold_id").is_some() {
                if row.get("session_id").is_some() || row.get("tickets").is_some() {
                    return Err(SqlError::Parse(
                        "bookings: hold_id cannot be combined with session_id or tickets".into(),
                    ));
                }
                Ok(Command::ConfirmHold {
                    id: row.ulid("id")?,
                    hold_id: row.ulid("hold_id")?,
                    guest: row.guest()?,
                })
            } else {
                Ok(Command::InsertBooking {
                    id: row.ulid("id")?,
                    session_id: row.ulid("session_id")?,
                    items: row.cart()?,
                    guest: row.guest()?,
                })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("SET target {}", a.target)))?;
        set.push((column, &a.value));
    }
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    let unknown = |col: &str| SqlError::Unsupported(format!("cannot update {table}.{col}"));

    match table.as_str() {
        "experiences" => {
            let (mut name, mut description, mut status) = (None, None, None);
            for (col, value) in set {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "description" => description = Some(parse_string_or_null(value)?),
                    "status" => status = Some(parse_status(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateExperience { id, name, description, status })
        }
        "ticket_types" => {
            let (mut name, mut price) = (None, None);
            for (col, value) in set {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "price" => price = Some(parse_money(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateTicketType { id, name, price })
        }
        "sessions" => match set.as_slice() {
            [(col, value)] if col == "capacity" => Ok(Command::UpdateSessionCapacity {
                id,
                capacity: parse_u32(value)?,
            }),
            [(col, value)] if col == "status" => {
                let status = parse_string(value)?;
                if status.eq_ignore_ascii_case("cancelled") {
                    Ok(Command::CancelSession { id })
                } else {
                    Err(SqlError::Unsupported(format!(
                        "session status can only be set to 'cancelled', got {status:?}"
                    )))
                }
            }
            [(col, _)] => Err(unknown(col)),
            _ => Err(SqlError::Unsupported(
                "sessions: update capacity and status separately".into(),
            )),
        },
        "guests" => {
            let (mut name, mut phone) = (None, None);
            for (col, value) in set {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "phone" => phone = Some(parse_string_or_null(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateGuest { id, name, phone })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "experiences" => Ok(Command::DeleteExperience { id }),
        "ticket_types" => Ok(Command::DeleteTicketType { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        "sessions" => Ok(Command::DeleteSession { id }),
        "guests" => Ok(Command::DeleteGuest { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// One `column <op> value` term of a WHERE conjunction.
struct Filter<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
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
        collect_filters(selection, &mut filters)?;
    }
    let unsupported =
        |f: &Filter| SqlError::Unsupported(format!("filter {} {} on {table}", f.column, f.op));

    match table.as_str() {
        "experiences" => {
            let mut status = None;
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("status", BinaryOperator::Eq) => status = Some(parse_status(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectExperiences { status })
        }
        "ticket_types" | "events" => {
            let mut experience_id = None;
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("experience_id", BinaryOperator::Eq) => {
                        experience_id = Some(parse_ulid_expr(f.value)?)
                    }
                    _ => return Err(unsupported(f)),
                }
            }
            if table == "events" {
                Ok(Command::SelectEvents { experience_id })
            } else {
                Ok(Command::SelectTicketTypes { experience_id })
            }
        }
        "sessions" => {
            let mut filter = SessionFilter::default();
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("event_id", BinaryOperator::Eq) => filter.event_id = Some(parse_ulid_expr(f.value)?),
                    ("experience_id", BinaryOperator::Eq) => {
                        filter.experience_id = Some(parse_ulid_expr(f.value)?)
                    }
                    ("start", BinaryOperator::GtEq) => filter.start = Some(parse_ms(f.value)?),
                    ("end", BinaryOperator::LtEq) => filter.end = Some(parse_ms(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectSessions { filter })
        }
        "availability" => {
            let (mut experience_id, mut start, mut end, mut quantity) = (None, None, None, None);
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("experience_id", BinaryOperator::Eq) => {
                        experience_id = Some(parse_ulid_expr(f.value)?)
                    }
                    ("start", BinaryOperator::GtEq) => start = Some(parse_ms(f.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_ms(f.value)?),
                    ("quantity", BinaryOperator::Eq) => quantity = Some(parse_u32(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectAvailability {
                experience_id: experience_id.ok_or(SqlError::MissingFilter("experience_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                quantity: quantity.unwrap_or(1),
            })
        }
        "holds" => {
            let mut session_id = None;
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("session_id", BinaryOperator::Eq) => session_id = Some(parse_ulid_expr(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectHolds { session_id })
        }
        "bookings" => {
            let mut filter = BookingFilter::default();
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("session_id", BinaryOperator::Eq) => {
                        filter.session_id = Some(parse_ulid_expr(f.value)?)
                    }
                    ("guest_id", BinaryOperator::Eq) => filter.guest_id = Some(parse_ulid_expr(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectBookings { filter })
        }
        "guests" => {
            let mut email = None;
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("email", BinaryOperator::Eq) => email = Some(parse_string(f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectGuests { email })
        }
        "summary" => match filters.first() {
            Some(f) => Err(unsupported(f)),
            None => Ok(Command::SelectSummary),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a AND b AND ...` into comparison terms.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE term {expr}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("WHERE term {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Parse a cart string: `"<ticket_type_id>:<qty>[,<ticket_type_id>:<qty>...]"`.
pub fn parse_cart(s: &str) -> Result<Vec<CartItem>, SqlError> {
    let mut items = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, qty) = part
            .split_once(':')
            .ok_or_else(|| SqlError::BadCart(format!("expected <ticket_type_id>:<qty>, got {part:?}")))?;
        let ticket_type_id = Ulid::from_string(id.trim())
            .map_err(|e| SqlError::BadCart(format!("bad ticket type id {id:?}: {e}")))?;
        let quantity = qty
            .trim()
            .parse::<u32>()
            .map_err(|_| SqlError::BadCart(format!("bad quantity {qty:?}")))?;
        items.push(CartItem { ticket_type_id, quantity });
    }
    if items.is_empty() {
        return Err(SqlError::BadCart("empty cart".into()));
    }
    Ok(items)
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
            op: BinaryOperator::Eq,
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

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64_expr(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

/// Prices come in as `'25.50'` or `25.50`; both go through `Money::parse`.
fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    let text = parse_string(expr)?;
    Money::parse(&text).map_err(|e| SqlError::Parse(format!("bad price: {e}")))
}

fn parse_status(expr: &Expr) -> Result<ExperienceStatus, SqlError> {
    let text = parse_string(expr)?;
    ExperienceStatus::parse(&text).ok_or_else(|| SqlError::Parse(format!("unknown status: {text}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    BadCart(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadCart(s) => write!(f, "bad tickets: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
