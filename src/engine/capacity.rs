use std::collections::HashMap;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span, max_duration: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan);
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_duration {
        return Err(EngineError::LimitExceeded("time range too wide"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_guest(guest: &GuestDetails) -> Result<(), EngineError> {
    validate_name(&guest.name, "guest name")?;
    let email = guest.email.trim();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => return Err(EngineError::InvalidInput(format!("invalid email: {email}"))),
    }
    if let Some(phone) = &guest.phone
        && phone.len() > MAX_PHONE_LEN
    {
        return Err(EngineError::LimitExceeded("phone too long"));
    }
    Ok(())
}

/// Turn a cart into priced lines for one session.
///
/// Repeated ticket types are merged. Every ticket type must belong to
/// `experience_id`; unit prices are snapshotted from the current catalog.
pub(crate) fn build_lines(
    ticket_types: &DashMap<Ulid, TicketTypeState>,
    experience_id: Ulid,
    items: &[CartItem],
) -> Result<Vec<TicketLine>, EngineError> {
    if items.is_empty() {
        return Err(EngineError::InvalidInput("no tickets requested".into()));
    }

    let mut merged: Vec<CartItem> = Vec::new();
    let mut index: HashMap<Ulid, usize> = HashMap::new();
    for item in items {
        if item.quantity == 0 {
            return Err(EngineError::InvalidInput(format!(
                "quantity for ticket type {} must be positive",
                item.ticket_type_id
            )));
        }
        match index.get(&item.ticket_type_id) {
            Some(&i) => {
                merged[i].quantity = merged[i].quantity.saturating_add(item.quantity);
            }
            None => {
                index.insert(item.ticket_type_id, merged.len());
                merged.push(*item);
            }
        }
    }
    if merged.len() > MAX_LINES_PER_ORDER {
        return Err(EngineError::LimitExceeded("too many ticket types in one order"));
    }
    let total: u64 = merged.iter().map(|i| u64::from(i.quantity)).sum();
    if total > u64::from(MAX_TICKETS_PER_ORDER) {
        return Err(EngineError::LimitExceeded("too many tickets in one order"));
    }

    let mut lines = Vec::with_capacity(merged.len());
    for item in merged {
        let tt = ticket_types
            .get(&item.ticket_type_id)
            .ok_or(EngineError::NotFound(item.ticket_type_id))?;
        if tt.experience_id != experience_id {
            return Err(EngineError::InvalidInput(format!(
                "ticket type {} does not belong to experience {experience_id}",
                item.ticket_type_id
            )));
        }
        lines.push(TicketLine {
            ticket_type_id: item.ticket_type_id,
            quantity: item.quantity,
            unit_price: tt.price,
        });
    }
    Ok(lines)
}

/// Open for new reservations: not cancelled, and for public checkout, not yet started.
pub(crate) fn check_open(ss: &SessionState, now: Ms, allow_started: bool) -> Result<(), EngineError> {
    if ss.cancelled || (!allow_started && ss.span.start <= now) {
        return Err(EngineError::SessionClosed(ss.id));
    }
    Ok(())
}

pub(crate) fn check_capacity(ss: &SessionState, requested: u32, now: Ms) -> Result<(), EngineError> {
    let remaining = ss.remaining(now);
    if requested > remaining {
        metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
        return Err(EngineError::CapacityExceeded { requested, remaining });
    }
    Ok(())
}
