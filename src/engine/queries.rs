use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::now_ms;
use super::{Engine, EngineError, SharedSessionState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub event_id: Option<Ulid>,
    pub experience_id: Option<Ulid>,
    /// Sessions starting at or after this instant.
    pub start: Option<Ms>,
    /// Sessions ending at or before this instant.
    pub end: Option<Ms>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub session_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
}

fn session_info(ss: &SessionState, now: Ms) -> SessionInfo {
    let booked = ss.booked();
    let held = ss.held(now);
    SessionInfo {
        id: ss.id,
        event_id: ss.event_id,
        experience_id: ss.experience_id,
        start: ss.span.start,
        end: ss.span.end,
        capacity: ss.capacity,
        booked,
        held,
        remaining: ss.capacity.saturating_sub(booked + held),
        cancelled: ss.cancelled,
    }
}

fn booking_info(session_id: Ulid, b: &Booking) -> BookingInfo {
    BookingInfo {
        id: b.id,
        session_id,
        guest_id: b.guest_id,
        tickets: format_cart(&b.lines),
        quantity: b.quantity(),
        total: total_price(&b.lines).unwrap_or(Money::ZERO),
        status: b.status,
        created_at: b.created_at,
    }
}

impl Engine {
    pub fn list_experiences(&self, status: Option<ExperienceStatus>) -> Vec<ExperienceInfo> {
        let mut tt_counts: HashMap<Ulid, usize> = HashMap::new();
        for tt in self.ticket_types.iter() {
            *tt_counts.entry(tt.experience_id).or_default() += 1;
        }
        let mut out: Vec<ExperienceInfo> = self
            .experiences
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| ExperienceInfo {
                id: e.id,
                name: e.name.clone(),
                description: e.description.clone(),
                status: e.status,
                event_count: self.child_ids(&e.id).len(),
                ticket_type_count: tt_counts.get(&e.id).copied().unwrap_or(0),
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn list_ticket_types(&self, experience_id: Option<Ulid>) -> Vec<TicketTypeInfo> {
        let mut out: Vec<TicketTypeInfo> = self
            .ticket_types
            .iter()
            .filter(|tt| experience_id.is_none_or(|x| tt.experience_id == x))
            .map(|tt| TicketTypeInfo {
                id: tt.id,
                experience_id: tt.experience_id,
                name: tt.name.clone(),
                price: tt.price,
            })
            .collect();
        out.sort_by_key(|tt| tt.id);
        out
    }

    pub fn list_events(&self, experience_id: Option<Ulid>) -> Vec<EventInfo> {
        let mut out: Vec<EventInfo> = self
            .events
            .iter()
            .filter(|e| experience_id.is_none_or(|x| e.experience_id == x))
            .map(|e| EventInfo {
                id: e.id,
                experience_id: e.experience_id,
                name: e.name.clone(),
                start: e.span.start,
                end: e.span.end,
                session_count: self.child_ids(&e.id).len(),
            })
            .collect();
        out.sort_by_key(|e| (e.start, e.id));
        out
    }

    /// Snapshot of session handles, so no map reference is held while locking.
    fn session_handles(&self) -> Vec<SharedSessionState> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<SessionInfo> {
        let now = now_ms();
        let handles = match filter.event_id {
            Some(event_id) => self
                .child_ids(&event_id)
                .iter()
                .filter_map(|id| self.get_session(id))
                .collect(),
            None => self.session_handles(),
        };
        let mut out = Vec::new();
        for ss in handles {
            let guard = ss.read().await;
            if filter.experience_id.is_some_and(|x| guard.experience_id != x)
                || filter.start.is_some_and(|s| guard.span.start < s)
                || filter.end.is_some_and(|e| guard.span.end > e)
            {
                continue;
            }
            out.push(session_info(&guard, now));
        }
        out.sort_by_key(|s| (s.start, s.id));
        out
    }

    /// Bookable sessions of a published experience inside `[start, end]`
    /// with at least `quantity` tickets left, soonest first.
    pub async fn availability(
        &self,
        experience_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    ) -> Result<Vec<SessionInfo>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidSpan);
        }
        if end.checked_sub(start).is_none_or(|w| w > MAX_QUERY_WINDOW_MS) {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        if quantity == 0 {
            return Err(EngineError::InvalidInput("quantity must be at least 1".into()));
        }
        let status = self
            .experiences
            .get(&experience_id)
            .map(|e| e.status)
            .ok_or(EngineError::NotFound(experience_id))?;
        if status != ExperienceStatus::Published {
            return Ok(Vec::new());
        }

        let filter = SessionFilter {
            experience_id: Some(experience_id),
            start: Some(start),
            end: Some(end),
            ..Default::default()
        };
        let now = now_ms();
        let mut sessions = self.list_sessions(&filter).await;
        sessions.retain(|s| !s.cancelled && s.start > now && s.remaining >= quantity);
        Ok(sessions)
    }

    /// Live holds, optionally for one session.
    pub async fn list_holds(&self, session_id: Option<Ulid>) -> Vec<HoldInfo> {
        let now = now_ms();
        let handles = match session_id {
            Some(id) => self.get_session(&id).into_iter().collect(),
            None => self.session_handles(),
        };
        let mut out = Vec::new();
        for ss in handles {
            let guard = ss.read().await;
            for h in guard.holds.iter().filter(|h| h.is_live(now)) {
                out.push(HoldInfo {
                    id: h.id,
                    session_id: guard.id,
                    tickets: format_cart(&h.lines),
                    quantity: h.quantity(),
                    total: total_price(&h.lines).unwrap_or(Money::ZERO),
                    expires_at: h.expires_at,
                });
            }
        }
        out.sort_by_key(|h| h.id);
        out
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<BookingInfo> {
        let handles = match filter.session_id {
            Some(id) => self.get_session(&id).into_iter().collect(),
            None => self.session_handles(),
        };
        let mut out = Vec::new();
        for ss in handles {
            let guard = ss.read().await;
            for b in &guard.bookings {
                if filter.guest_id.is_some_and(|g| b.guest_id != g) {
                    continue;
                }
                out.push(booking_info(guard.id, b));
            }
        }
        out.sort_by_key(|b| (b.created_at, b.id));
        out
    }

    pub async fn list_guests(&self, email: Option<&str>) -> Vec<GuestInfo> {
        let mut guests: Vec<GuestState> = match email {
            Some(email) => self
                .guest_by_email
                .get(&email.trim().to_lowercase())
                .and_then(|id| self.guests.get(id.value()).map(|g| g.value().clone()))
                .into_iter()
                .collect(),
            None => self.guests.iter().map(|g| g.value().clone()).collect(),
        };
        guests.sort_by_key(|g| g.id);

        let mut stats: HashMap<Ulid, (usize, Money)> = HashMap::new();
        for ss in self.session_handles() {
            let guard = ss.read().await;
            for b in &guard.bookings {
                let entry = stats.entry(b.guest_id).or_insert((0, Money::ZERO));
                entry.0 += 1;
                if b.is_active() {
                    let total = total_price(&b.lines).unwrap_or(Money::ZERO);
                    entry.1 = entry.1.checked_add(total).unwrap_or(entry.1);
                }
            }
        }

        guests
            .into_iter()
            .map(|g| {
                let (bookings, total_spent) = stats.get(&g.id).copied().unwrap_or((0, Money::ZERO));
                GuestInfo {
                    id: g.id,
                    name: g.name,
                    email: g.email,
                    phone: g.phone,
                    bookings,
                    total_spent,
                }
            })
            .collect()
    }

    pub async fn summary(&self) -> BusinessSummary {
        let now = now_ms();
        let mut summary = BusinessSummary {
            experiences: self.experiences.len(),
            published_experiences: self
                .experiences
                .iter()
                .filter(|e| e.status == ExperienceStatus::Published)
                .count(),
            events: self.events.len(),
            guests: self.guests.len(),
            ..Default::default()
        };
        for ss in self.session_handles() {
            let guard = ss.read().await;
            summary.sessions += 1;
            if !guard.cancelled && guard.span.start > now {
                summary.upcoming_sessions += 1;
            }
            for b in &guard.bookings {
                if b.is_active() {
                    summary.bookings_confirmed += 1;
                    summary.tickets_sold += u64::from(b.quantity());
                    let total = total_price(&b.lines).unwrap_or(Money::ZERO);
                    summary.revenue = summary.revenue.checked_add(total).unwrap_or(summary.revenue);
                } else {
                    summary.bookings_cancelled += 1;
                }
            }
        }
        summary
    }
}
