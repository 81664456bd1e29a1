use tokio::sync::{oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::schedule;

use super::capacity::{
    build_lines, check_capacity, check_open, now_ms, validate_capacity, validate_guest,
    validate_name, validate_span,
};
use super::{Engine, EngineError, WalCommand};

fn validate_description(description: &Option<String>) -> Result<(), EngineError> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => {
            Err(EngineError::LimitExceeded("description too long"))
        }
        _ => Ok(()),
    }
}

fn validate_phone(phone: &Option<String>) -> Result<(), EngineError> {
    match phone {
        Some(p) if p.len() > MAX_PHONE_LEN => Err(EngineError::LimitExceeded("phone too long")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Experiences ──────────────────────────────────────────

    pub async fn create_experience(
        &self,
        id: Ulid,
        name: String,
        description: Option<String>,
        status: ExperienceStatus,
    ) -> Result<(), EngineError> {
        validate_name(&name, "experience name")?;
        validate_description(&description)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.experiences.len() >= MAX_EXPERIENCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many experiences"));
        }
        if self.experiences.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ExperienceCreated { id, name, description, status };
        self.persist_catalog(&event).await
    }

    /// Partial update. `description: Some(None)` clears it.
    pub async fn update_experience(
        &self,
        id: Ulid,
        name: Option<String>,
        description: Option<Option<String>>,
        status: Option<ExperienceStatus>,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .experiences
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let name = name.unwrap_or(current.name);
        let description = description.unwrap_or(current.description);
        validate_name(&name, "experience name")?;
        validate_description(&description)?;
        let event = Event::ExperienceUpdated {
            id,
            name,
            description,
            status: status.unwrap_or(current.status),
        };
        self.persist_catalog(&event).await
    }

    pub async fn delete_experience(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.experiences.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !self.child_ids(&id).is_empty() {
            return Err(EngineError::HasChildren(id));
        }
        self.persist_catalog(&Event::ExperienceDeleted { id }).await
    }

    // ── Ticket types ─────────────────────────────────────────

    pub async fn create_ticket_type(
        &self,
        id: Ulid,
        experience_id: Ulid,
        name: String,
        price: Money,
    ) -> Result<(), EngineError> {
        validate_name(&name, "ticket type name")?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.experiences.contains_key(&experience_id) {
            return Err(EngineError::NotFound(experience_id));
        }
        if self.ticket_types.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let siblings = self
            .ticket_types
            .iter()
            .filter(|tt| tt.experience_id == experience_id)
            .count();
        if siblings >= MAX_TICKET_TYPES_PER_EXPERIENCE {
            return Err(EngineError::LimitExceeded("too many ticket types on experience"));
        }
        let event = Event::TicketTypeCreated { id, experience_id, name, price };
        self.persist_catalog(&event).await
    }

    /// Reservations already placed keep the price they were made at.
    pub async fn update_ticket_type(
        &self,
        id: Ulid,
        name: Option<String>,
        price: Option<Money>,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .ticket_types
            .get(&id)
            .map(|tt| tt.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let name = name.unwrap_or(current.name);
        validate_name(&name, "ticket type name")?;
        let event = Event::TicketTypeUpdated {
            id,
            name,
            price: price.unwrap_or(current.price),
        };
        self.persist_catalog(&event).await
    }

    pub async fn delete_ticket_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let experience_id = self
            .ticket_types
            .get(&id)
            .map(|tt| tt.experience_id)
            .ok_or(EngineError::NotFound(id))?;

        // Read locks stay held until the delete is applied so no new hold
        // can pick the ticket type up in between.
        let guards = self.read_sessions(self.experience_session_ids(&experience_id)).await;
        let now = now_ms();
        if guards.iter().any(|g| g.uses_ticket_type(&id, now)) {
            return Err(EngineError::InUse(id));
        }
        self.persist_catalog(&Event::TicketTypeDeleted { id }).await
    }

    // ── Events and sessions ──────────────────────────────────

    /// Create an event; with a schedule, also its generated sessions.
    /// Returns the number of sessions created.
    pub async fn create_event(
        &self,
        id: Ulid,
        experience_id: Ulid,
        name: String,
        span: Span,
        schedule: Option<Schedule>,
    ) -> Result<usize, EngineError> {
        validate_name(&name, "event name")?;
        validate_span(&span, MAX_EVENT_RANGE_MS)?;
        let session_spans = match &schedule {
            Some(s) => {
                validate_capacity(s.capacity)?;
                schedule::expand(&span, s)?
            }
            None => Vec::new(),
        };

        let _catalog = self.catalog_lock.lock().await;
        if !self.experiences.contains_key(&experience_id) {
            return Err(EngineError::NotFound(experience_id));
        }
        if self.events.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let capacity = schedule.as_ref().map(|s| s.capacity).unwrap_or(0);
        let mut records = Vec::with_capacity(session_spans.len() + 1);
        records.push(Event::EventCreated {
            id,
            experience_id,
            name,
            span,
            schedule,
        });
        for session_span in session_spans {
            records.push(Event::SessionCreated {
                id: Ulid::new(),
                event_id: id,
                experience_id,
                span: session_span,
                capacity,
            });
        }
        self.wal_append_all(&records).await?;
        for record in &records {
            self.apply_catalog(record);
        }
        Ok(records.len() - 1)
    }

    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.events.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let mut session_ids = self.child_ids(&id);
        session_ids.sort();
        let mut guards: Vec<OwnedRwLockWriteGuard<SessionState>> = Vec::with_capacity(session_ids.len());
        for sid in &session_ids {
            if let Some(ss) = self.get_session(sid) {
                let guard = ss.write_owned().await;
                if !guard.bookings.is_empty() {
                    return Err(EngineError::HasBookings(id));
                }
                guards.push(guard);
            }
        }

        let event = Event::EventDeleted { id };
        self.wal_append(&event).await?;
        for guard in &guards {
            self.unmap_session_entities(guard);
        }
        self.apply_catalog(&event);
        for sid in &session_ids {
            self.notify.send(*sid, &event);
            self.notify.remove(sid);
        }
        Ok(())
    }

    pub async fn create_session(
        &self,
        id: Ulid,
        event_id: Ulid,
        span: Span,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_span(&span, MAX_SESSION_DURATION_MS)?;
        validate_capacity(capacity)?;
        let _catalog = self.catalog_lock.lock().await;
        let (experience_id, range) = self
            .events
            .get(&event_id)
            .map(|e| (e.experience_id, e.span))
            .ok_or(EngineError::NotFound(event_id))?;
        if !range.contains_instant(span.start) {
            return Err(EngineError::InvalidInput(
                "session must start inside the event's date range".into(),
            ));
        }
        if self.sessions.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.child_ids(&event_id).len() >= MAX_SESSIONS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many sessions on event"));
        }
        let event = Event::SessionCreated {
            id,
            event_id,
            experience_id,
            span,
            capacity,
        };
        self.persist_catalog(&event).await
    }

    pub async fn update_session_capacity(&self, id: Ulid, capacity: u32) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        let ss = self.get_session(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        let committed = guard.committed(now_ms());
        if capacity < committed {
            return Err(EngineError::CapacityBelowCommitted { capacity, committed });
        }
        let event = Event::SessionCapacityChanged { id, capacity };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Close a session to new reservations and drop its holds.
    /// Confirmed bookings stay for the business to refund or move.
    pub async fn cancel_session(&self, id: Ulid) -> Result<(), EngineError> {
        let ss = self.get_session(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        if guard.cancelled {
            return Err(EngineError::SessionClosed(id));
        }
        let released = guard.holds.len();
        let event = Event::SessionCancelled { id };
        self.persist_and_apply(id, &mut guard, &event).await?;
        tracing::info!("session {id} cancelled, {released} holds released");
        Ok(())
    }

    pub async fn delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let ss = self.get_session(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.write_owned().await;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        let event = Event::SessionDeleted { id, event_id: guard.event_id };
        self.wal_append(&event).await?;
        self.unmap_session_entities(&guard);
        self.apply_catalog(&event);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Guests ───────────────────────────────────────────────

    pub async fn register_guest(&self, id: Ulid, guest: GuestDetails) -> Result<(), EngineError> {
        validate_guest(&guest)?;
        let _guests = self.guest_lock.lock().await;
        if self.guests.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.insert_guest(id, guest).await
    }

    pub async fn update_guest(
        &self,
        id: Ulid,
        name: Option<String>,
        phone: Option<Option<String>>,
    ) -> Result<(), EngineError> {
        let _guests = self.guest_lock.lock().await;
        let current = self
            .guests
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let name = name.unwrap_or(current.name);
        let phone = phone.unwrap_or(current.phone);
        validate_name(&name, "guest name")?;
        validate_phone(&phone)?;
        self.persist_catalog(&Event::GuestUpdated { id, name, phone }).await
    }

    pub async fn delete_guest(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let guards = self.read_sessions(self.all_session_ids()).await;
        let _guests = self.guest_lock.lock().await;
        if !self.guests.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guards.iter().any(|g| g.bookings.iter().any(|b| b.guest_id == id)) {
            return Err(EngineError::HasBookings(id));
        }
        self.persist_catalog(&Event::GuestDeleted { id }).await
    }

    /// Caller holds `guest_lock`.
    async fn insert_guest(&self, id: Ulid, guest: GuestDetails) -> Result<(), EngineError> {
        if self.guests.len() >= MAX_GUESTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many guests"));
        }
        let email = guest.email.trim().to_string();
        if let Some(existing) = self.guest_by_email.get(&email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(*existing));
        }
        let event = Event::GuestRegistered {
            id,
            name: guest.name,
            email,
            phone: guest.phone,
        };
        self.persist_catalog(&event).await
    }

    /// Find the guest by email or register a new one. Returns the guest id.
    async fn upsert_guest(&self, guest: GuestDetails) -> Result<Ulid, EngineError> {
        let _guests = self.guest_lock.lock().await;
        let key = guest.email.trim().to_lowercase();
        if let Some(existing) = self.guest_by_email.get(&key).map(|e| *e.value()) {
            return Ok(existing);
        }
        let id = Ulid::new();
        self.insert_guest(id, guest).await?;
        Ok(id)
    }

    // ── Holds and bookings ───────────────────────────────────

    /// Reserve tickets for a checkout. The quantity counts against capacity
    /// until the hold is confirmed, released or expires.
    pub async fn place_hold(
        &self,
        id: Ulid,
        session_id: Ulid,
        items: &[CartItem],
        expires_at: Ms,
    ) -> Result<(), EngineError> {
        let now = now_ms();
        if expires_at <= now {
            return Err(EngineError::InvalidInput("hold expiry must be in the future".into()));
        }
        if expires_at - now > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold expiry too far ahead"));
        }
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let mut guard = ss.write().await;
        let claim = self.claim_entity(id, session_id)?;
        check_open(&guard, now, false)?;
        let published = self
            .experiences
            .get(&guard.experience_id)
            .is_some_and(|e| e.status == ExperienceStatus::Published);
        if !published {
            return Err(EngineError::NotBookable(guard.experience_id));
        }
        let lines = build_lines(&self.ticket_types, guard.experience_id, items)?;
        check_capacity(&guard, total_quantity(&lines), now)?;

        let event = Event::HoldPlaced {
            id,
            session_id,
            lines,
            expires_at,
            created_at: now,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        claim.keep();
        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        Ok(())
    }

    pub async fn release_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (session_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.hold(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::HoldReleased { id, session_id };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(session_id)
    }

    /// Turn a live hold into a confirmed booking for `guest`. The tickets
    /// were reserved by the hold, so capacity is not checked again.
    pub async fn confirm_hold(
        &self,
        booking_id: Ulid,
        hold_id: Ulid,
        guest: GuestDetails,
    ) -> Result<Ulid, EngineError> {
        validate_guest(&guest)?;
        let (session_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let hold = guard.hold(&hold_id).cloned().ok_or(EngineError::NotFound(hold_id))?;
        let claim = self.claim_entity(booking_id, session_id)?;
        let now = now_ms();
        if !hold.is_live(now) {
            return Err(EngineError::HoldExpired(hold_id));
        }
        let guest_id = self.upsert_guest(guest).await?;
        let event = Event::BookingConfirmed {
            id: booking_id,
            session_id,
            guest_id,
            lines: hold.lines,
            created_at: now,
            hold_id: Some(hold_id),
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        claim.keep();
        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        Ok(session_id)
    }

    /// Book directly without a checkout hold. Draft experiences and
    /// sessions already under way are accepted.
    pub async fn create_booking(
        &self,
        id: Ulid,
        session_id: Ulid,
        items: &[CartItem],
        guest: GuestDetails,
    ) -> Result<(), EngineError> {
        validate_guest(&guest)?;
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let mut guard = ss.write().await;
        let claim = self.claim_entity(id, session_id)?;
        let now = now_ms();
        check_open(&guard, now, true)?;
        let lines = build_lines(&self.ticket_types, guard.experience_id, items)?;
        check_capacity(&guard, total_quantity(&lines), now)?;
        let guest_id = self.upsert_guest(guest).await?;

        let event = Event::BookingConfirmed {
            id,
            session_id,
            guest_id,
            lines,
            created_at: now,
            hold_id: None,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        claim.keep();
        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        Ok(())
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (session_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        let event = Event::BookingCancelled { id, session_id };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        Ok(session_id)
    }

    /// Holds past their expiry, as `(hold_id, session_id)`. Sessions that are
    /// busy right now are skipped and picked up on the next sweep.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let ss = entry.value().clone();
            if let Ok(guard) = ss.try_read() {
                for hold in &guard.holds {
                    if !hold.is_live(now) {
                        expired.push((hold.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the shortest event list that rebuilds current state.
    /// Expired holds and released entities are dropped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let guards = self.read_sessions(self.all_session_ids()).await;
        let _guests = self.guest_lock.lock().await;
        let now = now_ms();

        let mut events = Vec::new();

        let mut experiences: Vec<ExperienceState> =
            self.experiences.iter().map(|e| e.value().clone()).collect();
        experiences.sort_by_key(|e| e.id);
        events.extend(experiences.into_iter().map(|e| Event::ExperienceCreated {
            id: e.id,
            name: e.name,
            description: e.description,
            status: e.status,
        }));

        let mut ticket_types: Vec<TicketTypeState> =
            self.ticket_types.iter().map(|t| t.value().clone()).collect();
        ticket_types.sort_by_key(|t| t.id);
        events.extend(ticket_types.into_iter().map(|t| Event::TicketTypeCreated {
            id: t.id,
            experience_id: t.experience_id,
            name: t.name,
            price: t.price,
        }));

        let mut guests: Vec<GuestState> = self.guests.iter().map(|g| g.value().clone()).collect();
        guests.sort_by_key(|g| g.id);
        events.extend(guests.into_iter().map(|g| Event::GuestRegistered {
            id: g.id,
            name: g.name,
            email: g.email,
            phone: g.phone,
        }));

        let mut evs: Vec<EventState> = self.events.iter().map(|e| e.value().clone()).collect();
        evs.sort_by_key(|e| e.id);
        events.extend(evs.into_iter().map(|e| Event::EventCreated {
            id: e.id,
            experience_id: e.experience_id,
            name: e.name,
            span: e.span,
            schedule: e.schedule,
        }));

        for ss in &guards {
            events.push(Event::SessionCreated {
                id: ss.id,
                event_id: ss.event_id,
                experience_id: ss.experience_id,
                span: ss.span,
                capacity: ss.capacity,
            });
            if ss.cancelled {
                events.push(Event::SessionCancelled { id: ss.id });
            }
            for hold in ss.holds.iter().filter(|h| h.is_live(now)) {
                events.push(Event::HoldPlaced {
                    id: hold.id,
                    session_id: ss.id,
                    lines: hold.lines.clone(),
                    expires_at: hold.expires_at,
                    created_at: hold.created_at,
                });
            }
            for booking in &ss.bookings {
                events.push(Event::BookingConfirmed {
                    id: booking.id,
                    session_id: ss.id,
                    guest_id: booking.guest_id,
                    lines: booking.lines.clone(),
                    created_at: booking.created_at,
                    hold_id: None,
                });
                if !booking.is_active() {
                    events.push(Event::BookingCancelled { id: booking.id, session_id: ss.id });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Helpers ──────────────────────────────────────────────

    fn all_session_ids(&self) -> Vec<Ulid> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    fn experience_session_ids(&self, experience_id: &Ulid) -> Vec<Ulid> {
        self.child_ids(experience_id)
            .iter()
            .flat_map(|event_id| self.child_ids(event_id))
            .collect()
    }

    /// Read-lock sessions in ascending id order. Ids that vanished are skipped.
    async fn read_sessions(&self, mut ids: Vec<Ulid>) -> Vec<OwnedRwLockReadGuard<SessionState>> {
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ss) = self.get_session(&id) {
                guards.push(ss.read_owned().await);
            }
        }
        guards
    }
}
