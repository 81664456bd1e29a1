mod capacity;
mod error;
mod mutations;
mod queries;

pub use capacity::now_ms;
pub use error::EngineError;
pub use queries::{BookingFilter, SessionFilter};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSessionState = Arc<RwLock<SessionState>>;

/// A hold or booking id reserved in `entity_to_session` before its record is
/// written. Dropping the claim without `keep` gives the id back.
pub(super) struct EntityClaim<'a> {
    map: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    kept: bool,
}

impl EntityClaim<'_> {
    pub(super) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for EntityClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.map.remove(&self.id);
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One business's catalog, guests and session ledgers.
///
/// Lock order, outermost first: `catalog_lock`, session locks (ascending id),
/// `guest_lock`. DashMap references are never held across an await.
pub struct Engine {
    pub(super) experiences: DashMap<Ulid, ExperienceState>,
    pub(super) ticket_types: DashMap<Ulid, TicketTypeState>,
    pub(super) events: DashMap<Ulid, EventState>,
    pub(super) guests: DashMap<Ulid, GuestState>,
    /// Lower-cased email → guest id.
    pub(super) guest_by_email: DashMap<String, Ulid>,
    pub(super) sessions: DashMap<Ulid, SharedSessionState>,
    /// Reverse lookup: hold/booking id → session id.
    pub(super) entity_to_session: DashMap<Ulid, Ulid>,
    /// experience → events, event → sessions.
    pub(super) children: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes catalog mutations against each other and against compaction.
    pub(super) catalog_lock: Mutex<()>,
    /// Serializes guest registration so emails stay unique.
    pub(super) guest_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a session-local event. Caller holds the session's write lock.
fn apply_to_session(ss: &mut SessionState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HoldPlaced {
            id,
            session_id,
            lines,
            expires_at,
            created_at,
        } => {
            ss.holds.push(Hold {
                id: *id,
                lines: lines.clone(),
                expires_at: *expires_at,
                created_at: *created_at,
            });
            entity_map.insert(*id, *session_id);
        }
        Event::HoldReleased { id, .. } => {
            ss.remove_hold(id);
            entity_map.remove(id);
        }
        Event::BookingConfirmed {
            id,
            session_id,
            guest_id,
            lines,
            created_at,
            hold_id,
        } => {
            if let Some(hold_id) = hold_id {
                ss.remove_hold(hold_id);
                entity_map.remove(hold_id);
            }
            ss.bookings.push(Booking {
                id: *id,
                guest_id: *guest_id,
                lines: lines.clone(),
                status: BookingStatus::Confirmed,
                created_at: *created_at,
            });
            entity_map.insert(*id, *session_id);
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = ss.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::SessionCapacityChanged { capacity, .. } => {
            ss.capacity = *capacity;
        }
        Event::SessionCancelled { .. } => {
            ss.cancelled = true;
            for hold in ss.holds.drain(..) {
                entity_map.remove(&hold.id);
            }
        }
        _ => {}
    }
}

/// Events applied under a session's write lock rather than at the map level.
fn is_session_local(event: &Event) -> bool {
    matches!(
        event,
        Event::HoldPlaced { .. }
            | Event::HoldReleased { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCancelled { .. }
            | Event::SessionCapacityChanged { .. }
            | Event::SessionCancelled { .. }
    )
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            experiences: DashMap::new(),
            ticket_types: DashMap::new(),
            events: DashMap::new(),
            guests: DashMap::new(),
            guest_by_email: DashMap::new(),
            sessions: DashMap::new(),
            entity_to_session: DashMap::new(),
            children: DashMap::new(),
            catalog_lock: Mutex::new(()),
            guest_lock: Mutex::new(()),
            wal_tx,
            notify,
        };

        // Sole owner of every Arc during replay, so try_read/try_write never
        // contend. blocking_* would panic here: tenants are created lazily
        // from inside the runtime.
        for event in &events {
            if is_session_local(event) {
                if let Some(sid) = event.session_id()
                    && let Some(ss) = engine.get_session(&sid)
                {
                    let mut guard = ss.try_write().expect("replay: uncontended write");
                    apply_to_session(&mut guard, event, &engine.entity_to_session);
                }
            } else {
                for sid in engine.sessions_removed_by(event) {
                    if let Some(ss) = engine.get_session(&sid) {
                        let guard = ss.try_read().expect("replay: uncontended read");
                        engine.unmap_session_entities(&guard);
                    }
                }
                engine.apply_catalog(event);
            }
        }

        tracing::debug!(
            "replayed {} events from {}: {} experiences, {} sessions",
            events.len(),
            wal_path.display(),
            engine.experiences.len(),
            engine.sessions.len()
        );
        Ok(engine)
    }

    /// Apply a map-level event: catalog records, guests, session creation
    /// and removal. Session contents are never touched here.
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ExperienceCreated {
                id,
                name,
                description,
                status,
            }
            | Event::ExperienceUpdated {
                id,
                name,
                description,
                status,
            } => {
                self.experiences.insert(
                    *id,
                    ExperienceState {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                        status: *status,
                    },
                );
            }
            Event::ExperienceDeleted { id } => {
                self.experiences.remove(id);
                self.ticket_types.retain(|_, tt| tt.experience_id != *id);
                self.children.remove(id);
            }
            Event::TicketTypeCreated {
                id,
                experience_id,
                name,
                price,
            } => {
                self.ticket_types.insert(
                    *id,
                    TicketTypeState {
                        id: *id,
                        experience_id: *experience_id,
                        name: name.clone(),
                        price: *price,
                    },
                );
            }
            Event::TicketTypeUpdated { id, name, price } => {
                if let Some(mut tt) = self.ticket_types.get_mut(id) {
                    tt.name = name.clone();
                    tt.price = *price;
                }
            }
            Event::TicketTypeDeleted { id } => {
                self.ticket_types.remove(id);
            }
            Event::EventCreated {
                id,
                experience_id,
                name,
                span,
                schedule,
            } => {
                self.events.insert(
                    *id,
                    EventState {
                        id: *id,
                        experience_id: *experience_id,
                        name: name.clone(),
                        span: *span,
                        schedule: schedule.clone(),
                    },
                );
                self.children.entry(*experience_id).or_default().push(*id);
            }
            Event::EventDeleted { id } => {
                if let Some((_, ev)) = self.events.remove(id)
                    && let Some(mut kids) = self.children.get_mut(&ev.experience_id)
                {
                    kids.retain(|c| c != id);
                }
                if let Some((_, sessions)) = self.children.remove(id) {
                    for sid in sessions {
                        self.sessions.remove(&sid);
                    }
                }
            }
            Event::SessionCreated {
                id,
                event_id,
                experience_id,
                span,
                capacity,
            } => {
                let ss = SessionState::new(*id, *event_id, *experience_id, *span, *capacity);
                self.sessions.insert(*id, Arc::new(RwLock::new(ss)));
                self.children.entry(*event_id).or_default().push(*id);
            }
            Event::SessionDeleted { id, event_id } => {
                self.sessions.remove(id);
                if let Some(mut kids) = self.children.get_mut(event_id) {
                    kids.retain(|c| c != id);
                }
            }
            Event::GuestRegistered {
                id,
                name,
                email,
                phone,
            } => {
                self.guests.insert(
                    *id,
                    GuestState {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                    },
                );
                self.guest_by_email.insert(email.to_lowercase(), *id);
            }
            Event::GuestUpdated { id, name, phone } => {
                if let Some(mut g) = self.guests.get_mut(id) {
                    g.name = name.clone();
                    g.phone = phone.clone();
                }
            }
            Event::GuestDeleted { id } => {
                if let Some((_, g)) = self.guests.remove(id) {
                    self.guest_by_email.remove(&g.email.to_lowercase());
                }
            }
            _ => {}
        }
    }

    /// Sessions an event drops from the map.
    fn sessions_removed_by(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::SessionDeleted { id, .. } => vec![*id],
            Event::EventDeleted { id } => self.child_ids(id),
            _ => Vec::new(),
        }
    }

    /// Drop reverse-lookup entries for every hold and booking in a session.
    pub(super) fn unmap_session_entities(&self, ss: &SessionState) {
        for h in &ss.holds {
            self.entity_to_session.remove(&h.id);
        }
        for b in &ss.bookings {
            self.entity_to_session.remove(&b.id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Queue several events in order and wait for all of them; they share
    /// flushes with each other and with concurrent writers.
    pub(super) async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Append {
                    event: event.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            pending.push(rx);
        }
        for rx in pending {
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))?;
        }
        Ok(())
    }

    /// Atomically reserve a new hold/booking id for `session_id`. Ids are
    /// unique across every session of the business.
    pub(super) fn claim_entity(
        &self,
        id: Ulid,
        session_id: Ulid,
    ) -> Result<EntityClaim<'_>, EngineError> {
        match self.entity_to_session.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(session_id);
                Ok(EntityClaim {
                    map: &self.entity_to_session,
                    id,
                    kept: false,
                })
            }
        }
    }

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn get_session_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_session.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn child_ids(&self, parent: &Ulid) -> Vec<Ulid> {
        self.children
            .get(parent)
            .map(|kids| kids.value().clone())
            .unwrap_or_default()
    }

    /// WAL-append, apply and notify for a session-local event.
    pub(super) async fn persist_and_apply(
        &self,
        session_id: Ulid,
        ss: &mut SessionState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_session(ss, event, &self.entity_to_session);
        self.notify.send(session_id, event);
        Ok(())
    }

    /// WAL-append and apply for a map-level event.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        if let Some(sid) = event.session_id() {
            self.notify.send(sid, event);
        }
        Ok(())
    }

    /// Lookup hold/booking → session, acquire the session's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<SessionState>), EngineError> {
        let session_id = self
            .get_session_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let guard = ss.write_owned().await;
        Ok((session_id, guard))
    }
}
