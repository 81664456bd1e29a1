use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_PRICE_CENTS;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Money ────────────────────────────────────────────────────────

/// An amount in minor units (cents). Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Option<Self> {
        (0..=MAX_PRICE_CENTS).contains(&cents).then_some(Self(cents))
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    /// Parse a decimal amount: `"25"`, `"25.5"`, `"25.50"`.
    pub fn parse(s: &str) -> Result<Self, MoneyError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyError::Empty);
        }
        if s.starts_with('-') {
            return Err(MoneyError::Negative);
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyError::Invalid(s.to_string()));
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyError::Invalid(s.to_string()));
        }
        if frac.len() > 2 {
            return Err(MoneyError::TooPrecise);
        }
        let whole: i64 = whole.parse().map_err(|_| MoneyError::TooLarge)?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().unwrap_or(0) * 10,
            _ => frac.parse::<i64>().unwrap_or(0),
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or(MoneyError::TooLarge)?;
        Self::from_cents(cents).ok_or(MoneyError::TooLarge)
    }

    pub fn checked_mul(self, n: u32) -> Option<Self> {
        self.0.checked_mul(i64::from(n)).map(Self)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    Empty,
    Negative,
    TooPrecise,
    TooLarge,
    Invalid(String),
}

impl std::fmt::Display for MoneyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoneyError::Empty => write!(f, "empty amount"),
            MoneyError::Negative => write!(f, "amount must not be negative"),
            MoneyError::TooPrecise => write!(f, "amount has more than two decimal places"),
            MoneyError::TooLarge => write!(f, "amount too large"),
            MoneyError::Invalid(s) => write!(f, "invalid amount: {s}"),
        }
    }
}

impl std::error::Error for MoneyError {}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperienceStatus {
    Draft,
    Published,
    Archived,
}

impl ExperienceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceStatus::Draft => "draft",
            ExperienceStatus::Published => "published",
            ExperienceStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Some(ExperienceStatus::Draft),
            "published" => Some(ExperienceStatus::Published),
            "archived" => Some(ExperienceStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperienceState {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperienceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketTypeState {
    pub id: Ulid,
    pub experience_id: Ulid,
    pub name: String,
    pub price: Money,
}

/// Recurring rule used to generate an event's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Bit 0 = Monday ... bit 6 = Sunday.
    pub days: u8,
    /// Minutes after local midnight, sorted.
    pub times: Vec<u16>,
    pub duration_min: u32,
    pub capacity: u32,
    /// Fixed offset of the event's local time from UTC.
    pub utc_offset_min: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventState {
    pub id: Ulid,
    pub experience_id: Ulid,
    pub name: String,
    pub span: Span,
    pub schedule: Option<Schedule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestState {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// Contact details collected at checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestDetails {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

// ── Reservations ─────────────────────────────────────────────────

/// A requested cart line, before prices are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartItem {
    pub ticket_type_id: Ulid,
    pub quantity: u32,
}

/// A reserved cart line with the unit price captured at reservation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLine {
    pub ticket_type_id: Ulid,
    pub quantity: u32,
    pub unit_price: Money,
}

pub fn total_quantity(lines: &[TicketLine]) -> u32 {
    lines.iter().map(|l| l.quantity).sum()
}

pub fn total_price(lines: &[TicketLine]) -> Option<Money> {
    lines.iter().try_fold(Money::ZERO, |acc, l| {
        l.unit_price.checked_mul(l.quantity).and_then(|s| acc.checked_add(s))
    })
}

/// Render lines in cart form: `<ticket_type_id>:<qty>[,...]`.
pub fn format_cart(lines: &[TicketLine]) -> String {
    lines
        .iter()
        .map(|l| format!("{}:{}", l.ticket_type_id, l.quantity))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub id: Ulid,
    pub lines: Vec<TicketLine>,
    pub expires_at: Ms,
    pub created_at: Ms,
}

impl Hold {
    pub fn quantity(&self) -> u32 {
        total_quantity(&self.lines)
    }

    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub lines: Vec<TicketLine>,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn quantity(&self) -> u32 {
        total_quantity(&self.lines)
    }

    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A bookable time slot and everything reserved against it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: Ulid,
    pub event_id: Ulid,
    pub experience_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub cancelled: bool,
    pub holds: Vec<Hold>,
    pub bookings: Vec<Booking>,
}

impl SessionState {
    pub fn new(id: Ulid, event_id: Ulid, experience_id: Ulid, span: Span, capacity: u32) -> Self {
        Self {
            id,
            event_id,
            experience_id,
            span,
            capacity,
            cancelled: false,
            holds: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Tickets on confirmed bookings.
    pub fn booked(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.is_active())
            .map(Booking::quantity)
            .sum()
    }

    /// Tickets on holds that have not expired at `now`.
    pub fn held(&self, now: Ms) -> u32 {
        self.holds
            .iter()
            .filter(|h| h.is_live(now))
            .map(Hold::quantity)
            .sum()
    }

    pub fn committed(&self, now: Ms) -> u32 {
        self.booked() + self.held(now)
    }

    pub fn remaining(&self, now: Ms) -> u32 {
        self.capacity.saturating_sub(self.committed(now))
    }

    pub fn hold(&self, id: &Ulid) -> Option<&Hold> {
        self.holds.iter().find(|h| h.id == *id)
    }

    pub fn remove_hold(&mut self, id: &Ulid) -> Option<Hold> {
        let pos = self.holds.iter().position(|h| h.id == *id)?;
        Some(self.holds.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// True if a live hold or a confirmed booking still uses the ticket type.
    pub fn uses_ticket_type(&self, ticket_type_id: &Ulid, now: Ms) -> bool {
        let held = self
            .holds
            .iter()
            .filter(|h| h.is_live(now))
            .any(|h| h.lines.iter().any(|l| l.ticket_type_id == *ticket_type_id));
        held || self
            .bookings
            .iter()
            .filter(|b| b.is_active())
            .any(|b| b.lines.iter().any(|l| l.ticket_type_id == *ticket_type_id))
    }
}

/// Flat event types. This is the WAL record format and
/// the LISTEN/NOTIFY payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ExperienceCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
        status: ExperienceStatus,
    },
    ExperienceUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
        status: ExperienceStatus,
    },
    ExperienceDeleted {
        id: Ulid,
    },
    TicketTypeCreated {
        id: Ulid,
        experience_id: Ulid,
        name: String,
        price: Money,
    },
    TicketTypeUpdated {
        id: Ulid,
        name: String,
        price: Money,
    },
    TicketTypeDeleted {
        id: Ulid,
    },
    EventCreated {
        id: Ulid,
        experience_id: Ulid,
        name: String,
        span: Span,
        schedule: Option<Schedule>,
    },
    EventDeleted {
        id: Ulid,
    },
    SessionCreated {
        id: Ulid,
        event_id: Ulid,
        experience_id: Ulid,
        span: Span,
        capacity: u32,
    },
    SessionCapacityChanged {
        id: Ulid,
        capacity: u32,
    },
    SessionCancelled {
        id: Ulid,
    },
    SessionDeleted {
        id: Ulid,
        event_id: Ulid,
    },
    GuestRegistered {
        id: Ulid,
        name: String,
        email: String,
        phone: Option<String>,
    },
    GuestUpdated {
        id: Ulid,
        name: String,
        phone: Option<String>,
    },
    GuestDeleted {
        id: Ulid,
    },
    HoldPlaced {
        id: Ulid,
        session_id: Ulid,
        lines: Vec<TicketLine>,
        expires_at: Ms,
        created_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        session_id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        session_id: Ulid,
        guest_id: Ulid,
        lines: Vec<TicketLine>,
        created_at: Ms,
        /// Set when the booking converts a checkout hold.
        hold_id: Option<Ulid>,
    },
    BookingCancelled {
        id: Ulid,
        session_id: Ulid,
    },
}

impl Event {
    /// The session whose state this event changes, if any.
    pub fn session_id(&self) -> Option<Ulid> {
        match self {
            Event::SessionCreated { id, .. }
            | Event::SessionCapacityChanged { id, .. }
            | Event::SessionCancelled { id }
            | Event::SessionDeleted { id, .. } => Some(*id),
            Event::HoldPlaced { session_id, .. }
            | Event::HoldReleased { session_id, .. }
            | Event::BookingConfirmed { session_id, .. }
            | Event::BookingCancelled { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperienceInfo {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperienceStatus,
    pub event_count: usize,
    pub ticket_type_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketTypeInfo {
    pub id: Ulid,
    pub experience_id: Ulid,
    pub name: String,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub experience_id: Ulid,
    pub name: String,
    pub start: Ms,
    pub end: Ms,
    pub session_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub experience_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    pub booked: u32,
    pub held: u32,
    pub remaining: u32,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub session_id: Ulid,
    pub tickets: String,
    pub quantity: u32,
    pub total: Money,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub session_id: Ulid,
    pub guest_id: Ulid,
    pub tickets: String,
    pub quantity: u32,
    pub total: Money,
    pub status: BookingStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub bookings: usize,
    pub total_spent: Money,
}

/// Dashboard overview for one business.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessSummary {
    pub experiences: usize,
    pub published_experiences: usize,
    pub events: usize,
    pub sessions: usize,
    pub upcoming_sessions: usize,
    pub guests: usize,
    pub bookings_confirmed: usize,
    pub bookings_cancelled: usize,
    pub tickets_sold: u64,
    pub revenue: Money,
}
