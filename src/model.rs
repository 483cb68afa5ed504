use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

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

// ── Resources and their calendars ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Room,
    Staff,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Room => "room",
            ResourceKind::Staff => "staff",
        }
    }
}

/// Which table a calendar entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Individual,
    ClassOccurrence,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Individual => "individual",
            EntryKind::ClassOccurrence => "class_occurrence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Scheduled,
    Completed,
    NoShow,
    Cancelled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Scheduled => "scheduled",
            EntryStatus::Completed => "completed",
            EntryStatus::NoShow => "no_show",
            EntryStatus::Cancelled => "cancelled",
        }
    }

    /// Only scheduled entries block the resource. Completed, no-show and
    /// cancelled entries stay on the calendar as history.
    pub fn holds_time(&self) -> bool {
        matches!(self, EntryStatus::Scheduled)
    }
}

/// The common `(span, status)` projection of sessions and class occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub kind: EntryKind,
    pub span: Span,
    pub status: EntryStatus,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Sorted by `span.start`.
    pub entries: Vec<CalendarEntry>,
}

impl ResourceState {
    pub fn new(id: Ulid, kind: ResourceKind, name: Option<String>) -> Self {
        Self {
            id,
            kind,
            name,
            entries: Vec::new(),
        }
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert_entry(&mut self, entry: CalendarEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, id: Ulid) -> Option<CalendarEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Replace (or add) the entry with the same id.
    pub fn put_entry(&mut self, entry: CalendarEntry) {
        self.remove_entry(entry.id);
        self.insert_entry(entry);
    }

    /// Entries whose span overlaps the query window, any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &CalendarEntry> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

// ── Individual sessions ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::NoShow => "no_show",
        }
    }

    fn entry_status(&self) -> EntryStatus {
        match self {
            SessionStatus::Scheduled => EntryStatus::Scheduled,
            SessionStatus::Completed => EntryStatus::Completed,
            SessionStatus::Cancelled => EntryStatus::Cancelled,
            SessionStatus::NoShow => EntryStatus::NoShow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualSession {
    pub id: Ulid,
    pub room_id: Ulid,
    pub staff_id: Ulid,
    /// `None` for blocked or internal time.
    pub client_id: Option<Ulid>,
    pub span: Span,
    pub status: SessionStatus,
    pub attended: bool,
    pub external_ref: Option<String>,
}

impl IndividualSession {
    pub fn entry(&self) -> CalendarEntry {
        CalendarEntry {
            id: self.id,
            kind: EntryKind::Individual,
            span: self.span,
            status: self.status.entry_status(),
        }
    }
}

// ── Classes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl ClassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassStatus::Scheduled => "scheduled",
            ClassStatus::Cancelled => "cancelled",
            ClassStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOccurrence {
    pub id: Ulid,
    pub room_id: Ulid,
    pub trainer_id: Ulid,
    pub name: Option<String>,
    pub span: Span,
    pub capacity: u32,
    /// Fee per credit, charged to the unpaid balance when no pass covers the class.
    pub price_cents: i64,
    pub credits_required: u32,
    pub status: ClassStatus,
}

impl ClassOccurrence {
    pub fn entry(&self) -> CalendarEntry {
        let status = match self.status {
            ClassStatus::Scheduled => EntryStatus::Scheduled,
            ClassStatus::Cancelled => EntryStatus::Cancelled,
            ClassStatus::Completed => EntryStatus::Completed,
        };
        CalendarEntry {
            id: self.id,
            kind: EntryKind::ClassOccurrence,
            span: self.span,
            status,
        }
    }

    /// Amount added to the unpaid balance for one unpaid seat.
    pub fn unpaid_charge_cents(&self) -> i64 {
        self.price_cents * self.credits_required as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Booked,
    Waitlist,
    Attended,
    NoShow,
    Cancelled,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Booked => "booked",
            RegistrationStatus::Waitlist => "waitlist",
            RegistrationStatus::Attended => "attended",
            RegistrationStatus::NoShow => "no_show",
            RegistrationStatus::Cancelled => "cancelled",
        }
    }

    /// At most one active row per (occurrence, client).
    pub fn is_active(&self) -> bool {
        matches!(self, RegistrationStatus::Booked | RegistrationStatus::Waitlist)
    }

    /// Counts against class capacity.
    pub fn takes_seat(&self) -> bool {
        matches!(self, RegistrationStatus::Booked | RegistrationStatus::Attended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Pending,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRegistration {
    pub id: Ulid,
    pub occurrence_id: Ulid,
    pub client_id: Ulid,
    pub status: RegistrationStatus,
    /// Waitlist order (FIFO).
    pub booked_at: Ms,
    pub credits_used: u32,
    pub payment_status: PaymentStatus,
    /// One pass id per credit taken, so a refund returns each credit where it came from.
    pub debits: Vec<Ulid>,
}

impl ClassRegistration {
    pub fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            status: self.status,
            payment_status: self.payment_status,
            credits_used: self.credits_used,
        }
    }
}

/// A class occurrence row: the occurrence, its registrations and their audit trail.
#[derive(Debug, Clone)]
pub struct OccurrenceState {
    pub occurrence: ClassOccurrence,
    pub registrations: Vec<ClassRegistration>,
    /// Append-only.
    pub audit: Vec<AuditEntry>,
}

impl OccurrenceState {
    pub fn new(occurrence: ClassOccurrence) -> Self {
        Self {
            occurrence,
            registrations: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn confirmed_count(&self) -> u32 {
        self.registrations
            .iter()
            .filter(|r| r.status.takes_seat())
            .count() as u32
    }

    pub fn is_full(&self) -> bool {
        self.confirmed_count() >= self.occurrence.capacity
    }

    pub fn active_registration(&self, client_id: Ulid) -> Option<&ClassRegistration> {
        self.registrations
            .iter()
            .find(|r| r.client_id == client_id && r.status.is_active())
    }

    /// Most recent registration for the client, whatever its status.
    pub fn latest_registration(&self, client_id: Ulid) -> Option<&ClassRegistration> {
        self.registrations
            .iter()
            .filter(|r| r.client_id == client_id)
            .max_by_key(|r| (r.booked_at, r.id))
    }

    /// Earliest `booked_at` on the waitlist; ties broken by id.
    pub fn next_waitlisted(&self) -> Option<&ClassRegistration> {
        self.registrations
            .iter()
            .filter(|r| r.status == RegistrationStatus::Waitlist)
            .min_by_key(|r| (r.booked_at, r.id))
    }

    pub fn put_registration(&mut self, registration: ClassRegistration) {
        match self.registrations.iter_mut().find(|r| r.id == registration.id) {
            Some(existing) => *existing = registration,
            None => self.registrations.push(registration),
        }
    }
}

// ── Credit ledger ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassStatus {
    Active,
    Expired,
    Depleted,
    /// Issued with credits but `valid_from` is still ahead.
    Pending,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Active => "active",
            PassStatus::Expired => "expired",
            PassStatus::Depleted => "depleted",
            PassStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass {
    pub id: Ulid,
    pub client_id: Ulid,
    pub total_credits: u32,
    pub credits_left: u32,
    pub valid_from: Ms,
    pub valid_until: Ms,
    pub status: PassStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Pass {
    pub fn within_validity(&self, now: Ms) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }

    /// What the validity window alone says about a pass that still has credits.
    pub fn window_status(&self, now: Ms) -> PassStatus {
        if now < self.valid_from {
            PassStatus::Pending
        } else if now > self.valid_until {
            PassStatus::Expired
        } else {
            PassStatus::Active
        }
    }

    /// Has credits and `now` is inside the validity window. A pending pass
    /// whose window has opened counts even before the sweep activates it.
    pub fn is_available(&self, now: Ms) -> bool {
        matches!(self.status, PassStatus::Active | PassStatus::Pending)
            && self.credits_left > 0
            && self.within_validity(now)
    }

    /// Move an active or pending pass to the status its window implies.
    /// Returns whether the status changed.
    pub fn settle(&mut self, now: Ms) -> bool {
        if !matches!(self.status, PassStatus::Active | PassStatus::Pending) {
            return false;
        }
        let next = self.window_status(now);
        if next == self.status {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Can take a refunded credit without exceeding `total_credits`.
    pub fn has_room(&self) -> bool {
        self.credits_left < self.total_credits
    }
}

/// Everything a client owns in money terms. Locked as one row.
#[derive(Debug, Clone)]
pub struct ClientLedger {
    pub id: Ulid,
    pub name: Option<String>,
    pub passes: Vec<Pass>,
    pub unpaid_balance_cents: i64,
}

impl ClientLedger {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            passes: Vec::new(),
            unpaid_balance_cents: 0,
        }
    }

    pub fn pass(&self, id: Ulid) -> Option<&Pass> {
        self.passes.iter().find(|p| p.id == id)
    }

    pub fn put_pass(&mut self, pass: Pass) {
        match self.passes.iter_mut().find(|p| p.id == pass.id) {
            Some(existing) => *existing = pass,
            None => self.passes.push(pass),
        }
    }
}

// ── Actors and audit ────────────────────────────────────────────

/// Who is asking. Privileged actors (front desk, admins) bypass the
/// cancellation lock window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<Ulid>,
    pub privileged: bool,
}

impl Actor {
    pub fn member(id: Ulid) -> Self {
        Self { id: Some(id), privileged: false }
    }

    pub fn staff(id: Ulid) -> Self {
        Self { id: Some(id), privileged: true }
    }

    pub fn system() -> Self {
        Self { id: None, privileged: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Booked,
    Waitlisted,
    Cancelled,
    Promoted,
    Attended,
    NoShow,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Booked => "booked",
            AuditAction::Waitlisted => "waitlisted",
            AuditAction::Cancelled => "cancelled",
            AuditAction::Promoted => "promoted",
            AuditAction::Attended => "attended",
            AuditAction::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub status: RegistrationStatus,
    pub payment_status: PaymentStatus,
    pub credits_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub at: Ms,
    pub actor: Actor,
    pub action: AuditAction,
    pub occurrence_id: Ulid,
    pub registration_id: Ulid,
    pub before: Option<RegistrationSnapshot>,
    pub after: RegistrationSnapshot,
}

/// The event types: flat row images. This is the WAL record format; one
/// WAL entry holds every event of one committed unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    },
    ClientCreated {
        id: Ulid,
        name: Option<String>,
    },
    PassWritten {
        pass: Pass,
    },
    UnpaidBalanceSet {
        client_id: Ulid,
        balance_cents: i64,
    },
    /// Create, reschedule, status change or external-ref update of a session.
    /// `previous_*` name the calendars the session leaves when it moves.
    SessionWritten {
        session: IndividualSession,
        previous_room: Option<Ulid>,
        previous_staff: Option<Ulid>,
    },
    ClassWritten {
        occurrence: ClassOccurrence,
    },
    RegistrationWritten {
        registration: ClassRegistration,
    },
    AuditRecorded {
        entry: AuditEntry,
    },
}

// ── Query result types ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub unpaid_balance_cents: i64,
    pub available_credits: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: Ms, end: Ms, status: EntryStatus) -> CalendarEntry {
        CalendarEntry {
            id: Ulid::new(),
            kind: EntryKind::Individual,
            span: Span::new(start, end),
            status,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
        assert!(a.contains_instant(100));
        assert!(!a.contains_instant(200));
    }

    #[test]
    fn entries_stay_sorted() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Room, None);
        rs.insert_entry(entry(300, 400, EntryStatus::Scheduled));
        rs.insert_entry(entry(100, 200, EntryStatus::Scheduled));
        rs.insert_entry(entry(200, 300, EntryStatus::Cancelled));
        let starts: Vec<Ms> = rs.entries.iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn put_entry_moves_existing() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Staff, None);
        let mut e = entry(100, 200, EntryStatus::Scheduled);
        rs.insert_entry(e.clone());
        rs.insert_entry(entry(300, 400, EntryStatus::Scheduled));
        e.span = Span::new(500, 600);
        rs.put_entry(e.clone());
        assert_eq!(rs.entries.len(), 2);
        assert_eq!(rs.entries[1], e);
    }

    #[test]
    fn overlapping_skips_touching_and_distant() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Room, None);
        rs.insert_entry(entry(100, 200, EntryStatus::Scheduled));
        rs.insert_entry(entry(450, 600, EntryStatus::Scheduled));
        rs.insert_entry(entry(800, 900, EntryStatus::Scheduled));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_long_entry_spanning_query() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Room, None);
        rs.insert_entry(entry(0, 10_000, EntryStatus::Scheduled));
        rs.insert_entry(entry(100, 200, EntryStatus::Scheduled));
        let hits: Vec<_> = rs.overlapping(&Span::new(5_000, 6_000)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn waitlist_order_is_fifo() {
        let occ = ClassOccurrence {
            id: Ulid::new(),
            room_id: Ulid::new(),
            trainer_id: Ulid::new(),
            name: None,
            span: Span::new(0, HOUR_MS),
            capacity: 1,
            price_cents: 0,
            credits_required: 1,
            status: ClassStatus::Scheduled,
        };
        let mut state = OccurrenceState::new(occ.clone());
        let reg = |client: Ulid, at: Ms, status| ClassRegistration {
            id: Ulid::new(),
            occurrence_id: occ.id,
            client_id: client,
            status,
            booked_at: at,
            credits_used: 0,
            payment_status: PaymentStatus::Pending,
            debits: Vec::new(),
        };
        let w2 = Ulid::new();
        let w1 = Ulid::new();
        state.put_registration(reg(Ulid::new(), 5, RegistrationStatus::Booked));
        state.put_registration(reg(w2, 20, RegistrationStatus::Waitlist));
        state.put_registration(reg(w1, 10, RegistrationStatus::Waitlist));
        assert_eq!(state.next_waitlisted().map(|r| r.client_id), Some(w1));
        assert_eq!(state.confirmed_count(), 1);
        assert!(state.is_full());
    }

    #[test]
    fn pass_availability_window() {
        let pass = Pass {
            id: Ulid::new(),
            client_id: Ulid::new(),
            total_credits: 5,
            credits_left: 1,
            valid_from: 100,
            valid_until: 200,
            status: PassStatus::Active,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!pass.is_available(99));
        assert!(pass.is_available(100));
        assert!(pass.is_available(200));
        assert!(!pass.is_available(201));
        assert!(pass.has_room());
    }

    #[test]
    fn pass_status_follows_window() {
        let mut pass = Pass {
            id: Ulid::new(),
            client_id: Ulid::new(),
            total_credits: 5,
            credits_left: 5,
            valid_from: 100,
            valid_until: 200,
            status: PassStatus::Pending,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(pass.window_status(99), PassStatus::Pending);
        assert_eq!(pass.window_status(200), PassStatus::Active);
        assert_eq!(pass.window_status(201), PassStatus::Expired);

        assert!(!pass.settle(50));
        assert!(!pass.is_available(50));
        assert!(pass.is_available(150));
        assert!(pass.settle(150));
        assert_eq!((pass.status, pass.updated_at), (PassStatus::Active, 150));
        assert!(pass.settle(300));
        assert_eq!(pass.status, PassStatus::Expired);

        pass.status = PassStatus::Depleted;
        assert!(!pass.settle(150));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ResourceCreated {
            id: Ulid::new(),
            kind: ResourceKind::Room,
            name: Some("Studio A".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
