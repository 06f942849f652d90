use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

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

    /// `None` for empty or inverted windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Which participant pairings count as "the same party" when two
/// reservations on one source overlap in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParticipantMatch {
    /// reserver vs reserver, reservee vs reservee.
    #[default]
    SameRole,
    /// Every reserver/reservee pairing, across roles.
    AnyRole,
}

impl ParticipantMatch {
    pub fn shares(self, reserver_id: &str, reservee_id: &str, other: &Reservation) -> bool {
        let same_role = reserver_id == other.reserver_id || reservee_id == other.reservee_id;
        match self {
            ParticipantMatch::SameRole => same_role,
            ParticipantMatch::AnyRole => {
                same_role || reserver_id == other.reservee_id || reservee_id == other.reserver_id
            }
        }
    }
}

impl FromStr for ParticipantMatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "same_role" | "same-role" | "same" => Ok(ParticipantMatch::SameRole),
            "any_role" | "any-role" | "any" => Ok(ParticipantMatch::AnyRole),
            other => Err(format!("unknown participant match: {other}")),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub from: Ms,
    pub to: Ms,
    pub source_id: Ulid,
    pub reserver_id: String,
    pub reservee_id: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Ulid,
    pub name: String,
    /// Policy string, e.g. `"24h"`. Parsed on use by [`crate::policy::Policy`].
    pub max_possible_duration: String,
    pub customer_id: Ulid,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub company: String,
    pub email: String,
    pub max_source_limit: u32,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub value: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub source_id: Ulid,
    pub value: String,
    pub valid_until: Ms,
    pub created_at: Ms,
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub from: Ms,
    pub to: Ms,
    pub reserver_id: String,
    pub reservee_id: String,
    pub source_id: Ulid,
}

/// Partial update merged onto the stored record; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl ReservationPatch {
    pub fn apply(&self, reservation: &mut Reservation) {
        if let Some(from) = self.from {
            reservation.from = from;
        }
        if let Some(to) = self.to {
            reservation.to = to;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePatch {
    pub name: Option<String>,
    pub max_possible_duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerPatch {
    pub name: Option<String>,
    pub company: Option<String>,
    pub email: Option<String>,
    pub max_source_limit: Option<i64>,
}

// ── Filters & pagination ─────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub ids: Vec<Ulid>,
    pub reserver_id: Option<String>,
    pub reservee_id: Option<String>,
    pub source_id: Option<Ulid>,
    /// Restrict to sources owned by this customer.
    pub customer_id: Option<Ulid>,
}

impl ReservationFilter {
    /// Everything except the ownership scope, which needs the source.
    pub fn matches(&self, r: &Reservation) -> bool {
        (self.ids.is_empty() || self.ids.contains(&r.id))
            && non_empty(&self.reserver_id).is_none_or(|v| v == r.reserver_id)
            && non_empty(&self.reservee_id).is_none_or(|v| v == r.reservee_id)
            && self.source_id.is_none_or(|s| s == r.source_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    pub ids: Vec<Ulid>,
    /// Substring match.
    pub name: Option<String>,
    pub customer_id: Option<Ulid>,
}

impl SourceFilter {
    pub fn matches(&self, s: &Source) -> bool {
        (self.ids.is_empty() || self.ids.contains(&s.id))
            && non_empty(&self.name).is_none_or(|n| s.name.contains(n))
            && self.customer_id.is_none_or(|c| c == s.customer_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerFilter {
    pub ids: Vec<Ulid>,
    /// Substring match.
    pub name: Option<String>,
}

impl CustomerFilter {
    pub fn matches(&self, c: &Customer) -> bool {
        (self.ids.is_empty() || self.ids.contains(&c.id))
            && non_empty(&self.name).is_none_or(|n| c.name.contains(n))
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

/// 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// `(page - 1) * size`. Callers validate `page >= 1` first.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.size.min(MAX_PAGE_SIZE) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: u32,
    pub total: u64,
    pub count: usize,
}

impl<T> Page<T> {
    /// Cut one page out of the full, already ordered, match set.
    pub fn paginate(items: Vec<T>, req: PageRequest) -> Self {
        let total = items.len() as u64;
        let content: Vec<T> = items
            .into_iter()
            .skip(req.offset())
            .take(req.size.min(MAX_PAGE_SIZE) as usize)
            .collect();
        Self {
            count: content.len(),
            content,
            page: req.page,
            total,
        }
    }
}

// ── Per-source state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SourceState {
    pub source: Source,
    /// Sorted by `from`.
    pub reservations: Vec<Reservation>,
}

impl SourceState {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `from`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.from, |r| r.from)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose window intersects `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.from < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.to > query.start)
    }
}

/// WAL record format. Every mutation of the store is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CustomerCreated(Customer),
    CustomerUpdated(Customer),
    CustomerDeleted { id: Ulid },
    SecretIssued(Secret),
    TokenIssued(ApiToken),
    TokenRevoked { id: Ulid },
    SourceCreated(Source),
    SourceUpdated(Source),
    SourceDeleted { id: Ulid },
    ReservationCreated(Reservation),
    ReservationUpdated(Reservation),
    ReservationDeleted { id: Ulid, source_id: Ulid },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(from: Ms, to: Ms, reserver: &str, reservee: &str) -> Reservation {
        Reservation {
            id: Ulid::new(),
            from,
            to,
            source_id: Ulid::nil(),
            reserver_id: reserver.into(),
            reservee_id: reservee.into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn state() -> SourceState {
        SourceState::new(Source {
            id: Ulid::new(),
            name: "room".into(),
            max_possible_duration: "2h".into(),
            customer_id: Ulid::new(),
            created_at: 0,
            updated_at: 0,
        })
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(!a.overlaps(&Span::new(200, 300))); // touching
        assert!(a.overlaps(&Span::new(0, 1000))); // containment
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(5, 5).is_none());
        assert!(Span::try_new(6, 5).is_none());
        assert_eq!(Span::try_new(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn same_role_matching() {
        let existing = reservation(0, 10, "alice", "bob");
        let m = ParticipantMatch::SameRole;
        assert!(m.shares("alice", "carol", &existing));
        assert!(m.shares("dave", "bob", &existing));
        // Cross-role repeats are not a match under SameRole.
        assert!(!m.shares("bob", "alice", &existing));
        assert!(!m.shares("carol", "dave", &existing));
    }

    #[test]
    fn any_role_matching() {
        let existing = reservation(0, 10, "alice", "bob");
        let m = ParticipantMatch::AnyRole;
        assert!(m.shares("bob", "carol", &existing));
        assert!(m.shares("carol", "alice", &existing));
        assert!(m.shares("alice", "zed", &existing));
        assert!(!m.shares("carol", "dave", &existing));
    }

    #[test]
    fn participant_match_parses() {
        assert_eq!("same_role".parse(), Ok(ParticipantMatch::SameRole));
        assert_eq!("ANY-ROLE".parse(), Ok(ParticipantMatch::AnyRole));
        assert!("both".parse::<ParticipantMatch>().is_err());
    }

    #[test]
    fn patch_keeps_unset_fields() {
        let mut r = reservation(100, 200, "a", "b");
        ReservationPatch {
            from: None,
            to: Some(300),
        }
        .apply(&mut r);
        assert_eq!((r.from, r.to), (100, 300));
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut st = state();
        st.insert_reservation(reservation(300, 400, "a", "b"));
        st.insert_reservation(reservation(100, 200, "a", "b"));
        st.insert_reservation(reservation(200, 300, "a", "b"));
        let starts: Vec<Ms> = st.reservations.iter().map(|r| r.from).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut st = state();
        st.insert_reservation(reservation(100, 200, "a", "b"));
        st.insert_reservation(reservation(450, 600, "a", "b"));
        st.insert_reservation(reservation(1000, 1100, "a", "b"));
        let hits: Vec<_> = st.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].from, 450);
    }

    #[test]
    fn overlapping_excludes_touching() {
        let mut st = state();
        st.insert_reservation(reservation(100, 200, "a", "b"));
        assert_eq!(st.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(st.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn remove_missing_is_none() {
        let mut st = state();
        st.insert_reservation(reservation(100, 200, "a", "b"));
        assert!(st.remove_reservation(Ulid::new()).is_none());
        assert_eq!(st.reservations.len(), 1);
    }

    #[test]
    fn pagination_contract() {
        let items: Vec<u32> = (0..45).collect();
        let page = Page::paginate(items.clone(), PageRequest { page: 3, size: 20 });
        assert_eq!(page.content, (40..45).collect::<Vec<_>>());
        assert_eq!(page.total, 45);
        assert_eq!(page.count, 5);
        assert_eq!(page.page, 3);

        let beyond = Page::paginate(items, PageRequest { page: 9, size: 20 });
        assert!(beyond.content.is_empty());
        assert_eq!(beyond.total, 45);
    }

    #[test]
    fn reservation_filter_ignores_empty_strings() {
        let r = reservation(0, 10, "alice", "bob");
        let f = ReservationFilter {
            reserver_id: Some(String::new()),
            reservee_id: Some("bob".into()),
            ..Default::default()
        };
        assert!(f.matches(&r));
        let f = ReservationFilter {
            reservee_id: Some("carol".into()),
            ..Default::default()
        };
        assert!(!f.matches(&r));
    }
}
