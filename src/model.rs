use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Minutes since midnight, rendered as `HH:MM`.
///
/// Ordering on minutes matches lexicographic ordering of the zero-padded
/// string form, so sorted slot lists read the same either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

pub const MINUTES_PER_DAY: u16 = 24 * 60;

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
            return Err(err());
        }
        let hour: u16 = h.parse().map_err(|_| err())?;
        let minute: u16 = m.parse().map_err(|_| err())?;
        Self::hm(hour, minute).ok_or_else(err)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn contains_instant(&self, t: i64) -> bool {
        self.start <= t && t < self.end
    }
}

/// One bookable unit: a service at a time of day on a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
}

impl SlotKey {
    pub fn new(service_id: Ulid, date: NaiveDate, time: TimeOfDay) -> Self {
        Self { service_id, date, time }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.date, self.time, self.service_id)
    }
}

/// A session-owned, time-bounded claim on a slot. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: Ulid,
    pub slot: SlotKey,
    pub session_id: Ulid,
    pub acquired_at: Ms,
}

impl Lease {
    pub fn expires_at(&self, ttl: Ms) -> Ms {
        self.acquired_at + ttl
    }

    pub fn is_expired(&self, now: Ms, ttl: Ms) -> bool {
        self.expires_at(ttl) <= now
    }

    pub fn info(&self, ttl: Ms) -> LeaseInfo {
        LeaseInfo {
            session_id: self.session_id,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at(ttl),
        }
    }
}

/// Wire view of a lease, as seen by subscribers. The lease id stays with
/// the session that acquired it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub session_id: Ulid,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Canceled,
}

impl BookingStatus {
    /// Pending and confirmed bookings occupy their slot; the rest do not.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A durable booking. The slot key is stored decomposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub client_name: String,
    pub client_contact: String,
    pub status: BookingStatus,
    /// Lease that was promoted into this booking, if one was held.
    pub lease_origin: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.service_id, self.date, self.time)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Contact details supplied when confirming a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub name: String,
    pub contact: String,
}

/// Partial update applied by the operator console.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub client_name: Option<String>,
    pub client_contact: Option<String>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.client_name.is_none() && self.client_contact.is_none()
    }
}

// ── Catalog types ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
}

/// One entry of a weekday's working-hour template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingInterval {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    #[serde(default)]
    pub is_break: bool,
}

impl WorkingInterval {
    pub fn span(&self) -> Span {
        Span::new(self.start.minutes() as i64, self.end.minutes() as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub day: Weekday,
    pub intervals: Vec<WorkingInterval>,
}

/// The booking store's log records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Insert or full replacement of a booking.
    BookingWritten { booking: Booking },
    BookingRemoved { id: Ulid },
}

// ── Broadcast events ─────────────────────────────────────────────

/// Everything subscribers are told about. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    LockStateChanged {
        slot: SlotKey,
        holders: Vec<LeaseInfo>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        booking: Booking,
    },
    BookingDeleted {
        slot: SlotKey,
        booking_id: Ulid,
    },
    LeasesClearedBySessionLoss {
        session_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One row of the availability view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub time: TimeOfDay,
    pub held: bool,
    pub booked: bool,
    pub held_by: Option<Ulid>,
    pub booking_id: Option<Ulid>,
}

/// Current holders of one slot, as returned by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHolds {
    pub slot: SlotKey,
    pub holders: Vec<LeaseInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn time_of_day_parse_and_display() {
        let t: TimeOfDay = "14:30".parse().unwrap();
        assert_eq!(t.minutes(), 14 * 60 + 30);
        assert_eq!(t.to_string(), "14:30");

        let early: TimeOfDay = "9:05".parse().unwrap();
        assert_eq!(early.to_string(), "09:05");
    }

    #[test]
    fn time_of_day_rejects_garbage() {
        for bad in [
            "", "24:00", "12:60", "12", "12:5", "ab:cd", "123:00", "12:000", "+9:05", "10:+5", "-1:00",
        ] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn time_of_day_orders_like_strings() {
        let mut times: Vec<TimeOfDay> = ["13:00", "09:30", "10:00", "09:00"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        times.sort();
        let rendered: Vec<String> = times.iter().map(|t| t.to_string()).collect();
        let mut lexical = rendered.clone();
        lexical.sort();
        assert_eq!(rendered, lexical);
    }

    #[test]
    fn time_of_day_json_is_a_string() {
        let t = TimeOfDay::hm(8, 0).unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"08:00\"");
        let back: TimeOfDay = serde_json::from_str("\"08:00\"").unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn span_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.contains_instant(100));
        assert!(!a.contains_instant(200)); // half-open
    }

    #[test]
    fn slot_key_display() {
        let sid = Ulid::new();
        let key = SlotKey::new(sid, date(2024, 6, 10), TimeOfDay::hm(10, 0).unwrap());
        assert_eq!(key.to_string(), format!("2024-06-10-10:00-{sid}"));
    }

    #[test]
    fn only_pending_and_confirmed_are_active() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Canceled.is_active());
    }

    #[test]
    fn lease_expiry_boundary() {
        let lease = Lease {
            id: Ulid::new(),
            slot: SlotKey::new(Ulid::new(), date(2024, 6, 10), TimeOfDay::hm(10, 0).unwrap()),
            session_id: Ulid::new(),
            acquired_at: 1_000,
        };
        assert!(!lease.is_expired(1_499, 500));
        assert!(lease.is_expired(1_500, 500)); // expires exactly at acquired_at + ttl
        assert_eq!(lease.info(500).expires_at, 1_500);
    }

    #[test]
    fn lease_info_omits_lease_id() {
        let lease = Lease {
            id: Ulid::new(),
            slot: SlotKey::new(Ulid::new(), date(2024, 6, 10), TimeOfDay::hm(10, 0).unwrap()),
            session_id: Ulid::new(),
            acquired_at: 1_000,
        };
        let json = serde_json::to_value(lease.info(500)).unwrap();
        assert!(json.get("lease_id").is_none());
        assert_eq!(json["session_id"], lease.session_id.to_string());
        assert!(!json.to_string().contains(&lease.id.to_string()));
    }

    #[test]
    fn event_json_is_tagged() {
        let session_id = Ulid::new();
        let json = serde_json::to_value(Event::LeasesClearedBySessionLoss { session_id }).unwrap();
        assert_eq!(json["type"], "leases_cleared_by_session_loss");
        assert_eq!(json["session_id"], session_id.to_string());
    }

    #[test]
    fn booking_bincode_roundtrip() {
        let booking = Booking {
            id: Ulid::new(),
            service_id: Ulid::new(),
            date: date(2024, 6, 10),
            time: TimeOfDay::hm(10, 30).unwrap(),
            client_name: "Ana".into(),
            client_contact: "555-0100".into(),
            status: BookingStatus::Pending,
            lease_origin: None,
            created_at: 1,
            updated_at: 1,
        };
        let bytes = bincode::serialize(&booking).unwrap();
        let decoded: Booking = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, booking);
    }
}
