use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::{Booking, BookingPatch, BookingStatus, Ms, Record, SlotKey};
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another active booking already occupies the slot.
    Duplicate { existing: Ulid },
    NotFound(Ulid),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Duplicate { existing } => {
                write!(f, "slot already has active booking {existing}")
            }
            StoreError::NotFound(id) => write!(f, "booking not found: {id}"),
            StoreError::Unavailable(e) => write!(f, "booking store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable booking storage.
///
/// Implementations enforce at most one active (pending or confirmed)
/// booking per slot. Inactive bookings never take part in that check.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_active(&self, slot: &SlotKey) -> Result<Option<Booking>, StoreError>;

    /// Insert a new booking. Fails with `Duplicate` if the booking is active
    /// and the slot already has an active booking.
    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError>;

    async fn update(&self, id: Ulid, patch: &BookingPatch, now: Ms) -> Result<Booking, StoreError>;

    /// Remove a booking, returning what was removed.
    async fn delete(&self, id: Ulid) -> Result<Booking, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn list(&self) -> Result<Vec<Booking>, StoreError>;

    async fn list_active_on(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks on the first append, drains whatever else is queued, then does
/// one flush_sync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
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
    tracing::debug!("booking WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::STORE_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::STORE_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("booking WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── WAL-backed store ─────────────────────────────────────

/// Booking store persisted to an append-only log, served from memory.
///
/// `active` is the partial unique index: one entry per slot holding an
/// active booking. Inserts reserve their index entry before the log write
/// and roll it back if the write fails.
pub struct WalStore {
    bookings: DashMap<Ulid, Booking>,
    active: DashMap<SlotKey, Booking>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively so no
    /// append can land between the snapshot and the file swap.
    gate: RwLock<()>,
    /// Serializes read-modify-write operations on existing bookings.
    edit: Mutex<()>,
}

impl WalStore {
    /// Replay the log at `path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let records = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            bookings: DashMap::new(),
            active: DashMap::new(),
            wal_tx,
            gate: RwLock::new(()),
            edit: Mutex::new(()),
        };
        for record in &records {
            store.apply(record);
        }
        tracing::info!(
            path = %path.display(),
            records = records.len(),
            bookings = store.bookings.len(),
            "booking store replayed"
        );
        Ok(store)
    }

    fn apply(&self, record: &Record) {
        match record {
            Record::BookingWritten { booking } => {
                let mut booking = booking.clone();
                if let Some(old) = self.bookings.get(&booking.id).map(|e| e.value().clone())
                    && old.is_active()
                {
                    self.unreserve(&old);
                }
                // A log can carry a second active booking for a slot when a
                // flush failed after its bytes hit the disk. First one wins.
                if booking.is_active()
                    && let Err(StoreError::Duplicate { existing }) = self.reserve(&booking)
                {
                    tracing::warn!(
                        booking_id = %booking.id,
                        %existing,
                        slot = %booking.slot(),
                        "replayed booking collides with an active booking, marking it canceled"
                    );
                    booking.status = BookingStatus::Canceled;
                }
                self.bookings.insert(booking.id, booking);
            }
            Record::BookingRemoved { id } => {
                if let Some((_, old)) = self.bookings.remove(id) {
                    self.active.remove_if(&old.slot(), |_, b| b.id == old.id);
                }
            }
        }
    }

    async fn wal_append(&self, record: Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Claim the unique index entry for an active booking.
    fn reserve(&self, booking: &Booking) -> Result<(), StoreError> {
        match self.active.entry(booking.slot()) {
            Entry::Occupied(e) if e.get().id != booking.id => {
                Err(StoreError::Duplicate { existing: e.get().id })
            }
            Entry::Occupied(mut e) => {
                e.insert(booking.clone());
                Ok(())
            }
            Entry::Vacant(v) => {
                v.insert(booking.clone());
                Ok(())
            }
        }
    }

    fn unreserve(&self, booking: &Booking) {
        self.active.remove_if(&booking.slot(), |_, b| b.id == booking.id);
    }

    /// Rewrite the log with one record per live booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let mut records: Vec<Record> = self
            .bookings
            .iter()
            .map(|e| Record::BookingWritten { booking: e.value().clone() })
            .collect();
        records.sort_by_key(|r| match r {
            Record::BookingWritten { booking } => booking.id,
            Record::BookingRemoved { id } => *id,
        });

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
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
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_active(&self, slot: &SlotKey) -> Result<Option<Booking>, StoreError> {
        Ok(self.active.get(slot).map(|e| e.value().clone()))
    }

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::Duplicate { existing: booking.id });
        }
        if booking.is_active() {
            self.reserve(&booking)?;
        }
        if let Err(e) = self.wal_append(Record::BookingWritten { booking: booking.clone() }).await {
            if booking.is_active() {
                self.unreserve(&booking);
            }
            return Err(e);
        }
        self.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn update(&self, id: Ulid, patch: &BookingPatch, now: Ms) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let _edit = self.edit.lock().await;
        let current = self
            .bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;

        let mut next = current.clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(name) = &patch.client_name {
            next.client_name = name.clone();
        }
        if let Some(contact) = &patch.client_contact {
            next.client_contact = contact.clone();
        }
        next.updated_at = now;

        let reactivating = next.is_active() && !current.is_active();
        if reactivating {
            self.reserve(&next)?;
        }
        if let Err(e) = self.wal_append(Record::BookingWritten { booking: next.clone() }).await {
            if reactivating {
                self.unreserve(&next);
            }
            return Err(e);
        }

        self.bookings.insert(id, next.clone());
        if next.is_active() {
            self.active.insert(next.slot(), next.clone());
        } else if current.is_active() {
            self.unreserve(&current);
        }
        Ok(next)
    }

    async fn delete(&self, id: Ulid) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let _edit = self.edit.lock().await;
        let current = self
            .bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        self.wal_append(Record::BookingRemoved { id }).await?;
        self.bookings.remove(&id);
        self.unreserve(&current);
        Ok(current)
    }

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|e| e.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_active_on(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut out: Vec<Booking> = self
            .active
            .iter()
            .filter(|e| e.key().service_id == service_id && e.key().date == date)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| b.time);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::model::TimeOfDay;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn booking(service_id: Ulid, time: &str, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            service_id,
            date: d(10),
            time: t(time),
            client_name: "Ana".into(),
            client_contact: "555-0100".into(),
            status,
            lease_origin: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn second_active_booking_is_duplicate() {
        let store = WalStore::open(&test_wal_path("dup.wal")).unwrap();
        let sid = Ulid::new();
        let first = store.insert(booking(sid, "10:00", BookingStatus::Pending)).await.unwrap();

        let err = store
            .insert(booking(sid, "10:00", BookingStatus::Confirmed))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Duplicate { existing: first.id });
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn canceled_booking_does_not_block_slot() {
        let store = WalStore::open(&test_wal_path("canceled.wal")).unwrap();
        let sid = Ulid::new();
        store.insert(booking(sid, "10:00", BookingStatus::Canceled)).await.unwrap();
        store.insert(booking(sid, "10:00", BookingStatus::Completed)).await.unwrap();
        let live = store.insert(booking(sid, "10:00", BookingStatus::Pending)).await.unwrap();

        let slot = SlotKey::new(sid, d(10), t("10:00"));
        assert_eq!(store.find_active(&slot).await.unwrap().unwrap().id, live.id);
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancel_frees_slot() {
        let store = WalStore::open(&test_wal_path("cancel_frees.wal")).unwrap();
        let sid = Ulid::new();
        let b = store.insert(booking(sid, "11:00", BookingStatus::Pending)).await.unwrap();
        let patch = BookingPatch { status: Some(BookingStatus::Canceled), ..Default::default() };
        let updated = store.update(b.id, &patch, 5).await.unwrap();
        assert_eq!(updated.status, BookingStatus::Canceled);
        assert_eq!(updated.updated_at, 5);
        assert!(store.find_active(&b.slot()).await.unwrap().is_none());

        store.insert(booking(sid, "11:00", BookingStatus::Pending)).await.unwrap();
    }

    #[tokio::test]
    async fn reactivation_conflicts_with_newer_booking() {
        let store = WalStore::open(&test_wal_path("reactivate.wal")).unwrap();
        let sid = Ulid::new();
        let old = store.insert(booking(sid, "12:00", BookingStatus::Canceled)).await.unwrap();
        let new = store.insert(booking(sid, "12:00", BookingStatus::Pending)).await.unwrap();

        let patch = BookingPatch { status: Some(BookingStatus::Confirmed), ..Default::default() };
        let err = store.update(old.id, &patch, 9).await.unwrap_err();
        assert_eq!(err, StoreError::Duplicate { existing: new.id });
        // Rejected update leaves the record untouched.
        assert_eq!(store.get(old.id).await.unwrap().unwrap().status, BookingStatus::Canceled);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_id() {
        let store = WalStore::open(&test_wal_path("unknown.wal")).unwrap();
        let id = Ulid::new();
        assert_eq!(
            store.update(id, &BookingPatch::default(), 1).await.unwrap_err(),
            StoreError::NotFound(id)
        );
        assert_eq!(store.delete(id).await.unwrap_err(), StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn delete_removes_from_index() {
        let store = WalStore::open(&test_wal_path("delete.wal")).unwrap();
        let sid = Ulid::new();
        let b = store.insert(booking(sid, "13:00", BookingStatus::Confirmed)).await.unwrap();
        let removed = store.delete(b.id).await.unwrap();
        assert_eq!(removed.id, b.id);
        assert!(store.get(b.id).await.unwrap().is_none());
        assert!(store.find_active(&b.slot()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_rebuilds_unique_index() {
        let path = test_wal_path("replay.wal");
        let sid = Ulid::new();
        let (kept, removed) = {
            let store = WalStore::open(&path).unwrap();
            let kept = store.insert(booking(sid, "09:00", BookingStatus::Pending)).await.unwrap();
            let removed = store.insert(booking(sid, "09:30", BookingStatus::Pending)).await.unwrap();
            store.delete(removed.id).await.unwrap();
            let patch = BookingPatch { client_name: Some("Bea".into()), ..Default::default() };
            store.update(kept.id, &patch, 2).await.unwrap();
            (kept, removed)
        };

        let store = WalStore::open(&path).unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].client_name, "Bea");
        assert!(store.get(removed.id).await.unwrap().is_none());

        let err = store
            .insert(booking(sid, "09:00", BookingStatus::Pending))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Duplicate { existing: kept.id });
        store.insert(booking(sid, "09:30", BookingStatus::Pending)).await.unwrap();
    }

    #[tokio::test]
    async fn replay_keeps_first_active_booking_per_slot() {
        let path = test_wal_path("replay_collision.wal");
        let sid = Ulid::new();
        let first = booking(sid, "10:00", BookingStatus::Pending);
        let second = booking(sid, "10:00", BookingStatus::Confirmed);
        {
            // Two active records for one slot, as left behind by a failed flush
            // whose bytes still reached the file.
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Record::BookingWritten { booking: first.clone() }).unwrap();
            wal.append(&Record::BookingWritten { booking: second.clone() }).unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        let slot = SlotKey::new(sid, d(10), t("10:00"));
        assert_eq!(store.find_active(&slot).await.unwrap().unwrap().id, first.id);
        let active = store.list().await.unwrap().into_iter().filter(Booking::is_active).count();
        assert_eq!(active, 1);
        assert_eq!(store.get(second.id).await.unwrap().unwrap().status, BookingStatus::Canceled);
        assert_eq!(store.list_active_on(sid, d(10)).await.unwrap().len(), 1);

        // Canceling the survivor frees the slot for a new booking.
        let patch = BookingPatch { status: Some(BookingStatus::Canceled), ..Default::default() };
        store.update(first.id, &patch, 2).await.unwrap();
        store.insert(booking(sid, "10:00", BookingStatus::Pending)).await.unwrap();
    }

    #[tokio::test]
    async fn list_active_on_filters_and_sorts() {
        let store = WalStore::open(&test_wal_path("list_active.wal")).unwrap();
        let sid = Ulid::new();
        let other = Ulid::new();
        store.insert(booking(sid, "15:00", BookingStatus::Pending)).await.unwrap();
        store.insert(booking(sid, "09:00", BookingStatus::Confirmed)).await.unwrap();
        store.insert(booking(sid, "10:00", BookingStatus::Canceled)).await.unwrap();
        store.insert(booking(other, "09:00", BookingStatus::Pending)).await.unwrap();
        let mut next_day = booking(sid, "09:00", BookingStatus::Pending);
        next_day.date = d(11);
        store.insert(next_day).await.unwrap();

        let times: Vec<String> = store
            .list_active_on(sid, d(10))
            .await
            .unwrap()
            .iter()
            .map(|b| b.time.to_string())
            .collect();
        assert_eq!(times, vec!["09:00", "15:00"]);
    }

    #[tokio::test]
    async fn compact_preserves_state() {
        let path = test_wal_path("compact.wal");
        let sid = Ulid::new();
        let survivor = {
            let store = WalStore::open(&path).unwrap();
            let survivor = store.insert(booking(sid, "10:00", BookingStatus::Pending)).await.unwrap();
            for _ in 0..20 {
                let b = store.insert(booking(sid, "10:30", BookingStatus::Pending)).await.unwrap();
                store.delete(b.id).await.unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 41);
            let before = std::fs::metadata(&path).unwrap().len();

            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL ({after}) should be smaller than {before}");
            survivor
        };

        let store = WalStore::open(&path).unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all, vec![survivor]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(WalStore::open(&test_wal_path("race.wal")).unwrap());
        let sid = Ulid::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(booking(sid, "16:00", BookingStatus::Pending)).await
            }));
        }

        let mut ok = 0;
        let mut dup = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Duplicate { .. }) => dup += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dup, 15);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
