use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::validate::now_ms;
use super::{Engine, EngineError};

// ── Slot generation ───────────────────────────────────────────────

/// Expand a day's working-hour template into slot start times.
///
/// Every non-break interval is walked from its start in `step`-minute
/// increments; a start is emitted while it is strictly before the interval
/// end. Starts that fall inside a break are dropped. The result is
/// deduplicated and sorted.
pub fn expand_slots(intervals: &[WorkingInterval], step: u16) -> Vec<TimeOfDay> {
    let step = step.max(1);
    let mut breaks: Vec<Span> = intervals.iter().filter(|i| i.is_break).map(|i| i.span()).collect();
    breaks.sort_by_key(|s| s.start);
    let breaks = merge_overlapping(&breaks);

    let mut starts = BTreeSet::new();
    for iv in intervals.iter().filter(|i| !i.is_break) {
        let open = subtract_intervals(&[iv.span()], &breaks);
        let mut t = iv.start.minutes();
        while t < iv.end.minutes() {
            if open.iter().any(|s| s.contains_instant(t as i64))
                && let Some(tod) = TimeOfDay::from_minutes(t)
            {
                starts.insert(tod);
            }
            t += step;
        }
    }
    starts.into_iter().collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Availability resolver ─────────────────────────────────────────

impl Engine {
    /// Slot start times generated for a date from the weekly template.
    pub fn working_slots(&self, date: NaiveDate) -> Vec<TimeOfDay> {
        expand_slots(self.catalog.intervals_for(date.weekday()), self.config.slot_minutes)
    }

    pub async fn resolve(&self, date: NaiveDate, service_id: Ulid) -> Result<Vec<SlotView>, EngineError> {
        self.resolve_at(date, service_id, now_ms()).await
    }

    /// Availability view of one service on one date as of `now`.
    /// A booked slot is never reported as held.
    pub async fn resolve_at(
        &self,
        date: NaiveDate,
        service_id: Ulid,
        now: Ms,
    ) -> Result<Vec<SlotView>, EngineError> {
        if self.catalog.service(&service_id).is_none() {
            return Err(EngineError::invalid(format!("unknown service {service_id}")));
        }
        let times = self.working_slots(date);
        if times.is_empty() {
            return Ok(Vec::new());
        }

        let booked: HashMap<TimeOfDay, Ulid> = self
            .store
            .list_active_on(service_id, date)
            .await?
            .into_iter()
            .map(|b| (b.time, b.id))
            .collect();
        let held = self.locks.holders_on(service_id, date, now);

        Ok(times
            .into_iter()
            .map(|time| {
                let booking_id = booked.get(&time).copied();
                let held_by = match booking_id {
                    Some(_) => None,
                    None => held.get(&time).map(|l| l.session_id),
                };
                SlotView {
                    time,
                    held: held_by.is_some(),
                    booked: booking_id.is_some(),
                    held_by,
                    booking_id,
                }
            })
            .collect())
    }
}
