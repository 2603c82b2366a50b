use std::collections::HashMap;
use std::path::Path;

use chrono::Weekday;
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::{MAX_INTERVALS_PER_DAY, MAX_NAME_LEN, MAX_SERVICES};
use crate::model::{DaySchedule, Service, WorkingInterval};

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "cannot read catalog: {e}"),
            CatalogError::Parse(e) => write!(f, "malformed catalog: {e}"),
            CatalogError::Invalid(msg) => write!(f, "invalid catalog: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[derive(Deserialize)]
struct CatalogFile {
    services: Vec<Service>,
    #[serde(default)]
    schedules: Vec<DaySchedule>,
}

/// Read-only services and weekly working-hour template.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<Service>,
    schedules: HashMap<Weekday, Vec<WorkingInterval>>,
}

impl Catalog {
    pub fn new(services: Vec<Service>, schedules: Vec<DaySchedule>) -> Result<Self, CatalogError> {
        if services.len() > MAX_SERVICES {
            return Err(CatalogError::Invalid(format!(
                "{} services exceeds limit of {MAX_SERVICES}",
                services.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &services {
            if !seen.insert(s.id) {
                return Err(CatalogError::Invalid(format!("duplicate service id {}", s.id)));
            }
            if s.name.trim().is_empty() || s.name.len() > MAX_NAME_LEN {
                return Err(CatalogError::Invalid(format!("bad name for service {}", s.id)));
            }
        }

        let mut by_day: HashMap<Weekday, Vec<WorkingInterval>> = HashMap::new();
        for day in schedules {
            for iv in &day.intervals {
                if iv.start >= iv.end {
                    return Err(CatalogError::Invalid(format!(
                        "{}: interval {}-{} is empty",
                        day.day, iv.start, iv.end
                    )));
                }
            }
            let entry = by_day.entry(day.day).or_default();
            entry.extend(day.intervals);
            if entry.len() > MAX_INTERVALS_PER_DAY {
                return Err(CatalogError::Invalid(format!(
                    "{}: more than {MAX_INTERVALS_PER_DAY} intervals",
                    day.day
                )));
            }
        }

        Ok(Self { services, schedules: by_day })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json).map_err(CatalogError::Parse)?;
        Self::new(file.services, file.schedules)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(CatalogError::Io)?;
        Self::from_json(&json)
    }

    pub fn service(&self, id: &Ulid) -> Option<&Service> {
        self.services.iter().find(|s| s.id == *id)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Template for a weekday. Empty when the business is closed that day.
    pub fn intervals_for(&self, day: Weekday) -> &[WorkingInterval] {
        self.schedules.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All weekday templates, Monday first.
    pub fn schedules(&self) -> Vec<DaySchedule> {
        let mut out: Vec<DaySchedule> = self
            .schedules
            .iter()
            .map(|(day, intervals)| DaySchedule { day: *day, intervals: intervals.clone() })
            .collect();
        out.sort_by_key(|d| d.day.num_days_from_monday());
        out
    }
}
