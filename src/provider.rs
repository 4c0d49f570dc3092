//! Institutional data sources.
//!
//! A [`DataProvider`] hands out the entities of one organization. Calls are
//! idempotent, so [`CachingProvider`] may serve them from a TTL cache and
//! retry transient failures with exponential backoff.

use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, StampedeCache};
use crate::config::{CacheConfig, JobConfig};
use crate::data::{Course, Faculty, Room, Snapshot, Student, TimeSlot};
use crate::error::{EngineError, Result};
use crate::memory::PressureLevel;

pub trait DataProvider: Send + Sync {
    fn fetch_courses(&self, org: &str, semester: &str) -> Result<Vec<Course>>;
    fn fetch_faculty(&self, org: &str) -> Result<Vec<Faculty>>;
    fn fetch_rooms(&self, org: &str) -> Result<Vec<Room>>;
    fn fetch_time_slots(&self, org: &str) -> Result<Vec<TimeSlot>>;
    fn fetch_students(&self, org: &str) -> Result<Vec<Student>>;
}

impl<T: DataProvider + ?Sized> DataProvider for Arc<T> {
    fn fetch_courses(&self, org: &str, semester: &str) -> Result<Vec<Course>> {
        (**self).fetch_courses(org, semester)
    }

    fn fetch_faculty(&self, org: &str) -> Result<Vec<Faculty>> {
        (**self).fetch_faculty(org)
    }

    fn fetch_rooms(&self, org: &str) -> Result<Vec<Room>> {
        (**self).fetch_rooms(org)
    }

    fn fetch_time_slots(&self, org: &str) -> Result<Vec<TimeSlot>> {
        (**self).fetch_time_slots(org)
    }

    fn fetch_students(&self, org: &str) -> Result<Vec<Student>> {
        (**self).fetch_students(org)
    }
}

/// One organization as stored in a data file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationData {
    /// Semester name -> courses offered.
    #[serde(default)]
    pub semesters: BTreeMap<String, Vec<Course>>,
    #[serde(default)]
    pub faculty: Vec<Faculty>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub students: Vec<Student>,
}

/// Provider over data loaded up front, keyed by organization id.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    orgs: HashMap<String, OrganizationData>,
}

impl StaticProvider {
    pub fn new(orgs: HashMap<String, OrganizationData>) -> Self {
        Self { orgs }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let orgs: HashMap<String, OrganizationData> = serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvalidInput(format!("data file {}: {e}", path.display())))?;
        info!("Loaded {} organization(s) from {}", orgs.len(), path.display());
        Ok(Self { orgs })
    }

    pub fn insert(&mut self, org: impl Into<String>, data: OrganizationData) {
        self.orgs.insert(org.into(), data);
    }

    fn org(&self, org: &str) -> Result<&OrganizationData> {
        self.orgs
            .get(org)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown organization '{org}'")))
    }
}

impl DataProvider for StaticProvider {
    fn fetch_courses(&self, org: &str, semester: &str) -> Result<Vec<Course>> {
        self.org(org)?
            .semesters
            .get(semester)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("no courses for '{org}' in semester '{semester}'")))
    }

    fn fetch_faculty(&self, org: &str) -> Result<Vec<Faculty>> {
        Ok(self.org(org)?.faculty.clone())
    }

    fn fetch_rooms(&self, org: &str) -> Result<Vec<Room>> {
        Ok(self.org(org)?.rooms.clone())
    }

    fn fetch_time_slots(&self, org: &str) -> Result<Vec<TimeSlot>> {
        Ok(self.org(org)?.time_slots.clone())
    }

    fn fetch_students(&self, org: &str) -> Result<Vec<Student>> {
        Ok(self.org(org)?.students.clone())
    }
}

/// TTL-cached provider with bounded retries on transient failures.
pub struct CachingProvider<P> {
    inner: P,
    courses: StampedeCache<(String, String), Arc<Vec<Course>>>,
    faculty: StampedeCache<String, Arc<Vec<Faculty>>>,
    rooms: StampedeCache<String, Arc<Vec<Room>>>,
    time_slots: StampedeCache<String, Arc<Vec<TimeSlot>>>,
    students: StampedeCache<String, Arc<Vec<Student>>>,
    retries: u32,
    backoff: Duration,
}

impl<P: DataProvider> CachingProvider<P> {
    pub fn new(inner: P, cache: &CacheConfig, job: &JobConfig) -> Self {
        Self {
            inner,
            courses: StampedeCache::new(cache),
            faculty: StampedeCache::new(cache),
            rooms: StampedeCache::new(cache),
            time_slots: StampedeCache::new(cache),
            students: StampedeCache::new(cache),
            retries: job.data_retries,
            backoff: Duration::from_millis(job.data_backoff_ms),
        }
    }

    fn with_retry<T>(&self, what: &str, mut fetch: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match fetch() {
                Err(EngineError::TransientDataError(msg)) if attempt < self.retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!("{what} failed ({msg}), retry {attempt}/{} in {delay:?}", self.retries);
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Fetches every entity and freezes them into a validated snapshot.
    pub fn snapshot(&self, org: &str, semester: &str) -> Result<Snapshot> {
        let courses = self.fetch_courses(org, semester)?;
        let snapshot = Snapshot::new(
            courses,
            self.fetch_faculty(org)?,
            self.fetch_rooms(org)?,
            self.fetch_time_slots(org)?,
            self.fetch_students(org)?,
        );
        snapshot.validate()?;
        debug!(
            "snapshot for {org}/{semester}: {} courses, {} sessions",
            snapshot.courses().len(),
            snapshot.total_sessions()
        );
        Ok(snapshot)
    }

    /// Memory cleanup hook: drop stale entries, everything under emergency.
    pub fn relieve(&self, level: PressureLevel) -> usize {
        let caches: [&dyn Evictable; 5] = [&self.courses, &self.faculty, &self.rooms, &self.time_slots, &self.students];
        let removed: usize = match level {
            PressureLevel::Normal | PressureLevel::Elevated => 0,
            PressureLevel::Aggressive => caches.iter().map(|c| c.evict_expired()).sum(),
            PressureLevel::Emergency => caches.iter().map(|c| c.clear()).sum(),
        };
        if removed > 0 {
            info!("Released {removed} cached data entries under {level:?} pressure");
        }
        removed
    }

    pub fn course_cache_stats(&self) -> CacheStats {
        self.courses.stats()
    }
}

trait Evictable {
    fn evict_expired(&self) -> usize;
    fn clear(&self) -> usize;
}

impl<K, V> Evictable for StampedeCache<K, V>
where
    K: Eq + std::hash::Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn evict_expired(&self) -> usize {
        StampedeCache::evict_expired(self)
    }

    fn clear(&self) -> usize {
        StampedeCache::clear(self)
    }
}

impl<P: DataProvider> DataProvider for CachingProvider<P> {
    fn fetch_courses(&self, org: &str, semester: &str) -> Result<Vec<Course>> {
        let key = (org.to_string(), semester.to_string());
        let v = self.courses.get_or_compute(&key, || {
            self.with_retry("fetch_courses", || self.inner.fetch_courses(org, semester)).map(Arc::new)
        })?;
        Ok(v.as_ref().clone())
    }

    fn fetch_faculty(&self, org: &str) -> Result<Vec<Faculty>> {
        let v = self.faculty.get_or_compute(&org.to_string(), || {
            self.with_retry("fetch_faculty", || self.inner.fetch_faculty(org)).map(Arc::new)
        })?;
        Ok(v.as_ref().clone())
    }

    fn fetch_rooms(&self, org: &str) -> Result<Vec<Room>> {
        let v = self.rooms.get_or_compute(&org.to_string(), || {
            self.with_retry("fetch_rooms", || self.inner.fetch_rooms(org)).map(Arc::new)
        })?;
        Ok(v.as_ref().clone())
    }

    fn fetch_time_slots(&self, org: &str) -> Result<Vec<TimeSlot>> {
        let v = self.time_slots.get_or_compute(&org.to_string(), || {
            self.with_retry("fetch_time_slots", || self.inner.fetch_time_slots(org)).map(Arc::new)
        })?;
        Ok(v.as_ref().clone())
    }

    fn fetch_students(&self, org: &str) -> Result<Vec<Student>> {
        let v = self.students.get_or_compute(&org.to_string(), || {
            self.with_retry("fetch_students", || self.inner.fetch_students(org)).map(Arc::new)
        })?;
        Ok(v.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn org_data() -> OrganizationData {
        let snap = campus();
        let data = snap.data().clone();
        OrganizationData {
            semesters: [("2025-fall".to_string(), data.courses)].into_iter().collect(),
            faculty: data.faculty,
            rooms: data.rooms,
            time_slots: data.time_slots,
            students: data.students,
        }
    }

    /// Fails the first `failures` course fetches.
    struct Flaky {
        inner: StaticProvider,
        failures: u32,
        calls: AtomicU32,
    }

    impl DataProvider for Flaky {
        fn fetch_courses(&self, org: &str, semester: &str) -> Result<Vec<Course>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(EngineError::TransientDataError("connection reset".into()));
            }
            self.inner.fetch_courses(org, semester)
        }
        fn fetch_faculty(&self, org: &str) -> Result<Vec<Faculty>> {
            self.inner.fetch_faculty(org)
        }
        fn fetch_rooms(&self, org: &str) -> Result<Vec<Room>> {
            self.inner.fetch_rooms(org)
        }
        fn fetch_time_slots(&self, org: &str) -> Result<Vec<TimeSlot>> {
            self.inner.fetch_time_slots(org)
        }
        fn fetch_students(&self, org: &str) -> Result<Vec<Student>> {
            self.inner.fetch_students(org)
        }
    }

    fn flaky(failures: u32) -> Flaky {
        let mut inner = StaticProvider::default();
        inner.insert("uni", org_data());
        Flaky {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn job(retries: u32) -> JobConfig {
        JobConfig {
            data_retries: retries,
            data_backoff_ms: 1,
            ..JobConfig::default()
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let provider = CachingProvider::new(flaky(2), &CacheConfig::default(), &job(3));
        let courses = provider.fetch_courses("uni", "2025-fall").unwrap();
        assert_eq!(courses.len(), 6);
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_are_bounded() {
        let provider = CachingProvider::new(flaky(10), &CacheConfig::default(), &job(2));
        let err = provider.fetch_courses("uni", "2025-fall").unwrap_err();
        assert!(matches!(err, EngineError::TransientDataError(_)));
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cached_fetch_hits_source_once() {
        let provider = CachingProvider::new(flaky(0), &CacheConfig::default(), &job(0));
        provider.fetch_courses("uni", "2025-fall").unwrap();
        provider.fetch_courses("uni", "2025-fall").unwrap();
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.course_cache_stats().hits, 1);
        assert_eq!(provider.relieve(PressureLevel::Emergency), 1);
    }

    #[test]
    fn test_snapshot_and_unknown_org() {
        let provider = CachingProvider::new(flaky(0), &CacheConfig::default(), &job(0));
        let snap = provider.snapshot("uni", "2025-fall").unwrap();
        assert_eq!(snap.total_sessions(), campus().total_sessions());
        assert!(matches!(
            provider.snapshot("nowhere", "2025-fall"),
            Err(EngineError::InvalidInput(_))
        ));
    }
}
