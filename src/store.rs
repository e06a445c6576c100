//! Persistence for the group snapshot.
//!
//! Every write is a read-modify-write against the latest snapshot. Stores
//! reject a write whose snapshot revision is no longer current, so two writers
//! racing on the same group cannot silently overwrite each other; [`update`]
//! retries the whole cycle on fresh state instead.

use crate::error::{LedgerError, Result};
use crate::group::GroupState;
use crate::lifecycle::Lifecycle;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

/// Somewhere a group snapshot lives.
pub trait StateStore {
    /// Returns the latest snapshot, or a fresh group if nothing is stored yet.
    fn load(&self) -> Result<GroupState>;

    /// Stores `state` if its revision is still current and returns the new
    /// revision. Fails with [`LedgerError::StaleState`] otherwise.
    fn save(&self, state: &GroupState) -> Result<u64>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubled for each one after.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(50))
    }
}

/// Loads the group, applies `op` through a [`Lifecycle`] and saves the result.
///
/// Contention (a stale snapshot or a busy lock) restarts the cycle on freshly
/// loaded state, up to the policy's attempt limit. Errors from `op` and from
/// the final write are returned as-is. On success returns `op`'s value and the
/// snapshot as stored.
pub fn update<S, F, T>(store: &S, policy: &RetryPolicy, mut op: F) -> Result<(T, GroupState)>
where
    S: StateStore + ?Sized,
    F: FnMut(&mut Lifecycle) -> Result<T>,
{
    let mut attempt = 1;
    loop {
        let mut lifecycle = Lifecycle::new(store.load()?);
        let value = op(&mut lifecycle)?;
        let mut state = lifecycle.into_state();

        match store.save(&state) {
            Ok(revision) => {
                state.revision = revision;
                return Ok((value, state));
            }
            Err(e) if e.is_contention() && attempt < policy.max_attempts => {
                warn!("Attempt {}: {}, retrying", attempt, e);
                thread::sleep(policy.delay_for(attempt));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a group snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<GroupState>,
}

impl MemoryStore {
    pub fn new(state: GroupState) -> Self {
        MemoryStore {
            state: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<GroupState> {
        Ok(lock_ignoring_poison(&self.state).clone())
    }

    fn save(&self, state: &GroupState) -> Result<u64> {
        let mut current = lock_ignoring_poison(&self.state);
        if current.revision != state.revision {
            return Err(LedgerError::StaleState {
                expected: state.revision,
                found: current.revision,
            });
        }

        let mut next = state.clone();
        next.revision += 1;
        *current = next;
        Ok(current.revision)
    }
}

/// Keeps a group snapshot in a pretty-printed JSON file.
///
/// Writers in this process serialize on a mutex; writers in other processes
/// serialize on an exclusively created `<file>.lock` next to the data file.
/// A lock left behind by a writer that died is broken once it is older than
/// the store's stale-lock limit.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_policy: RetryPolicy,
    stale_lock_after: Duration,
    writer: Mutex<()>,
}

impl JsonFileStore {
    /// Locks older than this are assumed abandoned.
    pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore::with_lock_policy(path, RetryPolicy::default())
    }

    /// Uses `lock_policy` while waiting for another process's lock file.
    pub fn with_lock_policy(path: impl Into<PathBuf>, lock_policy: RetryPolicy) -> Self {
        JsonFileStore {
            path: path.into(),
            lock_policy,
            stale_lock_after: Self::DEFAULT_STALE_LOCK_AFTER,
            writer: Mutex::new(()),
        }
    }

    /// Breaks lock files older than `limit`. Must exceed the longest a save
    /// can take, or a live writer's lock may be broken.
    pub fn with_stale_lock_after(mut self, limit: Duration) -> Self {
        self.stale_lock_after = limit;
        self
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    fn read(&self) -> Result<GroupState> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist yet, starting empty", self.path.display());
                return Ok(GroupState::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<GroupState> {
        self.read()
    }

    fn save(&self, state: &GroupState) -> Result<u64> {
        let _writer = lock_ignoring_poison(&self.writer);
        let _lock = FileLock::acquire(self.lock_path(), &self.lock_policy, self.stale_lock_after)?;

        let current = self.read()?.revision;
        if current != state.revision {
            return Err(LedgerError::StaleState {
                expected: state.revision,
                found: current,
            });
        }

        let mut next = state.clone();
        next.revision = current + 1;

        let tmp_path = sibling(&self.path, "tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer_pretty(&mut writer, &next)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            "Wrote revision {} to {}",
            next.revision,
            self.path.display()
        );
        Ok(next.revision)
    }
}

/// `data.json` -> `data.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Written into the lock file so a stale lock can be dated and traced.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive lock held by the existence of a file; released on drop.
#[derive(Debug)]
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: PathBuf, policy: &RetryPolicy, stale_after: Duration) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let lock = FileLock { path };
                    let holder = LockHolder {
                        pid: process::id(),
                        acquired_at: Utc::now(),
                    };
                    serde_json::to_writer(&file, &holder)?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("{} is held, attempt {}", path.display(), attempt);
                    // Breaking a dead writer's lock doesn't count as an attempt.
                    if break_if_stale(&path, stale_after)? {
                        continue;
                    }
                    if attempt >= policy.max_attempts {
                        return Err(LedgerError::LockTimeout { path });
                    }
                    thread::sleep(policy.delay_for(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// How long the lock at `path` has been held, and by whom if it says.
///
/// The recorded acquisition time wins; a lock whose content can't be read yet
/// (its holder is still writing it, or it predates the format) is dated by
/// its modification time.
fn lock_age(path: &Path) -> io::Result<(Duration, Option<LockHolder>)> {
    let holder = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockHolder>(&bytes).ok());

    let age = match &holder {
        Some(holder) => (Utc::now() - holder.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => SystemTime::now()
            .duration_since(fs::metadata(path)?.modified()?)
            .unwrap_or(Duration::ZERO),
    };
    Ok((age, holder))
}

/// Removes the lock at `path` if it is older than `stale_after`.
///
/// The lock is first renamed aside and re-dated there, so a lock another
/// writer created in between is put back instead of removed. Returns `true`
/// when the caller should try to acquire again right away.
fn break_if_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    match lock_age(path) {
        Ok((age, _)) if age < stale_after => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    let aside = sibling(path, &format!("stale.{}", process::id()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    let (age, holder) = lock_age(&aside)?;
    if age < stale_after {
        debug!("{} was retaken, putting it back", path.display());
        if let Err(e) = fs::hard_link(&aside, path) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                fs::remove_file(&aside)?;
                return Err(e.into());
            }
        }
        fs::remove_file(&aside)?;
        return Ok(false);
    }

    fs::remove_file(&aside)?;
    match holder {
        Some(holder) => warn!(
            "Broke stale lock {} held by pid {} since {}",
            path.display(),
            holder.pid,
            holder.acquired_at
        ),
        None => warn!("Broke stale lock {} ({:?} old)", path.display(), age),
    }
    Ok(true)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Remembers the last snapshot it saw so reads survive a failing backend.
///
/// Writes are never served from the cache: a failed save is always returned.
#[derive(Debug)]
pub struct CachingStore<S> {
    inner: S,
    last_known: Mutex<Option<GroupState>>,
}

impl<S: StateStore> CachingStore<S> {
    pub fn new(inner: S) -> Self {
        CachingStore {
            inner,
            last_known: Mutex::new(None),
        }
    }
}

impl<S: StateStore> StateStore for CachingStore<S> {
    fn load(&self) -> Result<GroupState> {
        match self.inner.load() {
            Ok(state) => {
                *lock_ignoring_poison(&self.last_known) = Some(state.clone());
                Ok(state)
            }
            Err(e) => match lock_ignoring_poison(&self.last_known).clone() {
                Some(state) => {
                    warn!("Load failed ({}), using last known state", e);
                    Ok(state)
                }
                None => Err(e),
            },
        }
    }

    fn save(&self, state: &GroupState) -> Result<u64> {
        let revision = self.inner.save(state)?;
        let mut stored = state.clone();
        stored.revision = revision;
        *lock_ignoring_poison(&self.last_known) = Some(stored);
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_retry_policy_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_memory_store_rejects_stale_write() {
        let store = MemoryStore::new(GroupState::new());
        let first = store.load().unwrap();
        let second = store.load().unwrap();

        assert_eq!(store.save(&first).unwrap(), 1);
        assert!(matches!(
            store.save(&second),
            Err(LedgerError::StaleState {
                expected: 0,
                found: 1
            })
        ));
    }

    #[test]
    fn test_update_persists_changes() {
        let store = MemoryStore::default();

        let (id, state) = update(&store, &fast_policy(), |l| l.add_person("Dana")).unwrap();

        assert_eq!(state.revision, 1);
        assert_eq!(store.load().unwrap().person(&id).unwrap().name, "Dana");
    }

    #[test]
    fn test_update_returns_op_error_without_saving() {
        let store = MemoryStore::default();

        let err = update(&store, &fast_policy(), |l| l.add_person(" ")).unwrap_err();

        assert!(matches!(err, LedgerError::InvalidInput { .. }));
        assert_eq!(store.load().unwrap().revision, 0);
    }

    type Race = Box<dyn Fn(&mut GroupState) -> Result<()>>;

    /// Lets another writer apply `race` right after each load, a fixed number
    /// of times, so the caller's save goes stale.
    struct RacingStore {
        inner: MemoryStore,
        races_left: Cell<u32>,
        race: Race,
    }

    impl RacingStore {
        fn new(state: GroupState, races: u32, race: Race) -> Self {
            RacingStore {
                inner: MemoryStore::new(state),
                races_left: Cell::new(races),
                race,
            }
        }

        fn adding_people(races: u32) -> Self {
            RacingStore::new(
                GroupState::new(),
                races,
                Box::new(|other| other.add_person("Intruder").map(|_| ())),
            )
        }
    }

    impl StateStore for RacingStore {
        fn load(&self) -> Result<GroupState> {
            let state = self.inner.load()?;
            if self.races_left.get() > 0 {
                self.races_left.set(self.races_left.get() - 1);
                let mut other = state.clone();
                (self.race)(&mut other)?;
                self.inner.save(&other)?;
            }
            Ok(state)
        }

        fn save(&self, state: &GroupState) -> Result<u64> {
            self.inner.save(state)
        }
    }

    #[test]
    fn test_update_retries_on_fresh_state() {
        let store = RacingStore::adding_people(1);

        let (_, state) = update(&store, &fast_policy(), |l| l.add_person("Dana")).unwrap();

        let names: Vec<&str> = state.users.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Intruder", "Dana"]);
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn test_update_gives_up_after_max_attempts() {
        let store = RacingStore::adding_people(10);

        let err = update(&store, &fast_policy(), |l| l.add_person("Dana")).unwrap_err();

        assert!(matches!(err, LedgerError::StaleState { .. }));
    }

    #[test]
    fn test_settlement_retries_against_a_ride_added_meanwhile() {
        let mut seed = GroupState::new();
        let dana = seed.add_person("Dana").unwrap();
        let avi = seed.add_person("Avi").unwrap();
        seed.add_ride(&dana, &[avi.clone()], Decimal::from(10), Utc::now())
            .unwrap();

        let store = RacingStore::new(
            seed,
            1,
            Box::new(move |other| {
                other
                    .add_ride(&avi, &[dana.clone()], Decimal::from(4), Utc::now())
                    .map(|_| ())
            }),
        );

        let (settled, state) = update(&store, &fast_policy(), |l| {
            l.recompute()?;
            l.confirm_settlement()
        })
        .unwrap();

        assert_eq!(settled, 2);
        assert!(state.rides.is_empty());
        assert_eq!(state.historic_rides.len(), 2);
        assert_eq!(state.revision, 2);
        assert_eq!(store.load().unwrap(), state);
    }

    /// Fails one load out of the sequence, and bumps the revision behind the
    /// caller's back on the first.
    struct FlakyStore {
        inner: MemoryStore,
        loads: Cell<u32>,
    }

    impl StateStore for FlakyStore {
        fn load(&self) -> Result<GroupState> {
            self.loads.set(self.loads.get() + 1);
            match self.loads.get() {
                1 => {
                    let state = self.inner.load()?;
                    let mut other = state.clone();
                    other.add_person("Intruder")?;
                    self.inner.save(&other)?;
                    Ok(state)
                }
                2 => Err(io::Error::new(io::ErrorKind::Other, "backend unavailable").into()),
                _ => self.inner.load(),
            }
        }

        fn save(&self, state: &GroupState) -> Result<u64> {
            self.inner.save(state)
        }
    }

    #[test]
    fn test_update_through_cache_survives_failed_read() {
        let store = CachingStore::new(FlakyStore {
            inner: MemoryStore::default(),
            loads: Cell::new(0),
        });

        let (_, state) = update(&store, &fast_policy(), |l| l.add_person("Dana")).unwrap();

        let names: Vec<&str> = state.users.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Intruder", "Dana"]);
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn test_json_store_missing_file_is_empty_group() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("group.json"));

        assert_eq!(store.load().unwrap(), GroupState::default());
    }

    #[test]
    fn test_json_store_round_trip_and_lock_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        let store = JsonFileStore::new(&path);

        let mut state = store.load().unwrap();
        state.add_person("Dana").unwrap();
        assert_eq!(store.save(&state).unwrap(), 1);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.users[0].name, "Dana");
        assert!(!dir.path().join("group.json.lock").exists());
        assert!(!dir.path().join("group.json.tmp").exists());

        assert!(matches!(
            store.save(&state),
            Err(LedgerError::StaleState { .. })
        ));
    }

    #[test]
    fn test_json_store_reads_camel_case_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        fs::write(
            &path,
            r#"{
                "users": [{"id": "d", "name": "Dana", "pricePerKm": 1.2}],
                "rides": [],
                "historicRides": [],
                "settings": {"pricePerKm": 1.0, "defaultDistance": 10.0}
            }"#,
        )
        .unwrap();

        let state = JsonFileStore::new(&path).load().unwrap();

        assert_eq!(state.revision, 0);
        assert_eq!(state.users[0].name, "Dana");
    }

    #[test]
    fn test_json_store_times_out_on_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        fs::write(dir.path().join("group.json.lock"), "").unwrap();
        let store = JsonFileStore::with_lock_policy(&path, fast_policy());

        let err = store.save(&GroupState::default()).unwrap_err();

        assert!(matches!(err, LedgerError::LockTimeout { .. }));
        assert!(err.is_contention());
        assert!(!path.exists());
    }

    #[test]
    fn test_json_store_records_lock_holder() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("group.json.lock");

        let lock = FileLock::acquire(lock_path.clone(), &fast_policy(), Duration::from_secs(60))
            .unwrap();
        let (age, holder) = lock_age(&lock_path).unwrap();

        assert_eq!(holder.unwrap().pid, process::id());
        assert!(age < Duration::from_secs(60));
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_json_store_breaks_stale_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        let lock_path = dir.path().join("group.json.lock");
        let abandoned = LockHolder {
            pid: 4_000_000,
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        fs::write(&lock_path, serde_json::to_vec(&abandoned).unwrap()).unwrap();
        let store = JsonFileStore::with_lock_policy(&path, RetryPolicy::new(1, Duration::ZERO))
            .with_stale_lock_after(Duration::from_secs(60));

        let mut state = store.load().unwrap();
        state.add_person("Dana").unwrap();

        assert_eq!(store.save(&state).unwrap(), 1);
        assert!(!lock_path.exists());
        assert_eq!(store.load().unwrap().users[0].name, "Dana");
    }

    #[test]
    fn test_json_store_keeps_recent_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        let lock_path = dir.path().join("group.json.lock");
        let live = LockHolder {
            pid: 4_000_000,
            acquired_at: Utc::now(),
        };
        fs::write(&lock_path, serde_json::to_vec(&live).unwrap()).unwrap();
        let store = JsonFileStore::with_lock_policy(&path, fast_policy())
            .with_stale_lock_after(Duration::from_secs(3600));

        let err = store.save(&GroupState::default()).unwrap_err();

        assert!(matches!(err, LedgerError::LockTimeout { .. }));
        assert!(lock_path.exists());
    }

    #[test]
    fn test_json_store_breaks_unreadable_lock_by_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        let lock_path = dir.path().join("group.json.lock");
        fs::write(&lock_path, "").unwrap();
        let store = JsonFileStore::with_lock_policy(&path, fast_policy())
            .with_stale_lock_after(Duration::ZERO);

        assert_eq!(store.save(&GroupState::default()).unwrap(), 1);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_json_store_surfaces_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(LedgerError::Json(_))
        ));
    }

    #[test]
    fn test_caching_store_falls_back_on_read_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.json");
        let store = CachingStore::new(JsonFileStore::new(&path));

        let mut state = store.load().unwrap();
        state.add_person("Dana").unwrap();
        store.save(&state).unwrap();

        fs::write(&path, "not json").unwrap();

        let fallback = store.load().unwrap();
        assert_eq!(fallback.revision, 1);
        assert_eq!(fallback.users[0].name, "Dana");

        // Writes still go to the backend and report its failure.
        assert!(store.save(&fallback).is_err());
    }
}
