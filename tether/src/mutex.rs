use std::{
    fmt,
    ops::{Deref, DerefMut},
};

#[cfg(feature = "lock_tracking")]
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Locks held or awaited at least this long are reported
#[cfg(feature = "lock_tracking")]
const SLOW_LOCK: Duration = Duration::from_millis(1);

/// Owners remembered for diagnostics
#[cfg(feature = "lock_tracking")]
const MAX_OWNERS: usize = 16;

/// Mutex over connection, queue and table state
///
/// Every acquisition names its purpose. With the `lock_tracking` feature, the most recent
/// owners are remembered and slow acquisitions or long critical sections are logged along with
/// them.
pub(crate) struct Mutex<T> {
    inner: std::sync::Mutex<Slot<T>>,
}

struct Slot<T> {
    #[cfg(feature = "lock_tracking")]
    owners: VecDeque<(&'static str, Duration)>,
    value: T,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(Slot {
                #[cfg(feature = "lock_tracking")]
                owners: VecDeque::new(),
                value,
            }),
        }
    }

    /// Acquire the lock on behalf of `purpose`
    pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
        #[cfg(feature = "lock_tracking")]
        let requested = Instant::now();
        let guard = self.inner.lock().unwrap();
        #[cfg(feature = "lock_tracking")]
        let acquired = {
            let acquired = Instant::now();
            let waited = acquired.duration_since(requested);
            if waited >= SLOW_LOCK {
                tracing::warn!(
                    purpose,
                    ?waited,
                    owners = ?guard.owners,
                    "slow lock acquisition"
                );
            }
            acquired
        };
        #[cfg(not(feature = "lock_tracking"))]
        let _ = purpose;

        MutexGuard {
            guard,
            #[cfg(feature = "lock_tracking")]
            acquired,
            #[cfg(feature = "lock_tracking")]
            purpose,
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(slot) => f.debug_tuple("Mutex").field(&slot.value).finish(),
            Err(_) => f.write_str("Mutex(<locked>)"),
        }
    }
}

pub(crate) struct MutexGuard<'a, T> {
    guard: std::sync::MutexGuard<'a, Slot<T>>,
    #[cfg(feature = "lock_tracking")]
    acquired: Instant,
    #[cfg(feature = "lock_tracking")]
    purpose: &'static str,
}

#[cfg(feature = "lock_tracking")]
impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held >= SLOW_LOCK {
            tracing::warn!(purpose = self.purpose, ?held, "lock held for a long time");
        }
        let owners = &mut self.guard.owners;
        if owners.len() == MAX_OWNERS {
            owners.pop_back();
        }
        owners.push_front((self.purpose, held));
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}
