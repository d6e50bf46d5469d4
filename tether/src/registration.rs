use std::{
    collections::BTreeMap,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::mutex::Mutex;

/// Route a channel pre-registered for repeated calls
///
/// The table owns its copies of the method and authority, so a route stays valid for as long as
/// any call or handle refers to it.
#[derive(Debug, PartialEq, Eq)]
pub struct RegisteredCall {
    method: Arc<str>,
    authority: Option<Arc<str>>,
}

impl RegisteredCall {
    /// Method path
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Authority override
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub(crate) fn method_arc(&self) -> &Arc<str> {
        &self.method
    }

    pub(crate) fn authority_arc(&self) -> Option<&Arc<str>> {
        self.authority.as_ref()
    }
}

/// Handle returned by [`Channel::register_call`](crate::Channel::register_call)
///
/// Two handles are equal exactly when they refer to the same table entry.
#[derive(Clone)]
pub struct RouteHandle(Arc<RegisteredCall>);

impl RouteHandle {
    /// Whether both handles refer to the same table entry
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for RouteHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for RouteHandle {}

impl Deref for RouteHandle {
    type Target = RegisteredCall;

    fn deref(&self) -> &RegisteredCall {
        &self.0
    }
}

impl fmt::Debug for RouteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteHandle").field(&*self.0).finish()
    }
}

/// Per-channel table of registered `(method, authority)` pairs
///
/// Entries are only ever added; an entry is never removed or changed while the channel lives.
#[derive(Debug, Default)]
pub(crate) struct CallRegistrationTable {
    entries: Mutex<BTreeMap<(String, Option<String>), Arc<RegisteredCall>>>,
    attempts: AtomicU64,
}

impl CallRegistrationTable {
    /// Return the entry for `(method, host)`, inserting it if needed
    pub(crate) fn register(&self, method: &str, host: Option<&str>) -> RouteHandle {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock("register");
        let entry = entries
            .entry((method.to_owned(), host.map(str::to_owned)))
            .or_insert_with(|| {
                Arc::new(RegisteredCall {
                    method: method.into(),
                    authority: host.map(Into::into),
                })
            });
        RouteHandle(entry.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock("len").len()
    }

    /// Calls to [`register`](Self::register) so far, including repeats
    pub(crate) fn registration_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn repeated_registration_returns_same_entry() {
        let table = CallRegistrationTable::default();
        let a = table.register("/echo.Echo/Say", None);
        let b = table.register("/echo.Echo/Say", None);
        let c = table.register("/echo.Echo/Say", Some("override.example"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.registration_attempts(), 3);
        assert_eq!(c.authority(), Some("override.example"));
    }

    #[test]
    fn entries_outlive_caller_strings() {
        let table = CallRegistrationTable::default();
        let handle = {
            let method = String::from("/transient.Service/Method");
            table.register(&method, None)
        };
        assert_eq!(handle.method(), "/transient.Service/Method");
    }

    #[test]
    fn concurrent_registration_converges() {
        let table = Arc::new(CallRegistrationTable::default());
        let handles = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || table.register("/a.B/C", None))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|x| x.join().unwrap())
            .collect::<Vec<_>>();
        assert!(handles.windows(2).all(|x| x[0] == x[1]));
        assert_eq!(table.len(), 1);
    }
}
