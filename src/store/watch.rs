use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Called with the newly resolved value at the watched path (`None` once nothing authorized is
/// left there). Always called from the database's event loop, never concurrently with itself.
pub type WatchCallback = Box<dyn FnMut(Option<&Value>) + Send + 'static>;

/// WatchHandle keeps a watch registered. Dropping it unregisters the callback.
#[must_use = "the watch is unregistered as soon as the handle is dropped"]
pub struct WatchHandle {
    _alive: Arc<()>,
}

impl WatchHandle {
    pub fn unwatch(self) {}
}

/// Which paths may have resolved differently after a batch was applied.
pub(crate) enum ChangedPaths {
    /// Authorization changed, so any path could resolve differently.
    All,
    Some(HashSet<String>),
}

impl ChangedPaths {
    pub(crate) fn none() -> Self {
        ChangedPaths::Some(HashSet::new())
    }

    pub(crate) fn insert(&mut self, path: String) {
        if let ChangedPaths::Some(paths) = self {
            paths.insert(path);
        }
    }

    pub(crate) fn set_all(&mut self) {
        *self = ChangedPaths::All;
    }

    fn contains(&self, path: &str) -> bool {
        match self {
            ChangedPaths::All => true,
            ChangedPaths::Some(paths) => paths.contains(path),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, ChangedPaths::Some(paths) if paths.is_empty())
    }
}

struct Watcher {
    path: String,
    callback: WatchCallback,
    // Value most recently delivered (or current at registration). Used to deliver each distinct
    // value at most once.
    last_value: Option<Value>,
    alive: Weak<()>,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    watchers: Vec<Watcher>,
}

impl WatchRegistry {
    pub(crate) fn register(&mut self, path: String, callback: WatchCallback, current: Option<Value>) -> WatchHandle {
        let alive = Arc::new(());
        self.watchers.push(Watcher {
            path,
            callback,
            last_value: current,
            alive: Arc::downgrade(&alive),
        });

        WatchHandle { _alive: alive }
    }

    /// Runs once per applied batch, so entries arriving together produce at most one callback per
    /// watcher.
    pub(crate) fn dispatch<R>(&mut self, changed: &ChangedPaths, resolve: R)
    where
        R: Fn(&str) -> Option<Value>,
    {
        self.watchers.retain(|watcher| watcher.alive.strong_count() > 0);
        if changed.is_empty() {
            return;
        }

        for watcher in self.watchers.iter_mut() {
            if !changed.contains(&watcher.path) {
                continue;
            }

            let resolved = resolve(&watcher.path);
            if resolved != watcher.last_value {
                (watcher.callback)(resolved.as_ref());
                watcher.last_value = resolved;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_callback() -> (WatchCallback, Arc<Mutex<Vec<Option<Value>>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let callback: WatchCallback = Box::new(move |value| sink.lock().unwrap().push(value.cloned()));
        (callback, seen)
    }

    fn changed(paths: &[&str]) -> ChangedPaths {
        ChangedPaths::Some(paths.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn fires_once_per_distinct_value() {
        let mut registry = WatchRegistry::default();
        let (callback, seen) = recording_callback();
        let _handle = registry.register("/p".to_string(), callback, None);

        registry.dispatch(&changed(&["/p"]), |_| Some(json!(1)));
        registry.dispatch(&changed(&["/p"]), |_| Some(json!(1)));
        registry.dispatch(&ChangedPaths::All, |_| Some(json!(2)));
        registry.dispatch(&changed(&["/other"]), |_| Some(json!(3)));

        assert_eq!(vec![Some(json!(1)), Some(json!(2))], *seen.lock().unwrap());
    }

    #[test]
    fn no_callback_for_value_current_at_registration() {
        let mut registry = WatchRegistry::default();
        let (callback, seen) = recording_callback();
        let _handle = registry.register("/p".to_string(), callback, Some(json!("x")));

        registry.dispatch(&changed(&["/p"]), |_| Some(json!("x")));
        assert!(seen.lock().unwrap().is_empty());

        registry.dispatch(&changed(&["/p"]), |_| None);
        assert_eq!(vec![None], *seen.lock().unwrap());
    }

    #[test]
    fn dropping_handle_unregisters() {
        let mut registry = WatchRegistry::default();
        let (callback, seen) = recording_callback();
        let handle = registry.register("/p".to_string(), callback, None);

        handle.unwatch();
        registry.dispatch(&changed(&["/p"]), |_| Some(json!(1)));

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(0, registry.len());
    }
}
