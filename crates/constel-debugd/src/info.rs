use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use constel_core::protocol::debugd::InfoEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InfoError {
    #[error("info not set")]
    NotSet,
    #[error("info already set")]
    AlreadySet,
}

/// Callback run once the map has been received.
pub type Trigger = Box<dyn Fn(&InfoMap) + Send + Sync>;

/// Key/value information handed to debugd once per boot.
///
/// The map moves from unset to set exactly once; triggers registered before
/// that run right after it, triggers registered later run immediately.
#[derive(Default)]
pub struct InfoMap {
    inner: RwLock<Option<BTreeMap<String, String>>>,
    triggers: Mutex<Vec<Trigger>>,
}

impl InfoMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, InfoError> {
        match &*self.read() {
            Some(map) => Ok(map.get(key).cloned()),
            None => Err(InfoError::NotSet),
        }
    }

    pub fn get_copy(&self) -> Result<BTreeMap<String, String>, InfoError> {
        self.read().clone().ok_or(InfoError::NotSet)
    }

    /// Entries in key order, as sent on the wire.
    pub fn get_proto(&self) -> Result<Vec<InfoEntry>, InfoError> {
        Ok(self
            .get_copy()?
            .into_iter()
            .map(|(key, value)| InfoEntry { key, value })
            .collect())
    }

    pub fn received(&self) -> bool {
        self.read().is_some()
    }

    /// Set the map from wire entries; later duplicates of a key win.
    pub fn set_proto(&self, entries: Vec<InfoEntry>) -> Result<(), InfoError> {
        {
            let mut inner = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.is_some() {
                return Err(InfoError::AlreadySet);
            }
            let map: BTreeMap<String, String> =
                entries.into_iter().map(|e| (e.key, e.value)).collect();
            info!(keys = map.len(), "Info map received");
            *inner = Some(map);
        }

        // Triggers may read the map, so the lock is released first.
        let triggers = std::mem::take(&mut *self.lock_triggers());
        for trigger in &triggers {
            trigger(self);
        }
        Ok(())
    }

    pub fn register_on_receive_trigger(&self, trigger: Trigger) {
        if self.received() {
            debug!("Info already received, running trigger now");
            trigger(self);
            return;
        }
        let mut triggers = self.lock_triggers();
        // Re-check under the trigger lock: set_proto may have drained it meanwhile.
        if self.received() {
            drop(triggers);
            trigger(self);
            return;
        }
        triggers.push(trigger);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<BTreeMap<String, String>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_triggers(&self) -> std::sync::MutexGuard<'_, Vec<Trigger>> {
        match self.triggers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_get_before_set_fails() {
        let map = InfoMap::new();
        assert_eq!(map.get("logcollect"), Err(InfoError::NotSet));
        assert_eq!(map.get_copy(), Err(InfoError::NotSet));
        assert!(!map.received());
    }

    #[test]
    fn test_set_once() {
        let map = InfoMap::new();
        map.set_proto(vec![InfoEntry::new("logcollect", "true")])
            .unwrap();
        assert_eq!(map.get("logcollect").unwrap().as_deref(), Some("true"));
        assert_eq!(map.get("missing").unwrap(), None);

        let err = map
            .set_proto(vec![InfoEntry::new("logcollect", "false")])
            .unwrap_err();
        assert_eq!(err, InfoError::AlreadySet);
        assert_eq!(map.get("logcollect").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn test_empty_set_counts_as_received() {
        let map = InfoMap::new();
        map.set_proto(vec![]).unwrap();
        assert!(map.received());
        assert!(map.get_copy().unwrap().is_empty());
    }

    #[test]
    fn test_triggers_run_once_after_set() {
        let map = InfoMap::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        map.register_on_receive_trigger(Box::new(move |m| {
            // The map is readable from inside a trigger.
            assert!(m.get("k").unwrap().is_some());
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        map.set_proto(vec![InfoEntry::new("k", "v")]).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let _ = map.set_proto(vec![]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_registered_after_set_runs_immediately() {
        let map = InfoMap::new();
        map.set_proto(vec![]).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        map.register_on_receive_trigger(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_proto_is_sorted() {
        let map = InfoMap::new();
        map.set_proto(vec![InfoEntry::new("b", "2"), InfoEntry::new("a", "1")])
            .unwrap();
        assert_eq!(
            map.get_proto().unwrap(),
            vec![InfoEntry::new("a", "1"), InfoEntry::new("b", "2")]
        );
    }
}
