use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local memo of room id -> current extremity list. Populated on first
/// read from the extremity table and evicted by any mutation touching the
/// room, including external writers going through
/// `SqliteStore::invalidate_extremity_cache`. The cached order is the stable
/// insertion order of a single population, nothing more.
#[derive(Debug, Default)]
pub struct FrontierCache {
    rooms: Mutex<HashMap<String, Vec<String>>>,
}

impl FrontierCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: &str) -> Option<Vec<String>> {
        self.lock_rooms().get(room_id).cloned()
    }

    pub fn put(&self, room_id: &str, extremities: Vec<String>) {
        self.lock_rooms().insert(room_id.to_string(), extremities);
    }

    pub fn invalidate(&self, room_id: &str) {
        self.lock_rooms().remove(room_id);
    }

    pub fn is_cached(&self, room_id: &str) -> bool {
        self.lock_rooms().contains_key(room_id)
    }

    fn lock_rooms(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        // A panic while holding the lock leaves plain data behind; recover
        // rather than poisoning every later frontier read.
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_put_then_hit() {
        let cache = FrontierCache::new();
        assert_eq!(cache.get("room"), None);

        cache.put("room", vec!["a".to_string(), "b".to_string()]);
        assert!(cache.is_cached("room"));
        assert_eq!(
            cache.get("room"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn invalidation_is_per_room() {
        let cache = FrontierCache::new();
        cache.put("one", vec!["a".to_string()]);
        cache.put("two", vec!["b".to_string()]);

        cache.invalidate("one");
        assert!(!cache.is_cached("one"));
        assert_eq!(cache.get("two"), Some(vec!["b".to_string()]));
    }

    #[test]
    fn invalidating_an_uncached_room_is_a_no_op() {
        let cache = FrontierCache::new();
        cache.invalidate("never-seen");
        assert!(!cache.is_cached("never-seen"));
    }
}
