//! Shared 60s-TTL group member cache, consulted both by group fan-out
//! (send) and the receive pipeline's membership check.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GroupMember {
    pub username: String,
    pub public_key: String,
}

struct CachedMembers {
    members: Vec<GroupMember>,
    fetched_at: Instant,
}

pub struct GroupMemberCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CachedMembers>>,
}

impl GroupMemberCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_fresh(&self, community: &str, group_id: &str) -> Option<Vec<GroupMember>> {
        let entries = self.entries.lock().expect("member cache mutex poisoned");
        entries
            .get(&(community.to_string(), group_id.to_string()))
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.members.clone())
    }

    pub fn put(&self, community: &str, group_id: &str, members: Vec<GroupMember>) {
        self.entries
            .lock()
            .expect("member cache mutex poisoned")
            .insert(
                (community.to_string(), group_id.to_string()),
                CachedMembers {
                    members,
                    fetched_at: Instant::now(),
                },
            );
    }

    pub fn invalidate(&self, community: &str, group_id: &str) {
        self.entries
            .lock()
            .expect("member cache mutex poisoned")
            .remove(&(community.to_string(), group_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_returned_stale_entry_is_not() {
        let cache = GroupMemberCache::new(Duration::from_millis(20));
        cache.put(
            "home",
            "team",
            vec![GroupMember {
                username: "bob".into(),
                public_key: "xyz".into(),
            }],
        );
        assert!(cache.get_fresh("home", "team").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get_fresh("home", "team").is_none());
    }
}
