//! Reference-handle manager.
//!
//! DOM node identifiers handed out by the browser are ephemeral and only
//! meaningful within one tab. The ref store maps them to short opaque ref
//! strings so a later, stateless tool call can address an element observed
//! by an earlier read without re-querying the tree.
//!
//! Handles are scoped to one (session, tab) pair and invalidated in bulk
//! whenever that tab's DOM is re-read from scratch. A stale ref must fail
//! its lookup - it must never resolve to a different element - so ref ids
//! are never reissued within a tab, and the generation bump and map clear
//! happen in one critical section.

use parking_lot::Mutex;
use std::collections::HashMap;

/// What a ref stands for: one node observed in one snapshot of a tab.
#[derive(Debug, Clone)]
pub struct RefHandle {
    pub backend_node_id: i64,
    pub role: String,
    pub name: String,
    pub tag: Option<String>,
    pub text: Option<String>,
}

#[derive(Default)]
struct TabRefs {
    /// Bumped on every full invalidation.
    generation: u64,
    /// Monotonic within the tab so ids from a cleared generation can
    /// never collide with new ones.
    next_seq: u64,
    refs: HashMap<String, RefHandle>,
}

type TabKey = (String, String);

/// Injected store of reference handles, owned by the composition root.
#[derive(Default)]
pub struct RefStore {
    tabs: Mutex<HashMap<TabKey, TabRefs>>,
}

impl RefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its ref id, unique within the
    /// (session, tab) scope for the current generation.
    pub fn generate_ref(
        &self,
        session_id: &str,
        tab_id: &str,
        backend_node_id: i64,
        role: &str,
        name: &str,
        tag: Option<&str>,
        text: Option<&str>,
    ) -> String {
        let mut tabs = self.tabs.lock();
        let tab = tabs
            .entry((session_id.to_string(), tab_id.to_string()))
            .or_default();

        tab.next_seq += 1;
        let ref_id = format!("e{}", tab.next_seq);
        tab.refs.insert(
            ref_id.clone(),
            RefHandle {
                backend_node_id,
                role: role.to_string(),
                name: name.to_string(),
                tag: tag.map(str::to_string),
                text: text.map(str::to_string),
            },
        );
        ref_id
    }

    /// Resolve a ref back to its node id. Returns `None` (never an error)
    /// for unknown or expired refs so callers can produce a clean
    /// "ref not found" message.
    pub fn get_backend_node_id(&self, session_id: &str, tab_id: &str, ref_id: &str) -> Option<i64> {
        self.tabs
            .lock()
            .get(&(session_id.to_string(), tab_id.to_string()))
            .and_then(|tab| tab.refs.get(ref_id))
            .map(|handle| handle.backend_node_id)
    }

    /// Full handle lookup, for tools that render element descriptions.
    pub fn get_ref(&self, session_id: &str, tab_id: &str, ref_id: &str) -> Option<RefHandle> {
        self.tabs
            .lock()
            .get(&(session_id.to_string(), tab_id.to_string()))
            .and_then(|tab| tab.refs.get(ref_id))
            .cloned()
    }

    /// Invalidate the whole generation for a tab. Must be called before a
    /// fresh full-tree read so stale refs are never confused with the new
    /// snapshot.
    pub fn clear_target_refs(&self, session_id: &str, tab_id: &str) {
        let mut tabs = self.tabs.lock();
        if let Some(tab) = tabs.get_mut(&(session_id.to_string(), tab_id.to_string())) {
            tab.generation += 1;
            tab.refs.clear();
        }
    }

    /// Drop every tab entry belonging to a session. Called when the
    /// session is destroyed.
    pub fn clear_session_refs(&self, session_id: &str) {
        self.tabs.lock().retain(|(s, _), _| s != session_id);
    }

    /// Number of live refs for a tab.
    pub fn ref_count(&self, session_id: &str, tab_id: &str) -> usize {
        self.tabs
            .lock()
            .get(&(session_id.to_string(), tab_id.to_string()))
            .map(|tab| tab.refs.len())
            .unwrap_or(0)
    }

    /// Current generation for a tab; starts at 0 and bumps on each clear.
    pub fn generation(&self, session_id: &str, tab_id: &str) -> u64 {
        self.tabs
            .lock()
            .get(&(session_id.to_string(), tab_id.to_string()))
            .map(|tab| tab.generation)
            .unwrap_or(0)
    }
}
