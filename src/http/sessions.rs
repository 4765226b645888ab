//! In-memory chat session table with LRU eviction.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::session::ConversationState;

/// Shared handle to one session's history. The per-session mutex
/// serializes concurrent messages to the same session so turns land
/// in send order.
pub type SessionHandle = Arc<Mutex<ConversationState>>;

/// Summary row for the session listing endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub message_count: usize,
}

/// Bounded map of live chat sessions.
///
/// Capacity is fixed at construction; inserting past it evicts the
/// least recently used session. Callers holding a `SessionHandle` to
/// an evicted session keep a working handle, it just stops being
/// listed or reachable by id.
pub struct SessionTable {
    inner: Mutex<LruCache<String, SessionHandle>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a session, marking it most recently used.
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.lock().await.get(session_id).cloned()
    }

    /// Look up a session, creating an empty one under `session_id` if
    /// it does not exist.
    pub async fn get_or_create(&self, session_id: &str) -> SessionHandle {
        let mut table = self.inner.lock().await;
        if let Some(handle) = table.get(session_id) {
            return Arc::clone(handle);
        }
        let handle: SessionHandle = Arc::new(Mutex::new(ConversationState::new()));
        table.put(session_id.to_string(), Arc::clone(&handle));
        handle
    }

    /// Remove a session. Returns `false` if the id was unknown.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.inner.lock().await.pop(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Summaries of all live sessions, most recently used first.
    ///
    /// Snapshots the handles first so the table lock is not held while
    /// waiting on per-session locks.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let snapshot: Vec<(String, SessionHandle)> = {
            let table = self.inner.lock().await;
            table
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect()
        };

        let mut summaries = Vec::with_capacity(snapshot.len());
        for (session_id, handle) in snapshot {
            let state = handle.lock().await;
            summaries.push(SessionSummary {
                session_id,
                title: title_for(&state),
                message_count: state.message_count(),
            });
        }
        summaries
    }
}

/// Derive a listing title from the first user message.
fn title_for(state: &ConversationState) -> String {
    match state.first_user_content() {
        Some(content) => {
            let content = content.trim();
            if content.chars().count() > 50 {
                let truncated: String = content.chars().take(50).collect();
                format!("{truncated}...")
            } else {
                content.to_string()
            }
        }
        None => "New Chat".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChatTurn;

    #[tokio::test]
    async fn get_or_create_reuses_existing() {
        let table = SessionTable::new(4);
        let a = table.get_or_create("s1").await;
        a.lock().await.push(ChatTurn::user("hello"));

        let b = table.get_or_create("s1").await;
        assert_eq!(b.lock().await.len(), 1);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let table = SessionTable::new(2);
        table.get_or_create("s1").await;
        table.get_or_create("s2").await;
        // Touch s1 so s2 becomes the eviction candidate.
        table.get("s1").await.unwrap();
        table.get_or_create("s3").await;

        assert_eq!(table.len().await, 2);
        assert!(table.get("s1").await.is_some());
        assert!(table.get("s2").await.is_none());
        assert!(table.get("s3").await.is_some());
    }

    #[tokio::test]
    async fn remove_reports_unknown_ids() {
        let table = SessionTable::new(4);
        table.get_or_create("s1").await;
        assert!(table.remove("s1").await);
        assert!(!table.remove("s1").await);
    }

    #[tokio::test]
    async fn summaries_use_first_user_message_as_title() {
        let table = SessionTable::new(4);
        let handle = table.get_or_create("s1").await;
        {
            let mut state = handle.lock().await;
            state.push(ChatTurn::user("what invoices are due this week?"));
            state.push(ChatTurn::assistant("two of them"));
        }

        let summaries = table.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].title, "what invoices are due this week?");
        assert_eq!(summaries[0].message_count, 2);
    }

    #[tokio::test]
    async fn long_titles_are_truncated() {
        let table = SessionTable::new(4);
        let handle = table.get_or_create("s1").await;
        handle.lock().await.push(ChatTurn::user(&"x".repeat(80)));

        let summaries = table.summaries().await;
        assert_eq!(summaries[0].title.chars().count(), 53);
        assert!(summaries[0].title.ends_with("..."));
    }

    #[tokio::test]
    async fn empty_session_titled_new_chat() {
        let table = SessionTable::new(4);
        table.get_or_create("s1").await;
        let summaries = table.summaries().await;
        assert_eq!(summaries[0].title, "New Chat");
    }
}
