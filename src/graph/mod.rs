use std::collections::HashMap;

/// An event as the frontier engine sees it. Signing, content, and the
/// authorization step that decides `soft_failed` all live outside this crate;
/// once created an event is immutable and never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_id: String,
    pub room_id: String,
    pub prev_event_ids: Vec<String>,
    pub soft_failed: bool,
    pub received_at: String,
}

#[derive(Debug)]
pub enum GraphError {
    /// A referenced event id is absent from the store.
    NotFound(String),
    /// Detected graph inconsistency, e.g. a reachability cycle.
    Invariant(String),
    Storage(rusqlite::Error),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(event_id) => write!(f, "unknown event `{event_id}`"),
            Self::Invariant(message) => write!(f, "graph invariant violated: {message}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<rusqlite::Error> for GraphError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value)
    }
}

impl GraphError {
    /// Busy/locked conditions are worth retrying with backoff; everything else
    /// is either a caller error or a real fault.
    pub fn is_transient(&self) -> bool {
        let Self::Storage(rusqlite::Error::SqliteFailure(err, _)) = self else {
            return false;
        };
        matches!(
            err.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

/// Read-only view of the event DAG. Implementations must reflect committed
/// events only and be safe to call from concurrent readers.
pub trait EventGraph {
    /// Prev-events of an event; `NotFound` if the event is unknown.
    fn predecessors(&self, event_id: &str) -> Result<Vec<String>, GraphError>;
    /// Events whose prev-events include `event_id`; empty if none, never an error.
    fn children(&self, event_id: &str) -> Result<Vec<String>, GraphError>;
    fn is_soft_failed(&self, event_id: &str) -> Result<bool, GraphError>;
    fn room(&self, event_id: &str) -> Result<String, GraphError>;
}

#[derive(Debug)]
struct MemoryEvent {
    room_id: String,
    prev_event_ids: Vec<String>,
    soft_failed: bool,
}

/// In-memory graph used to exercise the validity rule without a store. Edges
/// are taken as given, so tests can build malformed graphs (dangling prevs,
/// cycles) that the SQLite insert path would reject.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    events: HashMap<String, MemoryEvent>,
    children: HashMap<String, Vec<String>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event_id: &str, room_id: &str, prev: &[&str], soft_failed: bool) {
        self.events.insert(
            event_id.to_string(),
            MemoryEvent {
                room_id: room_id.to_string(),
                prev_event_ids: prev.iter().map(|id| id.to_string()).collect(),
                soft_failed,
            },
        );
        for parent in prev {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(event_id.to_string());
        }
    }

    fn event(&self, event_id: &str) -> Result<&MemoryEvent, GraphError> {
        self.events
            .get(event_id)
            .ok_or_else(|| GraphError::NotFound(event_id.to_string()))
    }
}

impl EventGraph for MemoryGraph {
    fn predecessors(&self, event_id: &str) -> Result<Vec<String>, GraphError> {
        Ok(self.event(event_id)?.prev_event_ids.clone())
    }

    fn children(&self, event_id: &str) -> Result<Vec<String>, GraphError> {
        Ok(self.children.get(event_id).cloned().unwrap_or_default())
    }

    fn is_soft_failed(&self, event_id: &str) -> Result<bool, GraphError> {
        Ok(self.event(event_id)?.soft_failed)
    }

    fn room(&self, event_id: &str) -> Result<String, GraphError> {
        Ok(self.event(event_id)?.room_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_is_the_inverse_of_prev_events() {
        let mut graph = MemoryGraph::new();
        graph.add_event("a", "room", &[], false);
        graph.add_event("b", "room", &["a"], false);
        graph.add_event("c", "room", &["a", "b"], true);

        assert_eq!(
            graph.children("a").expect("children of a"),
            vec!["b".to_string(), "c".to_string()]
        );
        assert_eq!(graph.children("b").expect("children of b"), vec!["c".to_string()]);
        assert!(graph.children("c").expect("children of c").is_empty());
        assert_eq!(
            graph.predecessors("c").expect("prevs of c"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn unknown_event_is_not_found_but_unknown_children_are_empty() {
        let graph = MemoryGraph::new();
        assert!(matches!(
            graph.is_soft_failed("ghost"),
            Err(GraphError::NotFound(_))
        ));
        assert!(matches!(graph.room("ghost"), Err(GraphError::NotFound(_))));
        assert!(graph.children("ghost").expect("children query").is_empty());
    }

    #[test]
    fn soft_fail_flag_round_trips() {
        let mut graph = MemoryGraph::new();
        graph.add_event("real", "room", &[], false);
        graph.add_event("failed", "room", &["real"], true);

        assert!(!graph.is_soft_failed("real").expect("real flag"));
        assert!(graph.is_soft_failed("failed").expect("failed flag"));
        assert_eq!(graph.room("failed").expect("room"), "room");
    }
}
