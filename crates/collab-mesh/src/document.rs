/// History steps, selections and the document engine seam
/// The engine owns how a step mutates the document; this crate only moves steps around.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::{ClientId, StepId};

/// One atomic, causally ordered document mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStep {
    pub id: StepId,

    /// Client that produced the step
    pub client_id: ClientId,

    /// Step this one was produced on top of
    pub parent_id: Option<StepId>,

    /// Opaque payload interpreted by the document engine
    pub operations: serde_json::Value,
}

impl HistoryStep {
    pub fn new(
        client_id: ClientId,
        parent_id: Option<StepId>,
        operations: serde_json::Value,
    ) -> Self {
        Self {
            id: StepId::new(),
            client_id,
            parent_id,
            operations,
        }
    }
}

/// Cursor/selection as understood by the document engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: serde_json::Value,
    pub focus: serde_json::Value,
}

impl Selection {
    pub fn new(anchor: serde_json::Value, focus: serde_json::Value) -> Self {
        Self { anchor, focus }
    }

    /// Collapsed selection (plain caret)
    pub fn caret(position: serde_json::Value) -> Self {
        Self {
            anchor: position.clone(),
            focus: position,
        }
    }
}

/// A remote client's selection, enriched with how to display it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborativeSelection {
    pub client_id: ClientId,
    pub selection: Selection,
    pub client_name: Option<String>,
    pub client_avatar_url: Option<String>,
}

/// Full document state as held by the server: branch ids plus rendered content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub history_ids: Vec<StepId>,
    pub content: String,
}

impl DocumentSnapshot {
    pub fn new(history_ids: Vec<StepId>, content: impl Into<String>) -> Self {
        Self {
            history_ids,
            content: content.into(),
        }
    }

    pub fn head(&self) -> Option<&StepId> {
        self.history_ids.last()
    }
}

/// Answer to a missing-steps query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MissingStepsWire", into = "MissingStepsWire")]
pub enum MissingSteps {
    /// Ordered steps between the requested bounds (may be empty)
    Steps(Vec<HistoryStep>),

    /// The history diverged or was snapshotted past the requested point
    Unavailable,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MissingStepsWire {
    Steps(Vec<HistoryStep>),
    Sentinel(i64),
}

impl From<MissingStepsWire> for MissingSteps {
    fn from(wire: MissingStepsWire) -> Self {
        match wire {
            MissingStepsWire::Steps(steps) => MissingSteps::Steps(steps),
            MissingStepsWire::Sentinel(_) => MissingSteps::Unavailable,
        }
    }
}

impl From<MissingSteps> for MissingStepsWire {
    fn from(steps: MissingSteps) -> Self {
        match steps {
            MissingSteps::Steps(steps) => MissingStepsWire::Steps(steps),
            MissingSteps::Unavailable => MissingStepsWire::Sentinel(-1),
        }
    }
}

/// Events the engine fires for local activity
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    LocalStep(HistoryStep),
    LocalSelection(Selection),
}

/// The rich-text document/history engine this crate synchronizes
pub trait DocumentEngine: Send + Sync {
    /// Ordered step ids from the root to the current head
    fn branch_ids(&self) -> Vec<StepId>;

    /// Steps a newly joined client needs to reach our state
    fn snapshot_steps(&self) -> Vec<HistoryStep>;

    /// Steps strictly between `from` and `to` on our branch
    fn missing_steps(&self, from: &StepId, to: &StepId) -> MissingSteps;

    fn apply_external_steps(&self, steps: Vec<HistoryStep>);

    fn apply_external_selection(&self, selection: CollaborativeSelection);

    fn remove_external_selection(&self, client_id: &ClientId);

    fn current_selection(&self) -> Option<Selection>;

    /// Current content with its branch ids
    fn snapshot(&self) -> DocumentSnapshot;

    /// Discard local state and adopt `snapshot`
    fn replace_content(&self, snapshot: DocumentSnapshot);

    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent>;
}

struct MemoryState {
    base: DocumentSnapshot,
    steps: Vec<HistoryStep>,
    selection: Option<Selection>,
    remote_selections: HashMap<ClientId, CollaborativeSelection>,
}

impl MemoryState {
    fn branch_ids(&self) -> Vec<StepId> {
        self.base
            .history_ids
            .iter()
            .cloned()
            .chain(self.steps.iter().map(|s| s.id.clone()))
            .collect()
    }

    fn contains(&self, id: &StepId) -> bool {
        self.base.history_ids.contains(id) || self.steps.iter().any(|s| &s.id == id)
    }
}

/// In-memory document engine.
///
/// Starts from a server snapshot; every step operation is a JSON string that
/// gets appended to the content. Used by tests and local demos.
pub struct MemoryDocument {
    client_id: ClientId,
    state: Mutex<MemoryState>,
    events: broadcast::Sender<DocumentEvent>,
}

impl MemoryDocument {
    pub fn new(client_id: ClientId, base: DocumentSnapshot) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            client_id,
            state: Mutex::new(MemoryState {
                base,
                steps: Vec::new(),
                selection: None,
                remote_selections: HashMap::new(),
            }),
            events,
        }
    }

    /// Produce a local step appending `text` and fire the local-step event
    pub fn commit_local(&self, text: &str) -> HistoryStep {
        let step = {
            let mut state = self.state.lock();
            let parent = state.branch_ids().last().cloned();
            let step = HistoryStep::new(
                self.client_id.clone(),
                parent,
                serde_json::Value::String(text.to_string()),
            );
            state.steps.push(step.clone());
            step
        };
        let _ = self.events.send(DocumentEvent::LocalStep(step.clone()));
        step
    }

    /// Move the local cursor and fire the local-selection event
    pub fn set_selection(&self, selection: Selection) {
        self.state.lock().selection = Some(selection.clone());
        let _ = self.events.send(DocumentEvent::LocalSelection(selection));
    }

    pub fn content(&self) -> String {
        let state = self.state.lock();
        let mut content = state.base.content.clone();
        for step in &state.steps {
            if let Some(text) = step.operations.as_str() {
                content.push_str(text);
            }
        }
        content
    }

    pub fn remote_selection(&self, client_id: &ClientId) -> Option<CollaborativeSelection> {
        self.state.lock().remote_selections.get(client_id).cloned()
    }

    pub fn remote_selection_count(&self) -> usize {
        self.state.lock().remote_selections.len()
    }
}

impl DocumentEngine for MemoryDocument {
    fn branch_ids(&self) -> Vec<StepId> {
        self.state.lock().branch_ids()
    }

    fn snapshot_steps(&self) -> Vec<HistoryStep> {
        self.state.lock().steps.clone()
    }

    fn missing_steps(&self, from: &StepId, to: &StepId) -> MissingSteps {
        let state = self.state.lock();
        let start = if state.base.history_ids.contains(from) {
            0
        } else {
            match state.steps.iter().position(|s| &s.id == from) {
                Some(index) => index + 1,
                None => return MissingSteps::Unavailable,
            }
        };

        let steps = state.steps[start..]
            .iter()
            .take_while(|s| &s.id != to)
            .cloned()
            .collect();
        MissingSteps::Steps(steps)
    }

    fn apply_external_steps(&self, steps: Vec<HistoryStep>) {
        let mut state = self.state.lock();
        for step in steps {
            if state.contains(&step.id) {
                continue;
            }
            state.steps.push(step);
        }
    }

    fn apply_external_selection(&self, selection: CollaborativeSelection) {
        self.state
            .lock()
            .remote_selections
            .insert(selection.client_id.clone(), selection);
    }

    fn remove_external_selection(&self, client_id: &ClientId) {
        self.state.lock().remote_selections.remove(client_id);
    }

    fn current_selection(&self) -> Option<Selection> {
        self.state.lock().selection.clone()
    }

    fn snapshot(&self) -> DocumentSnapshot {
        let history_ids = self.branch_ids();
        DocumentSnapshot {
            history_ids,
            content: self.content(),
        }
    }

    fn replace_content(&self, snapshot: DocumentSnapshot) {
        let mut state = self.state.lock();
        state.base = snapshot;
        state.steps.clear();
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DocumentSnapshot {
        DocumentSnapshot::new(vec![StepId::from("root")], "<p>")
    }

    #[test]
    fn test_local_steps_chain_on_head() {
        let doc = MemoryDocument::new(ClientId::from("1"), base());
        let s1 = doc.commit_local("a");
        let s2 = doc.commit_local("b");

        assert_eq!(s1.parent_id, Some(StepId::from("root")));
        assert_eq!(s2.parent_id, Some(s1.id.clone()));
        assert_eq!(doc.branch_ids(), vec![StepId::from("root"), s1.id, s2.id]);
        assert_eq!(doc.content(), "<p>ab");
    }

    #[test]
    fn test_external_steps_are_deduplicated() {
        let origin = MemoryDocument::new(ClientId::from("1"), base());
        let step = origin.commit_local("x");

        let doc = MemoryDocument::new(ClientId::from("2"), base());
        doc.apply_external_steps(vec![step.clone()]);
        doc.apply_external_steps(vec![step]);

        assert_eq!(doc.content(), "<p>x");
    }

    #[test]
    fn test_missing_steps_between_bounds() {
        let doc = MemoryDocument::new(ClientId::from("1"), base());
        let s1 = doc.commit_local("a");
        let s2 = doc.commit_local("b");
        let s3 = doc.commit_local("c");

        match doc.missing_steps(&s1.id, &s3.id) {
            MissingSteps::Steps(steps) => assert_eq!(steps, vec![s2.clone()]),
            MissingSteps::Unavailable => panic!("expected steps"),
        }

        match doc.missing_steps(&StepId::from("root"), &s2.id) {
            MissingSteps::Steps(steps) => assert_eq!(steps, vec![s1]),
            MissingSteps::Unavailable => panic!("expected steps"),
        }

        assert_eq!(
            doc.missing_steps(&s2.id, &s3.id),
            MissingSteps::Steps(Vec::new())
        );
        assert_eq!(
            doc.missing_steps(&StepId::from("unknown"), &s3.id),
            MissingSteps::Unavailable
        );
    }

    #[test]
    fn test_missing_steps_sentinel_on_wire() {
        let json = serde_json::to_string(&MissingSteps::Unavailable).unwrap();
        assert_eq!(json, "-1");

        let parsed: MissingSteps = serde_json::from_str("-1").unwrap();
        assert_eq!(parsed, MissingSteps::Unavailable);

        let parsed: MissingSteps = serde_json::from_str("[]").unwrap();
        assert_eq!(parsed, MissingSteps::Steps(Vec::new()));
    }

    #[test]
    fn test_replace_content_matches_snapshot() {
        let doc = MemoryDocument::new(ClientId::from("1"), base());
        doc.commit_local("local edit");

        let server = DocumentSnapshot::new(vec![StepId::from("root"), StepId::from("srv")], "<p>server");
        doc.replace_content(server.clone());

        assert_eq!(doc.snapshot(), server);
    }

    #[tokio::test]
    async fn test_local_events_fire() {
        let doc = MemoryDocument::new(ClientId::from("1"), base());
        let mut rx = doc.subscribe();

        let step = doc.commit_local("a");
        doc.set_selection(Selection::caret(serde_json::json!(1)));

        assert_eq!(rx.recv().await.unwrap(), DocumentEvent::LocalStep(step));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DocumentEvent::LocalSelection(_)
        ));
    }
}
