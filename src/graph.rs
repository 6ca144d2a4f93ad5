//! Per document type finite state machines
use super::error::ConfigError;
use std::collections::BTreeMap;

pub const DEFAULT_GRAPH: &str = "default";
pub const INITIAL_STATE: &str = "draft";

/// state -> action -> next state
pub type Transitions = BTreeMap<String, BTreeMap<String, String>>;

/// Read-only after construction. Doc types without their own graph use the
/// `default` one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateGraph {
    graphs: BTreeMap<String, Transitions>,
}

/// draft -> saved -> waiting_approval -> approved -> locked, with cancel from
/// every open state. `saved` has no `save` edge so a repeated save is refused.
pub fn default_transitions() -> Transitions {
    let edges: [(&str, &str, &str); 13] = [
        ("draft", "save", "saved"),
        ("draft", "cancel", "cancelled"),
        ("saved", "submit", "waiting_approval"),
        ("saved", "lock", "locked"),
        ("saved", "cancel", "cancelled"),
        ("waiting_approval", "approve", "approved"),
        ("waiting_approval", "reject", "saved"),
        ("waiting_approval", "cancel", "cancelled"),
        ("approved", "lock", "locked"),
        ("approved", "cancel", "cancelled"),
        ("approved", "unlock", "saved"),
        ("locked", "unlock", "approved"),
        ("locked", "cancel", "cancelled"),
    ];

    let mut transitions = Transitions::new();
    for (from, action, to) in edges {
        transitions
            .entry(from.to_string())
            .or_default()
            .insert(action.to_string(), to.to_string());
    }
    transitions
}

impl Default for StateGraph {
    fn default() -> Self {
        let mut graphs = BTreeMap::new();
        graphs.insert(DEFAULT_GRAPH.to_string(), default_transitions());
        Self { graphs }
    }
}

/// Graph names, states and actions are compared case-insensitively. Config
/// sources fold map keys to lowercase, so everything is stored folded.
pub fn fold_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl StateGraph {
    /// Builds a graph set from configuration. Missing `default` falls back to
    /// the built-in one, empty target states are rejected.
    pub fn new(graphs: BTreeMap<String, Transitions>) -> Result<Self, ConfigError> {
        let mut folded = BTreeMap::new();
        for (doc_type, transitions) in graphs {
            let graph: &mut Transitions = folded.entry(fold_name(&doc_type)).or_default();
            for (state, actions) in transitions {
                for (action, to) in actions {
                    if to.trim().is_empty() {
                        return Err(ConfigError::EmptyTarget {
                            doc_type,
                            state,
                            action,
                        });
                    }
                    graph
                        .entry(fold_name(&state))
                        .or_default()
                        .insert(fold_name(&action), fold_name(&to));
                }
            }
        }
        folded
            .entry(DEFAULT_GRAPH.to_string())
            .or_insert_with(default_transitions);

        Ok(Self { graphs: folded })
    }

    fn graph_for(&self, doc_type: &str) -> Option<&Transitions> {
        self.graphs
            .get(&fold_name(doc_type))
            .or_else(|| self.graphs.get(DEFAULT_GRAPH))
    }

    pub fn has_graph(&self, doc_type: &str) -> bool {
        self.graphs.contains_key(&fold_name(doc_type))
    }

    pub fn next_state(&self, doc_type: &str, from_state: &str, action: &str) -> Option<&str> {
        self.graph_for(doc_type)?
            .get(&fold_name(from_state))?
            .get(&fold_name(action))
            .map(String::as_str)
    }

    pub fn can_transition(&self, doc_type: &str, from_state: &str, action: &str) -> bool {
        self.next_state(doc_type, from_state, action).is_some()
    }

    /// Actions with an outgoing edge from `state`, in name order.
    pub fn actions_from(&self, doc_type: &str, state: &str) -> Vec<&str> {
        self.graph_for(doc_type)
            .and_then(|g| g.get(&fold_name(state)))
            .map(|actions| actions.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}
