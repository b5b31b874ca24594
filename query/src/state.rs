//! Query lifecycle state machine. A query node can report which phase a
//! long-running merge/diff is in, and cancellation or failure can cut in
//! from any in-flight phase.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Parsing,
    Planning,
    Scanning,
    Merging,
    Symbolizing,
    Done,
    Cancelled,
    Failed,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Done | QueryState::Cancelled | QueryState::Failed)
    }

    /// Cancelled/Failed are reachable from any non-terminal state; the
    /// "happy path" otherwise only moves forward.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        use QueryState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Parsing, Planning)
                | (Planning, Scanning)
                | (Scanning, Merging)
                | (Scanning, Symbolizing)
                | (Scanning, Done)
                | (Merging, Symbolizing)
                | (Merging, Done)
                | (Symbolizing, Done)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_reachable_from_any_nonterminal_state() {
        for state in [
            QueryState::Parsing,
            QueryState::Planning,
            QueryState::Scanning,
            QueryState::Merging,
            QueryState::Symbolizing,
        ] {
            assert!(state.can_transition_to(QueryState::Cancelled));
        }
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        assert!(!QueryState::Done.can_transition_to(QueryState::Scanning));
        assert!(!QueryState::Cancelled.can_transition_to(QueryState::Done));
    }

    #[test]
    fn scanning_cannot_skip_to_symbolizing_then_back_to_merging() {
        assert!(QueryState::Scanning.can_transition_to(QueryState::Symbolizing));
        assert!(!QueryState::Symbolizing.can_transition_to(QueryState::Merging));
    }
}
