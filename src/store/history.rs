use std::collections::VecDeque;

use serde_json::Value;

/// Bounded undo/redo stacks for one entry.
///
/// `None` records that the entry was absent, so undoing the first write of
/// a key removes it again.
#[derive(Debug, Default, Clone)]
pub(crate) struct History {
    past: VecDeque<Option<Value>>,
    future: VecDeque<Option<Value>>,
}

impl History {
    /// Record the value a write is about to replace. Clears the redo stack.
    pub(crate) fn record(&mut self, previous: Option<Value>, max_depth: usize) {
        push_bounded(&mut self.past, previous, max_depth);
        self.future.clear();
    }

    /// Step back: returns the value to restore and stashes `current` for redo.
    pub(crate) fn undo(
        &mut self,
        current: Option<Value>,
        max_depth: usize,
    ) -> Option<Option<Value>> {
        let restored = self.past.pop_back()?;
        push_bounded(&mut self.future, current, max_depth);
        Some(restored)
    }

    /// Step forward: the inverse of [`History::undo`].
    pub(crate) fn redo(
        &mut self,
        current: Option<Value>,
        max_depth: usize,
    ) -> Option<Option<Value>> {
        let restored = self.future.pop_back()?;
        push_bounded(&mut self.past, current, max_depth);
        Some(restored)
    }

    pub(crate) fn past_len(&self) -> usize {
        self.past.len()
    }

    pub(crate) fn future_len(&self) -> usize {
        self.future.len()
    }
}

fn push_bounded(stack: &mut VecDeque<Option<Value>>, value: Option<Value>, max_depth: usize) {
    stack.push_back(value);
    while stack.len() > max_depth {
        stack.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn undo_redo_round_trip() {
        let mut history = History::default();
        history.record(None, 10);
        history.record(Some(json!("a")), 10);

        // current is "b"
        let restored = history.undo(Some(json!("b")), 10).unwrap();
        assert_eq!(restored, Some(json!("a")));
        let restored = history.redo(Some(json!("a")), 10).unwrap();
        assert_eq!(restored, Some(json!("b")));
    }

    #[test]
    fn new_record_clears_future() {
        let mut history = History::default();
        history.record(Some(json!(1)), 10);
        history.undo(Some(json!(2)), 10).unwrap();
        assert_eq!(history.future_len(), 1);

        history.record(Some(json!(1)), 10);
        assert_eq!(history.future_len(), 0);
        assert!(history.redo(Some(json!(3)), 10).is_none());
    }

    #[test]
    fn drops_oldest_first() {
        let mut history = History::default();
        for i in 0..5 {
            history.record(Some(json!(i)), 3);
        }
        assert_eq!(history.past_len(), 3);
        assert_eq!(history.undo(None, 3), Some(Some(json!(4))));
        assert_eq!(history.undo(None, 3), Some(Some(json!(3))));
        assert_eq!(history.undo(None, 3), Some(Some(json!(2))));
        assert_eq!(history.undo(None, 3), None);
    }

    proptest! {
        #[test]
        fn never_exceeds_depth(ops in prop::collection::vec(0u8..3, 0..200), depth in 1usize..20) {
            let mut history = History::default();
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    0 => history.record(Some(json!(i)), depth),
                    1 => { history.undo(Some(json!(i)), depth); }
                    _ => { history.redo(Some(json!(i)), depth); }
                }
                prop_assert!(history.past_len() <= depth);
                prop_assert!(history.future_len() <= depth);
            }
        }
    }
}
