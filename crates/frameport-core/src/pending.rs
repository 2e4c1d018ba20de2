//! Correlation table for requests still waiting on their response.
//!
//! Entries have no expiry: a response that never arrives leaves its entry in
//! place for the lifetime of the table.

use crate::protocol::RequestId;
use std::collections::HashMap;

type ResponseCallback<T> = Box<dyn FnOnce(T)>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("request id `{0}` is already pending")]
pub struct DuplicateRequestId(pub RequestId);

pub struct PendingRequests<T> {
    entries: HashMap<RequestId, ResponseCallback<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single-use callback for `id`. An id that is already
    /// pending is rejected and the existing entry is left untouched.
    pub fn register(
        &mut self,
        id: RequestId,
        callback: impl FnOnce(T) + 'static,
    ) -> Result<(), DuplicateRequestId> {
        if self.entries.contains_key(&id) {
            return Err(DuplicateRequestId(id));
        }
        self.entries.insert(id, Box::new(callback));
        Ok(())
    }

    /// Removes the entry for `id` and then invokes it with `value`.
    ///
    /// Returns `false` without side effects when nothing is pending under
    /// `id`, which covers duplicate and late responses.
    pub fn resolve(&mut self, id: &RequestId, value: T) -> bool {
        let Some(callback) = self.entries.remove(id) else {
            return false;
        };
        callback(value);
        true
    }

    /// Drops the entry for `id` without invoking it.
    pub fn forget(&mut self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn resolve_invokes_once_and_removes_entry() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingRequests::new();
        let sink = Rc::clone(&seen);
        pending
            .register(RequestId::new("r1"), move |value: u32| {
                sink.borrow_mut().push(value)
            })
            .expect("register");

        assert!(pending.resolve(&RequestId::new("r1"), 7));
        assert!(!pending.resolve(&RequestId::new("r1"), 8));
        assert_eq!(*seen.borrow(), vec![7]);
        assert!(pending.is_empty());
    }

    #[test]
    fn unmatched_response_is_silently_ignored() {
        let mut pending: PendingRequests<u32> = PendingRequests::new();
        assert!(!pending.resolve(&RequestId::new("never-issued"), 1));
    }

    #[test]
    fn duplicate_id_is_rejected_and_first_entry_survives() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingRequests::new();
        let first = Rc::clone(&seen);
        pending
            .register(RequestId::new("r1"), move |value: &'static str| {
                first.borrow_mut().push(format!("first:{value}"))
            })
            .expect("register first");
        let second = Rc::clone(&seen);
        let err = pending
            .register(RequestId::new("r1"), move |value: &'static str| {
                second.borrow_mut().push(format!("second:{value}"))
            })
            .expect_err("duplicate id");
        assert_eq!(err, DuplicateRequestId(RequestId::new("r1")));

        pending.resolve(&RequestId::new("r1"), "ok");
        assert_eq!(*seen.borrow(), vec!["first:ok".to_string()]);
    }

    #[test]
    fn resolved_entry_cannot_be_forgotten() {
        let mut pending: PendingRequests<Rc<RefCell<bool>>> = PendingRequests::new();
        pending
            .register(RequestId::new("r1"), |flag: Rc<RefCell<bool>>| {
                *flag.borrow_mut() = true;
            })
            .expect("register");
        let flag = Rc::new(RefCell::new(false));
        pending.resolve(&RequestId::new("r1"), Rc::clone(&flag));
        assert!(*flag.borrow());
        assert!(!pending.contains(&RequestId::new("r1")));
        assert!(!pending.forget(&RequestId::new("r1")));
    }
}
