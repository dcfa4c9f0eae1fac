//! Whole-kernel scenarios on the hosted platform. The test thread is `init`;
//! children report back through shared slots and all assertions run in
//! `init`.


use std::sync::{Arc, Mutex};

/// Filled in by a child process, read by `init` once the child is done.
pub(crate) type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

pub(crate) fn take<T>(slot: &Slot<T>) -> Option<T> {
    slot.lock().unwrap().take()
}
