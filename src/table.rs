use alloc::vec::Vec;

/// Fixed-capacity slot table. Ids are slot indices; freed ids are handed out
/// again before untouched slots.
pub struct FixedTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    capacity: usize,
    used: usize,
}

impl<T> FixedTable<T> {
    pub fn new(capacity: usize) -> Self {
        FixedTable {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            used: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Store `value` built from its future id. Returns `None` when full.
    pub fn insert_with(&mut self, make: impl FnOnce(usize) -> T) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[id] = Some(make(id));
        self.used += 1;
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        let value = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.used -= 1;
        Some(value)
    }
}
