//! Array-backed double-ended work queue
//!
//! `Quack` is a circular buffer that supports pushing at either end, popping
//! from the front, indexed access and out-of-order removal. The executor uses
//! it for its work list: internal work goes to the front, external work to
//! the back, and cancelled work is plucked out of the middle.
//!
//! Capacity starts at four slots and doubles when full. The buffer never
//! shrinks. It is not thread-safe and is meant to be owned by a single
//! scheduler.

use std::fmt;

const DEFAULT_CAPACITY: usize = 4;

/// Circular-buffer deque with out-of-order removal
pub struct Quack<T> {
    items: Vec<Option<T>>,
    head: usize,
    count: usize,
}

impl<T> Quack<T> {
    /// Create an empty queue with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty queue with room for `capacity` items
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        Self {
            items,
            head: 0,
            count: 0,
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current slot capacity
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Insert an item before every queued item
    pub fn push_front(&mut self, item: T) {
        if self.count == self.items.len() {
            self.grow();
        }

        self.head = if self.head == 0 {
            self.items.len() - 1
        } else {
            self.head - 1
        };
        self.items[self.head] = Some(item);
        self.count += 1;
    }

    /// Append an item after every queued item
    pub fn enqueue(&mut self, item: T) {
        if self.count == self.items.len() {
            self.grow();
        }

        let tail = self.physical(self.count);
        self.items[tail] = Some(item);
        self.count += 1;
    }

    /// Remove and return the front item
    pub fn dequeue(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }

        let item = self.items[self.head].take();
        self.head = (self.head + 1) % self.items.len();
        self.count -= 1;
        item
    }

    /// Borrow the item at logical position `index`
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            return None;
        }
        self.items[self.physical(index)].as_ref()
    }

    /// Remove the item at logical position `index`, shifting later items forward
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }

        let slot = self.physical(index);
        let removed = self.items[slot].take();
        for logical in index..self.count - 1 {
            let from = self.physical(logical + 1);
            let to = self.physical(logical);
            self.items[to] = self.items[from].take();
        }
        self.count -= 1;
        removed
    }

    /// Iterate from front to back
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |index| self.items[self.physical(index)].as_ref())
    }

    /// Index of the first item matching `predicate`
    pub fn position<F>(&self, mut predicate: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().position(|item| predicate(item))
    }

    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.items.len()
    }

    fn grow(&mut self) {
        let new_capacity = self.items.len() * 2;
        let mut items = Vec::with_capacity(new_capacity);
        for logical in 0..self.count {
            let slot = self.physical(logical);
            items.push(self.items[slot].take());
        }
        items.resize_with(new_capacity, || None);
        self.items = items;
        self.head = 0;
    }
}

impl<T: PartialEq> Quack<T> {
    /// Remove the first item equal to `item`
    pub fn remove(&mut self, item: &T) -> bool {
        match self.position(|candidate| candidate == item) {
            Some(index) => self.remove_at(index).is_some(),
            None => false,
        }
    }

    /// Whether an equal item is queued
    pub fn contains(&self, item: &T) -> bool {
        self.iter().any(|candidate| candidate == item)
    }
}

impl<T: Clone> Quack<T> {
    /// Copy the queue contents in front-to-back order
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for Quack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Quack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut quack = Quack::new();
        for i in 0..3 {
            quack.enqueue(i);
        }
        assert_eq!(quack.dequeue(), Some(0));
        assert_eq!(quack.dequeue(), Some(1));
        assert_eq!(quack.dequeue(), Some(2));
        assert_eq!(quack.dequeue(), None);
    }

    #[test]
    fn test_push_front_wraps() {
        let mut quack = Quack::new();
        quack.enqueue(2);
        quack.push_front(1);
        quack.push_front(0);
        assert_eq!(quack.to_vec(), vec![0, 1, 2]);
        assert_eq!(quack.get(0), Some(&0));
        assert_eq!(quack.get(3), None);
    }

    #[test]
    fn test_growth_preserves_wrapped_order() {
        let mut quack = Quack::new();
        quack.enqueue(1);
        quack.enqueue(2);
        quack.dequeue();
        quack.enqueue(3);
        quack.enqueue(4);
        quack.enqueue(5);
        // head is now mid-buffer and the tail has wrapped
        quack.push_front(0);
        quack.enqueue(6);
        assert!(quack.capacity() >= 8);
        assert_eq!(quack.to_vec(), vec![0, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_remove_by_value_and_index() {
        let mut quack = Quack::new();
        for i in 0..6 {
            quack.enqueue(i);
        }
        assert!(quack.remove(&3));
        assert!(!quack.remove(&42));
        assert_eq!(quack.remove_at(0), Some(0));
        assert_eq!(quack.remove_at(10), None);
        assert_eq!(quack.to_vec(), vec![1, 2, 4, 5]);
        assert_eq!(quack.len(), 4);
    }

    #[test]
    fn test_never_shrinks() {
        let mut quack = Quack::new();
        for i in 0..9 {
            quack.enqueue(i);
        }
        let grown = quack.capacity();
        while quack.dequeue().is_some() {}
        assert_eq!(quack.capacity(), grown);
        assert!(quack.is_empty());
    }
}
