//! Integration tests for the work queue
//!
//! Random operation sequences are checked against `VecDeque`.

use std::collections::VecDeque;

use proptest::prelude::*;
use tarry::runtime::quack::Quack;

#[derive(Debug, Clone)]
enum Op {
    PushFront(u32),
    Enqueue(u32),
    Dequeue,
    RemoveAt(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u32>().prop_map(Op::PushFront),
        any::<u32>().prop_map(Op::Enqueue),
        Just(Op::Dequeue),
        (0usize..16).prop_map(Op::RemoveAt),
    ]
}

proptest! {
    #[test]
    fn prop_matches_deque(ops in prop::collection::vec(op(), 0..200)) {
        let mut quack = Quack::new();
        let mut oracle = VecDeque::new();

        for op in ops {
            match op {
                Op::PushFront(value) => {
                    quack.push_front(value);
                    oracle.push_front(value);
                }
                Op::Enqueue(value) => {
                    quack.enqueue(value);
                    oracle.push_back(value);
                }
                Op::Dequeue => {
                    prop_assert_eq!(quack.dequeue(), oracle.pop_front());
                }
                Op::RemoveAt(index) => {
                    prop_assert_eq!(quack.remove_at(index), oracle.remove(index));
                }
            }
            prop_assert_eq!(quack.len(), oracle.len());
            prop_assert!(quack.capacity() >= quack.len());
        }

        let expected: Vec<u32> = oracle.iter().copied().collect();
        prop_assert_eq!(quack.to_vec(), expected);
    }
}

#[test]
fn test_growth_past_initial_capacity_keeps_order() {
    let mut quack = Quack::new();
    for value in 0..5 {
        quack.enqueue(value);
    }
    quack.push_front(-1);
    quack.push_front(-2);

    assert!(quack.capacity() >= 7);
    assert_eq!(quack.to_vec(), vec![-2, -1, 0, 1, 2, 3, 4]);
    assert_eq!(quack.dequeue(), Some(-2));
    assert!(quack.remove(&2));
    assert!(!quack.contains(&2));
    assert_eq!(quack.position(|value| *value == 3), Some(3));
}

#[test]
fn test_empty_queue() {
    let mut quack: Quack<u8> = Quack::new();
    assert!(quack.is_empty());
    assert_eq!(quack.dequeue(), None);
    assert_eq!(quack.remove_at(0), None);
    assert_eq!(quack.get(0), None);
}
