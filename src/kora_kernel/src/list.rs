//! Intrusive doubly-linked lists over the kernel node arena.
//!
//! Every list node the kernel ever links lives in one arena inside
//! [`KernelState`]: three nodes per task slot (state, event, link) followed
//! by one dummy head per kernel list. Links are node indices, so no raw
//! pointers are stored, and a node's membership is tracked by a `leader`
//! back-reference to the list it is on.
//!
//! Lists are dummy-headed and circular. An empty list is a head linked to
//! itself. Removal reports the removed node's predecessor so that callers
//! maintaining a cursor into the list (the scheduler's round-robin iterator)
//! can rewind it.
//!
//! [`KernelState`]: crate::KernelState
use core::fmt;

use crate::{
    cfg,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
};

/// Number of task-owned nodes (three per task slot).
pub(crate) const TASK_NODES: usize = cfg::NUM_TASKS * 3;

const READY_BASE: usize = 0;
const SLEEP: usize = READY_BASE + cfg::MAX_PRIOS;
const ALL_TASKS: usize = SLEEP + 1;
const SEM_BASE: usize = ALL_TASKS + 1;
const EVT_BASE: usize = SEM_BASE + cfg::NUM_SEMAPHORES;
const MTX_BASE: usize = EVT_BASE + cfg::NUM_EVENT_GROUPS;
const MSGQ_R_BASE: usize = MTX_BASE + cfg::NUM_MUTEXES;
const MSGQ_W_BASE: usize = MSGQ_R_BASE + cfg::NUM_MSG_QUEUES;
const SQ_R_BASE: usize = MSGQ_W_BASE + cfg::NUM_MSG_QUEUES;
const SQ_W_BASE: usize = SQ_R_BASE + cfg::NUM_STREAM_QUEUES;

/// Number of kernel lists (and dummy head nodes).
pub(crate) const NUM_LISTS: usize = SQ_W_BASE + cfg::NUM_STREAM_QUEUES;

/// Total node arena size: task nodes first, then one head per list.
pub(crate) const NODE_COUNT: usize = TASK_NODES + NUM_LISTS;

const _: () = assert!(NODE_COUNT <= u16::MAX as usize);

/// Identifies a kernel list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListRef(u16);

impl ListRef {
    /// The ready list for the given priority level.
    pub(crate) const fn ready(prio: usize) -> Self {
        assert!(prio < cfg::MAX_PRIOS);
        Self((READY_BASE + prio) as u16)
    }

    /// The sleep list, ordered by absolute wake deadline.
    pub(crate) const fn sleep() -> Self {
        Self(SLEEP as u16)
    }

    /// The list of every existing task's link node.
    pub(crate) const fn all_tasks() -> Self {
        Self(ALL_TASKS as u16)
    }

    pub(crate) const fn sem_block(index: usize) -> Self {
        assert!(index < cfg::NUM_SEMAPHORES);
        Self((SEM_BASE + index) as u16)
    }

    pub(crate) const fn evt_block(index: usize) -> Self {
        assert!(index < cfg::NUM_EVENT_GROUPS);
        Self((EVT_BASE + index) as u16)
    }

    pub(crate) const fn mutex_block(index: usize) -> Self {
        assert!(index < cfg::NUM_MUTEXES);
        Self((MTX_BASE + index) as u16)
    }

    pub(crate) const fn msgq_readers(index: usize) -> Self {
        assert!(index < cfg::NUM_MSG_QUEUES);
        Self((MSGQ_R_BASE + index) as u16)
    }

    pub(crate) const fn msgq_writers(index: usize) -> Self {
        assert!(index < cfg::NUM_MSG_QUEUES);
        Self((MSGQ_W_BASE + index) as u16)
    }

    pub(crate) const fn sq_readers(index: usize) -> Self {
        assert!(index < cfg::NUM_STREAM_QUEUES);
        Self((SQ_R_BASE + index) as u16)
    }

    pub(crate) const fn sq_writers(index: usize) -> Self {
        assert!(index < cfg::NUM_STREAM_QUEUES);
        Self((SQ_W_BASE + index) as u16)
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a node in the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef(u16);

impl NodeRef {
    /// The state node of the task in the given arena slot.
    pub(crate) const fn state_node(task_index: usize) -> Self {
        assert!(task_index < cfg::NUM_TASKS);
        Self((task_index * 3) as u16)
    }

    /// The event node of the task in the given arena slot.
    pub(crate) const fn event_node(task_index: usize) -> Self {
        assert!(task_index < cfg::NUM_TASKS);
        Self((task_index * 3 + 1) as u16)
    }

    /// The link node of the task in the given arena slot.
    pub(crate) const fn link_node(task_index: usize) -> Self {
        assert!(task_index < cfg::NUM_TASKS);
        Self((task_index * 3 + 2) as u16)
    }

    /// The dummy head node of the given list.
    pub(crate) const fn head_of(list: ListRef) -> Self {
        Self((TASK_NODES + list.index()) as u16)
    }

    /// The arena slot of the task owning this node, if it is a task node.
    pub(crate) const fn task_index(self) -> Option<usize> {
        if (self.0 as usize) < TASK_NODES {
            Some(self.0 as usize / 3)
        } else {
            None
        }
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Init for NodeRef {
    const INIT: Self = Self(0);
}

/// A node of an intrusive doubly-linked list.
///
/// `value` is owned by whoever linked the node: the absolute wake deadline on
/// the sleep list, the encoded event predicate on an event group's block
/// list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    prev: NodeRef,
    next: NodeRef,
    leader: Option<ListRef>,
    pub(crate) value: u32,
}

impl Init for Node {
    const INIT: Self = Self {
        prev: NodeRef(0),
        next: NodeRef(0),
        leader: None,
        value: 0,
    };
}

/// The result of inserting a node that is already on a list.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AlreadyLinked;

/// The node arena plus the per-list length table.
pub(crate) struct ListArena<Traits> {
    nodes: [CpuLockCell<Traits, Node>; NODE_COUNT],
    lens: [CpuLockCell<Traits, u16>; NUM_LISTS],
}

impl<Traits> Init for ListArena<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        nodes: Init::INIT,
        lens: Init::INIT,
    };
}

impl<Traits> fmt::Debug for ListArena<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ListArena { .. }")
    }
}

impl<Traits: 'static> ListArena<Traits> {
    /// Reset every node to the detached state and every list to empty.
    pub(crate) fn init(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        for i in 0..NODE_COUNT {
            *self.nodes[i].write(&mut *lock) = Node::INIT;
        }
        for l in 0..NUM_LISTS {
            let list = ListRef(l as u16);
            let head = NodeRef::head_of(list);
            *self.nodes[head.index()].write(&mut *lock) = Node {
                prev: head,
                next: head,
                leader: Some(list),
                value: 0,
            };
            *self.lens[l].write(&mut *lock) = 0;
        }
    }

    pub(crate) fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>, list: ListRef) -> usize {
        *self.lens[list.index()].read(&*lock) as usize
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>, list: ListRef) -> bool {
        *self.lens[list.index()].read(&*lock) == 0
    }

    /// The first element of `list`, or `None` if it is empty.
    pub(crate) fn first(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        list: ListRef,
    ) -> Option<NodeRef> {
        let head = NodeRef::head_of(list);
        let next = self.nodes[head.index()].read(&*lock).next;
        if next == head {
            None
        } else {
            Some(next)
        }
    }

    /// The element following `node` on `list`, or `None` if `node` is the
    /// last one.
    pub(crate) fn next_in(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        list: ListRef,
        node: NodeRef,
    ) -> Option<NodeRef> {
        let next = self.nodes[node.index()].read(&*lock).next;
        if next == NodeRef::head_of(list) {
            None
        } else {
            Some(next)
        }
    }

    /// The raw successor of `node`, dummy head included. Used by the
    /// round-robin cursor, which deliberately walks through the head.
    pub(crate) fn raw_next(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        node: NodeRef,
    ) -> NodeRef {
        self.nodes[node.index()].read(&*lock).next
    }

    /// The list `node` is currently on.
    pub(crate) fn leader(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        node: NodeRef,
    ) -> Option<ListRef> {
        self.nodes[node.index()].read(&*lock).leader
    }

    pub(crate) fn value(&self, lock: CpuLockTokenRefMut<'_, Traits>, node: NodeRef) -> u32 {
        self.nodes[node.index()].read(&*lock).value
    }

    pub(crate) fn set_value(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        node: NodeRef,
        value: u32,
    ) {
        self.nodes[node.index()].write(&mut *lock).value = value;
    }

    /// Insert `node` at the back of `list` (FIFO order).
    pub(crate) fn insert_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        list: ListRef,
        node: NodeRef,
    ) -> Result<(), AlreadyLinked> {
        if self.nodes[node.index()].read(&*lock).leader.is_some() {
            return Err(AlreadyLinked);
        }

        let head = NodeRef::head_of(list);
        let tail = self.nodes[head.index()].read(&*lock).prev;
        self.link_before(lock.borrow_mut(), list, node, tail, head);
        Ok(())
    }

    /// Insert `node` into `list` keeping it sorted by ascending `value`.
    /// Nodes with equal values keep their insertion order.
    pub(crate) fn insert_sorted(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        list: ListRef,
        node: NodeRef,
    ) -> Result<(), AlreadyLinked> {
        if self.nodes[node.index()].read(&*lock).leader.is_some() {
            return Err(AlreadyLinked);
        }

        let head = NodeRef::head_of(list);
        let value = self.nodes[node.index()].read(&*lock).value;

        let mut at = self.nodes[head.index()].read(&*lock).next;
        while at != head && value >= self.nodes[at.index()].read(&*lock).value {
            at = self.nodes[at.index()].read(&*lock).next;
        }

        let prev = self.nodes[at.index()].read(&*lock).prev;
        self.link_before(lock.borrow_mut(), list, node, prev, at);
        Ok(())
    }

    /// Unlink `node` from whatever list it is on. Detached nodes are
    /// tolerated. On success, returns the node's former predecessor so
    /// that a cursor resting on `node` can be rewound.
    pub(crate) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        node: NodeRef,
    ) -> Option<NodeRef> {
        let Node { prev, next, leader, .. } = *self.nodes[node.index()].read(&*lock);
        let list = leader?;

        self.nodes[prev.index()].write(&mut *lock).next = next;
        self.nodes[next.index()].write(&mut *lock).prev = prev;
        self.nodes[node.index()].write(&mut *lock).leader = None;
        let len = self.lens[list.index()].write(&mut *lock);
        debug_assert!(*len > 0);
        *len -= 1;

        Some(prev)
    }

    /// Link `node` between `prev` and `next` (which must be adjacent on
    /// `list`).
    fn link_before(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        list: ListRef,
        node: NodeRef,
        prev: NodeRef,
        next: NodeRef,
    ) {
        {
            let n = self.nodes[node.index()].write(&mut *lock);
            n.prev = prev;
            n.next = next;
            n.leader = Some(list);
        }
        self.nodes[prev.index()].write(&mut *lock).next = node;
        self.nodes[next.index()].write(&mut *lock).prev = node;
        *self.lens[list.index()].write(&mut *lock) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{with_state, StubPort};
    use crate::PortThreading;
    use quickcheck_macros::quickcheck;
    use std::vec::Vec;

    type Arena = ListArena<StubPort>;

    fn arena() -> &'static Arena {
        &StubPort::state().lists
    }

    fn collect(
        lock: &mut crate::klock::CpuLockGuard<StubPort>,
        list: ListRef,
    ) -> Vec<NodeRef> {
        let a: &Arena = arena();
        let mut out = Vec::new();
        let mut cur = a.first(lock.borrow_mut(), list);
        while let Some(n) = cur {
            out.push(n);
            cur = a.next_in(lock.borrow_mut(), list, n);
        }
        out
    }

    #[test]
    fn fifo_insert_preserves_order() {
        with_state(|mut lock| {
            let a = arena();
            let list = ListRef::sem_block(0);
            let nodes = [
                NodeRef::event_node(0),
                NodeRef::event_node(1),
                NodeRef::event_node(2),
            ];
            for n in nodes {
                a.insert_back(lock.borrow_mut(), list, n).unwrap();
            }

            assert_eq!(collect(&mut lock, list), nodes);
            assert_eq!(a.len(lock.borrow_mut(), list), 3);
        });
    }

    #[test]
    fn double_insert_is_rejected() {
        with_state(|mut lock| {
            let a = arena();
            let list = ListRef::sem_block(1);
            let n = NodeRef::event_node(3);
            a.insert_back(lock.borrow_mut(), list, n).unwrap();
            assert_eq!(a.insert_back(lock.borrow_mut(), list, n), Err(AlreadyLinked));
            assert_eq!(
                a.insert_sorted(lock.borrow_mut(), ListRef::sleep(), n),
                Err(AlreadyLinked)
            );
        });
    }

    #[test]
    fn remove_reports_predecessor_and_tolerates_detached() {
        with_state(|mut lock| {
            let a = arena();
            let list = ListRef::sem_block(2);
            let n0 = NodeRef::event_node(0);
            let n1 = NodeRef::event_node(1);
            a.insert_back(lock.borrow_mut(), list, n0).unwrap();
            a.insert_back(lock.borrow_mut(), list, n1).unwrap();

            assert_eq!(a.remove(lock.borrow_mut(), n1), Some(n0));
            // `n1` is now detached; a second removal is a no-op
            assert_eq!(a.remove(lock.borrow_mut(), n1), None);

            // removing the first element reports the dummy head
            assert_eq!(a.remove(lock.borrow_mut(), n0), Some(NodeRef::head_of(list)));
            assert!(a.is_empty(lock.borrow_mut(), list));
        });
    }

    #[quickcheck]
    fn sorted_insert_matches_stable_sort(values: Vec<u32>) {
        let values: Vec<u32> = values.into_iter().take(crate::cfg::NUM_TASKS).collect();
        with_state(|mut lock| {
            let a = arena();
            let list = ListRef::sleep();

            for (i, &v) in values.iter().enumerate() {
                let n = NodeRef::state_node(i);
                a.set_value(lock.borrow_mut(), n, v);
                a.insert_sorted(lock.borrow_mut(), list, n).unwrap();
            }

            let got: Vec<u32> = collect(&mut lock, list)
                .into_iter()
                .map(|n| a.value(lock.borrow_mut(), n))
                .collect();

            let mut expected = values.clone();
            expected.sort(); // stable, like the tie-breaking rule
            assert_eq!(got, expected);
        });
    }
}
