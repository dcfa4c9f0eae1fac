//! Parent / first-child / sibling links between PCBs.
//!
//! Links are pids into the process table; the parent's child list is the
//! only owner of the sibling chain.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::task::{Process, ProcessId};

pub type ProcessTable = BTreeMap<ProcessId, Process>;

/// Push `child` at the head of `parent`'s child list.
pub fn link_child(table: &mut ProcessTable, parent: ProcessId, child: ProcessId) {
    let Some(old_first) = table.get(&parent).map(|p| p.first_child) else {
        return;
    };
    if let Some(c) = table.get_mut(&child) {
        c.parent = Some(parent);
        c.prev_sibling = None;
        c.next_sibling = old_first;
    }
    if let Some(first) = old_first.and_then(|pid| table.get_mut(&pid)) {
        first.prev_sibling = Some(child);
    }
    if let Some(p) = table.get_mut(&parent) {
        p.first_child = Some(child);
    }
}

/// Take `pid` out of its parent's child list and forget the parent.
pub fn unlink(table: &mut ProcessTable, pid: ProcessId) {
    let Some((parent, prev, next)) = table
        .get_mut(&pid)
        .map(|p| (p.parent.take(), p.prev_sibling.take(), p.next_sibling.take()))
    else {
        return;
    };
    if let Some(n) = next.and_then(|n| table.get_mut(&n)) {
        n.prev_sibling = prev;
    }
    match prev {
        Some(prev) => {
            if let Some(p) = table.get_mut(&prev) {
                p.next_sibling = next;
            }
        }
        None => {
            if let Some(p) = parent.and_then(|p| table.get_mut(&p)) {
                if p.first_child == Some(pid) {
                    p.first_child = next;
                }
            }
        }
    }
}

/// Children of `parent`, most recently linked first.
pub fn children(table: &ProcessTable, parent: ProcessId) -> Vec<ProcessId> {
    let mut out = Vec::new();
    let mut cursor = table.get(&parent).and_then(|p| p.first_child);
    while let Some(pid) = cursor {
        out.push(pid);
        cursor = table.get(&pid).and_then(|p| p.next_sibling);
    }
    out
}
