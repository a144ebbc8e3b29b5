use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// In-flight counters for one group's loop.
#[derive(Debug, Default)]
pub struct GroupCounters {
    active_addresses: AtomicUsize,
    processed: AtomicU64,
}

/// Point-in-time view of a group's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupActivity {
    pub active_addresses: usize,
    pub processed: u64,
}

impl GroupCounters {
    pub fn active(&self) -> usize {
        self.active_addresses.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> GroupActivity {
        GroupActivity {
            active_addresses: self.active(),
            processed: self.processed.load(Ordering::SeqCst),
        }
    }
}

/// Dispatcher-wide counters. Group counters roll up into the totals so
/// `active_addresses` is always the sum over live groups.
#[derive(Debug, Default)]
pub struct ActivityCounters {
    active_addresses: AtomicUsize,
    active_groups: AtomicUsize,
}

impl ActivityCounters {
    pub fn active_addresses(&self) -> usize {
        self.active_addresses.load(Ordering::SeqCst)
    }

    pub fn active_groups(&self) -> usize {
        self.active_groups.load(Ordering::SeqCst)
    }

    pub fn group_started(&self) -> Arc<GroupCounters> {
        self.active_groups.fetch_add(1, Ordering::SeqCst);
        Arc::new(GroupCounters::default())
    }

    /// Release whatever the group still holds and drop it from the totals.
    pub fn group_finished(&self, group: &GroupCounters) {
        let remaining = group.active_addresses.swap(0, Ordering::SeqCst);
        saturating_sub(&self.active_addresses, remaining);
        saturating_sub(&self.active_groups, 1);
    }

    pub fn add(&self, group: &GroupCounters, n: usize) {
        if n == 0 {
            return;
        }
        group.active_addresses.fetch_add(n, Ordering::SeqCst);
        self.active_addresses.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark `n` popped addresses as finished.
    pub fn complete(&self, group: &GroupCounters, n: usize) {
        if n == 0 {
            return;
        }
        let released = saturating_sub(&group.active_addresses, n);
        saturating_sub(&self.active_addresses, released);
        group.processed.fetch_add(n as u64, Ordering::SeqCst);
    }

    /// Force a group's counter to zero after the shared queue proved empty.
    pub fn reset(&self, group: &GroupCounters) {
        let remaining = group.active_addresses.swap(0, Ordering::SeqCst);
        saturating_sub(&self.active_addresses, remaining);
    }
}

/// Subtract without wrapping; returns how much was actually subtracted.
fn saturating_sub(counter: &AtomicUsize, n: usize) -> usize {
    let mut released = 0;
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        released = current.min(n);
        Some(current - released)
    });
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_counters_roll_up() {
        let totals = ActivityCounters::default();
        let a = totals.group_started();
        let b = totals.group_started();
        totals.add(&a, 3);
        totals.add(&b, 2);
        assert_eq!(totals.active_addresses(), 5);
        assert_eq!(totals.active_groups(), 2);

        totals.complete(&a, 3);
        assert_eq!(a.snapshot(), GroupActivity { active_addresses: 0, processed: 3 });
        assert_eq!(totals.active_addresses(), 2);

        totals.group_finished(&b);
        totals.group_finished(&a);
        assert_eq!(totals.active_addresses(), 0);
        assert_eq!(totals.active_groups(), 0);
    }

    #[test]
    fn completion_never_underflows() {
        let totals = ActivityCounters::default();
        let group = totals.group_started();
        totals.add(&group, 1);
        totals.complete(&group, 4);
        assert_eq!(group.active(), 0);
        assert_eq!(totals.active_addresses(), 0);
    }
}
