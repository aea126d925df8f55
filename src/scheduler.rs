use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use ahash::HashSet;

/// Identifies a scheduled event for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventHandle(u64);

#[derive(Debug)]
struct Entry<E> {
    trigger: Instant,
    delay: Duration,
    recurring: bool,
    id: u64,
    payload: E,
}

impl<E> Entry<E> {
    fn key(&self) -> (Instant, Duration, bool, u64) {
        (self.trigger, self.delay, self.recurring, self.id)
    }
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A time ordered queue of events.
///
/// Events are ordered by trigger time, then by their delay, then one-shot
/// before recurring, and finally by the order they were scheduled in. Cancelled
/// events stay in the heap until they reach its top and are skipped there.
#[derive(Debug)]
pub(crate) struct EventScheduler<E> {
    heap: BinaryHeap<Reverse<Entry<E>>>,
    live: HashSet<u64>,
    next_id: u64,
}

impl<E> Default for EventScheduler<E> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::default(),
            next_id: 0,
        }
    }
}

impl<E: Clone> EventScheduler<E> {
    /// Schedules `payload` to fire `delay` after `now`.
    ///
    /// Recurring events fire every `delay` until cancelled and must have a
    /// non-zero delay.
    pub fn schedule(
        &mut self,
        now: Instant,
        delay: Duration,
        payload: E,
        recurring: bool,
    ) -> EventHandle {
        debug_assert!(!recurring || !delay.is_zero());

        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        self.heap.push(Reverse(Entry {
            trigger: now + delay,
            delay,
            recurring,
            id,
            payload,
        }));
        EventHandle(id)
    }

    /// Cancels the event. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.live.remove(&handle.0)
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.contains(&entry.id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Trigger time of the earliest pending event.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse(entry)| entry.trigger)
    }

    /// Removes and returns the earliest event due at `now`.
    ///
    /// Recurring events are rescheduled before they are returned.
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        self.discard_cancelled();
        if self.heap.peek()?.0.trigger > now {
            return None;
        }
        let Reverse(entry) = self.heap.pop()?;

        if entry.recurring {
            self.heap.push(Reverse(Entry {
                trigger: now.max(entry.trigger) + entry.delay,
                payload: entry.payload.clone(),
                ..entry
            }));
            Some(entry.payload)
        } else {
            self.live.remove(&entry.id);
            Some(entry.payload)
        }
    }

    /// Drops all pending events without firing them.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(scheduler: &mut EventScheduler<&'static str>, now: Instant) -> Vec<&'static str> {
        std::iter::from_fn(|| scheduler.pop_due(now)).collect()
    }

    #[test]
    fn fires_in_trigger_order() {
        let mut scheduler = EventScheduler::default();
        let now = Instant::now();
        scheduler.schedule(now, Duration::from_millis(30), "c", false);
        scheduler.schedule(now, Duration::from_millis(10), "a", false);
        scheduler.schedule(now, Duration::from_millis(20), "b", false);

        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(drain(&mut scheduler, now), Vec::<&str>::new());
        assert_eq!(
            drain(&mut scheduler, now + Duration::from_millis(20)),
            ["a", "b"]
        );
        assert_eq!(
            drain(&mut scheduler, now + Duration::from_millis(30)),
            ["c"]
        );
        assert_eq!(scheduler.len(), 0);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn same_trigger_time_is_deterministic() {
        let mut scheduler = EventScheduler::default();
        let now = Instant::now();
        let later = now + Duration::from_millis(5);

        // Same trigger time, shorter delay first.
        scheduler.schedule(now, Duration::from_millis(5), "long", false);
        scheduler.schedule(later, Duration::ZERO, "short", false);
        scheduler.schedule(later, Duration::ZERO, "short again", false);
        scheduler.schedule(now, Duration::from_millis(5), "recurring", true);

        assert_eq!(
            drain(&mut scheduler, later),
            ["short", "short again", "long", "recurring"]
        );
    }

    #[test]
    fn cancelled_events_never_fire() {
        let mut scheduler = EventScheduler::default();
        let now = Instant::now();
        let first = scheduler.schedule(now, Duration::from_millis(1), "first", false);
        scheduler.schedule(now, Duration::from_millis(2), "second", false);

        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_millis(2)));
        assert_eq!(
            drain(&mut scheduler, now + Duration::from_secs(1)),
            ["second"]
        );
    }

    #[test]
    fn recurring_events_are_rescheduled_until_cancelled() {
        let mut scheduler = EventScheduler::default();
        let now = Instant::now();
        let interval = Duration::from_millis(10);
        let handle = scheduler.schedule(now, interval, "tick", true);

        assert_eq!(drain(&mut scheduler, now + interval), ["tick"]);
        assert_eq!(scheduler.next_deadline(), Some(now + 2 * interval));
        assert_eq!(scheduler.len(), 1);

        // A late poll fires once and schedules relative to the poll time.
        let late = now + 5 * interval;
        assert_eq!(drain(&mut scheduler, late), ["tick"]);
        assert_eq!(scheduler.next_deadline(), Some(late + interval));

        assert!(scheduler.cancel(handle));
        assert_eq!(drain(&mut scheduler, late + 10 * interval), Vec::<&str>::new());
    }

    #[test]
    fn clear_discards_everything() {
        let mut scheduler = EventScheduler::default();
        let now = Instant::now();
        scheduler.schedule(now, Duration::ZERO, "a", false);
        scheduler.schedule(now, Duration::from_secs(1), "b", true);
        scheduler.clear();
        assert_eq!(scheduler.len(), 0);
        assert_eq!(drain(&mut scheduler, now + Duration::from_secs(5)), Vec::<&str>::new());
    }
}
