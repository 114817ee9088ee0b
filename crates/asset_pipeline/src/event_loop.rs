use core::cmp::Ordering;
use core::time::Duration;
use std::collections::BinaryHeap;

/// Cooperative single-threaded task queue driven by virtual time.
///
/// Timers and animation-frame callbacks are queued with a due time and run
/// in `(due, insertion)` order when the owner advances the clock. Frame
/// callbacks are aligned to the next multiple of the frame interval, so
/// every callback requested within one interval runs in the same frame.
pub struct EventLoop<T> {
    /// Current virtual time since the loop was created.
    now: Duration,
    /// Interval between animation frames.
    frame_interval: Duration,
    /// Tie-breaker preserving insertion order for equal due times.
    next_seq: u64,
    queue: BinaryHeap<Scheduled<T>>,
    /// Distinct frame boundaries at which at least one frame callback ran.
    frames_run: u64,
    last_frame: Option<Duration>,
}

struct Scheduled<T> {
    due: Duration,
    seq: u64,
    frame: bool,
    task: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    // Reversed so the max-heap pops the earliest task first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> EventLoop<T> {
    /// Creates an empty loop at virtual time zero.
    ///
    /// # Arguments
    ///
    /// * `frame_interval` - Spacing of animation frames; clamped to at least 1ms.
    #[must_use]
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            now: Duration::ZERO,
            frame_interval: frame_interval.max(Duration::from_millis(1)),
            next_seq: 0,
            queue: BinaryHeap::new(),
            frames_run: 0,
            last_frame: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.now
    }

    #[inline]
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    #[inline]
    #[must_use]
    pub const fn frames_run(&self) -> u64 {
        self.frames_run
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Due time of the earliest queued task.
    #[must_use]
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.peek().map(|scheduled| scheduled.due)
    }

    /// Queues `task` to run once `delay` has elapsed.
    pub fn set_timeout(&mut self, delay: Duration, task: T) {
        let due = self.now.saturating_add(delay);
        self.push(due, false, task);
    }

    /// Queues `task` for the next animation frame.
    pub fn request_animation_frame(&mut self, task: T) {
        let due = self.next_frame_boundary();
        self.push(due, true, task);
    }

    fn push(&mut self, due: Duration, frame: bool, task: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.queue.push(Scheduled {
            due,
            seq,
            frame,
            task,
        });
    }

    /// First frame boundary strictly after the current time.
    fn next_frame_boundary(&self) -> Duration {
        let interval = self.frame_interval.as_nanos();
        let next = (self.now.as_nanos() / interval + 1) * interval;
        Duration::from_nanos(u64::try_from(next).unwrap_or(u64::MAX))
    }

    /// Pops the earliest task due at or before `until`, moving the clock to
    /// its due time.
    pub fn pop_due(&mut self, until: Duration) -> Option<T> {
        if self.next_due()? > until {
            return None;
        }
        let scheduled = self.queue.pop()?;
        if scheduled.due > self.now {
            self.now = scheduled.due;
        }
        if scheduled.frame && self.last_frame != Some(scheduled.due) {
            self.last_frame = Some(scheduled.due);
            self.frames_run = self.frames_run.saturating_add(1);
        }
        Some(scheduled.task)
    }

    /// Moves the clock forward without running anything.
    pub fn advance_to(&mut self, until: Duration) {
        if until > self.now {
            self.now = until;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(event_loop: &mut EventLoop<&'static str>, until: Duration) -> Vec<&'static str> {
        let mut ran = Vec::new();
        while let Some(task) = event_loop.pop_due(until) {
            ran.push(task);
        }
        event_loop.advance_to(until);
        ran
    }

    #[test]
    fn timers_run_in_due_then_insertion_order() {
        let mut event_loop = EventLoop::new(Duration::from_millis(16));
        event_loop.set_timeout(Duration::from_millis(10), "late");
        event_loop.set_timeout(Duration::ZERO, "first");
        event_loop.set_timeout(Duration::ZERO, "second");
        assert_eq!(drain(&mut event_loop, Duration::from_millis(5)), vec!["first", "second"]);
        assert_eq!(drain(&mut event_loop, Duration::from_millis(10)), vec!["late"]);
        assert_eq!(event_loop.now(), Duration::from_millis(10));
        assert_eq!(event_loop.pending(), 0);
    }

    #[test]
    fn frame_callbacks_share_a_boundary() {
        let mut event_loop = EventLoop::new(Duration::from_millis(16));
        event_loop.advance_to(Duration::from_millis(3));
        event_loop.request_animation_frame("a");
        event_loop.request_animation_frame("b");
        assert_eq!(event_loop.next_due(), Some(Duration::from_millis(16)));
        assert!(drain(&mut event_loop, Duration::from_millis(15)).is_empty());
        assert_eq!(drain(&mut event_loop, Duration::from_millis(16)), vec!["a", "b"]);
        assert_eq!(event_loop.frames_run(), 1);
        event_loop.request_animation_frame("c");
        assert_eq!(event_loop.next_due(), Some(Duration::from_millis(32)));
    }
}
