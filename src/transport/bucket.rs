use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

/// Rate-limited FIFO of outbound sends.
///
/// At most `limit` tasks execute in any sliding window of `window`. The bucket
/// keeps the instants of the last `limit` executions; when the oldest of them
/// is still inside the window the bucket locks itself until it falls out.
/// The owner drives time: it calls [`Bucket::shift`] after adding work and
/// again once [`Bucket::unlock_deadline`] has passed.
pub struct Bucket<T> {
    limit: usize,
    window: Duration,
    queue: VecDeque<T>,
    sent: VecDeque<Instant>,
    locked: bool,
    unlock_at: Option<Instant>,
}

impl<T> Bucket<T> {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            queue: VecDeque::new(),
            sent: VecDeque::with_capacity(limit.max(1)),
            locked: false,
            unlock_at: None,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// When a timed lock expires, if one is installed.
    pub fn unlock_deadline(&self) -> Option<Instant> {
        if self.locked { self.unlock_at } else { None }
    }

    /// Queues a task. Urgent tasks jump to the front.
    pub fn add(&mut self, task: T, urgent: bool) {
        if urgent {
            self.queue.push_front(task);
        } else {
            self.queue.push_back(task);
        }
    }

    /// Executes queued tasks in order until the queue drains, the bucket locks,
    /// or a task hands itself back.
    ///
    /// `exec` returns `Err(task)` when the send could not happen (the socket is
    /// gone); the task is re-queued at the front and the bucket locks until
    /// someone calls [`Bucket::unlock`]. Returns the number of tasks executed.
    pub fn shift<F>(&mut self, now: Instant, mut exec: F) -> usize
    where
        F: FnMut(T) -> Result<(), T>,
    {
        let mut executed = 0;
        loop {
            self.poll_unlock(now);
            if self.locked || self.queue.is_empty() {
                break;
            }

            self.expire(now);
            if self.sent.len() >= self.limit {
                if let Some(&oldest) = self.sent.front() {
                    let remaining = (oldest + self.window).saturating_duration_since(now);
                    self.lock(Some(remaining), now);
                }
                break;
            }

            let Some(task) = self.queue.pop_front() else {
                break;
            };
            match exec(task) {
                Ok(()) => {
                    self.sent.push_back(now);
                    executed += 1;
                }
                Err(task) => {
                    self.queue.push_front(task);
                    self.lock(None, now);
                    break;
                }
            }
        }
        executed
    }

    /// Locks the bucket, replacing any pending unlock. `None` locks until
    /// [`Bucket::unlock`] is called.
    pub fn lock(&mut self, duration: Option<Duration>, now: Instant) {
        self.locked = true;
        self.unlock_at = duration.map(|d| now + d);
    }

    pub fn unlock(&mut self) {
        self.locked = false;
        self.unlock_at = None;
    }

    /// Releases a timed lock whose deadline has passed. Returns true if the
    /// bucket was unlocked by this call.
    pub fn poll_unlock(&mut self, now: Instant) -> bool {
        match self.unlock_at {
            Some(at) if self.locked && at <= now => {
                self.unlock();
                true
            }
            _ => false,
        }
    }

    /// Drops every queued task. Send history is kept so the rate stays honest
    /// across reconnects.
    pub fn clear(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&at) = self.sent.front() {
            if now.saturating_duration_since(at) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(bucket: &mut Bucket<u32>, now: Instant, out: &mut Vec<u32>) -> usize {
        bucket.shift(now, |task| {
            out.push(task);
            Ok(())
        })
    }

    #[test]
    fn executes_in_fifo_order() {
        let now = Instant::now();
        let mut bucket = Bucket::new(10, Duration::from_secs(1));
        let mut out = Vec::new();

        for i in 0..5 {
            bucket.add(i, false);
        }
        assert_eq!(drain(&mut bucket, now, &mut out), 5);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(bucket.is_empty());
    }

    #[test]
    fn urgent_tasks_jump_the_queue() {
        let now = Instant::now();
        let mut bucket = Bucket::new(10, Duration::from_secs(1));
        let mut out = Vec::new();

        bucket.lock(None, now);
        bucket.add(1, false);
        bucket.add(2, false);
        bucket.add(99, true);
        bucket.unlock();

        drain(&mut bucket, now, &mut out);
        assert_eq!(out, vec![99, 1, 2]);
    }

    #[test]
    fn locks_for_the_rest_of_the_window_at_the_limit() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2, Duration::from_millis(1000));
        let mut out = Vec::new();

        for i in 0..5 {
            bucket.add(i, false);
        }
        assert_eq!(drain(&mut bucket, start, &mut out), 2);
        assert!(bucket.is_locked());
        assert_eq!(
            bucket.unlock_deadline(),
            Some(start + Duration::from_millis(1000))
        );

        // Still locked just before the window ends.
        let early = start + Duration::from_millis(999);
        assert_eq!(drain(&mut bucket, early, &mut out), 0);

        let later = start + Duration::from_millis(1000);
        assert_eq!(drain(&mut bucket, later, &mut out), 2);
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn never_exceeds_limit_in_any_sliding_window() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let limit = 3;
        let mut bucket = Bucket::new(limit, window);
        let mut sends: Vec<Instant> = Vec::new();

        for i in 0..20 {
            bucket.add(i, false);
        }

        // Drive the bucket with an irregular clock.
        let mut now = start;
        for step in 0..200u64 {
            now += Duration::from_millis(7 + step % 5);
            bucket.shift(now, |_| {
                sends.push(now);
                Ok(())
            });
        }

        assert_eq!(sends.len(), 20);
        for (i, &at) in sends.iter().enumerate() {
            let in_window = sends[i..]
                .iter()
                .take_while(|&&other| other.duration_since(at) < window)
                .count();
            assert!(in_window <= limit, "{in_window} sends within {window:?}");
        }
    }

    #[test]
    fn failed_task_is_requeued_at_front_and_locks() {
        let now = Instant::now();
        let mut bucket = Bucket::new(10, Duration::from_secs(1));
        bucket.add(1, false);
        bucket.add(2, false);

        let executed = bucket.shift(now, Err);
        assert_eq!(executed, 0);
        assert!(bucket.is_locked());
        assert_eq!(bucket.unlock_deadline(), None);
        assert_eq!(bucket.len(), 2);

        bucket.unlock();
        let mut out = Vec::new();
        drain(&mut bucket, now, &mut out);
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn relocking_replaces_the_pending_unlock() {
        let now = Instant::now();
        let mut bucket: Bucket<u32> = Bucket::new(1, Duration::from_secs(1));
        bucket.lock(Some(Duration::from_millis(10)), now);
        bucket.lock(None, now);

        assert!(!bucket.poll_unlock(now + Duration::from_secs(5)));
        assert!(bucket.is_locked());
    }

    #[test]
    fn clear_returns_dropped_tasks() {
        let mut bucket = Bucket::new(1, Duration::from_secs(1));
        bucket.add(1, false);
        bucket.add(2, false);
        assert_eq!(bucket.clear(), vec![1, 2]);
        assert!(bucket.is_empty());
    }
}
