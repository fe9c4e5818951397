//! Priority queues with at-least-once delivery.
//!
//! Three independent tiers (high/normal/low). Each message carries an explicit
//! delivery state:
//!
//! - `Pending`: waiting in tier order, visible once `not_before` has passed
//! - `Delivered`: handed to a consumer and hidden until `visible_at`
//! - `DeadLettered`: removed from the tier and recorded on the [`DeadLetterChannel`]
//!
//! A delivered message that is neither acked nor nacked before its visibility
//! window closes counts as a failed delivery. Redelivered and deferred messages
//! re-enter at the back of their tier so a poison message cannot block the head.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::scheduler::job::Priority;

/// Envelope handed to the dispatcher for one delivery of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub priority: Priority,
    /// Position in the tier at first enqueue
    pub sequence: u64,
    /// Deliveries so far, including this one
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending { not_before: Instant },
    Delivered { attempt: u32, visible_at: Instant },
    DeadLettered,
}

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    state: DeliveryState,
    failures: u32,
}

/// A message that exhausted its delivery budget.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub priority: Priority,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Holding area for messages that exceeded their retry budget.
///
/// Entries stay here for operators; the dispatcher separately drains the ones
/// it has not reconciled yet.
#[derive(Debug, Default)]
pub struct DeadLetterChannel {
    entries: Mutex<Vec<DeadLetter>>,
    unreconciled: Mutex<VecDeque<DeadLetter>>,
    alerts: AtomicU64,
}

impl DeadLetterChannel {
    fn push(&self, letter: DeadLetter) {
        tracing::error!(
            job_id = %letter.job_id,
            message_id = %letter.message_id,
            priority = %letter.priority,
            attempts = letter.attempts,
            reason = %letter.reason,
            "ALERT: message moved to dead-letter channel"
        );
        self.alerts.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push(letter.clone());
        lock(&self.unreconciled).push_back(letter);
    }

    pub fn contains(&self, message_id: &Uuid) -> bool {
        lock(&self.entries)
            .iter()
            .any(|l| l.message_id == *message_id)
    }

    /// Every message ever dead-lettered, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        lock(&self.entries).clone()
    }

    /// Take entries whose jobs have not been reconciled yet.
    pub fn drain_unreconciled(&self) -> Vec<DeadLetter> {
        lock(&self.unreconciled).drain(..).collect()
    }

    /// Number of alerts raised since startup.
    pub fn alert_count(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct TierInner {
    /// Message ids in delivery order; only `Pending` messages live here
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, Entry>,
    /// job_id -> (message_id, enqueued at)
    dedup: HashMap<Uuid, (Uuid, Instant)>,
    next_sequence: u64,
}

/// One order-preserving priority channel.
#[derive(Debug)]
pub struct Tier {
    priority: Priority,
    config: QueueConfig,
    inner: Mutex<TierInner>,
    notify: Arc<Notify>,
    dead_letters: Arc<DeadLetterChannel>,
}

impl Tier {
    fn new(
        priority: Priority,
        config: QueueConfig,
        notify: Arc<Notify>,
        dead_letters: Arc<DeadLetterChannel>,
    ) -> Self {
        Self {
            priority,
            config,
            inner: Mutex::new(TierInner::default()),
            notify,
            dead_letters,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Enqueue a job. Re-enqueuing the same job inside the dedup window
    /// returns the original message id and changes nothing.
    pub fn enqueue(&self, job_id: Uuid) -> Result<Uuid, QueueError> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);

        let window = self.config.dedup_window;
        inner
            .dedup
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < window);
        if let Some((message_id, _)) = inner.dedup.get(&job_id) {
            tracing::debug!(job_id = %job_id, message_id = %message_id, "Duplicate enqueue ignored");
            return Ok(*message_id);
        }

        if inner.entries.len() >= self.config.capacity {
            return Err(QueueError::Full {
                priority: self.priority,
                capacity: self.config.capacity,
            });
        }

        let message_id = Uuid::new_v4();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.insert(
            message_id,
            Entry {
                message: QueueMessage {
                    message_id,
                    job_id,
                    priority: self.priority,
                    sequence,
                    attempt: 0,
                    enqueued_at: Utc::now(),
                },
                state: DeliveryState::Pending { not_before: now },
                failures: 0,
            },
        );
        inner.order.push_back(message_id);
        if !window.is_zero() {
            inner.dedup.insert(job_id, (message_id, now));
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(message_id)
    }

    /// Take the oldest visible message without waiting.
    pub fn try_dequeue(&self) -> Option<QueueMessage> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        self.reclaim_expired(&mut inner, now);

        let position = inner.order.iter().position(|id| {
            matches!(
                inner.entries.get(id).map(|e| e.state),
                Some(DeliveryState::Pending { not_before }) if not_before <= now
            )
        })?;
        let message_id = inner.order.remove(position)?;
        let visibility = self.config.visibility_timeout;
        let entry = inner.entries.get_mut(&message_id)?;
        entry.message.attempt += 1;
        entry.state = DeliveryState::Delivered {
            attempt: entry.message.attempt,
            visible_at: now + visibility,
        };
        Some(entry.message.clone())
    }

    /// Wait up to `max_wait` for a message to become available.
    pub async fn dequeue(&self, max_wait: Duration) -> Option<QueueMessage> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_dequeue() {
                return Some(message);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake_at = self.next_wakeup().map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Permanently remove a message.
    pub fn ack(&self, message_id: &Uuid) -> bool {
        let mut inner = lock(&self.inner);
        if inner.entries.remove(message_id).is_none() {
            return false;
        }
        inner.order.retain(|id| id != message_id);
        true
    }

    /// Report a failed delivery. The message goes to the back of the tier, or
    /// to the dead-letter channel once its failure budget is spent.
    pub fn nack(&self, message_id: &Uuid) -> bool {
        self.nack_after(message_id, Duration::ZERO)
    }

    /// Like [`Tier::nack`], but the message stays hidden for `backoff`.
    pub fn nack_after(&self, message_id: &Uuid, backoff: Duration) -> bool {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(message_id) else {
            return false;
        };
        if !matches!(entry.state, DeliveryState::Delivered { .. }) {
            return false;
        }
        entry.failures += 1;
        let exhausted = entry.failures >= self.config.max_delivery_attempts;
        if exhausted {
            let reason = format!("{} failed deliveries", entry.failures);
            self.divert(&mut inner, message_id, reason);
        } else {
            entry.state = DeliveryState::Pending {
                not_before: now + backoff,
            };
            inner.order.push_back(*message_id);
        }
        drop(inner);

        self.notify.notify_waiters();
        true
    }

    /// Return a delivered message without counting a failure. It becomes
    /// visible again after `delay`, behind everything already waiting.
    pub fn defer(&self, message_id: &Uuid, delay: Duration) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(message_id) else {
            return false;
        };
        if !matches!(entry.state, DeliveryState::Delivered { .. }) {
            return false;
        }
        entry.state = DeliveryState::Pending {
            not_before: Instant::now() + delay,
        };
        inner.order.push_back(*message_id);
        true
    }

    /// Divert a message to the dead-letter channel immediately.
    pub fn dead_letter(&self, message_id: &Uuid, reason: impl Into<String>) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.entries.contains_key(message_id) {
            return false;
        }
        inner.order.retain(|id| id != message_id);
        self.divert(&mut inner, message_id, reason.into());
        true
    }

    /// Live messages (pending or in flight).
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently waiting for delivery.
    pub fn pending(&self) -> usize {
        lock(&self.inner).order.len()
    }

    /// Current state of a message, or `None` once it has been acked.
    pub fn delivery_state(&self, message_id: &Uuid) -> Option<DeliveryState> {
        if let Some(entry) = lock(&self.inner).entries.get(message_id) {
            return Some(entry.state);
        }
        self.dead_letters
            .contains(message_id)
            .then_some(DeliveryState::DeadLettered)
    }

    fn reclaim_expired(&self, inner: &mut TierInner, now: Instant) {
        let mut expired: Vec<(u64, Uuid, u32)> = inner
            .entries
            .values()
            .filter_map(|e| match e.state {
                DeliveryState::Delivered {
                    attempt,
                    visible_at,
                } if visible_at <= now => Some((e.message.sequence, e.message.message_id, attempt)),
                _ => None,
            })
            .collect();
        expired.sort_unstable();

        for (_, message_id, attempt) in expired {
            let Some(entry) = inner.entries.get_mut(&message_id) else {
                continue;
            };
            entry.failures += 1;
            tracing::warn!(
                job_id = %entry.message.job_id,
                message_id = %message_id,
                attempt,
                failures = entry.failures,
                "Visibility window expired without ack"
            );
            if entry.failures >= self.config.max_delivery_attempts {
                let reason = format!(
                    "visibility window expired after {} deliveries",
                    entry.failures
                );
                self.divert(inner, &message_id, reason);
            } else {
                entry.state = DeliveryState::Pending { not_before: now };
                inner.order.push_back(message_id);
            }
        }
    }

    fn divert(&self, inner: &mut TierInner, message_id: &Uuid, reason: String) {
        if let Some(entry) = inner.entries.remove(message_id) {
            self.dead_letters.push(DeadLetter {
                message_id: *message_id,
                job_id: entry.message.job_id,
                priority: self.priority,
                attempts: entry.message.attempt,
                reason,
                dead_lettered_at: Utc::now(),
            });
        }
    }

    /// Earliest instant at which a hidden or deferred message becomes visible.
    fn next_wakeup(&self) -> Option<Instant> {
        lock(&self.inner)
            .entries
            .values()
            .filter_map(|e| match e.state {
                DeliveryState::Pending { not_before } => Some(not_before),
                DeliveryState::Delivered { visible_at, .. } => Some(visible_at),
                DeliveryState::DeadLettered => None,
            })
            .min()
    }
}

/// The three tiers plus their shared dead-letter channel.
#[derive(Debug)]
pub struct PriorityQueues {
    tiers: [Tier; 3],
    notify: Arc<Notify>,
    dead_letters: Arc<DeadLetterChannel>,
}

impl PriorityQueues {
    pub fn new(config: QueueConfig) -> Self {
        let notify = Arc::new(Notify::new());
        let dead_letters = Arc::new(DeadLetterChannel::default());
        let tier = |p| Tier::new(p, config.clone(), notify.clone(), dead_letters.clone());
        Self {
            tiers: [
                tier(Priority::High),
                tier(Priority::Normal),
                tier(Priority::Low),
            ],
            notify,
            dead_letters,
        }
    }

    pub fn tier(&self, priority: Priority) -> &Tier {
        &self.tiers[priority.index()]
    }

    pub fn enqueue(&self, job_id: Uuid, priority: Priority) -> Result<Uuid, QueueError> {
        self.tier(priority).enqueue(job_id)
    }

    /// Poll high, then normal, then low. A lower tier is only consulted when
    /// every higher tier has nothing visible.
    pub fn poll_strict(&self) -> Option<QueueMessage> {
        Priority::ALL
            .iter()
            .find_map(|p| self.tier(*p).try_dequeue())
    }

    /// Sleep until any tier may have work, or `max_wait` passes.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let deadline = Instant::now() + max_wait;
        let wake_at = self
            .tiers
            .iter()
            .filter_map(Tier::next_wakeup)
            .min()
            .map_or(deadline, |at| at.min(deadline));
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }

    pub fn ack(&self, message: &QueueMessage) -> bool {
        self.tier(message.priority).ack(&message.message_id)
    }

    pub fn nack(&self, message: &QueueMessage) -> bool {
        self.tier(message.priority).nack(&message.message_id)
    }

    pub fn nack_after(&self, message: &QueueMessage, backoff: Duration) -> bool {
        self.tier(message.priority)
            .nack_after(&message.message_id, backoff)
    }

    pub fn defer(&self, message: &QueueMessage, delay: Duration) -> bool {
        self.tier(message.priority).defer(&message.message_id, delay)
    }

    pub fn dead_letter(&self, message: &QueueMessage, reason: impl Into<String>) -> bool {
        self.tier(message.priority)
            .dead_letter(&message.message_id, reason)
    }

    pub fn dead_letters(&self) -> &DeadLetterChannel {
        &self.dead_letters
    }

    /// Live messages per tier, in priority order.
    pub fn depths(&self) -> [usize; 3] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
        ]
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> PriorityQueues {
        PriorityQueues::new(QueueConfig {
            visibility_timeout: Duration::from_secs(30),
            ..QueueConfig::default()
        })
    }

    #[test]
    fn fifo_within_a_tier() {
        let q = queues();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(a, Priority::Normal).unwrap();
        q.enqueue(b, Priority::Normal).unwrap();

        assert_eq!(q.poll_strict().unwrap().job_id, a);
        assert_eq!(q.poll_strict().unwrap().job_id, b);
        assert!(q.poll_strict().is_none());
    }

    #[test]
    fn strict_priority_across_tiers() {
        let q = queues();
        let low = Uuid::new_v4();
        let normal = Uuid::new_v4();
        let high = Uuid::new_v4();
        q.enqueue(low, Priority::Low).unwrap();
        q.enqueue(normal, Priority::Normal).unwrap();
        q.enqueue(high, Priority::High).unwrap();

        let order: Vec<Uuid> = std::iter::from_fn(|| q.poll_strict())
            .map(|m| m.job_id)
            .collect();
        assert_eq!(order, vec![high, normal, low]);
    }

    #[test]
    fn enqueue_is_idempotent_within_dedup_window() {
        let q = queues();
        let job = Uuid::new_v4();
        let first = q.enqueue(job, Priority::High).unwrap();
        let second = q.enqueue(job, Priority::High).unwrap();
        assert_eq!(first, second);
        assert_eq!(q.tier(Priority::High).len(), 1);
    }

    #[test]
    fn nacked_message_goes_to_the_back() {
        let q = queues();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(a, Priority::Low).unwrap();
        q.enqueue(b, Priority::Low).unwrap();

        let first = q.poll_strict().unwrap();
        assert!(q.nack(&first));

        let next = q.poll_strict().unwrap();
        assert_eq!(next.job_id, b);
        let redelivered = q.poll_strict().unwrap();
        assert_eq!(redelivered.job_id, a);
        assert_eq!(redelivered.attempt, 2);
    }

    #[test]
    fn ack_removes_permanently() {
        let q = queues();
        q.enqueue(Uuid::new_v4(), Priority::Normal).unwrap();
        let msg = q.poll_strict().unwrap();
        assert!(q.ack(&msg));
        assert!(!q.ack(&msg));
        assert_eq!(q.depths(), [0, 0, 0]);
    }

    #[test]
    fn exhausted_nacks_dead_letter_with_alert() {
        let q = queues();
        let job = Uuid::new_v4();
        q.enqueue(job, Priority::High).unwrap();

        for _ in 0..3 {
            let msg = q.poll_strict().unwrap();
            q.nack(&msg);
        }

        assert!(q.poll_strict().is_none());
        let letters = q.dead_letters().entries();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, job);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(q.dead_letters().alert_count(), 1);
    }

    #[test]
    fn deferred_message_does_not_count_as_failure() {
        let q = queues();
        q.enqueue(Uuid::new_v4(), Priority::Normal).unwrap();

        for _ in 0..5 {
            let msg = q.poll_strict().unwrap();
            assert!(q.defer(&msg, Duration::ZERO));
        }
        assert!(q.dead_letters().is_empty());
        assert_eq!(q.tier(Priority::Normal).len(), 1);
    }

    #[test]
    fn full_tier_rejects_enqueue() {
        let q = PriorityQueues::new(QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        });
        q.enqueue(Uuid::new_v4(), Priority::Low).unwrap();
        assert_eq!(
            q.enqueue(Uuid::new_v4(), Priority::Low),
            Err(QueueError::Full {
                priority: Priority::Low,
                capacity: 1
            })
        );
    }
}
