//! The event plane (§4.8): a bounded FIFO of protocol events the
//! binding layer drains, carrying generational handles rather than raw
//! references.
//!
//! Design Note 9 replaces the reference implementation's intrusive
//! linked list (`NormEvent` nodes threaded through `NormSession`) with
//! an explicit `VecDeque`-backed queue — there's no reason to hand-roll
//! a linked list once a `Handle` already makes a stale reference safe
//! to detect at lookup time.

use std::collections::VecDeque;

use collections::arena::Handle;

use crate::object::Object;
use crate::sender_node::SenderNode;

/// The event type enum (§4.8), one variant per `NORM_EVENT_*` constant
/// in `normApi.h`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
	TxQueueVacancy,
	TxQueueEmpty,
	TxFlushCompleted,
	TxWatermarkCompleted,
	TxObjectSent,
	TxObjectPurged,
	TxRateChanged,
	RxObjectNew,
	RxObjectInfo,
	RxObjectUpdated,
	RxObjectCompleted,
	RxObjectAborted,
	RxCmdNew,
	RemoteSenderNew,
	RemoteSenderActive,
	RemoteSenderInactive,
	RemoteSenderPurged,
	GrttUpdated,
	CcActive,
	CcInactive,
	AckingNodeNew,
	SendError,
	UserTimeout,
}

/// An event plus whatever generational handles it names. `sender`/
/// `object` are `None` when the event isn't scoped to a remote sender
/// or object (e.g. `USER_TIMEOUT`).
#[derive(Clone, Copy, Debug)]
pub struct Event {
	pub kind: EventKind,
	pub sender: Option<Handle<SenderNode>>,
	pub object: Option<Handle<Object>>,
}

impl Event {
	pub fn new(kind: EventKind) -> Self {
		Self { kind, sender: None, object: None }
	}

	pub fn with_sender(mut self, sender: Handle<SenderNode>) -> Self {
		self.sender = Some(sender);
		self
	}

	pub fn with_object(mut self, object: Handle<Object>) -> Self {
		self.object = Some(object);
		self
	}
}

/// A bounded FIFO of pending events. `SEND_ERROR` is collapsed: a
/// second one queued before the first is drained just leaves the
/// existing entry in place rather than growing the queue, matching
/// §4.8's "duplicate SEND_ERROR events are collapsed until
/// acknowledged".
pub struct EventQueue {
	queue: VecDeque<Event>,
	capacity: usize,
	send_error_pending: bool,
	dropped: u64,
}

impl EventQueue {
	pub fn new(capacity: usize) -> Self {
		Self { queue: VecDeque::with_capacity(capacity.min(256)), capacity, send_error_pending: false, dropped: 0 }
	}

	/// Queue `event`. Returns `false` (and counts a drop) if the queue
	/// is at capacity and `event` isn't a collapsible duplicate.
	pub fn push(&mut self, event: Event) -> bool {
		if event.kind == EventKind::SendError {
			if self.send_error_pending {
				return true;
			}
			self.send_error_pending = true;
		}

		if self.queue.len() >= self.capacity {
			self.dropped += 1;
			return false;
		}

		self.queue.push_back(event);
		true
	}

	pub fn pop(&mut self) -> Option<Event> {
		let event = self.queue.pop_front()?;
		if event.kind == EventKind::SendError {
			self.send_error_pending = false;
		}
		Some(event)
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	pub fn len(&self) -> usize {
		self.queue.len()
	}

	/// Count of events dropped for want of queue capacity, surfaced the
	/// same way `Pool::overruns()` is (a counter the binding layer polls
	/// rather than an event of its own, avoiding infinite regress when
	/// the queue that would carry the "queue overflowed" event is
	/// itself the thing that's full).
	pub fn dropped(&self) -> u64 {
		self.dropped
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn events_drain_in_fifo_order() {
		let mut q = EventQueue::new(8);
		q.push(Event::new(EventKind::GrttUpdated));
		q.push(Event::new(EventKind::TxRateChanged));

		assert_eq!(q.pop().map(|e| e.kind), Some(EventKind::GrttUpdated));
		assert_eq!(q.pop().map(|e| e.kind), Some(EventKind::TxRateChanged));
		assert!(q.pop().is_none());
	}

	#[test]
	fn duplicate_send_errors_collapse_until_drained() {
		let mut q = EventQueue::new(8);
		q.push(Event::new(EventKind::SendError));
		q.push(Event::new(EventKind::SendError));
		assert_eq!(q.len(), 1);

		q.pop();
		q.push(Event::new(EventKind::SendError));
		assert_eq!(q.len(), 1);
	}

	#[test]
	fn pushing_past_capacity_counts_a_drop() {
		let mut q = EventQueue::new(1);
		assert!(q.push(Event::new(EventKind::GrttUpdated)));
		assert!(!q.push(Event::new(EventKind::TxRateChanged)));
		assert_eq!(q.dropped(), 1);
	}
}
