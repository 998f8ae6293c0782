//! Pooled session lease model and the persisted lease table.

// crates.io
use uuid::Uuid;
// self
use crate::{_prelude::*, auth::Secret};

/// Time-bounded claim on one stateful upstream session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLease {
	/// Session security token.
	pub session_token: Secret,
	/// Checkout owner id while the lease is in use.
	pub owner_id: Option<String>,
	/// Instant the upstream session was created.
	pub acquired_at: OffsetDateTime,
	/// Instant of the last checkout or release.
	pub last_used_at: OffsetDateTime,
	/// Whether a caller currently holds the lease.
	pub in_use: bool,
}
impl SessionLease {
	pub(crate) fn created(session_token: Secret, now: OffsetDateTime) -> Self {
		Self { session_token, owner_id: None, acquired_at: now, last_used_at: now, in_use: false }
	}

	/// Age of the upstream session at `now`.
	pub fn age_at(&self, now: OffsetDateTime) -> Duration {
		now - self.acquired_at
	}

	/// Instant the upstream session stops being usable.
	pub fn expires_at(&self, lifetime: Duration) -> OffsetDateTime {
		self.acquired_at + lifetime
	}

	/// Returns `true` once the session outlived `lifetime`.
	pub fn is_expired_at(&self, now: OffsetDateTime, lifetime: Duration) -> bool {
		self.age_at(now) >= lifetime
	}

	/// Returns `true` when the session is inside the refresh margin but not yet expired.
	pub fn needs_reissue_at(
		&self,
		now: OffsetDateTime,
		lifetime: Duration,
		margin: Duration,
	) -> bool {
		!self.is_expired_at(now, lifetime) && self.age_at(now) >= lifetime - margin
	}

	pub(crate) fn check_out(&mut self, now: OffsetDateTime) {
		self.check_out_to(Uuid::new_v4().to_string(), now);
	}

	pub(crate) fn check_out_to(&mut self, owner: String, now: OffsetDateTime) {
		self.in_use = true;
		self.owner_id = Some(owner);
		self.last_used_at = now;
	}

	pub(crate) fn check_in(&mut self, now: OffsetDateTime) {
		self.in_use = false;
		self.owner_id = None;
		self.last_used_at = now;
	}
}
impl Debug for SessionLease {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SessionLease")
			.field("session_token", &self.session_token)
			.field("owner_id", &self.owner_id)
			.field("acquired_at", &self.acquired_at)
			.field("last_used_at", &self.last_used_at)
			.field("in_use", &self.in_use)
			.finish()
	}
}

/// Slot held for a session that is still being created upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
	/// Opaque reservation id.
	pub id: String,
	/// Instant the slot was reserved.
	pub reserved_at: OffsetDateTime,
}

/// Point-in-time pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
	/// Leases currently tracked.
	pub total: usize,
	/// Leases checked out.
	pub in_use: usize,
	/// Leases available for checkout.
	pub free: usize,
	/// Slots held for sessions being created.
	pub reserved: usize,
}

/// Result of claiming a slot in the table.
#[derive(Debug)]
pub(crate) enum Claim {
	Leased(SessionLease),
	Reserved(String),
	Exhausted,
}

/// Lease table stored under the pool key.
///
/// Leases plus reservations never exceed the pool size. Every method is a pure in-memory step;
/// callers persist the table under the pool lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PoolTable {
	pub(crate) leases: Vec<SessionLease>,
	#[serde(default)]
	pub(crate) reservations: Vec<Reservation>,
}
impl PoolTable {
	pub(crate) fn occupancy(&self) -> usize {
		self.leases.len() + self.reservations.len()
	}

	pub(crate) fn stats(&self) -> PoolStats {
		let in_use = self.leases.iter().filter(|lease| lease.in_use).count();

		PoolStats {
			total: self.leases.len(),
			in_use,
			free: self.leases.len() - in_use,
			reserved: self.reservations.len(),
		}
	}

	/// Drops expired leases and abandoned reservations; returns the sessions to close.
	pub(crate) fn evict(
		&mut self,
		now: OffsetDateTime,
		lifetime: Duration,
		reservation_timeout: Duration,
	) -> Vec<Secret> {
		let mut retired = Vec::new();

		self.leases.retain(|lease| {
			let expired = lease.is_expired_at(now, lifetime);

			if expired {
				if lease.in_use {
					tracing::warn!(
						owner = ?lease.owner_id,
						"evicting in-use session past its lifetime"
					);
				}

				retired.push(lease.session_token.clone());
			}

			!expired
		});
		self.reservations.retain(|reservation| {
			let abandoned = now - reservation.reserved_at >= reservation_timeout;

			if abandoned {
				tracing::warn!(id = %reservation.id, "reclaiming abandoned session reservation");
			}

			!abandoned
		});

		retired
	}

	/// Checks out the free lease with the most life left, or reserves a slot if there is room.
	pub(crate) fn claim(&mut self, now: OffsetDateTime, size: usize) -> Claim {
		let freshest = self
			.leases
			.iter_mut()
			.filter(|lease| !lease.in_use)
			.max_by_key(|lease| lease.acquired_at);

		if let Some(lease) = freshest {
			lease.check_out(now);

			return Claim::Leased(lease.clone());
		}
		if self.occupancy() < size {
			let id = Uuid::new_v4().to_string();

			self.reservations.push(Reservation { id: id.clone(), reserved_at: now });

			return Claim::Reserved(id);
		}

		Claim::Exhausted
	}

	/// Turns reservation `id` into a checked-out lease for `session_token`.
	///
	/// A reclaimed reservation is only replaced when the pool still has room; otherwise `None`.
	pub(crate) fn fill(
		&mut self,
		id: &str,
		session_token: Secret,
		now: OffsetDateTime,
		size: usize,
	) -> Option<SessionLease> {
		if !self.cancel(id) && self.occupancy() >= size {
			return None;
		}

		let mut lease = SessionLease::created(session_token, now);

		lease.check_out(now);
		self.leases.push(lease.clone());

		Some(lease)
	}

	/// Removes reservation `id`; returns whether it was still held.
	pub(crate) fn cancel(&mut self, id: &str) -> bool {
		let before = self.reservations.len();

		self.reservations.retain(|reservation| reservation.id != id);

		self.reservations.len() != before
	}

	/// Checks `session_token` back in; returns whether it was still pooled.
	pub(crate) fn release(&mut self, session_token: &Secret, now: OffsetDateTime) -> bool {
		match self.leases.iter_mut().find(|lease| lease.session_token == *session_token) {
			Some(lease) => {
				lease.check_in(now);

				true
			},
			None => false,
		}
	}

	/// Holds every free lease inside the refresh margin for `owner`; returns their tokens.
	pub(crate) fn mark_due(
		&mut self,
		now: OffsetDateTime,
		lifetime: Duration,
		margin: Duration,
		owner: &str,
	) -> Vec<Secret> {
		self.leases
			.iter_mut()
			.filter(|lease| !lease.in_use && lease.needs_reissue_at(now, lifetime, margin))
			.map(|lease| {
				lease.check_out_to(owner.to_owned(), now);

				lease.session_token.clone()
			})
			.collect()
	}

	/// Settles a re-issue started by [`mark_due`](Self::mark_due); returns a session to close.
	///
	/// A replacement swaps in as a free lease and retires `previous`. Without one the held
	/// lease is checked back in. A replacement whose lease was evicted meanwhile is pooled when
	/// there is room and retired otherwise.
	pub(crate) fn settle(
		&mut self,
		previous: &Secret,
		replacement: Option<Secret>,
		owner: &str,
		now: OffsetDateTime,
		size: usize,
	) -> Option<Secret> {
		let occupancy = self.occupancy();
		let held = self.leases.iter_mut().find(|lease| {
			lease.session_token == *previous && lease.owner_id.as_deref() == Some(owner)
		});

		match (held, replacement) {
			(Some(lease), Some(replacement)) => Some(
				std::mem::replace(lease, SessionLease::created(replacement, now)).session_token,
			),
			(Some(lease), None) => {
				lease.check_in(now);

				None
			},
			(None, Some(replacement)) if occupancy < size => {
				self.leases.push(SessionLease::created(replacement, now));

				None
			},
			(None, replacement) => replacement,
		}
	}
}
