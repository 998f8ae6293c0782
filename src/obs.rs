//! Observability helpers shared by broker components.
//!
//! Every public operation runs inside a `credential_broker.op` span carrying `op` and `stage`
//! fields. With the `metrics` feature, `credential_broker_op_total` counts attempts and
//! terminal outcomes, and `credential_broker_op_duration_seconds` records wall time per
//! finished operation.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Broker operations observed by spans and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
	/// Token cache read or refresh.
	Token,
	/// Session pool checkout, release, or sweep.
	Session,
	/// Distributed lock acquisition.
	Lock,
	/// Rate limiter attempt.
	RateLimit,
}
impl OpKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpKind::Token => "token",
			OpKind::Session => "session",
			OpKind::Lock => "lock",
			OpKind::RateLimit => "rate_limit",
		}
	}
}
impl Display for OpKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpOutcome {
	/// Entry to a broker operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl OpOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpOutcome::Attempt => "attempt",
			OpOutcome::Success => "success",
			OpOutcome::Failure => "failure",
		}
	}
}
impl Display for OpOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Runs `fut` inside an operation span, recording attempt and terminal outcome.
pub(crate) async fn observe<T, Fut>(kind: OpKind, stage: &'static str, fut: Fut) -> Result<T>
where
	Fut: Future<Output = Result<T>>,
{
	let span = OpSpan::new(kind, stage);
	let started = std::time::Instant::now();

	record_op_outcome(kind, stage, OpOutcome::Attempt);

	let result = span.instrument(fut).await;
	let outcome = if result.is_ok() { OpOutcome::Success } else { OpOutcome::Failure };

	record_op_outcome(kind, stage, outcome);
	record_op_duration(kind, stage, outcome, started.elapsed());

	result
}
