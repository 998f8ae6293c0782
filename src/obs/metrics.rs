// self
use crate::{
	_prelude::*,
	obs::{OpKind, OpOutcome},
};

/// Counts one `outcome` of `kind` at `stage` (no-op without the `metrics` feature).
pub fn record_op_outcome(kind: OpKind, stage: &'static str, outcome: OpOutcome) {
	#[cfg(feature = "metrics")]
	metrics::counter!(
		"credential_broker_op_total",
		"op" => kind.as_str(),
		"stage" => stage,
		"outcome" => outcome.as_str()
	)
	.increment(1);

	#[cfg(not(feature = "metrics"))]
	let _ = (kind, stage, outcome);
}

/// Records how long a finished operation took, labeled by its terminal outcome.
pub fn record_op_duration(
	kind: OpKind,
	stage: &'static str,
	outcome: OpOutcome,
	elapsed: StdDuration,
) {
	#[cfg(feature = "metrics")]
	metrics::histogram!(
		"credential_broker_op_duration_seconds",
		"op" => kind.as_str(),
		"stage" => stage,
		"outcome" => outcome.as_str()
	)
	.record(elapsed.as_secs_f64());

	#[cfg(not(feature = "metrics"))]
	let _ = (kind, stage, outcome, elapsed);
}
