//! NMT errors.

use thiserror::Error;

/// Failure modes of the NMT error-control mechanisms (heartbeat, node-guarding).
#[derive(Debug, Error)]
pub enum NmtError {
	/// No heartbeat frame arrived from a monitored node within its configured interval.
	#[error("heartbeat failed for node {node_id}")]
	HeartbeatFailed {
		/// The node that stopped producing heartbeats.
		node_id: u8,
	},
	/// A node-guarding target failed to answer `life_time_factor` consecutive RTR requests.
	#[error("life guarding failed for node {node_id}")]
	LifeGuardingFailed {
		/// The node that stopped answering guarding requests.
		node_id: u8,
	},
}
