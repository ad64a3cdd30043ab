//! Lane relay version.

/// The version of the lane relay.
pub const LANE_RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");
