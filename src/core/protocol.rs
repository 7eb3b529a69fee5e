//! Request/response messages exchanged with miners.
//!
//! The transport is not modelled here. A miner answers a validator query
//! with a `PatternResponse`, and the validator acknowledges each
//! adjudicated pattern with a `PatternQueryAck`.

use serde::{Deserialize, Serialize};

use super::DetectedPattern;

/// Default cap on the patterns a single response may carry.
pub const MAX_PATTERNS_PER_RESPONSE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternResponse {
    pub miner_hotkey: String,
    #[serde(default)]
    pub query_timestamp: i64,
    #[serde(default)]
    pub detected_patterns: Vec<DetectedPattern>,
}

impl PatternResponse {
    pub fn pattern_count(&self) -> usize {
        self.detected_patterns.len()
    }

    /// Splits into the patterns admitted for processing and the overflow
    /// beyond `cap`.
    pub fn split_at_cap(self, cap: usize) -> (Vec<DetectedPattern>, Vec<DetectedPattern>) {
        let mut admitted = self.detected_patterns;
        let overflow = if admitted.len() > cap {
            admitted.split_off(cap)
        } else {
            Vec::new()
        };
        (admitted, overflow)
    }
}

/// Acknowledgement sent back to the miner once a pattern is adjudicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternQueryAck {
    pub pattern_id: String,
    pub disposition: String,
}
