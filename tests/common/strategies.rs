//! Proptest strategies for receiver tuning values.

use proptest::prelude::*;

/// Backoff caps between one second and ten minutes
pub fn backoff_cap_strategy() -> impl Strategy<Value = u64> {
    1u64..=600
}

/// Operations applied to a resource limiter
#[derive(Debug, Clone, Copy)]
pub enum LimiterOp {
    Increase(i64),
    Reduce(i64),
}

pub fn limiter_op_strategy() -> impl Strategy<Value = LimiterOp> {
    prop_oneof![
        (0i64..5).prop_map(LimiterOp::Increase),
        (0i64..5).prop_map(LimiterOp::Reduce),
    ]
}

pub fn limiter_ops_strategy() -> impl Strategy<Value = Vec<LimiterOp>> {
    prop::collection::vec(limiter_op_strategy(), 0..20)
}

/// Message ids as transports hand them out
pub fn message_id_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9:._-]{1,40}"
}
