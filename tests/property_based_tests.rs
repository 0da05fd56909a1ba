mod common;

use common::strategies::*;
use frank_core::concurrency::ResourceLimiter;
use frank_core::constants::context_keys;
use frank_core::message::RawMessageWrapper;
use frank_core::receiver::BackoffState;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// Property: backoff starts at one second, never shrinks and never passes its cap
    #[test]
    fn backoff_grows_monotonically_up_to_cap(cap in backoff_cap_strategy(), steps in 1usize..40) {
        let mut state = BackoffState::new(Duration::from_secs(cap));
        let mut previous = Duration::ZERO;
        let mut suspensions = 0;

        for n in 0..steps {
            let step = state.next_step();
            if n == 0 {
                prop_assert_eq!(step.delay, Duration::from_secs(1));
            }
            prop_assert!(step.delay >= previous);
            prop_assert!(step.delay <= Duration::from_secs(cap.max(1)));
            if step.suspended {
                suspensions += 1;
            }
            previous = step.delay;
        }
        prop_assert!(suspensions <= 1, "suspension is announced once, got {}", suspensions);

        let was_suspended = state.reset();
        prop_assert_eq!(was_suspended, suspensions == 1);
        prop_assert_eq!(state.current(), Duration::from_secs(1));
    }

    /// Property: an idle limiter hands out exactly as many permits as its ceiling
    #[test]
    fn limiter_ceiling_tracks_adjustments(initial in 1usize..8, ops in limiter_ops_strategy()) {
        let limiter = ResourceLimiter::new(initial);
        let mut expected = initial;

        for op in ops {
            match op {
                LimiterOp::Increase(n) => {
                    limiter.increase_max_resource_count(n).unwrap();
                    expected += n as usize;
                }
                LimiterOp::Reduce(n) => {
                    let result = limiter.reduce_max_resource_count(n);
                    if n as usize > expected {
                        prop_assert!(result.is_err());
                    } else {
                        prop_assert!(result.is_ok());
                        expected -= n as usize;
                    }
                }
            }
            prop_assert_eq!(limiter.max_resource_limit(), expected);
        }

        let tokens: Vec<_> = (0..expected).filter_map(|_| limiter.try_acquire()).collect();
        prop_assert_eq!(tokens.len(), expected);
        prop_assert!(limiter.try_acquire().is_none());

        drop(tokens);
        prop_assert_eq!(limiter.available_permits(), expected);
    }

    /// Property: the id fields and their context entries never disagree
    #[test]
    fn wrapper_ids_mirror_into_context(id in message_id_strategy(), cid in message_id_strategy()) {
        let mut wrapper = RawMessageWrapper::new((), Some(id.clone()), Some(cid.clone()));
        prop_assert_eq!(wrapper.context()[context_keys::MESSAGE_ID].as_str(), Some(id.as_str()));
        prop_assert_eq!(
            wrapper.context()[context_keys::CORRELATION_ID].as_str(),
            Some(cid.as_str())
        );

        wrapper.insert_context(context_keys::MESSAGE_ID, cid.clone());
        prop_assert_eq!(wrapper.id(), Some(cid.as_str()));

        wrapper.set_id(None);
        prop_assert!(wrapper.id().is_none());
        prop_assert!(!wrapper.context().contains_key(context_keys::MESSAGE_ID));
    }
}
