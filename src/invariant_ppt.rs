//! Runtime invariant checks with contract-test support
//!
//! Production code states its invariants with [`assert_invariant!`]; every
//! check is recorded per thread so a test can afterwards prove that the code
//! path it exercised actually verified the invariants it cares about.
//!
//! # Usage
//!
//! ```rust,ignore
//! use crabcapture::assert_invariant;
//!
//! assert_invariant!(
//!     ring.len() <= depth,
//!     "ZSL ring never exceeds its depth",
//!     "ZslRing::push_buffer"
//! );
//!
//! // In a test, after driving the ring:
//! crabcapture::invariant_ppt::contract_test("zsl ring", &[
//!     "ZSL ring never exceeds its depth",
//! ]);
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::thread_local;

thread_local! {
    static CHECKED: RefCell<BTreeSet<String>> = RefCell::new(BTreeSet::new());
}

/// Assert an invariant and record that it was checked.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    CHECKED.with(|checked| {
        checked.borrow_mut().insert(message.to_string());
    });

    if !condition {
        let ctx = context.unwrap_or("unknown");
        log::error!("Invariant violated in {}: {}", ctx, message);
        panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
    }
}

/// Fail unless every invariant in `required` was checked on this thread.
///
/// # Panics
/// Panics listing the invariants that were never reached.
pub fn contract_test(test_name: &str, required: &[&str]) {
    let missing: Vec<&str> = CHECKED.with(|checked| {
        let checked = checked.borrow();
        required
            .iter()
            .copied()
            .filter(|inv| !checked.contains(*inv))
            .collect()
    });

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: invariants never checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

/// Invariants checked so far on this thread, in sorted order.
pub fn checked_invariants() -> Vec<String> {
    CHECKED.with(|checked| checked.borrow().iter().cloned().collect())
}

/// Forget every recorded check on this thread.
pub fn clear_invariant_log() {
    CHECKED.with(|checked| checked.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_invariants_are_recorded() {
        clear_invariant_log();
        crate::assert_invariant!(true, "always holds");
        assert_eq!(checked_invariants(), vec!["always holds".to_string()]);
        contract_test("recorded", &["always holds"]);
    }

    #[test]
    #[should_panic(expected = "CONTRACT FAILURE")]
    fn test_missing_invariant_fails_contract() {
        clear_invariant_log();
        contract_test("missing", &["never checked"]);
    }

    #[test]
    #[should_panic(expected = "INVARIANT VIOLATION [ctx]")]
    fn test_violation_panics() {
        crate::assert_invariant!(false, "broken", "ctx");
    }
}
