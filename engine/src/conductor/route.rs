//! Branch decision after code validation

use super::state::CodeValidity;
use serde::{Deserialize, Serialize};

/// Where the run goes after validate-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Run the candidate in the sandbox
    Execute,
    /// Generate another candidate with the rejection fed back
    Retry,
    /// Give up: the retry budget is spent
    Abort,
}

/// Decide the next step from the validity of the current candidate and
/// the retries already spent. Code that was never validated is treated as
/// rejected.
pub fn route(code_valid: CodeValidity, retry_count: u32, max_retries: u32) -> Route {
    match code_valid {
        CodeValidity::Valid => Route::Execute,
        CodeValidity::Rejected | CodeValidity::Unknown if retry_count < max_retries => {
            Route::Retry
        }
        CodeValidity::Rejected | CodeValidity::Unknown => Route::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_code_executes_regardless_of_retries() {
        assert_eq!(route(CodeValidity::Valid, 0, 2), Route::Execute);
        assert_eq!(route(CodeValidity::Valid, 2, 2), Route::Execute);
    }

    #[test]
    fn test_rejected_code_retries_until_budget() {
        assert_eq!(route(CodeValidity::Rejected, 0, 2), Route::Retry);
        assert_eq!(route(CodeValidity::Rejected, 1, 2), Route::Retry);
        assert_eq!(route(CodeValidity::Rejected, 2, 2), Route::Abort);
        assert_eq!(route(CodeValidity::Unknown, 0, 0), Route::Abort);
    }

    proptest! {
        #[test]
        fn prop_generation_count_is_bounded(max_retries in 0u32..8) {
            // Every candidate rejected: count generator invocations
            let mut retry_count = 0;
            let mut generations = 1;
            while route(CodeValidity::Rejected, retry_count, max_retries) == Route::Retry {
                retry_count += 1;
                generations += 1;
            }
            prop_assert_eq!(generations, max_retries + 1);
            prop_assert!(retry_count <= max_retries);
        }
    }
}
