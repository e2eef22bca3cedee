//! Policy gate for generated code
//!
//! A deterministic static scan run before any code reaches the sandbox.
//! The deny-list is plain case-insensitive containment: a pattern that
//! appears anywhere in the text, comments and string literals included,
//! rejects the code.
//!
//! The scan over-approximates: every program in which a denied pattern
//! occurs as real code is rejected, and so is every program that merely
//! mentions one in a comment or string. Harmless text can therefore be
//! refused, but a denied call can never pass.
//!
//! # Example
//!
//! ```
//! use sift_engine::policy::{PolicyCategory, PolicyValidator};
//!
//! let validator = PolicyValidator::new().unwrap();
//! let verdict = validator.evaluate("import os\nresult = os.system('ls')");
//! assert!(!verdict.valid);
//! assert!(verdict.categories().contains(&PolicyCategory::SystemAccess));
//! ```

use crate::sandbox::parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Binding every program must assign its answer to
const RESULT_NAME: &str = "result";

/// What kind of rule a piece of code broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCategory {
    /// Process, shell or OS access
    SystemAccess,
    /// Evaluating code built at run time
    DynamicEvaluation,
    /// Writing files or deleting data
    DestructiveMutation,
    /// Raw SQL statements
    QueryInjection,
    /// The code does not parse
    Syntax,
    /// The code never assigns `result`
    ResultContract,
    /// No code at all
    Empty,
}

impl PolicyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCategory::SystemAccess => "system_access",
            PolicyCategory::DynamicEvaluation => "dynamic_evaluation",
            PolicyCategory::DestructiveMutation => "destructive_mutation",
            PolicyCategory::QueryInjection => "query_injection",
            PolicyCategory::Syntax => "syntax",
            PolicyCategory::ResultContract => "result_contract",
            PolicyCategory::Empty => "empty",
        }
    }
}

impl fmt::Display for PolicyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deny-listed substrings and their categories. Matching ignores case.
pub const DENY_LIST: &[(&str, PolicyCategory)] = &[
    ("import os", PolicyCategory::SystemAccess),
    ("import sys", PolicyCategory::SystemAccess),
    ("import subprocess", PolicyCategory::SystemAccess),
    ("import shutil", PolicyCategory::SystemAccess),
    ("__import__", PolicyCategory::DynamicEvaluation),
    ("eval(", PolicyCategory::DynamicEvaluation),
    ("exec(", PolicyCategory::DynamicEvaluation),
    ("os.system", PolicyCategory::SystemAccess),
    ("os.popen", PolicyCategory::SystemAccess),
    ("subprocess.", PolicyCategory::SystemAccess),
    ("shutil.", PolicyCategory::SystemAccess),
    (".to_csv(", PolicyCategory::DestructiveMutation),
    (".to_excel(", PolicyCategory::DestructiveMutation),
    ("rm -rf", PolicyCategory::DestructiveMutation),
    ("DROP TABLE", PolicyCategory::QueryInjection),
    ("DELETE FROM", PolicyCategory::QueryInjection),
    ("TRUNCATE ", PolicyCategory::QueryInjection),
];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid policy pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One broken rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub category: PolicyCategory,
    /// The deny-listed pattern, or a short description for structural rules
    pub pattern: String,
    /// Byte offset of the first match, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            PolicyCategory::Syntax | PolicyCategory::ResultContract | PolicyCategory::Empty => {
                write!(f, "{}: {}", self.category, self.pattern)
            }
            _ => write!(f, "{}: forbidden pattern {:?}", self.category, self.pattern),
        }
    }
}

/// Outcome of a policy scan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl Verdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Distinct categories in first-seen order
    pub fn categories(&self) -> Vec<PolicyCategory> {
        let mut seen = Vec::new();
        for v in &self.violations {
            if !seen.contains(&v.category) {
                seen.push(v.category);
            }
        }
        seen
    }

    /// One line per violation, for the next generation prompt
    pub fn describe(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Static scanner for generated code
pub struct PolicyValidator {
    patterns: Vec<(Regex, &'static str, PolicyCategory)>,
}

impl PolicyValidator {
    /// Compile the deny-list.
    pub fn new() -> Result<Self, PolicyError> {
        let patterns = DENY_LIST
            .iter()
            .map(|(pattern, category)| {
                Regex::new(&format!("(?i){}", regex::escape(pattern)))
                    .map(|re| (re, *pattern, *category))
                    .map_err(|source| PolicyError::Pattern {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Scan code and report every rule it breaks.
    ///
    /// Pure and deterministic: the same text always yields the same
    /// verdict, and every matching category is reported at once.
    pub fn evaluate(&self, code: &str) -> Verdict {
        if code.trim().is_empty() {
            return Verdict::from_violations(vec![Violation {
                category: PolicyCategory::Empty,
                pattern: "no code was generated".to_string(),
                position: None,
            }]);
        }

        let mut violations: Vec<Violation> = self
            .patterns
            .iter()
            .filter_map(|(re, pattern, category)| {
                re.find(code).map(|m| Violation {
                    category: *category,
                    pattern: pattern.to_string(),
                    position: Some(m.start()),
                })
            })
            .collect();

        if let Err(e) = parser::parse(code) {
            violations.push(Violation {
                category: PolicyCategory::Syntax,
                pattern: e.to_string(),
                position: None,
            });
        }

        if !code.contains(RESULT_NAME) {
            violations.push(Violation {
                category: PolicyCategory::ResultContract,
                pattern: format!("code must assign its answer to `{}`", RESULT_NAME),
                position: None,
            });
        }

        let verdict = Verdict::from_violations(violations);
        if !verdict.valid {
            debug!(
                "Policy rejected code: {}",
                verdict
                    .categories()
                    .iter()
                    .map(PolicyCategory::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> PolicyValidator {
        PolicyValidator::new().unwrap()
    }

    #[test]
    fn test_clean_code_passes() {
        let verdict = validator().evaluate("result = df.groupby('Group')['X'].mean()");
        assert!(verdict.valid);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_every_deny_listed_pattern_rejects() {
        let v = validator();
        for (pattern, category) in DENY_LIST {
            let code = format!("result = 1\n# {}\n", pattern);
            let verdict = v.evaluate(&code);
            assert!(!verdict.valid, "{} passed", pattern);
            assert!(verdict.categories().contains(category));
        }
    }

    #[test]
    fn test_match_ignores_case_and_context() {
        let verdict = validator().evaluate("result = 'drop table users'");
        assert!(!verdict.valid);
        assert_eq!(verdict.categories(), vec![PolicyCategory::QueryInjection]);
        assert_eq!(verdict.violations[0].position, Some(10));
    }

    #[test]
    fn test_mentions_in_comments_and_strings_reject() {
        let validator = validator();
        for code in [
            "# never import os here\nresult = 1",
            "note = \"eval( is not used\"\nresult = note",
            "result = 1  # would call exec( otherwise",
        ] {
            assert!(!validator.evaluate(code).valid, "{:?} passed", code);
        }
    }

    #[test]
    fn test_all_categories_reported_together() {
        let code = "import os\nresult = eval('1')\ndf.to_csv('out.csv')\n";
        let verdict = validator().evaluate(code);
        assert_eq!(
            verdict.categories(),
            vec![
                PolicyCategory::SystemAccess,
                PolicyCategory::DynamicEvaluation,
                PolicyCategory::DestructiveMutation,
                PolicyCategory::Syntax,
            ]
        );
    }

    #[test]
    fn test_structural_rules() {
        let v = validator();
        assert_eq!(v.evaluate("  \n").categories(), vec![PolicyCategory::Empty]);
        assert_eq!(
            v.evaluate("total = 1 + 1").categories(),
            vec![PolicyCategory::ResultContract]
        );
        assert_eq!(
            v.evaluate("result = (1 +").categories(),
            vec![PolicyCategory::Syntax]
        );
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let v = validator();
        let code = "import subprocess\nresult = subprocess.run(['ls'])";
        assert_eq!(v.evaluate(code), v.evaluate(code));
    }

    #[test]
    fn test_describe_lists_patterns() {
        let verdict = validator().evaluate("# import shutil\nresult = 1");
        assert_eq!(
            verdict.describe(),
            vec!["system_access: forbidden pattern \"import shutil\"".to_string()]
        );
    }
}
