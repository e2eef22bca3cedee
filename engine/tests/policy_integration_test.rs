//! Integration tests for the code policy
//!
//! Feeds realistic model output through the validator: typical analysis
//! scripts must pass, and unsafe ones must be rejected with every broken
//! rule named.

use sift_engine::llm::extract_fenced_block;
use sift_engine::policy::{PolicyCategory, PolicyValidator, DENY_LIST};

fn validator() -> PolicyValidator {
    PolicyValidator::new().unwrap()
}

#[test]
fn test_typical_analysis_scripts_pass() {
    let scripts = [
        "result = df.groupby('Group')['X'].mean().reset_index()",
        "sales['month'] = sales['date'].dt.month\nresult = sales.groupby('month')['amount'].sum().reset_index()",
        "merged = pd.merge(orders, customers, on='customer_id', how='left')\nresult = merged.head(10)",
        "top = df.sort_values('revenue', ascending=False).head(5)\nresult = top[['name', 'revenue']]",
        "result = df['region'].value_counts().reset_index()",
        "def share(x):\n    return x / x.sum()\n\nresult = share(df['X'])",
    ];

    let validator = validator();
    for script in scripts {
        let verdict = validator.evaluate(script);
        assert!(verdict.valid, "{:?} rejected: {:?}", script, verdict.describe());
    }
}

#[test]
fn test_fenced_model_reply_is_checked_after_extraction() {
    let reply = "Here is the code:\n```python\nimport os\nresult = os.listdir('.')\n```\nHope this helps.";
    let code = extract_fenced_block(reply).unwrap();
    let verdict = validator().evaluate(code);
    assert!(!verdict.valid);
    assert!(verdict.categories().contains(&PolicyCategory::SystemAccess));
}

#[test]
fn test_every_rule_is_reported_at_once() {
    let code = "import subprocess\nx = eval('1')\ndf.to_csv('/tmp/out.csv')\nq = 'DROP TABLE users'\nresult = x";
    let verdict = validator().evaluate(code);

    assert!(!verdict.valid);
    let categories = verdict.categories();
    for expected in [
        PolicyCategory::SystemAccess,
        PolicyCategory::DynamicEvaluation,
        PolicyCategory::DestructiveMutation,
        PolicyCategory::QueryInjection,
    ] {
        assert!(categories.contains(&expected), "missing {}", expected);
    }
    let described = verdict.describe().join("\n");
    assert!(described.contains("\"eval(\""));
    assert!(described.contains("\"DROP TABLE\""));
}

#[test]
fn test_deny_list_matches_inside_longer_code() {
    let validator = validator();
    for (pattern, category) in DENY_LIST {
        let code = format!("x = 1\ny = \"{}\"\nresult = x", pattern.to_lowercase());
        let verdict = validator.evaluate(&code);
        assert!(
            verdict.categories().contains(category),
            "{:?} not caught in {:?}",
            pattern,
            code
        );
    }
}

#[test]
fn test_structural_rules() {
    let validator = validator();

    let empty = validator.evaluate("  \n ");
    assert_eq!(empty.categories(), vec![PolicyCategory::Empty]);

    let no_result = validator.evaluate("total = df['X'].sum()");
    assert_eq!(no_result.categories(), vec![PolicyCategory::ResultContract]);

    let broken = validator.evaluate("result = (1 +");
    assert!(broken.categories().contains(&PolicyCategory::Syntax));
}

#[test]
fn test_unsupported_import_is_a_syntax_violation() {
    let verdict = validator().evaluate("import numpy as np\nresult = 1");
    assert_eq!(verdict.categories(), vec![PolicyCategory::Syntax]);
}
