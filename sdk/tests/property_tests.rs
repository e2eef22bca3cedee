use proptest::prelude::*;
use sdk::errors::{EngineError, SiftErrorExt};
use sdk::types::{ResultValue, Scalar, Table, TabularResult};

// Property: Error User Hint Completeness
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        // Hints are static, so they never echo the raw detail back
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Database(error_str.clone()),
            EngineError::Dataset(error_str.clone()),
            EngineError::LLMProvider(error_str.clone()),
            EngineError::SandboxUnavailable(error_str.clone()),
            EngineError::InvalidRequest(error_str.clone()),
            EngineError::KeyringError(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if error_str.len() > 12 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }
}

// Property: Cell parsing never panics and integers survive as integers
proptest! {
    #[test]
    fn test_parse_cell_integers(n in any::<i64>()) {
        prop_assert_eq!(Scalar::parse_cell(&n.to_string()), Scalar::Int(n));
    }

    #[test]
    fn test_parse_cell_total(raw in "\\PC{0,40}") {
        let parsed = Scalar::parse_cell(&raw);
        if raw.trim().is_empty() {
            prop_assert!(parsed.is_null());
        }
    }
}

// Property: Records keep the table's column order and row order
proptest! {
    #[test]
    fn test_records_preserve_order(
        columns in proptest::collection::hash_set("[a-z]{1,6}", 1..6),
        values in proptest::collection::vec(any::<i32>(), 0..20)
    ) {
        let columns: Vec<String> = columns.into_iter().collect();
        let rows: Vec<Vec<Scalar>> = values
            .iter()
            .map(|v| columns.iter().map(|_| Scalar::Int(i64::from(*v))).collect())
            .collect();
        let table = Table::from_rows(columns.clone(), rows).unwrap();
        let result = ResultValue::Table(TabularResult::from(&table));

        let json = serde_json::to_string(&result).unwrap();
        let back: ResultValue = serde_json::from_str(&json).unwrap();
        let back = back.as_table().unwrap().clone();

        prop_assert_eq!(&back.columns, &columns);
        prop_assert_eq!(back.records.len(), values.len());
        for (record, v) in back.records.iter().zip(values.iter()) {
            let keys: Vec<&String> = record.keys().collect();
            prop_assert_eq!(keys, columns.iter().collect::<Vec<_>>());
            prop_assert_eq!(record[&columns[0]].clone(), Scalar::Int(i64::from(*v)));
        }
    }
}
