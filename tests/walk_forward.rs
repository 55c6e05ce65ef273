use proptest::prelude::*;
use trainer::validation::{create_folds, FoldError, WalkForwardConfig};

proptest! {
    #[test]
    fn folds_are_ordered_disjoint_and_purged(
        total_rows in 0usize..2_000,
        n_folds in 1usize..10,
        min_train_size in 1usize..200,
        purge_gap in 0usize..20,
    ) {
        let config = WalkForwardConfig { n_folds, min_train_size, purge_gap };
        match create_folds(total_rows, &config) {
            Ok(folds) => {
                prop_assert_eq!(folds.len(), n_folds);
                prop_assert_eq!(folds[0].train_end, min_train_size);
                for fold in &folds {
                    prop_assert_eq!(fold.train_end + purge_gap, fold.test_start);
                    prop_assert!(fold.test_start < fold.test_end);
                    prop_assert!(fold.test_end <= total_rows);
                }
                for pair in folds.windows(2) {
                    prop_assert_eq!(pair[0].test_end, pair[1].test_start);
                    prop_assert!(pair[0].train_end < pair[1].train_end);
                }
                prop_assert_eq!(folds.last().unwrap().test_end, total_rows);
                prop_assert_eq!(create_folds(total_rows, &config).unwrap(), folds);
            }
            Err(FoldError::InsufficientData { .. }) => {
                prop_assert!(total_rows < min_train_size + purge_gap + n_folds);
            }
            Err(FoldError::NoFolds) => prop_assert!(false, "n_folds is never zero here"),
        }
    }
}

#[test]
fn zero_folds_is_rejected() {
    let config = WalkForwardConfig {
        n_folds: 0,
        ..WalkForwardConfig::default()
    };
    assert_eq!(create_folds(500, &config), Err(FoldError::NoFolds));
}
