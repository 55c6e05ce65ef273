use serde::{Deserialize, Serialize};

const DEFAULT_LEFT_MASK: u8 = 2;
const ZERO_THRESHOLD: f64 = 1e-35;

/// How a split treats missing values, bits 2-3 of LightGBM's `decision_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingType {
    None,
    Zero,
    NaN,
}

impl MissingType {
    fn from_decision_type(decision_type: u8) -> Self {
        match (decision_type >> 2) & 3 {
            1 => MissingType::Zero,
            2 => MissingType::NaN,
            _ => MissingType::None,
        }
    }
}

/// One regression tree in LightGBM's array layout. Node 0 is the root, children always
/// carry a larger index than their parent, and a negative child `c` refers to leaf
/// `-c - 1`. Values are stored as LightGBM saved them, already shrunk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tree {
    pub split_feature: Vec<usize>,
    pub threshold: Vec<f64>,
    pub decision_type: Vec<u8>,
    pub split_gain: Vec<f64>,
    pub left_child: Vec<i32>,
    pub right_child: Vec<i32>,
    pub internal_value: Vec<f64>,
    pub internal_count: Vec<usize>,
    pub leaf_value: Vec<f64>,
    pub leaf_count: Vec<usize>,
}

impl Tree {
    pub fn num_leaves(&self) -> usize {
        self.leaf_value.len()
    }

    pub fn num_internal(&self) -> usize {
        self.split_feature.len()
    }

    fn next_node(&self, node: usize, features: &[f64]) -> i32 {
        let feature_idx = self.split_feature.get(node).copied().unwrap_or_default();
        let decision_type = self.decision_type.get(node).copied().unwrap_or_default();
        let missing = MissingType::from_decision_type(decision_type);
        let mut value = features.get(feature_idx).copied().unwrap_or(0.0);
        if value.is_nan() && missing != MissingType::NaN {
            value = 0.0;
        }
        let is_missing = match missing {
            MissingType::Zero => value.abs() <= ZERO_THRESHOLD,
            MissingType::NaN => value.is_nan(),
            MissingType::None => false,
        };
        let go_left = if is_missing {
            decision_type & DEFAULT_LEFT_MASK != 0
        } else {
            value <= self.threshold.get(node).copied().unwrap_or(0.0)
        };
        let children = if go_left {
            &self.left_child
        } else {
            &self.right_child
        };
        children.get(node).copied().unwrap_or(-1)
    }

    pub fn leaf_index(&self, features: &[f64]) -> usize {
        if self.split_feature.is_empty() {
            return 0;
        }
        let mut node_idx = 0usize;
        loop {
            let child = self.next_node(node_idx, features);
            if child < 0 {
                return (-child - 1) as usize;
            }
            node_idx = child as usize;
        }
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        self.leaf_value
            .get(self.leaf_index(features))
            .copied()
            .unwrap_or_default()
    }

    /// Internal nodes visited by `features`, each paired with the child reference taken.
    pub fn decision_path(&self, features: &[f64]) -> Vec<(usize, i32)> {
        let mut path = Vec::new();
        if self.split_feature.is_empty() {
            return path;
        }
        let mut node_idx = 0usize;
        loop {
            let child = self.next_node(node_idx, features);
            path.push((node_idx, child));
            if child < 0 {
                return path;
            }
            node_idx = child as usize;
        }
    }

    pub fn node_value(&self, child: i32) -> f64 {
        if child < 0 {
            self.leaf_value
                .get((-child - 1) as usize)
                .copied()
                .unwrap_or_default()
        } else {
            self.internal_value
                .get(child as usize)
                .copied()
                .unwrap_or_default()
        }
    }

    /// Expected output before any split is applied.
    pub fn root_value(&self) -> f64 {
        if self.split_feature.is_empty() {
            self.leaf_value.first().copied().unwrap_or_default()
        } else {
            self.internal_value.first().copied().unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump(decision_type: u8) -> Tree {
        Tree {
            split_feature: vec![0],
            threshold: vec![0.5],
            decision_type: vec![decision_type],
            split_gain: vec![1.0],
            left_child: vec![-1],
            right_child: vec![-2],
            internal_value: vec![0.5],
            internal_count: vec![4],
            leaf_value: vec![-1.0, 2.0],
            leaf_count: vec![2, 2],
        }
    }

    #[test]
    fn predict_follows_less_or_equal_to_the_left() {
        let tree = stump(2);
        assert_eq!(tree.predict(&[0.5]), -1.0);
        assert_eq!(tree.predict(&[0.6]), 2.0);
        assert_eq!(tree.decision_path(&[0.6]), vec![(0, -2)]);
        assert_eq!(tree.root_value(), 0.5);
    }

    #[test]
    fn missing_values_take_the_default_direction() {
        // Missing type NaN, default right.
        let nan_right = stump(8);
        assert_eq!(nan_right.predict(&[f64::NAN]), 2.0);
        assert_eq!(nan_right.predict(&[0.0]), -1.0);
        // Missing type zero, default right: zero no longer compares against the threshold.
        let zero_right = stump(4);
        assert_eq!(zero_right.predict(&[0.0]), 2.0);
        assert_eq!(zero_right.predict(&[f64::NAN]), 2.0);
        // No missing handling: NaN is scored as zero.
        assert_eq!(stump(0).predict(&[f64::NAN]), -1.0);
    }

    #[test]
    fn single_leaf_tree_is_constant() {
        let tree = Tree {
            leaf_value: vec![0.25],
            leaf_count: vec![10],
            ..Tree::default()
        };
        assert_eq!(tree.predict(&[3.0]), 0.25);
        assert_eq!(tree.root_value(), 0.25);
        assert!(tree.decision_path(&[3.0]).is_empty());
    }
}
