//! Reading LightGBM text models.
//!
//! LightGBM writes the models; this module reads them back for in-process scoring and
//! attribution. Models trained from files use placeholder feature names (`Column_0`,
//! `Column_1`, ...). Exported models carry two extra header keys naming the input and
//! output tensors, which LightGBM's own loader ignores.

use std::str::FromStr;

use super::tree::Tree;
use super::{sigmoid, softmax, ModelError, Objective};

pub const INPUT_TENSOR: &str = "input";
pub const CLASSIFIER_OUTPUT_TENSOR: &str = "probabilities";
pub const REGRESSOR_OUTPUT_TENSOR: &str = "variable";

const CATEGORICAL_MASK: u8 = 1;

pub fn output_tensor_name(objective: &Objective) -> &'static str {
    if objective.is_classifier() {
        CLASSIFIER_OUTPUT_TENSOR
    } else {
        REGRESSOR_OUTPUT_TENSOR
    }
}

/// Inserts `input_tensor`/`output_tensor` lines into the header, right after
/// `feature_infos=` (or before the first tree when that line is absent).
pub fn with_tensor_names(model_text: &str, output_tensor: &str) -> String {
    let tensor_lines = format!("input_tensor={INPUT_TENSOR}\noutput_tensor={output_tensor}\n");
    let mut text = String::with_capacity(model_text.len() + tensor_lines.len());
    let mut inserted = false;
    for line in model_text.lines() {
        if !inserted && line.starts_with("Tree=") {
            text.push_str(&tensor_lines);
            inserted = true;
        }
        text.push_str(line);
        text.push('\n');
        if !inserted && line.starts_with("feature_infos=") {
            text.push_str(&tensor_lines);
            inserted = true;
        }
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    KeptTree,
    DroppedTree,
    Footer,
    Importances,
}

/// Keeps the first `keep_trees` trees of a LightGBM model text. `tree_sizes` and the
/// feature importance block describe the full ensemble, so both are dropped; LightGBM
/// then reads the trees sequentially.
pub fn truncate_trees(model_text: &str, keep_trees: usize) -> String {
    let mut text = String::with_capacity(model_text.len());
    let mut section = Section::Header;
    for line in model_text.lines() {
        if let Some(idx) = line.strip_prefix("Tree=") {
            let idx = idx.trim().parse::<usize>().unwrap_or(usize::MAX);
            section = if idx < keep_trees {
                Section::KeptTree
            } else {
                Section::DroppedTree
            };
        } else if line.starts_with("end of trees") {
            section = Section::Footer;
        } else if section == Section::Footer && line.starts_with("feature_importances:") {
            section = Section::Importances;
            continue;
        } else if section == Section::Importances {
            if line.trim().is_empty() {
                section = Section::Footer;
            }
            continue;
        }
        let keep = match section {
            Section::Header => !line.starts_with("tree_sizes="),
            Section::DroppedTree | Section::Importances => false,
            Section::KeptTree | Section::Footer => true,
        };
        if keep {
            text.push_str(line);
            text.push('\n');
        }
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextObjective {
    Binary { sigmoid: f64 },
    Multiclass,
    Regression,
}

fn tree_from_lines(
    lines: &mut std::iter::Peekable<std::str::Lines<'_>>,
) -> Result<Tree, ModelError> {
    let mut num_leaves: Option<usize> = None;
    let mut num_cat: usize = 0;
    let mut tree = Tree::default();

    while let Some(peeked) = lines.peek() {
        if peeked.starts_with("Tree=") || peeked.starts_with("end of trees") {
            break;
        }
        let line = match lines.next() {
            Some(line) => line.trim(),
            None => break,
        };

        if line.starts_with("num_leaves=") {
            num_leaves = Some(parse_value(line, "num_leaves=")?);
        } else if line.starts_with("num_cat=") {
            num_cat = parse_value(line, "num_cat=")?;
        } else if line.starts_with("split_feature=") {
            tree.split_feature = parse_array(line, "split_feature=")?;
        } else if line.starts_with("split_gain=") {
            tree.split_gain = parse_array(line, "split_gain=")?;
        } else if line.starts_with("threshold=") {
            tree.threshold = parse_array(line, "threshold=")?;
        } else if line.starts_with("decision_type=") {
            tree.decision_type = parse_array(line, "decision_type=")?;
        } else if line.starts_with("left_child=") {
            tree.left_child = parse_array(line, "left_child=")?;
        } else if line.starts_with("right_child=") {
            tree.right_child = parse_array(line, "right_child=")?;
        } else if line.starts_with("leaf_value=") {
            tree.leaf_value = parse_array(line, "leaf_value=")?;
        } else if line.starts_with("leaf_count=") {
            tree.leaf_count = parse_array(line, "leaf_count=")?;
        } else if line.starts_with("internal_value=") {
            tree.internal_value = parse_array(line, "internal_value=")?;
        } else if line.starts_with("internal_count=") {
            tree.internal_count = parse_array(line, "internal_count=")?;
        }
    }

    let internal_nodes = tree.split_feature.len();
    if tree.threshold.len() != internal_nodes
        || tree.left_child.len() != internal_nodes
        || tree.right_child.len() != internal_nodes
    {
        return Err(ModelError::Parse(
            "split/child/threshold length mismatch".to_string(),
        ));
    }
    if tree.split_gain.is_empty() {
        tree.split_gain = vec![0.0; internal_nodes];
    } else if tree.split_gain.len() != internal_nodes {
        return Err(ModelError::Parse("split_gain length mismatch".to_string()));
    }
    if tree.decision_type.is_empty() {
        tree.decision_type = vec![0; internal_nodes];
    } else if tree.decision_type.len() != internal_nodes {
        return Err(ModelError::Parse(
            "decision_type length mismatch".to_string(),
        ));
    }
    if num_cat > 0 || tree.decision_type.iter().any(|d| d & CATEGORICAL_MASK != 0) {
        return Err(ModelError::Parse(
            "categorical splits are not supported".to_string(),
        ));
    }

    let declared_leaves = num_leaves.unwrap_or(tree.leaf_value.len());
    if declared_leaves != tree.leaf_value.len() || declared_leaves == 0 {
        return Err(ModelError::Parse(format!(
            "leaf count mismatch: expected {declared_leaves}, found {}",
            tree.leaf_value.len()
        )));
    }

    // Children must point forward (or at a leaf) so traversal always terminates.
    for (node, child) in tree
        .left_child
        .iter()
        .chain(tree.right_child.iter())
        .enumerate()
        .map(|(idx, child)| (idx % internal_nodes.max(1), *child))
    {
        let valid = if child < 0 {
            ((-child - 1) as usize) < declared_leaves
        } else {
            (child as usize) > node && (child as usize) < internal_nodes
        };
        if !valid {
            return Err(ModelError::Parse(format!(
                "node {node} references invalid child {child}"
            )));
        }
    }

    Ok(tree)
}

/// A LightGBM text model, scored without calling into LightGBM.
#[derive(Debug, Clone)]
pub struct TextModel {
    trees: Vec<Tree>,
    feature_count: usize,
    num_classes: usize,
    num_tree_per_iteration: usize,
    objective: TextObjective,
    pub feature_names: Vec<String>,
    pub input_tensor: Option<String>,
    pub output_tensor: Option<String>,
}

impl TextModel {
    pub fn from_model_text(text: &str) -> Result<Self, ModelError> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut num_classes: usize = 1;
        let mut num_tree_per_iteration: usize = 1;
        let mut objective = TextObjective::Regression;
        let mut feature_names = Vec::new();
        let mut input_tensor = None;
        let mut output_tensor = None;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with("objective=") {
                objective = if trimmed.contains("multiclass") {
                    TextObjective::Multiclass
                } else if trimmed.contains("binary") {
                    TextObjective::Binary {
                        sigmoid: extract_sigmoid(trimmed),
                    }
                } else {
                    TextObjective::Regression
                };
            } else if trimmed.starts_with("num_class=") {
                num_classes = parse_value(trimmed, "num_class=")?;
            } else if trimmed.starts_with("num_tree_per_iteration=") {
                num_tree_per_iteration = parse_value(trimmed, "num_tree_per_iteration=")?;
            } else if trimmed.starts_with("max_feature_idx=") {
                max_feature_idx = Some(parse_value(trimmed, "max_feature_idx=")?);
            } else if trimmed.starts_with("feature_names=") {
                feature_names = parse_array(trimmed, "feature_names=")?;
            } else if let Some(name) = trimmed.strip_prefix("input_tensor=") {
                input_tensor = Some(name.trim().to_string());
            } else if let Some(name) = trimmed.strip_prefix("output_tensor=") {
                output_tensor = Some(name.trim().to_string());
            } else if trimmed.starts_with("Tree=") {
                trees.push(tree_from_lines(&mut lines)?);
            } else if trimmed.starts_with("end of trees") {
                break;
            }
        }

        if trees.is_empty() {
            return Err(ModelError::Parse("model contained no trees".to_string()));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_feature.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);
        if matches!(objective, TextObjective::Multiclass) && num_classes < 2 {
            num_classes = num_tree_per_iteration.max(2);
        }
        if num_tree_per_iteration == 0 {
            num_tree_per_iteration = 1;
        }

        Ok(Self {
            trees,
            feature_count,
            num_classes,
            num_tree_per_iteration,
            objective,
            feature_names,
            input_tensor,
            output_tensor,
        })
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_tree_per_iteration(&self) -> usize {
        self.num_tree_per_iteration
    }

    pub fn objective(&self) -> TextObjective {
        self.objective
    }

    pub fn into_trees(self) -> Vec<Tree> {
        self.trees
    }

    /// Class probabilities for classifiers, `[value]` for regressors. `None` when the
    /// input is narrower than the model expects.
    pub fn predict_distribution(&self, features: &[f64]) -> Option<Vec<f64>> {
        if features.len() < self.feature_count || self.trees.is_empty() {
            return None;
        }

        let mut raw_scores = vec![0.0; self.num_tree_per_iteration];
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            let bucket = tree_idx % self.num_tree_per_iteration;
            if let Some(slot) = raw_scores.get_mut(bucket) {
                *slot += tree.predict(features);
            }
        }

        match self.objective {
            TextObjective::Binary { sigmoid: scale } => {
                let probability = sigmoid(raw_scores.first().copied().unwrap_or(0.0) * scale);
                Some(vec![
                    (1.0 - probability).clamp(0.0, 1.0),
                    probability.clamp(0.0, 1.0),
                ])
            }
            TextObjective::Multiclass => {
                let mut trimmed = raw_scores;
                trimmed.truncate(self.num_classes.max(2));
                Some(softmax(&trimmed))
            }
            TextObjective::Regression => Some(vec![raw_scores.first().copied().unwrap_or(0.0)]),
        }
    }
}

fn parse_value<T>(line: &str, prefix: &str) -> Result<T, ModelError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| ModelError::Parse(format!("expected prefix {prefix}")))?;
    raw.trim().parse::<T>().map_err(|err| {
        ModelError::Parse(format!(
            "failed to parse value for {prefix} from \"{line}\": {err}"
        ))
    })
}

fn parse_array<T>(line: &str, prefix: &str) -> Result<Vec<T>, ModelError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| ModelError::Parse(format!("expected prefix {prefix}")))?;
    raw.split_whitespace()
        .map(|token| {
            token.parse::<T>().map_err(|err| {
                ModelError::Parse(format!("failed to parse value {token} for {prefix}: {err}"))
            })
        })
        .collect()
}

fn extract_sigmoid(objective_line: &str) -> f64 {
    objective_line
        .split_whitespace()
        .find_map(|token| token.strip_prefix("sigmoid:"))
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(1.0)
}
