use serde::Serialize;
use std::collections::BTreeMap;

use crate::gbdt::{argmax, GradientBoostedModel, Objective};

/// Rows scored for the attribution summary, taken from the end of the matrix.
pub const ATTRIBUTION_SAMPLE_ROWS: usize = 200;
pub const TOP_INTERACTIONS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionPair {
    pub first: String,
    pub second: String,
    pub strength: f64,
}

/// Additive decomposition of one prediction: `bias + sum(contributions)` equals the raw
/// margin of the explained output.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub output: usize,
    pub bias: f64,
    pub contributions: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Explanation {
    pub feature_importances: Vec<FeatureImportance>,
    pub mean_abs_attribution: Option<Vec<FeatureImportance>>,
    pub interactions: Vec<InteractionPair>,
}

fn name_of(names: &[String], idx: usize) -> String {
    names
        .get(idx)
        .cloned()
        .unwrap_or_else(|| format!("feature_{idx}"))
}

fn ranked(names: &[String], scores: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = scores
        .iter()
        .enumerate()
        .map(|(idx, score)| FeatureImportance {
            feature: name_of(names, idx),
            importance: *score,
        })
        .collect();
    // Stable sort keeps column order among equal scores.
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked
}

/// Total split gain per feature, normalized to sum to one.
pub fn gain_importances(model: &GradientBoostedModel) -> Vec<f64> {
    let mut gains = vec![0.0; model.n_features];
    for tree in &model.trees {
        for (feature, gain) in tree.split_feature.iter().zip(&tree.split_gain) {
            if let Some(slot) = gains.get_mut(*feature) {
                *slot += gain;
            }
        }
    }
    let total: f64 = gains.iter().sum();
    if total > 0.0 {
        gains.iter_mut().for_each(|g| *g /= total);
    }
    gains
}

pub fn feature_importances(
    model: &GradientBoostedModel,
    names: &[String],
) -> Vec<FeatureImportance> {
    ranked(names, &gain_importances(model))
}

/// Path decomposition of a prediction: each split on the decision path credits its
/// feature with the change in expected value it causes. Multiclass models explain the
/// predicted class.
pub fn attribute(model: &GradientBoostedModel, features: &[f64]) -> Attribution {
    let output = match model.objective {
        Objective::Multiclass { .. } => argmax(&model.predict_raw(features)),
        _ => 0,
    };
    let mut contributions = vec![0.0; model.n_features];
    let mut bias = 0.0;
    for tree in model.trees_for_output(output) {
        bias += tree.root_value();
        for (node, child) in tree.decision_path(features) {
            let delta = tree.node_value(child) - tree.node_value(node as i32);
            if let Some(slot) = contributions.get_mut(tree.split_feature[node]) {
                *slot += delta;
            }
        }
    }
    Attribution {
        output,
        bias,
        contributions,
    }
}

/// Mean absolute attribution over the most recent rows.
pub fn mean_abs_attribution(
    model: &GradientBoostedModel,
    rows: &[Vec<f64>],
    names: &[String],
) -> Vec<FeatureImportance> {
    let sample = &rows[rows.len().saturating_sub(ATTRIBUTION_SAMPLE_ROWS)..];
    let mut totals = vec![0.0; model.n_features];
    for row in sample {
        let attribution = attribute(model, row);
        for (total, value) in totals.iter_mut().zip(&attribution.contributions) {
            *total += value.abs();
        }
    }
    if !sample.is_empty() {
        totals.iter_mut().for_each(|t| *t /= sample.len() as f64);
    }
    ranked(names, &totals)
}

/// Feature pairs that split one after the other on the same path, weighted by the
/// smaller of the two gains.
pub fn interaction_pairs(model: &GradientBoostedModel, names: &[String]) -> Vec<InteractionPair> {
    let mut strengths: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for tree in &model.trees {
        for node in 0..tree.num_internal() {
            for child in [tree.left_child[node], tree.right_child[node]] {
                if child < 0 {
                    continue;
                }
                let child = child as usize;
                let (a, b) = (tree.split_feature[node], tree.split_feature[child]);
                if a == b {
                    continue;
                }
                let key = (a.min(b), a.max(b));
                let gain = tree.split_gain[node].min(tree.split_gain[child]);
                *strengths.entry(key).or_default() += gain;
            }
        }
    }
    let total: f64 = strengths.values().sum();
    let mut pairs: Vec<InteractionPair> = strengths
        .into_iter()
        .map(|((a, b), strength)| InteractionPair {
            first: name_of(names, a),
            second: name_of(names, b),
            strength: if total > 0.0 { strength / total } else { 0.0 },
        })
        .collect();
    pairs.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    pairs.truncate(TOP_INTERACTIONS);
    pairs
}

pub fn explain(
    model: &GradientBoostedModel,
    rows: &[Vec<f64>],
    names: &[String],
    attribution_enabled: bool,
) -> Explanation {
    Explanation {
        feature_importances: feature_importances(model, names),
        mean_abs_attribution: attribution_enabled.then(|| mean_abs_attribution(model, rows, names)),
        interactions: if attribution_enabled {
            interaction_pairs(model, names)
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbdt::{BoosterParams, Dataset};

    fn model(objective: Objective) -> (GradientBoostedModel, Vec<Vec<f64>>) {
        let rows: Vec<Vec<f64>> = (0..120)
            .map(|i| vec![(i % 10) as f64, (i % 7) as f64, 1.0])
            .collect();
        let labels: Vec<f64> = rows
            .iter()
            .map(|r| match objective {
                Objective::Multiclass { .. } => (r[0] / 4.0).floor(),
                Objective::Binary => ((r[0] + r[1]) > 8.0) as u8 as f64,
                _ => r[0] * 2.0 + r[1],
            })
            .collect();
        let params = BoosterParams {
            n_estimators: 30,
            ..BoosterParams::default()
        };
        let data = Dataset::new(&rows, &labels);
        let model = GradientBoostedModel::fit(&params, objective, &data, None, 0).unwrap();
        (model, rows)
    }

    fn names() -> Vec<String> {
        vec!["strong".to_string(), "weak".to_string(), "constant".to_string()]
    }

    #[test]
    fn importances_sum_to_one_and_rank_the_driver_first() {
        let (model, _) = model(Objective::SquaredError);
        let importances = feature_importances(&model, &names());
        let total: f64 = importances.iter().map(|i| i.importance).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(importances[0].feature, "strong");
        assert_eq!(importances.last().unwrap().feature, "constant");
        assert_eq!(importances.last().unwrap().importance, 0.0);
    }

    #[test]
    fn attributions_add_up_to_the_raw_margin() {
        for objective in [
            Objective::SquaredError,
            Objective::Binary,
            Objective::Multiclass { num_class: 3 },
        ] {
            let (model, rows) = model(objective);
            for row in rows.iter().step_by(13) {
                let attribution = attribute(&model, row);
                let raw = model.predict_raw(row)[attribution.output];
                let total = attribution.bias + attribution.contributions.iter().sum::<f64>();
                assert!((total - raw).abs() < 1e-9, "{objective:?}: {total} vs {raw}");
                assert_eq!(attribution.contributions[2], 0.0);
            }
        }
    }

    #[test]
    fn interactions_pair_distinct_features() {
        let (model, rows) = model(Objective::SquaredError);
        let explanation = explain(&model, &rows, &names(), true);
        assert!(!explanation.interactions.is_empty());
        for pair in &explanation.interactions {
            assert_ne!(pair.first, pair.second);
        }
        assert!(explanation.mean_abs_attribution.is_some());

        let plain = explain(&model, &rows, &names(), false);
        assert!(plain.mean_abs_attribution.is_none());
        assert!(plain.interactions.is_empty());
    }
}
