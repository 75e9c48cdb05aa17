use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// This trait extends the functionality of [`LabelSelector`] with the evaluation rules the API
/// server applies when a selector is matched against an object's labels.
pub trait LabelSelectorExt {
    /// Returns `true` if every `matchLabels` entry and every `matchExpressions` requirement holds
    /// for `labels`. An empty selector matches everything.
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool>;
}

impl LabelSelectorExt for LabelSelector {
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        let labels_match = self
            .match_labels
            .iter()
            .flatten()
            .all(|(key, value)| labels.get(key) == Some(value));

        if !labels_match {
            return Ok(false);
        }

        for requirement in self.match_expressions.iter().flatten() {
            if !requirement_matches(requirement, labels)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let values = requirement.values.as_deref().unwrap_or_default();
    let value = labels.get(&requirement.key);

    match requirement.operator.as_str() {
        operator @ ("In" | "NotIn") => {
            if values.is_empty() {
                return BinaryOperatorWithoutValuesSnafu { operator }.fail();
            }

            let contained = value.is_some_and(|value| values.contains(value));
            Ok(if operator == "In" { contained } else { !contained })
        }
        operator @ ("Exists" | "DoesNotExist") => {
            if !values.is_empty() {
                return UnaryOperatorWithValuesSnafu { operator }.fail();
            }

            Ok(value.is_some() == (operator == "Exists"))
        }
        operator => InvalidOperatorSnafu { operator }.fail(),
    }
}

/// Returns `true` if every pair of `selector` is present in `labels`.
///
/// This is the semantic of a pod `nodeSelector`: an empty selector matches every node.
pub fn node_selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
