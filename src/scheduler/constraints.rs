use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Primary placement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Pack instances tightly (minimize nodes)
    #[default]
    BinPack,
    /// Spread instances across nodes (high availability)
    Spread,
    /// Random placement
    Random,
    /// Spread plus affinity-rule adjustments
    Affinity,
}

/// Hard vs. soft constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Must match; infeasible otherwise
    Required,
    /// Should match; contributes its weight to the score
    Preferred,
}

/// Label matching operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    NotExists,
}

/// One placement constraint against node labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConstraint {
    pub key: String,
    pub op: ConstraintOperator,
    pub values: Vec<String>,
    pub kind: ConstraintKind,
    /// Score contribution when a Preferred constraint matches
    pub weight: i64,
}

impl PlacementConstraint {
    pub fn required(
        key: impl Into<String>,
        op: ConstraintOperator,
        values: Vec<String>,
    ) -> Self {
        Self {
            key: key.into(),
            op,
            values,
            kind: ConstraintKind::Required,
            weight: 100,
        }
    }

    pub fn preferred(
        key: impl Into<String>,
        op: ConstraintOperator,
        values: Vec<String>,
        weight: i64,
    ) -> Self {
        Self {
            key: key.into(),
            op,
            values,
            kind: ConstraintKind::Preferred,
            weight,
        }
    }

    /// Evaluate this constraint against a node's label set.
    /// Negative operators treat an absent key as a match.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.op {
            ConstraintOperator::Equals => {
                value.is_some_and(|v| self.values.first().is_some_and(|want| v == want))
            }
            ConstraintOperator::NotEquals => {
                !value.is_some_and(|v| self.values.first().is_some_and(|want| v == want))
            }
            ConstraintOperator::In => value.is_some_and(|v| self.values.iter().any(|w| w == v)),
            ConstraintOperator::NotIn => {
                !value.is_some_and(|v| self.values.iter().any(|w| w == v))
            }
            ConstraintOperator::Exists => value.is_some(),
            ConstraintOperator::NotExists => value.is_none(),
        }
    }
}

/// Prefer or avoid co-residence with a named service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityRule {
    pub service_name: String,
    /// true = avoid nodes hosting the service, false = prefer them
    pub anti_affinity: bool,
    pub weight: i64,
}

impl AffinityRule {
    pub fn prefer(service_name: impl Into<String>, weight: i64) -> Self {
        Self {
            service_name: service_name.into(),
            anti_affinity: false,
            weight,
        }
    }

    pub fn avoid(service_name: impl Into<String>, weight: i64) -> Self {
        Self {
            service_name: service_name.into(),
            anti_affinity: true,
            weight,
        }
    }
}

/// Complete placement preferences for one scheduling request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementPreferences {
    pub strategy: PlacementStrategy,
    pub constraints: Vec<PlacementConstraint>,
    pub affinity_rules: Vec<AffinityRule>,
    /// Taints the request is willing to accept
    pub tolerations: Vec<String>,
    /// Spread replicas across distinct values of this label
    pub spread_across_key: Option<String>,
}

impl PlacementPreferences {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_constraint(mut self, constraint: PlacementConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_affinity(mut self, rule: AffinityRule) -> Self {
        self.affinity_rules.push(rule);
        self
    }

    pub fn with_toleration(mut self, taint: impl Into<String>) -> Self {
        self.tolerations.push(taint.into());
        self
    }
}
