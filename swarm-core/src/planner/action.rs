use serde::{Deserialize, Serialize};

use crate::config::RiskFactors;
use crate::types::{ActionId, Scalar, WorldState};

/// Risk classification multiplying an action's base cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Med,
    High,
    Critical,
}

impl RiskLevel {
    /// Multiplier for this level under the given factors
    #[must_use]
    pub fn factor(self, factors: &RiskFactors) -> f64 {
        match self {
            RiskLevel::Low => factors.low,
            RiskLevel::Med => factors.med,
            RiskLevel::High => factors.high,
            RiskLevel::Critical => factors.critical,
        }
    }
}

/// State mutation produced by applying an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Effect {
    /// Assign a variable
    Set {
        var: String,
        value: Scalar,
    },
    /// Increment a numeric variable (missing variables start at 0)
    Add {
        var: String,
        delta: f64,
    },
}

/// A planner action: a guarded state transition with a scalar cost.
///
/// Preconditions are subset predicates over the current world state;
/// effects are deltas applied to produce the successor state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Stable action identifier
    pub id: ActionId,
    /// Variables that must hold before the action is applicable
    pub preconditions: WorldState,
    /// Deltas applied to the pre-state
    pub effects: Vec<Effect>,
    /// Base cost before risk weighting
    pub cost: f64,
    /// Risk classification
    pub risk: RiskLevel,
}

impl Action {
    /// Create an action with low risk and the given cost
    #[must_use]
    pub fn new(id: impl Into<ActionId>, cost: f64) -> Self {
        Self {
            id: id.into(),
            preconditions: WorldState::new(),
            effects: Vec::new(),
            cost,
            risk: RiskLevel::Low,
        }
    }

    /// Builder: require `var == value` before application
    #[must_use]
    pub fn requires(mut self, var: impl Into<String>, value: Scalar) -> Self {
        self.preconditions.set(var, value);
        self
    }

    /// Builder: set `var = value` on application
    #[must_use]
    pub fn sets(mut self, var: impl Into<String>, value: Scalar) -> Self {
        self.effects.push(Effect::Set {
            var: var.into(),
            value,
        });
        self
    }

    /// Builder: risk classification
    #[must_use]
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Effective cost under the configured risk factors
    #[must_use]
    pub fn weighted_cost(&self, factors: &RiskFactors) -> f64 {
        self.cost * self.risk.factor(factors)
    }

    /// Check applicability in `state`
    #[must_use]
    pub fn applicable(&self, state: &WorldState) -> bool {
        state.satisfies(&self.preconditions)
    }

    /// Produce the successor state. Non-suspending; used on the A* hot path.
    #[must_use]
    pub fn apply(&self, state: &WorldState) -> WorldState {
        let mut next = state.clone();
        for effect in &self.effects {
            match effect {
                Effect::Set { var, value } => next.set(var.clone(), value.clone()),
                Effect::Add { var, delta } => {
                    let current = match next.get(var) {
                        Some(Scalar::Int(v)) => *v as f64,
                        Some(Scalar::Float(v)) => *v,
                        _ => 0.0,
                    };
                    next.set(var.clone(), Scalar::Float(current + delta));
                }
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applicable_checks_preconditions() {
        let action = Action::new("deploy", 10.0).requires("built", Scalar::Bool(true));

        let mut state = WorldState::new();
        assert!(!action.applicable(&state));

        state.set("built", Scalar::Bool(true));
        assert!(action.applicable(&state));
    }

    #[test]
    fn test_apply_sets_and_adds() {
        let action = Action {
            id: "work".to_string(),
            preconditions: WorldState::new(),
            effects: vec![
                Effect::Set {
                    var: "phase".to_string(),
                    value: Scalar::from("done"),
                },
                Effect::Add {
                    var: "progress".to_string(),
                    delta: 0.5,
                },
            ],
            cost: 1.0,
            risk: RiskLevel::Low,
        };

        let state = WorldState::new();
        let next = action.apply(&state);
        assert_eq!(next.get("phase"), Some(&Scalar::from("done")));
        assert_eq!(next.get("progress"), Some(&Scalar::Float(0.5)));

        let again = action.apply(&next);
        assert_eq!(again.get("progress"), Some(&Scalar::Float(1.0)));
    }

    #[test]
    fn test_weighted_cost_applies_risk_factor() {
        let factors = RiskFactors::default();
        let action = Action::new("risky", 10.0).with_risk(RiskLevel::Critical);
        assert!((action.weighted_cost(&factors) - 30.0).abs() < f64::EPSILON);
    }
}
