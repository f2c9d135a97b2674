//! Transition Evaluation
//!
//! Pure functions over a compiled step and a map of collected inputs:
//! which required fields are still missing, whether the step may be left,
//! and where it leads.
//!
//! Ordering operators (`>`, `>=`, `<`, `<=`) compare numerically when both
//! sides are numeric. Otherwise `>` and `<` never hold, and `>=` / `<=` hold
//! only when both sides are equal under the `==` rule. A missing or null
//! input never satisfies an ordering operator.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::compiler::{CompiledStep, RuntimeMachine};
use crate::definition::{CompareOp, ConditionDef, END};
use crate::error::TransitionError;
use crate::value::{FieldValue, Inputs};

/// Result of gating a step on its required fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionCheck {
    pub can_transition: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Where a step leads for a given input set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome<'a> {
    pub is_end: bool,
    pub target_step_id: String,
    /// Index of the condition that fired; `None` when the default was used
    pub matched_condition: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<&'a CompiledStep>,
}

/// Required fields that are absent, null or blank in `inputs`.
pub fn missing_required_fields(step: &CompiledStep, inputs: &Inputs) -> BTreeSet<String> {
    step.required_fields
        .iter()
        .filter(|field| inputs.get(field.as_str()).map_or(true, FieldValue::is_blank))
        .cloned()
        .collect()
}

pub fn can_transition_from(step: &CompiledStep, inputs: &Inputs) -> TransitionCheck {
    let missing = missing_required_fields(step, inputs);
    if missing.is_empty() {
        TransitionCheck {
            can_transition: true,
            reason: None,
        }
    } else {
        TransitionCheck {
            can_transition: false,
            reason: Some(missing_reason(&missing)),
        }
    }
}

/// "email missing", "email, phone missing"
pub fn missing_reason(missing: &BTreeSet<String>) -> String {
    let names: Vec<&str> = missing.iter().map(String::as_str).collect();
    format!("{} missing", names.join(", "))
}

/// Resolve the step's next target. The first condition that holds wins,
/// otherwise the default. Required fields are the caller's gate; they are
/// not re-checked here.
pub fn execute_transition<'a>(
    machine: &'a RuntimeMachine,
    step: &CompiledStep,
    inputs: &Inputs,
) -> Result<TransitionOutcome<'a>, TransitionError> {
    let (matched_condition, target) = step
        .next
        .conditions
        .iter()
        .enumerate()
        .find(|(_, c)| condition_holds(c, inputs))
        .map(|(i, c)| (Some(i), c.target.as_str()))
        .unwrap_or((None, step.next.default.as_str()));

    if target == END {
        return Ok(TransitionOutcome {
            is_end: true,
            target_step_id: END.to_string(),
            matched_condition,
            next_step: None,
        });
    }

    let next = machine
        .step(target)
        .ok_or_else(|| TransitionError::UnknownTarget {
            from: step.id.clone(),
            target: target.to_string(),
        })?;

    Ok(TransitionOutcome {
        is_end: false,
        target_step_id: next.id.clone(),
        matched_condition,
        next_step: Some(next),
    })
}

/// Evaluate one condition against the collected inputs.
pub fn condition_holds(condition: &ConditionDef, inputs: &Inputs) -> bool {
    let actual = inputs
        .get(&condition.field)
        .filter(|v| !matches!(v, FieldValue::Null));
    compare(actual, condition.op, &condition.value)
}

/// `actual op literal`, with `None` standing for a missing or null input.
pub fn compare(actual: Option<&FieldValue>, op: CompareOp, literal: &FieldValue) -> bool {
    match op {
        CompareOp::Eq => equals(actual, literal),
        CompareOp::Ne => !equals(actual, literal),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let Some(actual) = actual else {
                return false;
            };
            match actual.numeric_cmp(literal) {
                Some(ordering) => match op {
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Gte => ordering != Ordering::Less,
                    CompareOp::Lt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                },
                None => {
                    matches!(op, CompareOp::Gte | CompareOp::Lte) && actual.loosely_equals(literal)
                }
            }
        }
    }
}

fn equals(actual: Option<&FieldValue>, literal: &FieldValue) -> bool {
    match actual {
        None => matches!(literal, FieldValue::Null),
        Some(value) => value.loosely_equals(literal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, ClientProfile};
    use crate::definition::load;

    const BRANCHING: &str = r#"
workflow: branching
applies_to:
  client_type: corporate
steps:
  - id: start
    required_fields: [email]
    next: verify
  - id: verify
    next:
      conditions:
        - field: risk
          op: ">="
          value: high
          target: review
      default: finalize
  - id: review
    next: END
  - id: finalize
"#;

    fn machine() -> RuntimeMachine {
        compile(
            &load(BRANCHING).unwrap(),
            &ClientProfile::new("corporate", "LU"),
        )
        .unwrap()
    }

    fn inputs(pairs: &[(&str, FieldValue)]) -> Inputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_required_fields_gate() {
        let machine = machine();
        let start = machine.step("start").unwrap();

        let check = can_transition_from(start, &Inputs::new());
        assert!(!check.can_transition);
        assert_eq!(check.reason.as_deref(), Some("email missing"));

        let filled = inputs(&[("email", "a@b.com".into())]);
        let check = can_transition_from(start, &filled);
        assert!(check.can_transition);
        assert!(check.reason.is_none());

        let outcome = execute_transition(&machine, start, &filled).unwrap();
        assert!(!outcome.is_end);
        assert_eq!(outcome.next_step.unwrap().id, "verify");
        assert_eq!(outcome.matched_condition, None);
    }

    #[test]
    fn test_blank_and_null_count_as_missing() {
        let machine = machine();
        let start = machine.step("start").unwrap();

        for value in [FieldValue::Null, "".into()] {
            let missing = missing_required_fields(start, &inputs(&[("email", value)]));
            assert!(missing.contains("email"));
        }
        for value in [FieldValue::from(0), FieldValue::from(" "), FieldValue::from(false)] {
            let filled = inputs(&[("email", value)]);
            assert!(missing_required_fields(start, &filled).is_empty());
            assert!(can_transition_from(start, &filled).can_transition);
        }
    }

    #[test]
    fn test_missing_iff_cannot_transition() {
        let machine = machine();
        let samples = [
            Inputs::new(),
            inputs(&[("email", "".into())]),
            inputs(&[("email", "x".into())]),
            inputs(&[("risk", "high".into())]),
        ];
        for step in &machine.steps {
            for sample in &samples {
                assert_eq!(
                    missing_required_fields(step, sample).is_empty(),
                    can_transition_from(step, sample).can_transition
                );
            }
        }
    }

    #[test]
    fn test_conditional_routing() {
        let machine = machine();
        let verify = machine.step("verify").unwrap();

        let high = execute_transition(&machine, verify, &inputs(&[("risk", "high".into())])).unwrap();
        assert_eq!(high.target_step_id, "review");
        assert_eq!(high.matched_condition, Some(0));

        let low = execute_transition(&machine, verify, &inputs(&[("risk", "low".into())])).unwrap();
        assert_eq!(low.target_step_id, "finalize");

        let none = execute_transition(&machine, verify, &Inputs::new()).unwrap();
        assert_eq!(none.target_step_id, "finalize");
    }

    #[test]
    fn test_end_transition() {
        let machine = machine();
        let review = machine.step("review").unwrap();
        let outcome = execute_transition(&machine, review, &Inputs::new()).unwrap();
        assert!(outcome.is_end);
        assert_eq!(outcome.target_step_id, END);
        assert!(outcome.next_step.is_none());

        // implicit next of the last step
        let finalize = machine.step("finalize").unwrap();
        assert!(execute_transition(&machine, finalize, &Inputs::new()).unwrap().is_end);
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let machine = machine();
        let mut rogue = machine.step("start").unwrap().clone();
        rogue.next.default = "ghost".into();

        let err = execute_transition(&machine, &rogue, &Inputs::new()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::UnknownTarget {
                from: "start".into(),
                target: "ghost".into()
            }
        );
    }

    #[test]
    fn test_first_matching_condition_wins() {
        let yaml = r#"
workflow: ordered
applies_to:
  client_type: fund
steps:
  - id: start
    next:
      conditions:
        - field: aum
          op: ">"
          value: 1000000
          target: large
        - field: aum
          op: ">"
          value: 1000
          target: medium
      default: small
  - id: large
  - id: medium
  - id: small
"#;
        let machine = compile(&load(yaml).unwrap(), &ClientProfile::new("fund", "IE")).unwrap();
        let start = machine.step("start").unwrap();
        let route = |aum: FieldValue| {
            execute_transition(&machine, start, &inputs(&[("aum", aum)]))
                .unwrap()
                .target_step_id
        };

        assert_eq!(route(5_000_000.into()), "large");
        assert_eq!(route("50000".into()), "medium");
        assert_eq!(route(10.into()), "small");
        assert_eq!(route("lots".into()), "small");
    }

    #[test]
    fn test_numeric_comparison() {
        let ten: FieldValue = 10.into();
        assert!(compare(Some(&"9".into()), CompareOp::Lt, &ten));
        assert!(compare(Some(&"10".into()), CompareOp::Lte, &ten));
        assert!(compare(Some(&"10.0".into()), CompareOp::Eq, &ten));
        assert!(compare(Some(&100.into()), CompareOp::Gt, &ten));
        assert!(!compare(Some(&"9".into()), CompareOp::Gte, &ten));
        // lexical ordering would put "9" after "10"
        assert!(!compare(Some(&"9".into()), CompareOp::Gt, &ten));
    }

    #[test]
    fn test_non_numeric_ordering_policy() {
        let high: FieldValue = "high".into();
        assert!(compare(Some(&"high".into()), CompareOp::Gte, &high));
        assert!(compare(Some(&"high".into()), CompareOp::Lte, &high));
        assert!(!compare(Some(&"high".into()), CompareOp::Gt, &high));
        assert!(!compare(Some(&"high".into()), CompareOp::Lt, &high));
        assert!(!compare(Some(&"low".into()), CompareOp::Gte, &high));
        assert!(!compare(Some(&"low".into()), CompareOp::Lte, &high));
        assert!(!compare(None, CompareOp::Gte, &high));
        assert!(!compare(None, CompareOp::Lt, &10.into()));
    }

    #[test]
    fn test_equality_with_missing_input() {
        let yes: FieldValue = "yes".into();
        assert!(!compare(None, CompareOp::Eq, &yes));
        assert!(compare(None, CompareOp::Ne, &yes));
        assert!(compare(None, CompareOp::Eq, &FieldValue::Null));
        assert!(compare(Some(&true.into()), CompareOp::Eq, &"true".into()));
        assert!(!compare(Some(&"Yes".into()), CompareOp::Eq, &yes));
    }

    #[test]
    fn test_null_input_treated_as_missing() {
        let condition = ConditionDef {
            field: "pep".into(),
            op: CompareOp::Ne,
            value: true.into(),
            target: "x".into(),
        };
        assert!(condition_holds(&condition, &inputs(&[("pep", FieldValue::Null)])));
        assert!(!condition_holds(&condition, &inputs(&[("pep", true.into())])));
    }
}
