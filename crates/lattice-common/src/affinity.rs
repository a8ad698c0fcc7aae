//! Node-affinity matching
//!
//! Decides whether a node satisfies a PersistentVolume's required node
//! affinity, using the same rules the scheduler applies to
//! `NodeSelectorTerm`s: terms are ORed, requirements within a term are ANDed,
//! and an empty term matches nothing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Node, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeSpec,
};

use crate::ReconcileError;

/// The only field supported in `matchFields`
const NODE_NAME_FIELD: &str = "metadata.name";

/// Check whether `node` satisfies the PV spec's required node affinity
///
/// A PV without `nodeAffinity.required` matches no node. A malformed term
/// only fails the check when no other term matches.
pub fn node_matches_volume(
    pv_spec: &PersistentVolumeSpec,
    node: &Node,
) -> Result<bool, ReconcileError> {
    let Some(required) = pv_spec
        .node_affinity
        .as_ref()
        .and_then(|a| a.required.as_ref())
    else {
        return Ok(false);
    };
    match_node_selector_terms(&required.node_selector_terms, node)
}

/// Evaluate a list of ORed selector terms against a node
pub fn match_node_selector_terms(
    terms: &[NodeSelectorTerm],
    node: &Node,
) -> Result<bool, ReconcileError> {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let name = node.metadata.name.as_deref().unwrap_or_default();

    let mut errors = Vec::new();
    for term in terms {
        match term_matches(term, labels, name) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(false)
    } else {
        Err(ReconcileError::Config(format!(
            "invalid node affinity: {}",
            errors.join("; ")
        )))
    }
}

fn term_matches(
    term: &NodeSelectorTerm,
    labels: &BTreeMap<String, String>,
    node_name: &str,
) -> Result<bool, String> {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return Ok(false);
    }

    for req in expressions {
        if !label_requirement_matches(req, labels)? {
            return Ok(false);
        }
    }
    for req in fields {
        if !field_requirement_matches(req, node_name)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn label_requirement_matches(
    req: &NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    let values = req.values.as_deref().unwrap_or_default();
    let actual = labels.get(&req.key);

    match req.operator.as_str() {
        "In" | "NotIn" => {
            if values.is_empty() {
                return Err(format!(
                    "operator {} on key {} requires at least one value",
                    req.operator, req.key
                ));
            }
            let found = actual.is_some_and(|v| values.contains(v));
            Ok(if req.operator == "In" { found } else { !found })
        }
        "Exists" | "DoesNotExist" => {
            if !values.is_empty() {
                return Err(format!(
                    "operator {} on key {} must not have values",
                    req.operator, req.key
                ));
            }
            Ok((req.operator == "Exists") == actual.is_some())
        }
        "Gt" | "Lt" => {
            let [bound] = values else {
                return Err(format!(
                    "operator {} on key {} requires exactly one value",
                    req.operator, req.key
                ));
            };
            let bound: i64 = bound.parse().map_err(|_| {
                format!(
                    "operator {} on key {} requires an integer value, got {}",
                    req.operator, req.key, bound
                )
            })?;
            let Some(actual) = actual.and_then(|v| v.parse::<i64>().ok()) else {
                return Ok(false);
            };
            Ok(if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            })
        }
        other => Err(format!("unsupported operator {} on key {}", other, req.key)),
    }
}

fn field_requirement_matches(req: &NodeSelectorRequirement, node_name: &str) -> Result<bool, String> {
    if req.key != NODE_NAME_FIELD {
        return Err(format!("unsupported field selector key {}", req.key));
    }
    let values = req.values.as_deref().unwrap_or_default();
    let [value] = values else {
        return Err(format!(
            "field selector {} requires exactly one value",
            req.key
        ));
    };
    match req.operator.as_str() {
        "In" => Ok(value == node_name),
        "NotIn" => Ok(value != node_name),
        other => Err(format!(
            "unsupported field selector operator {} on key {}",
            other, req.key
        )),
    }
}
