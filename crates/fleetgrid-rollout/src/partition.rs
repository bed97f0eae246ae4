//! Group partitioner: splits a rollout's matched devices into ordered groups.
//!
//! Device ids are sorted and deduplicated first, so the same matched set
//! always yields the same groups. Group sizes come from exact integer
//! shares `N·wᵢ / Σw`; the [`RoundingRule`] decides where the devices lost
//! to flooring go. Every device lands in exactly one group.

use std::collections::HashSet;

use fleet_core::RoundingSetting;
use fleetgrid_state::{ControllerId, ErrorAction, GroupCondition, ThresholdKind};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

/// Where devices left over after flooring each share are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundingRule {
    /// One extra device each to the groups with the largest fractional
    /// remainder; ties go to the earlier group.
    #[default]
    LargestRemainder,
    /// The final group absorbs every leftover device.
    CarryToLast,
}

impl From<RoundingSetting> for RoundingRule {
    fn from(setting: RoundingSetting) -> Self {
        match setting {
            RoundingSetting::LargestRemainder => RoundingRule::LargestRemainder,
            RoundingSetting::CarryToLast => RoundingRule::CarryToLast,
        }
    }
}

/// One explicitly configured group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    pub percentage: u32,
    pub success_condition: GroupCondition,
    #[serde(default)]
    pub error_condition: Option<GroupCondition>,
    #[serde(default)]
    pub error_action: ErrorAction,
}

/// How a rollout's devices are split into groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSpec {
    /// `groups` equal shares, all with the same conditions.
    Count {
        groups: u32,
        success_condition: GroupCondition,
        #[serde(default)]
        error_condition: Option<GroupCondition>,
        #[serde(default)]
        error_action: ErrorAction,
    },
    /// Ordered groups with percentages that sum to 100.
    Explicit(Vec<GroupDefinition>),
}

/// A group ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedGroup {
    pub name: String,
    pub percentage: Option<u32>,
    pub success_condition: GroupCondition,
    pub error_condition: Option<GroupCondition>,
    pub error_action: ErrorAction,
    pub members: Vec<ControllerId>,
}

impl GroupSpec {
    /// Reject specifications that cannot produce a valid partition.
    pub fn validate(&self, max_groups: u32) -> RolloutResult<()> {
        let invalid = |msg: String| Err(RolloutError::Validation(msg));
        match self {
            GroupSpec::Count {
                groups,
                success_condition,
                error_condition,
                ..
            } => {
                if *groups == 0 {
                    return invalid("a rollout needs at least one group".into());
                }
                if *groups > max_groups {
                    return invalid(format!("{groups} groups exceed the maximum of {max_groups}"));
                }
                validate_conditions("groups", success_condition, error_condition.as_ref())
            }
            GroupSpec::Explicit(definitions) => {
                if definitions.is_empty() {
                    return invalid("a rollout needs at least one group".into());
                }
                if definitions.len() > max_groups as usize {
                    return invalid(format!(
                        "{} groups exceed the maximum of {max_groups}",
                        definitions.len()
                    ));
                }
                let mut names = HashSet::new();
                let mut total = 0u32;
                for def in definitions {
                    if def.name.trim().is_empty() {
                        return invalid("group names must not be empty".into());
                    }
                    if !names.insert(def.name.as_str()) {
                        return invalid(format!("duplicate group name '{}'", def.name));
                    }
                    if !(1..=100).contains(&def.percentage) {
                        return invalid(format!(
                            "group '{}' percentage {} is outside 1..=100",
                            def.name, def.percentage
                        ));
                    }
                    validate_conditions(&def.name, &def.success_condition, def.error_condition.as_ref())?;
                    total += def.percentage;
                }
                if total != 100 {
                    return invalid(format!("group percentages sum to {total}, expected 100"));
                }
                Ok(())
            }
        }
    }

    pub fn group_count(&self) -> usize {
        match self {
            GroupSpec::Count { groups, .. } => *groups as usize,
            GroupSpec::Explicit(definitions) => definitions.len(),
        }
    }
}

fn validate_conditions(
    group: &str,
    success: &GroupCondition,
    error: Option<&GroupCondition>,
) -> RolloutResult<()> {
    if success.kind == ThresholdKind::Percent && success.value > 100 {
        return Err(RolloutError::Validation(format!(
            "group '{group}' success percentage {} exceeds 100",
            success.value
        )));
    }
    if let Some(error) = error {
        let in_range = match error.kind {
            ThresholdKind::Percent => (1..=100).contains(&error.value),
            ThresholdKind::Count => error.value >= 1,
        };
        if !in_range {
            return Err(RolloutError::Validation(format!(
                "group '{group}' error threshold {} is out of range",
                error.value
            )));
        }
    }
    Ok(())
}

/// Sizes of groups with the given weights over `total` devices.
///
/// Always sums to `total` when at least one weight is non-zero.
pub fn group_sizes(total: usize, weights: &[u64], rule: RoundingRule) -> Vec<usize> {
    let weight_sum: u64 = weights.iter().sum();
    if weights.is_empty() || weight_sum == 0 {
        return vec![0; weights.len()];
    }

    let n = total as u128;
    let sum = weight_sum as u128;
    let mut sizes: Vec<usize> = weights
        .iter()
        .map(|&w| (n * w as u128 / sum) as usize)
        .collect();
    let leftover = total - sizes.iter().sum::<usize>();

    match rule {
        RoundingRule::CarryToLast => {
            if let Some(last) = sizes.last_mut() {
                *last += leftover;
            }
        }
        RoundingRule::LargestRemainder => {
            let mut order: Vec<usize> = (0..weights.len()).collect();
            // Stable sort keeps earlier groups first among equal remainders.
            order.sort_by_key(|&i| std::cmp::Reverse(n * weights[i] as u128 % sum));
            for &i in order.iter().take(leftover) {
                sizes[i] += 1;
            }
        }
    }
    sizes
}

/// Split `devices` into groups per `spec`.
pub fn partition(
    mut devices: Vec<ControllerId>,
    spec: &GroupSpec,
    rule: RoundingRule,
    max_groups: u32,
) -> RolloutResult<Vec<PlannedGroup>> {
    spec.validate(max_groups)?;
    devices.sort();
    devices.dedup();

    let mut planned: Vec<PlannedGroup> = match spec {
        GroupSpec::Count {
            groups,
            success_condition,
            error_condition,
            error_action,
        } => (0..*groups)
            .map(|i| PlannedGroup {
                name: format!("group-{}", i + 1),
                percentage: None,
                success_condition: *success_condition,
                error_condition: *error_condition,
                error_action: *error_action,
                members: Vec::new(),
            })
            .collect(),
        GroupSpec::Explicit(definitions) => definitions
            .iter()
            .map(|def| PlannedGroup {
                name: def.name.clone(),
                percentage: Some(def.percentage),
                success_condition: def.success_condition,
                error_condition: def.error_condition,
                error_action: def.error_action,
                members: Vec::new(),
            })
            .collect(),
    };

    let weights: Vec<u64> = planned
        .iter()
        .map(|g| g.percentage.map_or(1, u64::from))
        .collect();
    let sizes = group_sizes(devices.len(), &weights, rule);

    let mut remaining = devices.into_iter();
    for (group, size) in planned.iter_mut().zip(sizes) {
        group.members = remaining.by_ref().take(size).collect();
    }
    Ok(planned)
}
