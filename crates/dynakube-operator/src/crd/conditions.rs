//! Status conditions of a DynaKube.
//!
//! Conditions are keyed by their `type`. Setting a condition whose type already exists updates it
//! in place; `lastTransitionTime` only moves when the status actually changes.

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

pub const API_TOKEN_CONDITION_TYPE: &str = "APIToken";
pub const PAAS_TOKEN_CONDITION_TYPE: &str = "PaaSToken";
pub const DATA_INGEST_TOKEN_CONDITION_TYPE: &str = "DataIngestToken";
pub const ONEAGENT_CONNECTION_INFO_CONDITION_TYPE: &str = "OneAgentConnectionInfo";
pub const ACTIVEGATE_CONNECTION_INFO_CONDITION_TYPE: &str = "ActiveGateConnectionInfo";
pub const PROCESS_MODULE_CONFIG_CONDITION_TYPE: &str = "ProcessModuleConfig";

pub const CREATED_REASON: &str = "Created";
pub const UPDATED_REASON: &str = "Updated";
pub const OUTDATED_REASON: &str = "Outdated";
pub const DYNATRACE_API_ERROR_REASON: &str = "DynatraceApiError";

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionStatus {
    /// The resource is in the condition.
    True,
    /// The resource is not in the condition.
    False,
    /// It cannot be decided whether the resource is in the condition.
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine readable reason for the last transition, in CamelCase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable details about the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl DynaKubeCondition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }

    /// A `False` condition reporting a failed Dynatrace API call.
    pub fn api_error(type_: impl Into<String>, error: &impl std::error::Error) -> Self {
        Self::new(
            type_,
            ConditionStatus::False,
            DYNATRACE_API_ERROR_REASON,
            error.to_string(),
        )
    }
}

/// Inserts or updates `condition` in `conditions`, keeping a single entry per type.
///
/// Returns `true` if anything changed.
pub fn set_condition(
    conditions: &mut Vec<DynaKubeCondition>,
    mut condition: DynaKubeCondition,
    now: Timestamp,
) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) else {
        condition.last_transition_time = Some(Time(now));
        conditions.push(condition);
        return true;
    };

    condition.last_transition_time = if existing.status == condition.status {
        existing.last_transition_time.clone()
    } else {
        Some(Time(now))
    };

    if *existing == condition {
        return false;
    }

    *existing = condition;
    true
}

pub fn remove_condition(conditions: &mut Vec<DynaKubeCondition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}

pub fn find_condition<'a>(
    conditions: &'a [DynaKubeCondition],
    type_: &str,
) -> Option<&'a DynaKubeCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::from_second(seconds).expect("valid timestamp")
    }

    #[test]
    fn new_condition_is_appended_with_transition_time() {
        let mut conditions = Vec::new();
        let changed = set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", ""),
            at(10),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Some(Time(at(10))));
    }

    #[test]
    fn same_type_is_updated_in_place() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", ""),
            at(10),
        );
        set_condition(
            &mut conditions,
            DynaKubeCondition::new(PAAS_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", ""),
            at(10),
        );
        let changed = set_condition(
            &mut conditions,
            DynaKubeCondition::new(
                API_TOKEN_CONDITION_TYPE,
                ConditionStatus::False,
                "Invalid",
                "token expired",
            ),
            at(20),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 2);
        let condition = find_condition(&conditions, API_TOKEN_CONDITION_TYPE).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.message.as_deref(), Some("token expired"));
        assert_eq!(condition.last_transition_time, Some(Time(at(20))));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", "a"),
            at(10),
        );

        let changed = set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", "b"),
            at(20),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, Some(Time(at(10))));

        let changed = set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", "b"),
            at(30),
        );
        assert!(!changed);
    }

    #[test]
    fn remove() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            DynaKubeCondition::new(API_TOKEN_CONDITION_TYPE, ConditionStatus::True, "Ok", ""),
            at(10),
        );
        assert!(remove_condition(&mut conditions, API_TOKEN_CONDITION_TYPE));
        assert!(!remove_condition(&mut conditions, API_TOKEN_CONDITION_TYPE));
    }
}
