//! Type-specific behaviour selected when a session is created

use crate::domain::call::value_object::CallType;
use crate::domain::collection::digits;
use crate::domain::collection::outcome::CallAction;
use crate::domain::collection::scenario::ScenarioCatalog;
use crate::domain::collection::stage::StageCollector;
use crate::domain::shared::{DomainError, Result};
use std::collections::{BTreeMap, HashMap};

pub const META_SCENARIO: &str = "scenario";
pub const META_STAGES: &str = "stages";
pub const META_EXPECTED_CODE: &str = "expected_code";
pub const META_GREETING: &str = "greeting";
pub const META_CHAT_ID: &str = "chat_id";

const DEFAULT_GREETING: &str = "Hello, how can I help you today?";

/// Inputs needed to build a strategy
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub catalog: &'a ScenarioCatalog,
    pub default_scenario: &'a str,
    /// Accept format-valid input when a verification call has no expected value
    pub accept_unverified_input: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStrategy {
    Conversational { greeting: String },
    Verification { expected_code: Option<String> },
    PureCollection,
}

impl CallStrategy {
    /// Pick the strategy for `call_type` and build its stage plan from metadata
    pub fn select(
        call_type: CallType,
        metadata: &BTreeMap<String, String>,
        ctx: StrategyContext<'_>,
    ) -> Result<(Self, Vec<StageCollector>)> {
        match call_type {
            CallType::Conversational => {
                let greeting = metadata
                    .get(META_GREETING)
                    .filter(|g| !g.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_GREETING.to_string());
                let stages = if metadata.contains_key(META_STAGES)
                    || metadata.contains_key(META_SCENARIO)
                {
                    plan_stages(metadata, ctx)?
                } else {
                    Vec::new()
                };
                Ok((CallStrategy::Conversational { greeting }, stages))
            }
            CallType::Verification => {
                let scenario_name = metadata
                    .get(META_SCENARIO)
                    .map(String::as_str)
                    .unwrap_or(ctx.default_scenario);
                let scenario = ctx.catalog.require(scenario_name)?;

                let expected_code = metadata
                    .get(META_EXPECTED_CODE)
                    .map(|c| digits::strip_structural(c.trim()))
                    .filter(|c| !c.is_empty());
                match &expected_code {
                    Some(code) if !digits::validate(code, scenario.digit_length) => {
                        return Err(DomainError::Validation(format!(
                            "expected_code must be {} digits for scenario {}",
                            scenario.digit_length, scenario.name
                        )));
                    }
                    None if !ctx.accept_unverified_input => {
                        return Err(DomainError::Validation(
                            "verification call requires expected_code".to_string(),
                        ));
                    }
                    _ => {}
                }

                let stage = StageCollector::from_scenario(scenario.name.clone(), scenario);
                Ok((CallStrategy::Verification { expected_code }, vec![stage]))
            }
            CallType::PureCollection => {
                Ok((CallStrategy::PureCollection, plan_stages(metadata, ctx)?))
            }
        }
    }

    /// Final judgement on a flushed entry for `stage`
    pub fn accepts(&self, stage: &StageCollector, entry: &str) -> bool {
        if !stage.is_well_formed(entry) {
            return false;
        }
        match self {
            CallStrategy::Verification {
                expected_code: Some(code),
            } => digits::strip_structural(entry) == *code,
            _ => true,
        }
    }

    /// What the call does once every stage is satisfied
    pub fn completion_action(&self) -> CallAction {
        match self {
            CallStrategy::Conversational { .. } => CallAction::Continue,
            _ => CallAction::Hangup,
        }
    }

    pub fn greeting(&self) -> Option<&str> {
        match self {
            CallStrategy::Conversational { greeting } => Some(greeting),
            _ => None,
        }
    }
}

fn plan_stages(
    metadata: &BTreeMap<String, String>,
    ctx: StrategyContext<'_>,
) -> Result<Vec<StageCollector>> {
    let names: Vec<String> = match (metadata.get(META_STAGES), metadata.get(META_SCENARIO)) {
        (Some(list), _) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        (None, Some(single)) => vec![single.trim().to_string()],
        (None, None) => vec![ctx.default_scenario.to_string()],
    };
    if names.is_empty() {
        return Err(DomainError::Validation("stages list is empty".to_string()));
    }

    let mut occurrences: HashMap<String, usize> = HashMap::new();
    for name in &names {
        *occurrences.entry(name.to_ascii_lowercase()).or_default() += 1;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .iter()
        .map(|name| {
            let scenario = ctx.catalog.require(name)?;
            let lower = name.to_ascii_lowercase();
            let index = seen.entry(lower.clone()).or_default();
            *index += 1;
            let key = if occurrences[&lower] > 1 {
                format!("{}_{}", lower, index)
            } else {
                lower
            };
            Ok(StageCollector::from_scenario(key, scenario))
        })
        .collect()
}
