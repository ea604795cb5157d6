//! Stage registry: the immutable, ordered stage catalog.
//!
//! Validated once in [`StageRegistry::new`]; there is no mutation path after
//! construction.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{GateError, GateResult};
use crate::types::{FactorId, Normalization, Stage, StageId};

#[derive(Clone, Debug)]
pub struct StageRegistry {
    /// Sorted by `order`; `stages[i].order == i`.
    stages: Vec<Stage>,
    /// factor → index into `stages`.
    owners: BTreeMap<FactorId, usize>,
}

impl StageRegistry {
    /// Validate and freeze a stage catalog.
    ///
    /// Rules:
    /// - at least one stage
    /// - orders contiguous from 0 and unique
    /// - stage ids unique
    /// - every factor set non-empty, `1 <= threshold <= |factors|`
    /// - a factor id belongs to exactly one stage
    pub fn new(mut stages: Vec<Stage>) -> GateResult<Self> {
        if stages.is_empty() {
            return Err(invalid("registry has no stages"));
        }

        stages.sort_by_key(|s| s.order);

        let mut ids = BTreeSet::new();
        let mut owners = BTreeMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if stage.order as usize != i {
                return Err(invalid(format!(
                    "stage orders must be contiguous from 0: expected {i}, found {} ('{}')",
                    stage.order, stage.id
                )));
            }
            if !ids.insert(stage.id.clone()) {
                return Err(invalid(format!("duplicate stage id '{}'", stage.id)));
            }
            if stage.required_factors.is_empty() {
                return Err(invalid(format!("stage '{}' has no factors", stage.id)));
            }
            if stage.threshold == 0 {
                return Err(invalid(format!("stage '{}' threshold must be >= 1", stage.id)));
            }
            if stage.threshold as usize > stage.required_factors.len() {
                return Err(invalid(format!(
                    "stage '{}' threshold {} exceeds factor count {}",
                    stage.id,
                    stage.threshold,
                    stage.required_factors.len()
                )));
            }
            if let Some(stray) = stage
                .normalization
                .keys()
                .find(|f| !stage.required_factors.contains(*f))
            {
                return Err(invalid(format!(
                    "stage '{}' sets normalization for foreign factor '{stray}'",
                    stage.id
                )));
            }
            for factor in &stage.required_factors {
                if let Some(prev) = owners.insert(factor.clone(), i) {
                    return Err(invalid(format!(
                        "factor '{factor}' appears in both '{}' and '{}'",
                        stages[prev].id, stage.id
                    )));
                }
            }
        }

        Ok(Self { stages, owners })
    }

    /// Build from the `stages` array of the loaded config JSON.
    ///
    /// Each entry: `{ id, name?, threshold?, factors: [ { id, normalize? } ] }`.
    /// Order is the array position. `threshold` defaults to all factors.
    pub fn from_config_json(cfg: &Value) -> GateResult<Self> {
        let arr = cfg
            .pointer("/stages")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("config missing stages[]"))?;

        let mut stages = Vec::with_capacity(arr.len());
        for (i, s) in arr.iter().enumerate() {
            let id = s
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("stages[{i}] missing id")))?;
            let factors = s
                .get("factors")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(format!("stages[{i}] ('{id}') missing factors[]")))?;

            let mut required = BTreeSet::new();
            let mut normalization = BTreeMap::new();
            for (j, f) in factors.iter().enumerate() {
                let fid = f
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(format!("stages[{i}].factors[{j}] missing id")))?;
                let norm = match f.get("normalize").and_then(Value::as_str) {
                    None | Some("exact") => Normalization::Exact,
                    Some("phrase") => Normalization::Phrase,
                    Some(other) => {
                        return Err(invalid(format!(
                            "stages[{i}].factors[{j}] unknown normalize '{other}' (exact | phrase)"
                        )))
                    }
                };
                let fid = FactorId::new(fid);
                if !required.insert(fid.clone()) {
                    return Err(invalid(format!("stage '{id}' lists factor '{fid}' twice")));
                }
                if norm != Normalization::Exact {
                    normalization.insert(fid, norm);
                }
            }

            let threshold = match s.get("threshold") {
                None => required.len() as u32,
                Some(v) => v
                    .as_u64()
                    .and_then(|t| u32::try_from(t).ok())
                    .ok_or_else(|| invalid(format!("stages[{i}] threshold must be a u32")))?,
            };

            stages.push(Stage {
                id: StageId::new(id),
                name: s
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(id)
                    .to_string(),
                order: i as u32,
                required_factors: required,
                threshold,
                normalization,
            });
        }

        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn last_order(&self) -> u32 {
        (self.stages.len() - 1) as u32
    }

    pub fn stage_at(&self, order: u32) -> Option<&Stage> {
        self.stages.get(order as usize)
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// The stage that lists `factor`, if any.
    pub fn owning_stage(&self, factor: &FactorId) -> Option<&Stage> {
        self.owners.get(factor).map(|&i| &self.stages[i])
    }

    pub fn factor_ids(&self) -> impl Iterator<Item = &FactorId> {
        self.owners.keys()
    }
}

fn invalid(reason: impl Into<String>) -> GateError {
    GateError::InvalidRegistry(reason.into())
}
