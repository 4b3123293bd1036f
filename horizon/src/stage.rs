use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;

use crate::error::ConfigError;
use crate::ids::validate_label;

/// A named step of a pipeline route, such as `ingest` or `simulate`.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        validate_label("stage", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed stage route a family of plugins is written against.
///
/// The route doubles as the template's known stage set: plugins may only
/// declare stages that appear in it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    id: String,
    route: Vec<Stage>,
}

impl StageTemplate {
    /// Create a template from an ordered list of stage names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyRoute`] for an empty route and
    /// [`ConfigError::DuplicateStage`] if a stage is listed twice.
    pub fn new<I, S>(id: impl Into<String>, stages: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        validate_label("template id", &id)?;

        let mut seen = HashSet::new();
        let mut route = Vec::new();
        for name in stages {
            let stage = Stage::new(name)?;
            if !seen.insert(stage.clone()) {
                return Err(ConfigError::DuplicateStage(stage));
            }
            route.push(stage);
        }

        if route.is_empty() {
            return Err(ConfigError::EmptyRoute);
        }

        Ok(Self { id, route })
    }

    /// The eight-step recovery route used by the operations console.
    pub fn recovery() -> Self {
        Self {
            id: "recovery".to_string(),
            route: [
                "sense", "assess", "plan", "simulate", "approve", "execute", "verify", "close",
            ]
            .into_iter()
            .map(|s| Stage(s.to_string()))
            .collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &[Stage] {
        &self.route
    }

    pub fn contains(&self, stage: &Stage) -> bool {
        self.route.contains(stage)
    }

    /// Position of `stage` within the route.
    pub fn index_of(&self, stage: &Stage) -> Option<usize> {
        self.route.iter().position(|s| s == stage)
    }

    /// Resolve a requested phase list against the route.
    ///
    /// An empty request selects the whole route. Otherwise every phase must
    /// be known and appear at most once; the result keeps the caller's order.
    pub fn resolve_phases(&self, phases: &[Stage]) -> Result<Vec<Stage>, ConfigError> {
        if phases.is_empty() {
            return Ok(self.route.clone());
        }

        let mut seen = HashSet::new();
        for phase in phases {
            if !self.contains(phase) {
                return Err(ConfigError::UnknownStage {
                    stage: phase.clone(),
                    template: self.id.clone(),
                });
            }
            if !seen.insert(phase) {
                return Err(ConfigError::DuplicateStage(phase.clone()));
            }
        }

        Ok(phases.to_vec())
    }
}
