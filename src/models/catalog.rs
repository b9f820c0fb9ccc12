use super::image::ImageVersion;
use super::service::{Dependencies, Service};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the planner knows about one managed service: the version it is
/// currently pinned to plus every version ever observed for its image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub service: Service,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub image_info: ImageVersion,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

/// A complete `service -> version` assignment of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase(pub Vec<PhasePin>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePin {
    pub service: String,
    pub version: String,
}

impl Phase {
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Phase(
            map.iter()
                .map(|(service, version)| PhasePin {
                    service: service.clone(),
                    version: version.clone(),
                })
                .collect(),
        )
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|pin| (pin.service.clone(), pin.version.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Running,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Waiting,
    Running,
    Done,
    Aborted,
}

/// One single-service upgrade inside a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub service: String,
    pub from: Option<String>,
    pub to: String,
    pub state: StepState,
}

/// An ordered plan of single-service upgrades and its runtime state. At most
/// one schedule is `Running` at any time; starting a new one aborts the
/// previous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub state: ScheduleState,
    pub steps: Vec<Step>,
}

impl Schedule {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            state: ScheduleState::Running,
            steps,
        }
    }

    /// Abort is terminal: pending steps are aborted along with the schedule.
    pub fn abort(&mut self) {
        self.state = ScheduleState::Aborted;
        for step in &mut self.steps {
            if step.state == StepState::Waiting || step.state == StepState::Running {
                step.state = StepState::Aborted;
            }
        }
    }
}

/// Append-only audit row recording a fleet snapshot after a version change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub updated_service: String,
    pub from: Option<String>,
    pub to: String,
    pub snapshot: BTreeMap<String, String>,
    pub date: DateTime<Utc>,
}

/// One observed `(repository, image, tag)`, kept by the versions store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTag {
    pub repository: String,
    pub image: String,
    pub tag: String,
    pub date: DateTime<Utc>,
}

impl ObservedTag {
    pub fn key(&self) -> String {
        format!("{}/{}:{}", self.repository, self.image, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("producer".to_string(), "1.0.2".to_string());
        map.insert("consumer".to_string(), "1.0.1".to_string());
        let phase = Phase::from_map(&map);
        assert_eq!(phase.as_map(), map);
    }

    #[test]
    fn test_schedule_abort() {
        let mut schedule = Schedule::new(vec![
            Step {
                service: "a".to_string(),
                from: Some("1".to_string()),
                to: "2".to_string(),
                state: StepState::Done,
            },
            Step {
                service: "b".to_string(),
                from: Some("1".to_string()),
                to: "2".to_string(),
                state: StepState::Running,
            },
            Step {
                service: "c".to_string(),
                from: Some("1".to_string()),
                to: "2".to_string(),
                state: StepState::Waiting,
            },
        ]);

        schedule.abort();
        assert_eq!(schedule.state, ScheduleState::Aborted);
        assert_eq!(schedule.steps[0].state, StepState::Done);
        assert_eq!(schedule.steps[1].state, StepState::Aborted);
        assert_eq!(schedule.steps[2].state, StepState::Aborted);
    }
}
