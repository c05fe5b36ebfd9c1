//! Phase state machine.
//!
//! A discussion moves through the phases declared in its [`PhaseGraph`].
//! Valid moves are listed in `transition_rules`; the sentinel [`END_PHASE`]
//! closes the discussion. The graph is stored with the discussion and never
//! changes after creation.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::db::DbHandle;
use super::models::Discussion;
use crate::errors::DiscussionError;

/// Terminal pseudo-phase. Moving to it completes the discussion.
pub const END_PHASE: &str = "end";

/// Allowed-speaker entry that admits every participant.
pub const ALL_SPEAKERS: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Display names or roles allowed to speak; `"all"` admits everyone.
    #[serde(default = "default_allowed_speakers")]
    pub allowed_speakers: Vec<String>,
    #[serde(default)]
    pub transition_trigger: Option<String>,
}

fn default_allowed_speakers() -> Vec<String> {
    vec![ALL_SPEAKERS.to_string()]
}

impl PhaseDefinition {
    /// Whether a participant with this display name and role may speak.
    pub fn admits(&self, display_name: &str, role: Option<&str>) -> bool {
        self.allowed_speakers.iter().any(|entry| {
            entry == ALL_SPEAKERS || entry == display_name || Some(entry.as_str()) == role
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseGraph {
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub transition_rules: BTreeMap<String, Vec<String>>,
}

impl Default for PhaseGraph {
    fn default() -> Self {
        let phase = |id: &str, name: &str, description: &str, trigger: &str| PhaseDefinition {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            allowed_speakers: default_allowed_speakers(),
            transition_trigger: Some(trigger.to_string()),
        };
        let mut transition_rules = BTreeMap::new();
        transition_rules.insert("initial".to_string(), vec!["discussion".to_string()]);
        transition_rules.insert("discussion".to_string(), vec!["conclusion".to_string()]);
        transition_rules.insert("conclusion".to_string(), vec![END_PHASE.to_string()]);
        Self {
            phases: vec![
                phase(
                    "initial",
                    "Problem Definition",
                    "Define and understand the problem",
                    "objective_stated",
                ),
                phase(
                    "discussion",
                    "Main Discussion",
                    "Discuss potential solutions",
                    "consensus_reached",
                ),
                phase(
                    "conclusion",
                    "Conclusion",
                    "Summarize and conclude",
                    "conclusion_provided",
                ),
            ],
            transition_rules,
        }
    }
}

impl PhaseGraph {
    /// The first declared phase, where every run starts.
    pub fn entry_phase(&self) -> Option<&str> {
        self.phases.first().map(|p| p.id.as_str())
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Phases reachable from `current`. An unset current phase reaches nothing.
    pub fn allowed_next(&self, current: Option<&str>) -> &[String] {
        current
            .and_then(|c| self.transition_rules.get(c))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn can_transition(&self, current: Option<&str>, target: &str) -> bool {
        self.allowed_next(current).iter().any(|t| t == target)
    }

    /// Structural checks run when a discussion is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.phases.is_empty() {
            return Err("phase graph must declare at least one phase".to_string());
        }
        let mut ids = HashSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err("phase id must not be empty".to_string());
            }
            if phase.id == END_PHASE {
                return Err(format!("'{}' is reserved and cannot be declared as a phase", END_PHASE));
            }
            if !ids.insert(phase.id.as_str()) {
                return Err(format!("phase '{}' is declared more than once", phase.id));
            }
        }
        for (from, targets) in &self.transition_rules {
            if !ids.contains(from.as_str()) {
                return Err(format!("transition rule for undeclared phase '{}'", from));
            }
            for target in targets {
                if target != END_PHASE && !ids.contains(target.as_str()) {
                    return Err(format!(
                        "transition from '{}' targets undeclared phase '{}'",
                        from, target
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Check a requested move against the graph without touching storage.
pub fn check_transition(
    graph: &PhaseGraph,
    current: Option<&str>,
    target: &str,
) -> Result<(), DiscussionError> {
    if graph.can_transition(current, target) {
        Ok(())
    } else {
        Err(DiscussionError::InvalidTransition {
            from: current.unwrap_or("none").to_string(),
            to: target.to_string(),
        })
    }
}

/// Result of an applied transition.
#[derive(Debug, Clone)]
pub struct PhaseChange {
    pub from: Option<String>,
    pub to: String,
    pub discussion: Discussion,
}

/// Validate and apply a phase transition.
///
/// The check and the update run under one database lock, so a concurrent
/// transition cannot slip in between. Moving to [`END_PHASE`] also marks the
/// discussion completed.
pub async fn transition(
    db: &DbHandle,
    id: Uuid,
    target: String,
) -> Result<PhaseChange, DiscussionError> {
    let change = db
        .call(move |db| {
            let discussion = db
                .get_discussion(id)?
                .ok_or(DiscussionError::NotFound { id })?;
            let from = discussion.current_phase.clone();
            check_transition(&discussion.phase_config, from.as_deref(), &target)?;
            db.set_phase(id, &target, target == END_PHASE)?;
            let discussion = db
                .get_discussion(id)?
                .ok_or(DiscussionError::NotFound { id })?;
            Ok(PhaseChange {
                from,
                to: target,
                discussion,
            })
        })
        .await?;
    info!(
        discussion_id = %id,
        from = change.from.as_deref().unwrap_or("none"),
        to = %change.to,
        "phase transition applied"
    );
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roundtable::db::RoundTableDb;
    use crate::roundtable::models::{DiscussionStatus, NewAgent, NewDiscussion, NewParticipant};

    fn new_discussion(db: &RoundTableDb) -> anyhow::Result<Discussion> {
        let agent = db.create_agent(&NewAgent {
            name: "Ada".into(),
            title: "Engineer".into(),
            background: "You build things.".into(),
            agent_type: Default::default(),
            llm_config: serde_json::json!({}),
            tool_config: serde_json::json!({}),
            is_active: true,
        })?;
        db.create_discussion(&NewDiscussion {
            title: "Roadmap".into(),
            context: "Plan the next quarter".into(),
            participants: vec![NewParticipant {
                agent_id: agent.id,
                role: None,
            }],
            settings: Default::default(),
            phase_config: None,
        })
    }

    #[test]
    fn test_default_graph_is_valid() {
        let graph = PhaseGraph::default();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.entry_phase(), Some("initial"));
        assert_eq!(graph.allowed_next(Some("conclusion")), &["end".to_string()]);
    }

    #[test]
    fn test_allowed_next_for_unset_or_unknown_phase_is_empty() {
        let graph = PhaseGraph::default();
        assert!(graph.allowed_next(None).is_empty());
        assert!(graph.allowed_next(Some("brainstorm")).is_empty());
        assert!(!graph.can_transition(None, "initial"));
    }

    #[test]
    fn test_validate_rejects_undeclared_targets_and_reserved_ids() {
        let mut graph = PhaseGraph::default();
        graph
            .transition_rules
            .insert("discussion".into(), vec!["vote".into()]);
        assert!(graph.validate().unwrap_err().contains("vote"));

        let mut graph = PhaseGraph::default();
        graph.phases[0].id = END_PHASE.into();
        assert!(graph.validate().is_err());

        let graph = PhaseGraph {
            phases: vec![],
            transition_rules: BTreeMap::new(),
        };
        assert!(graph.validate().is_err());

        let mut graph = PhaseGraph::default();
        graph.phases[1].id = "initial".into();
        assert!(graph.validate().unwrap_err().contains("more than once"));
    }

    #[test]
    fn test_admits_by_all_name_or_role() {
        let mut phase = PhaseGraph::default().phases[0].clone();
        assert!(phase.admits("Anyone", None));
        phase.allowed_speakers = vec!["moderator".into(), "Ada".into()];
        assert!(phase.admits("Ada", None));
        assert!(phase.admits("Grace", Some("moderator")));
        assert!(!phase.admits("Grace", Some("panelist")));
    }

    #[test]
    fn test_check_transition_error_names_phases() {
        let graph = PhaseGraph::default();
        let err = check_transition(&graph, Some("initial"), "conclusion").unwrap_err();
        match err {
            DiscussionError::InvalidTransition { from, to } => {
                assert_eq!(from, "initial");
                assert_eq!(to, "conclusion");
            }
            other => panic!("Expected InvalidTransition, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transition_walks_default_graph_to_end() -> anyhow::Result<()> {
        let raw = RoundTableDb::new_in_memory()?;
        let discussion = new_discussion(&raw)?;
        raw.start_discussion(discussion.id, "initial")?;
        let db = DbHandle::new(raw);

        let change = transition(&db, discussion.id, "discussion".into()).await?;
        assert_eq!(change.from.as_deref(), Some("initial"));
        assert_eq!(change.discussion.current_phase.as_deref(), Some("discussion"));
        assert_eq!(change.discussion.status, DiscussionStatus::InProgress);

        transition(&db, discussion.id, "conclusion".into()).await?;
        let change = transition(&db, discussion.id, "end".into()).await?;
        assert_eq!(change.discussion.status, DiscussionStatus::Completed);
        assert!(change.discussion.completed_at.is_some());
        assert_eq!(change.discussion.current_phase.as_deref(), Some("end"));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_discussion_untouched() -> anyhow::Result<()> {
        let raw = RoundTableDb::new_in_memory()?;
        let discussion = new_discussion(&raw)?;
        raw.start_discussion(discussion.id, "initial")?;
        let db = DbHandle::new(raw);

        let err = transition(&db, discussion.id, "end".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscussionError::InvalidTransition { .. }));

        let after = db
            .call(move |db| db.get_discussion(discussion.id))
            .await?
            .expect("discussion should exist");
        assert_eq!(after.current_phase.as_deref(), Some("initial"));
        assert_eq!(after.status, DiscussionStatus::InProgress);
        assert!(after.completed_at.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_from_unset_phase_is_rejected() -> anyhow::Result<()> {
        let raw = RoundTableDb::new_in_memory()?;
        let discussion = new_discussion(&raw)?;
        let db = DbHandle::new(raw);

        let err = transition(&db, discussion.id, "initial".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("from none to initial"));
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_unknown_discussion_is_not_found() {
        let db = DbHandle::new(RoundTableDb::new_in_memory().unwrap());
        let err = transition(&db, Uuid::new_v4(), "discussion".into())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
