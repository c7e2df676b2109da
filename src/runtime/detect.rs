use std::collections::{HashMap, HashSet};

use crate::Event;

fn scheduled_ids(history: &[Event]) -> HashSet<u64> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

/// An activity outcome whose correlation id was never scheduled.
pub fn detect_orphan_outcome(history: &[Event], incoming: &Event) -> Option<String> {
    let id = match incoming {
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => *id,
        _ => return None,
    };
    if scheduled_ids(history).contains(&id) {
        None
    } else {
        Some(format!("completion for activity id={id} has no matching schedule in history"))
    }
}

/// Same check over a whole stored history.
pub fn detect_orphan_outcomes(history: &[Event]) -> Option<String> {
    let scheduled = scheduled_ids(history);
    history.iter().find_map(|e| match e {
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } if !scheduled.contains(id) => Some(
            format!("completion for activity id={id} has no matching schedule in history"),
        ),
        _ => None,
    })
}

/// True when history already holds an outcome for the incoming event's id.
pub fn is_duplicate_outcome(history: &[Event], incoming: &Event) -> bool {
    let Some(id) = incoming.correlation_id() else {
        return false;
    };
    history
        .iter()
        .any(|e| e.is_activity_outcome() && e.correlation_id() == Some(id))
}

/// Scheduled ids the orchestration no longer reaches on replay.
pub fn detect_unclaimed_schedules(history: &[Event], claimed: &HashSet<u64>) -> Option<String> {
    let mut missing: Vec<(u64, &str)> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, name, .. } if !claimed.contains(id) => Some((*id, name.as_str())),
            _ => None,
        })
        .collect();
    if missing.is_empty() {
        return None;
    }
    missing.sort();
    let listed: Vec<String> = missing.iter().map(|(id, name)| format!("{name}#{id}")).collect();
    Some(format!(
        "history schedules {} that replay no longer schedules",
        listed.join(", ")
    ))
}

/// Activities scheduled in history that have no outcome yet, ordered by id.
pub fn pending_activities(history: &[Event]) -> Vec<(u64, String, String)> {
    let mut scheduled: HashMap<u64, (String, String)> = HashMap::new();
    for e in history {
        match e {
            Event::ActivityScheduled { id, name, input } => {
                scheduled.insert(*id, (name.clone(), input.clone()));
            }
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => {
                scheduled.remove(id);
            }
            _ => {}
        }
    }
    let mut out: Vec<(u64, String, String)> = scheduled
        .into_iter()
        .map(|(id, (name, input))| (id, name, input))
        .collect();
    out.sort_by_key(|(id, _, _)| *id);
    out
}
