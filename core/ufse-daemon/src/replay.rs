//! Offline replay: rebuilds sessions from a JSON Lines event file and runs the
//! pipeline over each, printing emitted incidents to stdout as JSON Lines.

use fs_err as fs;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use ufse_core::session::{dedupe_events, sort_events};
use ufse_core::{DetectionConfig, NoopObserver, Pipeline};
use ufse_protocol::{Event, Session};

const REPLAY_PROJECT_ID: &str = "replay";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sessions: usize,
    pub incidents: usize,
    pub shadowed: usize,
}

pub fn run(path: &Path, config: DetectionConfig) -> Result<ReplaySummary, String> {
    let file = fs::File::open(path).map_err(|err| format!("Failed to open events: {}", err))?;
    let sessions = load_sessions(BufReader::new(file))?;
    let pipeline = Pipeline::new(config, Arc::new(NoopObserver))
        .map_err(|err| format!("Failed to build pipeline: {}", err))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut summary = ReplaySummary::default();
    for session in &sessions {
        let report = pipeline.process(session);
        summary.sessions += 1;
        summary.incidents += report.emitted.len();
        summary.shadowed += report.shadowed.len();
        for incident in &report.emitted {
            let line = serde_json::to_string(incident)
                .map_err(|err| format!("Failed to serialize incident: {}", err))?;
            writeln!(out, "{}", line).map_err(|err| format!("Failed to write incident: {}", err))?;
        }
    }
    info!(
        sessions = summary.sessions,
        incidents = summary.incidents,
        shadowed = summary.shadowed,
        "Replay finished"
    );
    Ok(summary)
}

/// Groups events by session id in first-seen order. Each session's events are
/// ordered and deduplicated the same way live ingestion does it.
pub fn load_sessions(reader: impl BufRead) -> Result<Vec<Session>, String> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Event>> = HashMap::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| format!("Failed to read events: {}", err))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(line = number + 1, error = %err, "Skipping malformed event line");
                continue;
            }
        };
        if !grouped.contains_key(&event.session_id) {
            order.push(event.session_id.clone());
        }
        grouped.entry(event.session_id.clone()).or_default().push(event);
    }

    Ok(order
        .into_iter()
        .filter_map(|session_id| {
            let mut events = grouped.remove(&session_id)?;
            sort_events(&mut events);
            Some(Session::from_events(
                session_id,
                REPLAY_PROJECT_ID,
                dedupe_events(events),
            ))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn line(event_type: &str, timestamp: &str, session_id: &str) -> String {
        let event = Event::new(event_type, timestamp, session_id, "/checkout/pay");
        serde_json::to_string(&event).expect("serialize event")
    }

    #[test]
    fn groups_events_by_session_in_first_seen_order() {
        let input = [
            line("click", "2026-01-30T12:00:02Z", "b"),
            line("click", "2026-01-30T12:00:01Z", "a"),
            line("click", "2026-01-30T12:00:00Z", "b"),
        ]
        .join("\n");
        let sessions = load_sessions(Cursor::new(input)).expect("load");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "b");
        assert_eq!(sessions[0].events[0].timestamp, "2026-01-30T12:00:00Z");
        assert_eq!(sessions[1].project_id, REPLAY_PROJECT_ID);
    }

    #[test]
    fn skips_malformed_lines() {
        let input = format!("not json\n\n{}\n", line("click", "2026-01-30T12:00:00Z", "a"));
        let sessions = load_sessions(Cursor::new(input)).expect("load");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].events.len(), 1);
    }

    #[test]
    fn unparseable_timestamp_stays_after_its_predecessor() {
        let input = [
            line("click", "2026-01-30T12:00:05Z", "a"),
            line("error", "garbage", "a"),
            line("click", "2026-01-30T12:00:01Z", "a"),
        ]
        .join("\n");
        let sessions = load_sessions(Cursor::new(input)).expect("load");
        let types: Vec<&str> = sessions[0]
            .events
            .iter()
            .map(|event| event.event_type.as_str())
            .collect();
        assert_eq!(types, vec!["click", "click", "error"]);
    }

    #[test]
    fn duplicate_events_are_collapsed_like_live_ingestion() {
        let input = [
            line("click", "2026-01-30T12:00:00Z", "a"),
            line("click", "2026-01-30T12:00:00.000Z", "a"),
            line("click", "2026-01-30T12:00:00Z", "a"),
            line("click", "2026-01-30T12:00:01Z", "a"),
        ]
        .join("\n");
        let sessions = load_sessions(Cursor::new(input)).expect("load");
        assert_eq!(sessions[0].events.len(), 2);
    }

    #[test]
    fn run_reports_incidents_from_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("events.jsonl");
        let mut lines: Vec<String> = (0..4)
            .map(|i| {
                let event = Event::new(
                    "click",
                    format!("2026-01-30T12:00:00.{}00Z", i),
                    "s-1",
                    "/checkout/pay",
                )
                .with_target(ufse_protocol::Target::new("button").with_id("submit-btn"));
                serde_json::to_string(&event).expect("serialize event")
            })
            .collect();
        lines.push(line("error", "2026-01-30T12:00:01.500Z", "s-1"));
        fs::write(&path, lines.join("\n")).expect("write events");

        let summary = run(&path, DetectionConfig::default()).expect("replay");
        assert_eq!(
            summary,
            ReplaySummary {
                sessions: 1,
                incidents: 1,
                shadowed: 0,
            }
        );
    }
}
