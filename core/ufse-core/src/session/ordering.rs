use chrono::{DateTime, Utc};
use std::collections::HashSet;
use ufse_protocol::Event;

/// Sorts by parsed timestamp, keeping ingestion order for ties.
///
/// Events whose timestamp does not parse inherit the sort key of the nearest
/// preceding parsable event, so they stay next to their ingestion neighbours
/// instead of jumping to either end.
pub fn sort_events(events: &mut Vec<Event>) {
    let mut last_key: Option<DateTime<Utc>> = None;
    let mut keyed: Vec<(Option<DateTime<Utc>>, Event)> = events
        .drain(..)
        .map(|event| {
            let key = event.parsed_timestamp().or(last_key);
            last_key = key;
            (key, event)
        })
        .collect();
    // Vec::sort_by_key is stable.
    keyed.sort_by_key(|(key, _)| *key);
    events.extend(keyed.into_iter().map(|(_, event)| event));
}

/// Drops repeated fingerprints, first occurrence wins.
pub fn dedupe_events(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::with_capacity(events.len());
    events
        .into_iter()
        .filter(|event| seen.insert(event.fingerprint()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ufse_protocol::Target;

    fn event_at(event_type: &str, timestamp: &str, target: &str) -> Event {
        Event::new(event_type, timestamp, "session-1", "/home")
            .with_target(Target::new("button").with_id(target))
    }

    #[test]
    fn sort_orders_by_timestamp() {
        let mut events = vec![
            event_at("click", "2026-01-30T12:00:02Z", "b"),
            event_at("click", "2026-01-30T12:00:01Z", "a"),
        ];
        sort_events(&mut events);
        assert_eq!(events[0].target.identity(), "a");
        assert_eq!(events[1].target.identity(), "b");
    }

    #[test]
    fn sort_compares_instants_across_offsets() {
        let mut events = vec![
            event_at("click", "2026-01-30T13:00:00+02:00", "later"),
            event_at("click", "2026-01-30T10:30:00Z", "earlier"),
        ];
        sort_events(&mut events);
        assert_eq!(events[0].target.identity(), "earlier");
    }

    #[test]
    fn unparseable_timestamps_keep_their_position() {
        let mut events = vec![
            event_at("click", "2026-01-30T12:00:01Z", "a"),
            event_at("click", "garbage", "b"),
            event_at("click", "2026-01-30T12:00:02Z", "c"),
        ];
        sort_events(&mut events);
        let order: Vec<&str> = events.iter().map(|e| e.target.identity()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut first = event_at("click", "2026-01-30T12:00:01Z", "a");
        first.metadata.insert("marker".to_string(), 1.into());
        let duplicate = event_at("click", "2026-01-30T12:00:01Z", "a");
        let events = dedupe_events(vec![first.clone(), duplicate]);
        assert_eq!(events, vec![first]);
    }

    #[test]
    fn dedupe_matches_one_instant_written_two_ways() {
        let events = dedupe_events(vec![
            event_at("click", "2026-01-30T12:00:00Z", "a"),
            event_at("click", "2026-01-30T12:00:00.000Z", "a"),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, "2026-01-30T12:00:00Z");
    }

    #[test]
    fn dedupe_distinguishes_targets() {
        let events = dedupe_events(vec![
            event_at("click", "2026-01-30T12:00:01Z", "a"),
            event_at("click", "2026-01-30T12:00:01Z", "b"),
        ]);
        assert_eq!(events.len(), 2);
    }

    fn arb_events() -> impl Strategy<Value = Vec<Event>> {
        let event = (
            prop::sample::select(vec!["click", "scroll", "error"]),
            0u32..5,
            prop::sample::select(vec!["a", "b"]),
        )
            .prop_map(|(event_type, second, target)| {
                event_at(
                    event_type,
                    &format!("2026-01-30T12:00:0{}Z", second),
                    target,
                )
            });
        prop::collection::vec(event, 0..40)
    }

    proptest! {
        #[test]
        fn dedupe_is_idempotent(events in arb_events()) {
            let once = dedupe_events(events);
            let twice = dedupe_events(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn sort_is_stable_for_equal_timestamps(events in arb_events()) {
            let tagged: Vec<Event> = events
                .into_iter()
                .enumerate()
                .map(|(index, event)| event.with_metadata("seq", index as u64))
                .collect();
            let mut sorted = tagged.clone();
            sort_events(&mut sorted);

            for pair in sorted.windows(2) {
                let left = pair[0].parsed_timestamp();
                let right = pair[1].parsed_timestamp();
                prop_assert!(left <= right);
                if left == right {
                    prop_assert!(pair[0].metadata_f64("seq") < pair[1].metadata_f64("seq"));
                }
            }
        }
    }
}
