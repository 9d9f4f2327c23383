//! Property tests: any key produced by the grammar round-trips through both
//! the canonical and the raw rendering without loss.

use maestro_configuration::{Query, RunType};
use proptest::prelude::*;

fn arb_run_type() -> impl Strategy<Value = RunType> {
    prop_oneof![
        Just(RunType::None),
        Just(RunType::Physics),
        Just(RunType::Cosmics),
        Just(RunType::Technical),
        Just(RunType::Synthetic),
        Just(RunType::Calibration),
    ]
}

fn arb_segment() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,16}"
}

fn arb_timestamp() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "[0-9]{1,10}"]
}

proptest! {
    /// parse(K).path() parses again to the same tuple.
    #[test]
    fn canonical_rendering_round_trips(
        component in arb_segment(),
        flavor in arb_run_type(),
        rolename in arb_segment(),
        entry_key in arb_segment(),
        timestamp in arb_timestamp(),
    ) {
        let key = if timestamp.is_empty() {
            format!("{component}/{flavor}/{rolename}/{entry_key}")
        } else {
            format!("{component}/{flavor}/{rolename}/{entry_key}@{timestamp}")
        };

        let parsed = Query::new(&key).unwrap();
        prop_assert_eq!(&parsed.component, &component);
        prop_assert_eq!(parsed.flavor, flavor);
        prop_assert_eq!(&parsed.rolename, &rolename);
        prop_assert_eq!(&parsed.entry_key, &entry_key);
        prop_assert_eq!(&parsed.timestamp, &timestamp);

        // Rendering canonically yields the input back, and reparses stably.
        prop_assert_eq!(parsed.path(), key.clone());
        let reparsed = Query::new(&parsed.path()).unwrap();
        prop_assert_eq!(reparsed, parsed);
    }

    /// Round-tripping through the raw rendering is stable too.
    #[test]
    fn raw_rendering_round_trips(
        component in arb_segment(),
        flavor in arb_run_type(),
        rolename in arb_segment(),
        entry_key in arb_segment(),
        timestamp in "[0-9]{1,10}",
    ) {
        let raw = format!("{component}/{flavor}/{rolename}/{entry_key}/{timestamp}");
        let parsed = Query::new(&raw).unwrap();
        prop_assert_eq!(&parsed.timestamp, &timestamp);
        prop_assert_eq!(parsed.raw(), raw);

        // Raw and canonical renderings describe the same tuple.
        let via_canonical = Query::new(&parsed.path()).unwrap();
        prop_assert_eq!(via_canonical, parsed);
    }

    /// Keys with a lowercase run type never parse.
    #[test]
    fn lowercase_run_type_rejected(
        component in arb_segment(),
        rolename in arb_segment(),
        entry_key in arb_segment(),
    ) {
        let key = format!("{component}/physics/{rolename}/{entry_key}");
        prop_assert!(Query::new(&key).is_err());
    }
}
