//! Fuzz target: therapy profile JSON
//!
//! Parses arbitrary bytes as a `Profile` and verifies:
//! - No panics on malformed JSON or out-of-range values
//! - Every accepted profile answers `slice_at` for any minute of the day
//!   with a slice that contains it
//!
//! cargo fuzz run fuzz_profile_json

#![no_main]

use aidloop::profile::Profile;
use chrono::{Duration, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(profile) = serde_json::from_slice::<Profile>(data) else {
        return;
    };
    let midnight = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    for minute in (0..1440).step_by(7) {
        let at = midnight + Duration::minutes(minute);
        let slice = profile.slice_at(at);
        let local = profile.minute_of_day(at);
        assert!(slice.start_min <= local && local < slice.end_min);
        assert!(slice.basal_rate >= 0.0 && slice.isf > 0.0 && slice.carb_ratio > 0.0);
    }
});
