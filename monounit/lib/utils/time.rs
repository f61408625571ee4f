use chrono::{DateTime, Utc};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the age of `then` relative to `now` the way image listings show it.
pub fn human_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let days = (now - then).num_days();
    match days {
        d if d <= 0 => "just now".to_string(),
        1 => "1 day ago".to_string(),
        d => format!("{d} days ago"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_human_age() {
        let now = Utc::now();
        assert_eq!(human_age(now - Duration::hours(3), now), "just now");
        assert_eq!(human_age(now - Duration::hours(30), now), "1 day ago");
        assert_eq!(human_age(now - Duration::days(12), now), "12 days ago");
        assert_eq!(human_age(now + Duration::days(1), now), "just now");
    }
}
