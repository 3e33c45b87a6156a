use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// Interpret a wall-clock time in the source's offset.
pub fn local_to_utc(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Source timestamps: RFC 3339, `+0900`-style offsets, or naive local time.
pub fn parse_timestamp(text: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .and_then(|naive| local_to_utc(naive, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn timestamps_with_and_without_offsets() {
        let expected = "2025-11-01T04:36:00+00:00";
        assert_eq!(parse_timestamp("2025-11-01T13:36:00+09:00", kst()).unwrap().to_rfc3339(), expected);
        assert_eq!(parse_timestamp("2025-11-01T13:36:00+0900", kst()).unwrap().to_rfc3339(), expected);
        assert_eq!(parse_timestamp("2025-11-01T04:36:00.000Z", kst()).unwrap().to_rfc3339(), expected);
        assert_eq!(parse_timestamp("2025-11-01T13:36:00", kst()).unwrap().to_rfc3339(), expected);
        assert_eq!(parse_timestamp("2025-11-01 13:36:00", kst()).unwrap().to_rfc3339(), expected);
        assert!(parse_timestamp("", kst()).is_none());
        assert!(parse_timestamp("yesterday", kst()).is_none());
    }
}
