use chrono::{DateTime, NaiveDateTime, Utc};

/// Current wall-clock time as unix seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn secs_to_datetime(secs: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}
