use chrono::{DateTime, Datelike, Months, NaiveTime, Utc};

/// Midnight UTC on the first day of the month `months` after `now`.
pub fn start_of_month(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.checked_add_months(Months::new(months)))
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 15, 4, 5).unwrap();
        assert_eq!(start_of_month(now, 1), Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(start_of_month(now, 0), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rolls_over_the_year() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(start_of_month(now, 1), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(start_of_month(now, 2), Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
    }
}
