use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, Utc};

use hypideas_types::models::DailyCount;

/// Bucket timestamps into one count per day for the `days` days ending with
/// `today`, oldest first. Days without activity are reported as zero.
pub fn daily_series(timestamps: &[DateTime<Utc>], days: u32, today: NaiveDate) -> Vec<DailyCount> {
    if days == 0 {
        return Vec::new();
    }
    let first = today
        .checked_sub_days(Days::new(u64::from(days - 1)))
        .unwrap_or(NaiveDate::MIN);

    let mut counts: BTreeMap<NaiveDate, u32> = BTreeMap::new();
    for ts in timestamps {
        let day = ts.date_naive();
        if day >= first && day <= today {
            *counts.entry(day).or_default() += 1;
        }
    }

    first
        .iter_days()
        .take_while(|d| *d <= today)
        .map(|date| DailyCount {
            date,
            value: counts.get(&date).copied().unwrap_or(0),
        })
        .collect()
}

/// Longest range the admin analytics accept.
pub const MAX_RANGE_DAYS: u32 = 365;

/// Parse an analytics range such as `7d` or `30d` into a day count between
/// 1 and [`MAX_RANGE_DAYS`].
pub fn parse_range(range: &str) -> Option<u32> {
    let days: u32 = range.strip_suffix('d')?.parse().ok()?;
    (1..=MAX_RANGE_DAYS).contains(&days).then_some(days)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesSummary {
    pub total: u64,
    pub peak: u32,
}

pub fn summarize(series: &[DailyCount]) -> SeriesSummary {
    SeriesSummary {
        total: series.iter().map(|d| u64::from(d.value)).sum(),
        peak: series.iter().map(|d| d.value).max().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn series_fills_empty_days() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let ts = vec![
            Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 8, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap(),
        ];
        let series = daily_series(&ts, 3, today);
        let values: Vec<u32> = series.iter().map(|d| d.value).collect();
        assert_eq!(values, vec![1, 0, 2]);
        assert_eq!(series[0].date, NaiveDate::from_ymd_opt(2024, 5, 8).unwrap());
        assert_eq!(summarize(&series), SeriesSummary { total: 3, peak: 2 });
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("7d"), Some(7));
        assert_eq!(parse_range("30d"), Some(30));
        assert_eq!(parse_range("0d"), None);
        assert_eq!(parse_range("week"), None);
        assert_eq!(parse_range("365d"), Some(MAX_RANGE_DAYS));
        assert_eq!(parse_range("366d"), None);
        assert_eq!(parse_range("5000000d"), None);
    }
}
