//! Market-calendar freshness.
//!
//! Stored daily+ rows are fresh when their latest trade date is no older
//! than the last completed trading day in the market's own calendar.
//! Weekends roll back to Friday, so data does not go perpetually "stale"
//! on a Saturday. Crypto trades around the clock and uses plain UTC days.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Asia::Shanghai;

use crate::models::Market;

/// Local calendar date of `now` in the market's home timezone.
pub fn local_today(market: Market, now: DateTime<Utc>) -> NaiveDate {
    match market {
        Market::AShare | Market::Futures => now.with_timezone(&Shanghai).date_naive(),
        Market::UsStock => now.with_timezone(&New_York).date_naive(),
        Market::HkStock => now.with_timezone(&Shanghai).date_naive(),
        Market::Crypto => now.date_naive(),
    }
}

fn previous_weekday(mut date: NaiveDate) -> NaiveDate {
    loop {
        date -= ChronoDuration::days(1);
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return date;
        }
    }
}

/// The most recent trading day strictly before the market's local today.
pub fn last_completed_trading_day(market: Market, now: DateTime<Utc>) -> NaiveDate {
    let today = local_today(market, now);
    if market == Market::Crypto {
        return today - ChronoDuration::days(1);
    }
    previous_weekday(today)
}

/// Whether a stored slice ending at `latest` (a `YYYY-MM-DD` string) is
/// fresh for the market at `now`.
pub fn is_fresh(market: Market, latest: &str, now: DateTime<Utc>) -> bool {
    let Ok(latest) = NaiveDate::parse_from_str(latest, "%Y-%m-%d") else {
        return false;
    };
    latest >= last_completed_trading_day(market, now)
}
