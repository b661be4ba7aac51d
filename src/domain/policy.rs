use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Listing, SortOrder, Watch};

/// Does `listing` satisfy the watch's price and time-remaining bounds?
pub fn matches(watch: &Watch, listing: &Listing, now: DateTime<Utc>) -> bool {
    if let Some(max) = watch.max_price {
        if listing.price > max {
            return false;
        }
    }
    match watch.max_minutes {
        None => true,
        Some(max_minutes) => match listing.minutes_remaining(now) {
            Some(m) if !listing.has_ended(now) => m <= i64::from(max_minutes),
            _ => false,
        },
    }
}

/// Stable ordering of candidates according to the watch's sort preference.
pub fn sort_listings(listings: &mut [Listing], sort: SortOrder) {
    match sort {
        SortOrder::SourceDefault | SortOrder::Newest => {}
        SortOrder::PriceAsc => {
            listings.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal))
        }
        SortOrder::EndingSoonest => listings.sort_by(|a, b| match (a.ends_at, b.ends_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }),
    }
}

/// Polling cadence for one watch.
#[derive(Clone, Debug)]
pub struct SchedulePolicy {
    pub base_interval: Duration,
    /// Floor for ending-soon urgency.
    pub min_interval: Duration,
    /// Cap for failure backoff.
    pub max_backoff: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(120),
            min_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
        }
    }
}

impl SchedulePolicy {
    /// Interval after `failures` consecutive failed fetches: base doubled per failure, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base_interval;
        }
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
            .max(self.base_interval)
    }

    /// Interval after a successful evaluation.
    ///
    /// Ending-soon watches wake up when the soonest tracked auction enters the
    /// watch's window, never sooner than `min_interval` and never later than base.
    pub fn after_success(
        &self,
        watch: &Watch,
        soonest_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let (Some(max_minutes), Some(end)) = (watch.max_minutes, soonest_end) else {
            return self.base_interval;
        };
        if end <= now {
            return self.base_interval;
        }
        let window_opens = end - chrono::Duration::minutes(i64::from(max_minutes));
        let lead = (window_opens - now).to_std().unwrap_or(Duration::ZERO);
        if lead.is_zero() {
            return self.base_interval;
        }
        lead.clamp(self.min_interval, self.base_interval)
    }
}

/// The earliest future end time among listings that pass the price bound but
/// are still outside the time window. Drives ending-soon urgency.
pub fn soonest_pending_end(
    watch: &Watch,
    listings: &[Listing],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let max_minutes = i64::from(watch.max_minutes?);
    listings
        .iter()
        .filter(|l| watch.max_price.map_or(true, |max| l.price <= max))
        .filter_map(|l| l.ends_at.filter(|t| *t > now).map(|t| (l, t)))
        .filter(|(l, _)| l.minutes_remaining(now).is_some_and(|m| m > max_minutes))
        .map(|(_, t)| t)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewWatch, Platform, UserId, WatchId};
    use chrono::Duration as ChronoDuration;

    fn listing(id: &str, price: f64, ends_in_minutes: Option<i64>, now: DateTime<Utc>) -> Listing {
        Listing {
            id: id.into(),
            title: id.into(),
            price,
            url: format!("https://zenmarket.jp/{id}"),
            image_url: None,
            ends_at: ends_in_minutes.map(|m| now + ChronoDuration::minutes(m) + ChronoDuration::seconds(5)),
        }
    }

    fn standard(max_price: Option<f64>) -> Watch {
        NewWatch::standard(UserId(1), Platform::Yahoo, "figma hatsune miku", max_price)
            .into_watch(WatchId(1), Utc::now())
    }

    fn ending(max_minutes: u32) -> Watch {
        NewWatch::ending_soon(UserId(1), Platform::Yahoo, "figma", Some(10000.0), max_minutes)
            .into_watch(WatchId(2), Utc::now())
    }

    #[test]
    fn price_bound_is_inclusive() {
        let now = Utc::now();
        let w = standard(Some(10000.0));
        assert!(matches(&w, &listing("a", 9000.0, None, now), now));
        assert!(matches(&w, &listing("b", 10000.0, None, now), now));
        assert!(!matches(&w, &listing("c", 12000.0, None, now), now));
    }

    #[test]
    fn no_price_bound_matches_everything() {
        let now = Utc::now();
        let w = standard(None);
        assert!(matches(&w, &listing("a", 1e9, None, now), now));
    }

    #[test]
    fn ending_soon_needs_end_time_inside_window() {
        let now = Utc::now();
        let w = ending(60);
        assert!(!matches(&w, &listing("far", 100.0, Some(90), now), now));
        assert!(matches(&w, &listing("near", 100.0, Some(45), now), now));
        assert!(!matches(&w, &listing("unknown", 100.0, None, now), now));
        assert!(!matches(&w, &listing("ended", 100.0, Some(-5), now), now));
    }

    #[test]
    fn price_sort_is_stable() {
        let now = Utc::now();
        let mut v = vec![
            listing("b", 500.0, None, now),
            listing("a", 100.0, None, now),
            listing("c", 500.0, None, now),
        ];
        sort_listings(&mut v, SortOrder::PriceAsc);
        let ids: Vec<_> = v.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn ending_sort_puts_unknown_end_last() {
        let now = Utc::now();
        let mut v = vec![
            listing("none", 1.0, None, now),
            listing("late", 1.0, Some(50), now),
            listing("soon", 1.0, Some(5), now),
        ];
        sort_listings(&mut v, SortOrder::EndingSoonest);
        let ids: Vec<_> = v.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["soon", "late", "none"]);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = SchedulePolicy {
            base_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
            max_backoff: Duration::from_secs(400),
        };
        assert_eq!(p.backoff(0), Duration::from_secs(60));
        assert_eq!(p.backoff(1), Duration::from_secs(120));
        assert_eq!(p.backoff(2), Duration::from_secs(240));
        assert_eq!(p.backoff(3), Duration::from_secs(400));
        assert_eq!(p.backoff(40), Duration::from_secs(400));
    }

    #[test]
    fn ending_soon_wakes_when_window_opens() {
        let p = SchedulePolicy {
            base_interval: Duration::from_secs(600),
            min_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
        };
        let now = Utc::now();
        let w = ending(60);

        // Ends in 65 minutes: window opens in 5 minutes.
        let end = now + ChronoDuration::minutes(65);
        assert_eq!(p.after_success(&w, Some(end), now), Duration::from_secs(300));

        // Window opens in 10 seconds: floor applies.
        let end = now + ChronoDuration::minutes(60) + ChronoDuration::seconds(10);
        assert_eq!(p.after_success(&w, Some(end), now), Duration::from_secs(30));

        // Far away: base applies.
        let end = now + ChronoDuration::hours(5);
        assert_eq!(p.after_success(&w, Some(end), now), Duration::from_secs(600));

        // Already elapsed: dropped, base applies.
        let end = now - ChronoDuration::minutes(1);
        assert_eq!(p.after_success(&w, Some(end), now), Duration::from_secs(600));
    }

    #[test]
    fn standard_watch_ignores_end_times() {
        let p = SchedulePolicy::default();
        let now = Utc::now();
        let end = now + ChronoDuration::minutes(3);
        assert_eq!(p.after_success(&standard(None), Some(end), now), p.base_interval);
    }

    #[test]
    fn soonest_pending_end_skips_in_window_and_overpriced() {
        let now = Utc::now();
        let w = ending(60);
        let v = vec![
            listing("in-window", 100.0, Some(30), now),
            listing("too-pricey", 20000.0, Some(70), now),
            listing("pending-late", 100.0, Some(200), now),
            listing("pending-soon", 100.0, Some(90), now),
        ];
        let got = soonest_pending_end(&w, &v, now).unwrap();
        assert_eq!(got, v[3].ends_at.unwrap());
        assert_eq!(soonest_pending_end(&standard(None), &v, now), None);
    }
}
