use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Platform, UserId, Watch};

/// One marketplace item as returned by a source query. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Platform-scoped identity; the item page URL for ZenMarket.
    pub id: String,
    pub title: String,
    pub price: f64,
    pub url: String,
    pub image_url: Option<String>,
    /// Auction close time, if the listing is an auction.
    pub ends_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// Whole minutes until the auction closes. Negative once ended.
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.ends_at.map(|t| (t - now).num_minutes())
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|t| t <= now)
    }
}

/// What the dispatcher hands to the sink: who, which listing, for which watch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub destination: UserId,
    pub watch: Watch,
    pub listing: Listing,
    pub detected_at: DateTime<Utc>,
}

/// Rendered message for a sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub destination: UserId,
    pub text: String,
    pub image_url: Option<String>,
}

impl NotificationEvent {
    pub fn render(&self) -> Notification {
        Notification {
            destination: self.destination,
            text: format_event_text(self),
            image_url: usable_image(self.watch.platform, self.listing.image_url.as_deref()),
        }
    }
}

// Yahoo thumbnails from the proxy are frequently rejected as photos.
fn usable_image(platform: Platform, image: Option<&str>) -> Option<String> {
    match image {
        Some(url) if platform != Platform::Yahoo && url.starts_with("http") => Some(url.to_string()),
        _ => None,
    }
}

fn format_event_text(event: &NotificationEvent) -> String {
    let watch = &event.watch;
    let listing = &event.listing;
    let mut lines = vec![];

    lines.push("✨ New Item Found".to_string());
    lines.push(format!(
        "Query: {} ({})",
        watch.query,
        watch.platform.display_name()
    ));
    lines.push(format!("Item: {}", listing.title));
    match watch.max_price {
        Some(max) => lines.push(format!(
            "Price: {} (Watch max: {})",
            format_yen(listing.price),
            format_yen(max)
        )),
        None => lines.push(format!("Price: {}", format_yen(listing.price))),
    }

    if let Some(max_minutes) = watch.max_minutes {
        let ending = match listing.minutes_remaining(event.detected_at) {
            Some(m) if m >= 0 => format!("≈ {m} min"),
            Some(_) => "Ended".to_string(),
            None => "?".to_string(),
        };
        lines.push(format!("Ending in: {ending} (Watch: ≤ {max_minutes} min)"));
    }

    lines.push(String::new());
    lines.push(format!("Link: {}", listing.url));

    lines.join("\n")
}

/// `¥12,345` with the fraction dropped.
pub fn format_yen(amount: f64) -> String {
    let whole = amount.round() as i64;
    let digits = whole.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if whole < 0 {
        format!("-¥{grouped}")
    } else {
        format!("¥{grouped}")
    }
}
