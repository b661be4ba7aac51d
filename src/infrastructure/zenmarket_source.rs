//! ZenMarket search-page scraper.
//!
//! ZenMarket proxies Mercari, Rakuten and Yahoo Auctions behind one site, but
//! each platform renders its result cards differently. `ZenMarketSource` is
//! bound to one platform and carries that platform's `PageLayout`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::USER_AGENT;
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::application::{AppError, AppResult, SourceAdapter};
use crate::domain::{Listing, Platform, SortOrder};

pub const BASE_URL: &str = "https://zenmarket.jp/";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Category labels Mercari/Rakuten sometimes put in the title slot.
const GENERIC_TITLES: &[&str] = &[
    "Baby and Kids Toys, Educational toys",
    "Games / Toys / Goods, Character goods",
    "Toys, Hobbies & Games, Figures",
    "Comics, Anime",
    "Other",
    "Search results",
];

const NO_RESULTS_TEXT: &[&str] = &["find any items matching", "no results found"];

/// CSS selectors for one platform's result page.
struct PageLayout {
    item: Selector,
    title: Selector,
    /// Separate link element; `None` when the title element is the link.
    link: Option<Selector>,
    price: Selector,
    image: Selector,
    /// Candidate containers for the remaining-time text (auctions only).
    time: Option<Selector>,
    time_marker: Option<Selector>,
    no_results: Selector,
}

fn selector(css: &str) -> AppResult<Selector> {
    Selector::parse(css).map_err(|e| AppError::Internal(format!("bad selector {css:?}: {e}")))
}

impl PageLayout {
    fn for_platform(platform: Platform) -> AppResult<Self> {
        let no_results = selector(".products-not-found-text, .search-results-empty")?;
        Ok(match platform {
            Platform::Yahoo => Self {
                item: selector("div.yahoo-search-result")?,
                title: selector("div.translate a.auction-url")?,
                link: None,
                price: selector("div.auction-price span.amount")?,
                image: selector("div.img-wrap img")?,
                time: Some(selector("div.col-md-7 div")?),
                time_marker: Some(selector("span.glyphicon-time")?),
                no_results,
            },
            Platform::Mercari | Platform::Rakuten => Self {
                item: selector("div.product")?,
                title: selector("h3.item-title")?,
                link: Some(selector("a.product-link")?),
                price: selector("div.price span.amount")?,
                image: selector("div.img-wrap img")?,
                time: None,
                time_marker: None,
                no_results,
            },
        })
    }
}

/// Search page URL for `platform`, with the sort mapped to ZenMarket's parameters.
pub fn search_url(platform: Platform, query: &str, sort: SortOrder) -> AppResult<Url> {
    let path = format!("en/{}.aspx", platform.as_str());
    let mut url = Url::parse(BASE_URL)
        .and_then(|base| base.join(&path))
        .map_err(|e| AppError::Internal(format!("bad search url: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("q", query);
        for (k, v) in sort_params(platform, sort) {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn sort_params(platform: Platform, sort: SortOrder) -> &'static [(&'static str, &'static str)] {
    match (platform, sort) {
        (_, SortOrder::SourceDefault) => &[],
        (Platform::Mercari, SortOrder::Newest) => &[("sort", "LaunchDate")],
        (Platform::Yahoo, SortOrder::Newest) => &[("sort", "new"), ("order", "desc")],
        (Platform::Rakuten, SortOrder::Newest) => &[],
        (_, SortOrder::PriceAsc) => &[("sort", "price"), ("order", "asc")],
        (Platform::Yahoo, SortOrder::EndingSoonest) => &[("sort", "endtime"), ("order", "asc")],
        (_, SortOrder::EndingSoonest) => &[],
    }
}

/// `"¥1,234"` → `1234.0`. Keeps digits and dots; extra dots are treated as grouping.
pub fn clean_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let normalized = match cleaned.rfind('.') {
        Some(last) if cleaned.matches('.').count() > 1 => {
            let (int, frac) = cleaned.split_at(last);
            format!("{}{}", int.replace('.', ""), frac)
        }
        _ => cleaned,
    };
    if normalized.is_empty() || normalized == "." {
        return None;
    }
    normalized.parse().ok()
}

/// Remaining auction time as ZenMarket prints it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeRemaining {
    Ended,
    LessThanMinute,
    Minutes(i64),
}

impl TimeRemaining {
    /// `None` when the remaining time does not fit in a timestamp.
    pub fn ends_at(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delta = match self {
            TimeRemaining::Ended => chrono::Duration::seconds(-1),
            TimeRemaining::LessThanMinute => chrono::Duration::seconds(30),
            TimeRemaining::Minutes(m) => chrono::Duration::try_minutes(m)?,
        };
        now.checked_add_signed(delta)
    }
}

/// Parses `"3 days, 17 hours"`, `"45 minutes"`, `"8 min 30 sec"`, `"< 1 minute"`, `"Ended"`.
/// Seconds are ignored. `None` when no known unit is present or the total overflows.
pub fn parse_time_remaining(raw: &str) -> Option<TimeRemaining> {
    let text = raw.trim().to_lowercase();
    if text.contains('<') && text.contains("min") {
        return Some(TimeRemaining::LessThanMinute);
    }
    if text.contains("ended") || text.contains("finished") {
        return Some(TimeRemaining::Ended);
    }

    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let mut total = 0i64;
    let mut found = false;
    for pair in tokens.windows(2) {
        let Ok(n) = pair[0].parse::<i64>() else {
            continue;
        };
        let unit = pair[1];
        let factor = if unit.starts_with("day") {
            24 * 60
        } else if unit.starts_with("hour") {
            60
        } else if unit.starts_with("min") {
            1
        } else {
            continue;
        };
        total = n.checked_mul(factor).and_then(|m| total.checked_add(m))?;
        found = true;
    }
    found.then_some(TimeRemaining::Minutes(total))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn absolute(base: &Url, raw: &str) -> Option<String> {
    base.join(raw.trim()).ok().map(|mut u| {
        u.set_fragment(None);
        u.to_string()
    })
}

/// Parses a search result page into listings.
///
/// An empty page is only a valid empty result when it carries an explicit
/// "no results" marker; otherwise the layout is assumed to have changed.
pub fn parse_search_page(platform: Platform, html: &str, now: DateTime<Utc>) -> AppResult<Vec<Listing>> {
    let layout = PageLayout::for_platform(platform)?;
    let base = Url::parse(BASE_URL).map_err(|e| AppError::Internal(e.to_string()))?;
    let doc = Html::parse_document(html);

    let cards: Vec<ElementRef<'_>> = doc.select(&layout.item).collect();
    if cards.is_empty() {
        let marker = doc.select(&layout.no_results).next().is_some();
        let body = doc.root_element().text().collect::<String>().to_lowercase();
        if marker || NO_RESULTS_TEXT.iter().any(|t| body.contains(t)) {
            return Ok(vec![]);
        }
        return Err(AppError::Parse(format!(
            "{platform}: no result cards and no empty-result marker"
        )));
    }

    let mut listings = Vec::with_capacity(cards.len());
    for (index, card) in cards.into_iter().enumerate() {
        match parse_card(&layout, &base, card, now) {
            Some(listing) => listings.push(listing),
            None => debug!(platform = %platform, index, "skipping card with missing fields"),
        }
    }
    Ok(listings)
}

fn parse_card(
    layout: &PageLayout,
    base: &Url,
    card: ElementRef<'_>,
    now: DateTime<Utc>,
) -> Option<Listing> {
    let title_el = card.select(&layout.title).next()?;
    let mut title = text_of(title_el);
    if let Some(attr) = title_el.value().attr("title").map(str::trim) {
        let generic = GENERIC_TITLES.contains(&title.as_str()) && attr.len() > title.len();
        if generic || (title.is_empty() && !attr.is_empty()) {
            title = attr.to_string();
        }
    }
    if title.is_empty() {
        return None;
    }

    let link_el = match &layout.link {
        Some(sel) => card.select(sel).next()?,
        None => title_el,
    };
    let url = absolute(base, link_el.value().attr("href")?)?;

    let price_el = card.select(&layout.price).next()?;
    let price = price_el
        .value()
        .attr("data-jpy")
        .and_then(clean_price)
        .or_else(|| clean_price(&text_of(price_el)))?;

    let image_url = card.select(&layout.image).next().and_then(|img| {
        let raw = img
            .value()
            .attr("data-src")
            .or_else(|| img.value().attr("src"))?;
        if raw.starts_with("data:image") {
            return None;
        }
        absolute(base, raw)
    });

    let ends_at = match (&layout.time, &layout.time_marker) {
        (Some(time), Some(marker)) => card
            .select(time)
            .find(|div| div.select(marker).next().is_some())
            .and_then(|div| parse_time_remaining(&text_of(div)))
            .and_then(|t| t.ends_at(now)),
        _ => None,
    };

    Some(Listing {
        id: url.clone(),
        title,
        price,
        url,
        image_url,
        ends_at,
    })
}

/// Scrapes one ZenMarket platform.
pub struct ZenMarketSource {
    client: reqwest::Client,
    platform: Platform,
    user_agent: String,
}

impl ZenMarketSource {
    pub fn new(client: reqwest::Client, platform: Platform) -> Self {
        Self {
            client,
            platform,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Shared client with the request timeout used for search pages.
    pub fn default_client() -> AppResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(e.to_string()))
    }
}

#[async_trait]
impl SourceAdapter for ZenMarketSource {
    async fn fetch(&self, platform: Platform, query: &str, sort: SortOrder) -> AppResult<Vec<Listing>> {
        if platform != self.platform {
            return Err(AppError::Internal(format!(
                "{} source asked for {platform}",
                self.platform
            )));
        }
        let url = search_url(platform, query, sort)?;
        debug!(platform = %platform, url = %url, "fetching search page");

        let resp = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| AppError::Fetch(e.to_string()))?;

        match resp.status() {
            // unknown query paths come back as 404 rather than an empty page
            StatusCode::NOT_FOUND => {
                warn!(platform = %platform, url = %url, "search page not found");
                return Ok(vec![]);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(AppError::RateLimited(format!("{platform}: HTTP 429")));
            }
            _ => {}
        }

        let body = resp
            .error_for_status()
            .map_err(|e| AppError::Fetch(e.to_string()))?
            .text()
            .await
            .map_err(|e| AppError::Fetch(e.to_string()))?;

        let listings = parse_search_page(platform, &body, Utc::now())?;
        info!(platform = %platform, query, count = listings.len(), "search page parsed");
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAHOO_PAGE: &str = r#"
    <html><body>
      <div class="yahoo-search-result">
        <div class="img-wrap"><img data-src="//img.zenmarket.jp/a1.jpg" src="data:image/gif;base64,AAA"></div>
        <div class="translate"><a class="auction-url" href="/en/auction.aspx?itemCode=x100">Vintage Seiko watch</a></div>
        <div class="auction-price"><span class="amount" data-jpy="¥9,000">¥9,000</span></div>
        <div class="col-md-7">
          <div><span class="glyphicon glyphicon-user"></span> seller</div>
          <div><span class="glyphicon glyphicon-time"></span> 1 hour, 30 minutes</div>
        </div>
      </div>
      <div class="yahoo-search-result">
        <div class="translate"><a class="auction-url" href="/en/auction.aspx?itemCode=x200">Seiko 5</a></div>
        <div class="auction-price"><span class="amount">12,000 yen</span></div>
        <div class="col-md-7"><div><span class="glyphicon-time"></span> Ended</div></div>
      </div>
      <div class="yahoo-search-result">
        <div class="translate"><a class="auction-url" href="/en/auction.aspx?itemCode=x300">No price</a></div>
      </div>
    </body></html>"#;

    const MERCARI_PAGE: &str = r#"
    <div class="product">
      <a class="product-link" href="/en/mercari/m123#top">
        <div class="img-wrap"><img src="https://static.mercdn.net/m123.jpg"></div>
      </a>
      <h3 class="item-title" title="Pokemon card Pikachu promo">Other</h3>
      <div class="price"><span class="amount">¥3,500</span></div>
    </div>
    <div class="product">
      <a class="product-link" href="/en/mercari/m456"></a>
      <h3 class="item-title">Game Boy Color</h3>
      <div class="price"><span class="amount" data-jpy="8000"></span></div>
    </div>"#;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn builds_platform_urls_with_sort() {
        let u = search_url(Platform::Mercari, "game boy", SortOrder::Newest).unwrap();
        assert_eq!(
            u.as_str(),
            "https://zenmarket.jp/en/mercari.aspx?q=game+boy&sort=LaunchDate"
        );
        let u = search_url(Platform::Yahoo, "seiko", SortOrder::EndingSoonest).unwrap();
        assert_eq!(
            u.as_str(),
            "https://zenmarket.jp/en/yahoo.aspx?q=seiko&sort=endtime&order=asc"
        );
        let u = search_url(Platform::Rakuten, "x", SortOrder::SourceDefault).unwrap();
        assert_eq!(u.as_str(), "https://zenmarket.jp/en/rakuten.aspx?q=x");
    }

    #[test]
    fn clean_price_variants() {
        assert_eq!(clean_price("¥1,234"), Some(1234.0));
        assert_eq!(clean_price("12,000 yen"), Some(12000.0));
        assert_eq!(clean_price("1.234.56"), Some(1234.56));
        assert_eq!(clean_price("free"), None);
        assert_eq!(clean_price("."), None);
    }

    #[test]
    fn time_remaining_variants() {
        use TimeRemaining::*;
        assert_eq!(parse_time_remaining("3 days, 17 hours"), Some(Minutes(3 * 1440 + 17 * 60)));
        assert_eq!(parse_time_remaining("5 hours, 30 minutes"), Some(Minutes(330)));
        assert_eq!(parse_time_remaining("45 minutes"), Some(Minutes(45)));
        assert_eq!(parse_time_remaining("8 min 30 sec"), Some(Minutes(8)));
        assert_eq!(parse_time_remaining("< 1 minute"), Some(LessThanMinute));
        assert_eq!(parse_time_remaining("Ended"), Some(Ended));
        assert_eq!(parse_time_remaining("soon"), None);
    }

    #[test]
    fn absurd_remaining_time_is_an_unknown_end() {
        assert_eq!(parse_time_remaining("99999999999999999 days"), None);
        assert_eq!(parse_time_remaining("9223372036854775807 minutes, 1 minute"), None);
        assert_eq!(TimeRemaining::Minutes(i64::MAX).ends_at(now()), None);

        let page = r#"
        <div class="yahoo-search-result">
          <div class="translate"><a class="auction-url" href="/en/auction.aspx?itemCode=x900">Odd lot</a></div>
          <div class="auction-price"><span class="amount">¥500</span></div>
          <div class="col-md-7"><div><span class="glyphicon-time"></span> 99999999999 days</div></div>
        </div>"#;
        let listings = parse_search_page(Platform::Yahoo, page, now()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].ends_at, None);
    }

    #[test]
    fn parses_yahoo_cards() {
        let listings = parse_search_page(Platform::Yahoo, YAHOO_PAGE, now()).unwrap();
        assert_eq!(listings.len(), 2, "card without price is skipped");

        let first = &listings[0];
        assert_eq!(first.title, "Vintage Seiko watch");
        assert_eq!(first.price, 9000.0);
        assert_eq!(first.url, "https://zenmarket.jp/en/auction.aspx?itemCode=x100");
        assert_eq!(first.id, first.url);
        assert_eq!(first.image_url.as_deref(), Some("https://img.zenmarket.jp/a1.jpg"));
        assert_eq!(first.minutes_remaining(now()), Some(90));

        let second = &listings[1];
        assert_eq!(second.price, 12000.0);
        assert!(second.image_url.is_none());
        assert!(second.has_ended(now()));
    }

    #[test]
    fn parses_mercari_cards_with_title_fallback() {
        let listings = parse_search_page(Platform::Mercari, MERCARI_PAGE, now()).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].title, "Pokemon card Pikachu promo");
        assert_eq!(listings[0].url, "https://zenmarket.jp/en/mercari/m123");
        assert_eq!(listings[0].ends_at, None);
        assert_eq!(listings[1].price, 8000.0);
    }

    #[test]
    fn explicit_no_results_is_empty() {
        let page = r#"<div class="search-results-empty">Nothing</div>"#;
        assert!(parse_search_page(Platform::Rakuten, page, now()).unwrap().is_empty());

        let page = "<p>Sorry, we couldn't find any items matching your query.</p>";
        assert!(parse_search_page(Platform::Yahoo, page, now()).unwrap().is_empty());
    }

    #[test]
    fn unknown_layout_is_parse_error() {
        let page = "<html><body><div class='new-layout'>cards</div></body></html>";
        let err = parse_search_page(Platform::Mercari, page, now()).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }
}
