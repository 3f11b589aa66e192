use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{Database, NewPost};
use crate::error::{Error, Result};
use crate::fetcher::{parse_pub_date, Fetcher, RssItem};

/// Outcome of a single successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeReport {
    pub feed_id: i64,
    pub url: String,
    pub inserted: usize,
    pub skipped: usize,
}

/// Parses a duration such as `30s`, `1m`, `1h30m`, `1.5h` or `250ms`.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. Every number
/// needs a unit, and the total must be positive.
pub fn parse_interval(text: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(text.to_string());

    let mut rest = text.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };

        total_nanos += value * nanos_per_unit;
        rest = tail;
    }

    if !total_nanos.is_finite() || total_nanos < 1.0 || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn cutoff_for(interval: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Runs one pass: claims the most overdue feed, fetches it and stores its posts.
///
/// The feed is marked fetched even when storing a post fails; that insert
/// error is still returned. Posts stored before the failure stay committed.
pub async fn scrape_feeds(
    db: &Database,
    fetcher: &Fetcher,
    interval: Duration,
) -> Result<ScrapeReport> {
    let cutoff = cutoff_for(interval);
    let feed_id = db
        .get_next_feed_to_fetch(cutoff)
        .await?
        .ok_or_else(|| Error::NotFound("feed due for fetching".to_string()))?;
    let url = db
        .get_feed_url(feed_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("feed {}", feed_id)))?;

    let feed = fetcher.fetch_feed(&url).await?;
    info!("Scraping {} ({} items)", url, feed.channel.items.len());

    let stored = store_posts(db, feed_id, &feed.channel.items).await;
    db.mark_feed_fetched(feed_id).await?;
    let (inserted, skipped) = stored?;

    Ok(ScrapeReport {
        feed_id,
        url,
        inserted,
        skipped,
    })
}

async fn store_posts(db: &Database, feed_id: i64, items: &[RssItem]) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut skipped = 0;

    for item in items {
        if item.link.is_empty() {
            warn!("Skipping item with no link: {:?}", item.title);
            skipped += 1;
            continue;
        }

        let published_at = parse_pub_date(&item.pub_date);
        if published_at.is_none() && !item.pub_date.is_empty() {
            debug!("Unparseable pubDate {:?} for {}", item.pub_date, item.link);
        }

        let post = NewPost {
            feed_id,
            title: non_empty(&item.title),
            url: &item.link,
            description: non_empty(&item.description),
            published_at,
        };

        if db.create_post(&post).await? {
            debug!("Post {:?} added", item.title);
            inserted += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

/// Runs a pass and logs its outcome. Errors never escape.
pub async fn run_pass(db: &Database, fetcher: &Fetcher, interval: Duration) -> Option<ScrapeReport> {
    match scrape_feeds(db, fetcher, interval).await {
        Ok(report) => {
            info!(
                "Scraped {}: {} new posts, {} skipped",
                report.url, report.inserted, report.skipped
            );
            Some(report)
        }
        Err(e) => {
            error!("Error during scraping: {}", e);
            None
        }
    }
}

/// Scrapes one feed immediately and then once per `interval`, forever.
pub async fn run(db: &Database, fetcher: &Fetcher, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::InvalidDuration(format!("{:?}", interval)));
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // The first tick completes immediately.
        ticker.tick().await;
        run_pass(db, fetcher, interval).await;
    }
}
