use std::io::Cursor;
use std::time::Duration;

use chrono::{DateTime, Utc};
use html_escape::decode_html_entities;
use reqwest::Client;
use tracing::debug;

use crate::error::Result;

pub const USER_AGENT: &str = "gator";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssFeed {
    pub channel: RssChannel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssChannel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RssItem>,
}

/// One `<item>` with its fields kept as raw strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

impl RssFeed {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let channel = rss::Channel::read_from(Cursor::new(bytes))?;

        let items = channel
            .items()
            .iter()
            .map(|item| RssItem {
                title: item.title().unwrap_or_default().to_owned(),
                link: item.link().unwrap_or_default().to_owned(),
                description: item.description().unwrap_or_default().to_owned(),
                pub_date: item.pub_date().unwrap_or_default().to_owned(),
            })
            .collect();

        Ok(Self {
            channel: RssChannel {
                title: channel.title().to_owned(),
                link: channel.link().to_owned(),
                description: channel.description().to_owned(),
                items,
            },
        })
    }

    /// Decodes HTML entities in every text field of the channel and its items.
    pub fn unescape(mut self) -> Self {
        let channel = &mut self.channel;
        unescape_in_place(&mut channel.title);
        unescape_in_place(&mut channel.link);
        unescape_in_place(&mut channel.description);
        for item in &mut channel.items {
            unescape_in_place(&mut item.title);
            unescape_in_place(&mut item.link);
            unescape_in_place(&mut item.description);
            unescape_in_place(&mut item.pub_date);
        }
        self
    }
}

// Unknown entities and bare ampersands pass through; the rest is decoded.
fn unescape_in_place(field: &mut String) {
    if !field.contains('&') {
        return;
    }
    let decoded = decode_html_entities(field.as_str()).into_owned();
    *field = decoded;
}

/// Parses an RSS `pubDate` (RFC 1123 / RFC 2822).
pub fn parse_pub_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }

    /// Performs a single GET and returns the parsed, unescaped feed.
    pub async fn fetch_feed(&self, url: &str) -> Result<RssFeed> {
        debug!("Fetching feed: {}", url);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        let feed = RssFeed::parse(&bytes)?.unescape();
        debug!("Parsed {} items from {}", feed.channel.items.len(), url);
        Ok(feed)
    }
}
