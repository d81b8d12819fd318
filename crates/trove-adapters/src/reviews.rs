//! Review listing pages. There is no API: cards are pulled out of the browse
//! page HTML, and a card that cannot be read is skipped rather than failing
//! the page.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use trove_core::{Medium, Provider, ReviewCard, ReviewQuery};
use trove_storage::HttpTransport;

use crate::{trim_base, AdapterError};

const PROVIDER: Provider = Provider::Metacritic;

const CARD: &str = ".c-finderProductCard_container";
const TITLE: &str = ".c-finderProductCard_title";
const SCORE: &str = ".c-finderProductCard_metascoreValue";
const DESCRIPTION: &str = ".c-finderProductCard_description";
const META: &str = ".c-finderProductCard_meta";

pub const DEFAULT_BASE_URL: &str = "https://www.metacritic.com";

#[derive(Debug, Clone)]
pub struct ReviewsClient {
    transport: HttpTransport,
    base_url: String,
}

impl ReviewsClient {
    pub fn new(transport: HttpTransport, base_url: &str) -> Self {
        Self {
            transport,
            base_url: trim_base(base_url),
        }
    }

    pub fn browse_url(&self, query: &ReviewQuery) -> String {
        format!(
            "{}/browse/{}/?releaseYearMin={}&releaseYearMax={}&page={}",
            self.base_url,
            query.medium.path(),
            query.min_year,
            query.max_year,
            query.page.unwrap_or(1)
        )
    }

    pub async fn fetch_page(&self, query: &ReviewQuery) -> Result<String, AdapterError> {
        let request = self
            .transport
            .client()
            .get(self.browse_url(query))
            .build()
            .map_err(|e| AdapterError::build(PROVIDER, e))?;
        let response = self
            .transport
            .execute(PROVIDER, request)
            .await
            .map_err(|e| AdapterError::from_fetch(PROVIDER, e))?;
        Ok(response.text())
    }

    pub async fn fetch_cards(&self, query: &ReviewQuery) -> Result<Vec<ReviewCard>, AdapterError> {
        let document = self.fetch_page(query).await?;
        let cards = extract_cards(&document, query.medium)?;
        debug!(medium = %query.medium, page = query.page.unwrap_or(1), num_items = cards.len(), "extracted review cards");
        Ok(cards)
    }
}

struct Selectors {
    card: Selector,
    title: Selector,
    score: Selector,
    description: Selector,
    meta: Selector,
}

impl Selectors {
    fn parse() -> Result<Self, AdapterError> {
        let parse = |s: &str| Selector::parse(s).map_err(|_| AdapterError::Selector(s.to_string()));
        Ok(Self {
            card: parse(CARD)?,
            title: parse(TITLE)?,
            score: parse(SCORE)?,
            description: parse(DESCRIPTION)?,
            meta: parse(META)?,
        })
    }
}

pub fn extract_cards(document: &str, medium: Medium) -> Result<Vec<ReviewCard>, AdapterError> {
    let selectors = Selectors::parse()?;
    let html = Html::parse_document(document);
    let mut cards = Vec::new();
    for (index, element) in html.select(&selectors.card).enumerate() {
        match extract_card(element, &selectors, medium) {
            Some(card) => cards.push(card),
            None => warn!(index, "skipping unreadable review card"),
        }
    }
    Ok(cards)
}

fn extract_card(card: ElementRef<'_>, selectors: &Selectors, medium: Medium) -> Option<ReviewCard> {
    let href = card.value().attr("href").and_then(|s| text_or_none(s.to_string()))?;
    let title = card
        .select(&selectors.title)
        .next()
        .and_then(|n| n.value().attr("data-title"))
        .and_then(|s| text_or_none(s.to_string()))?;
    let score = select_first_text(card, &selectors.score)?.parse::<i64>().ok()?;
    let description = select_first_text(card, &selectors.description).unwrap_or_default();
    let date_text = card
        .select(&selectors.meta)
        .next()
        .and_then(|meta| meta.children().filter_map(ElementRef::wrap).next())
        .and_then(|first| text_or_none(first.text().collect()))?;
    let release_date = parse_release_date(&date_text)?;

    Some(ReviewCard {
        title,
        href,
        score,
        description,
        release_date,
        medium,
    })
}

/// `Mon D, YYYY`, falling back to a bare year pinned to January 1st.
pub fn parse_release_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let date = NaiveDate::parse_from_str(text, "%b %d, %Y")
        .ok()
        .or_else(|| NaiveDate::from_ymd_opt(text.parse().ok()?, 1, 1))?;
    Utc.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).single()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}
