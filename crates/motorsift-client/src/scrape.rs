//! Selector-driven parsing of rendered search-result pages.
//!
//! The selectors come from configuration, so the engine carries no
//! knowledge of any particular site's markup.

use chrono::Utc;
use motorsift_core::error::{AppError, UpstreamErrorKind};
use motorsift_core::models::{Listing, SearchRequest};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::parse_number;

/// How to search and read one browser-automated site. Lives in the `scrape`
/// table of a source definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSpec {
    /// Search page URL. `{make}`, `{model}`, `{query}`, `{year_min}`,
    /// `{year_max}`, `{price_max}` and `{page}` are substituted (URL-encoded,
    /// empty when unset).
    pub search_url: String,
    /// Page probed by health checks. Defaults to the search URL's origin.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Present when the site answered with an empty result page.
    #[serde(default)]
    pub no_results: Option<String>,
    /// Present when the site wants a human (captcha, block page).
    #[serde(default)]
    pub blocked: Option<String>,
    pub selectors: ListingSelectors,
}

/// CSS selectors, relative to one result item unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSelectors {
    /// Matches each result item in the document.
    pub item: String,
    pub title: String,
    /// Link to the detail page; its `href` doubles as the listing id when
    /// `id_attribute` is unset.
    pub link: String,
    #[serde(default)]
    pub id_attribute: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub mileage: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl ScrapeSpec {
    /// Fill the search URL template for one request.
    pub fn search_url_for(&self, request: &SearchRequest, page: u32) -> Result<Url, AppError> {
        let fill = |value: Option<String>| {
            value
                .map(|v| url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>())
                .unwrap_or_default()
        };
        let filled = self
            .search_url
            .replace("{make}", &fill(request.make.clone()))
            .replace("{model}", &fill(request.model.clone()))
            .replace("{query}", &fill(request.query.clone()))
            .replace("{year_min}", &fill(request.year_min.map(|v| v.to_string())))
            .replace("{year_max}", &fill(request.year_max.map(|v| v.to_string())))
            .replace("{price_max}", &fill(request.price_max.map(|v| v.to_string())))
            .replace("{page}", &page.to_string());
        Url::parse(&filled).map_err(|e| AppError::ConfigError(format!("invalid search_url '{filled}': {e}")))
    }

    pub fn health_url(&self) -> Result<Url, AppError> {
        match &self.health_url {
            Some(raw) => Url::parse(raw).map_err(|e| AppError::ConfigError(format!("invalid health_url: {e}"))),
            None => {
                let search = Url::parse(&self.search_url.replace(['{', '}'], ""))
                    .map_err(|e| AppError::ConfigError(format!("invalid search_url: {e}")))?;
                search
                    .join("/")
                    .map_err(|e| AppError::ConfigError(format!("invalid search_url: {e}")))
            }
        }
    }

    /// Compile every selector once so a bad one fails at startup.
    pub fn parser(&self, source_id: &str) -> Result<SelectorParser, AppError> {
        SelectorParser::new(source_id, self)
    }
}

struct Compiled {
    item: Selector,
    title: Selector,
    link: Selector,
    price: Option<Selector>,
    mileage: Option<Selector>,
    year: Option<Selector>,
    vin: Option<Selector>,
    location: Option<Selector>,
    image: Option<Selector>,
    no_results: Option<Selector>,
    blocked: Option<Selector>,
}

pub struct SelectorParser {
    source_id: String,
    id_attribute: Option<String>,
    compiled: Compiled,
}

impl SelectorParser {
    pub fn new(source_id: &str, spec: &ScrapeSpec) -> Result<Self, AppError> {
        let compile = |raw: &str| {
            Selector::parse(raw).map_err(|e| {
                AppError::ConfigError(format!("source '{source_id}': invalid selector '{raw}': {e}"))
            })
        };
        let optional = |raw: &Option<String>| raw.as_deref().map(compile).transpose();
        let s = &spec.selectors;

        Ok(Self {
            source_id: source_id.to_string(),
            id_attribute: s.id_attribute.clone(),
            compiled: Compiled {
                item: compile(&s.item)?,
                title: compile(&s.title)?,
                link: compile(&s.link)?,
                price: optional(&s.price)?,
                mileage: optional(&s.mileage)?,
                year: optional(&s.year)?,
                vin: optional(&s.vin)?,
                location: optional(&s.location)?,
                image: optional(&s.image)?,
                no_results: optional(&spec.no_results)?,
                blocked: optional(&spec.blocked)?,
            },
        })
    }

    /// Parse a rendered result page. `page_url` resolves relative links.
    pub fn parse(&self, html: &str, page_url: &Url) -> Result<Vec<Listing>, AppError> {
        let document = Html::parse_document(html);
        let c = &self.compiled;

        if let Some(blocked) = &c.blocked
            && document.select(blocked).next().is_some()
        {
            return Err(AppError::upstream(
                &self.source_id,
                UpstreamErrorKind::RateLimited,
                "site presented a block page",
            ));
        }
        if let Some(no_results) = &c.no_results
            && document.select(no_results).next().is_some()
        {
            return Ok(Vec::new());
        }

        let items: Vec<ElementRef> = document.select(&c.item).collect();
        if items.is_empty() && c.no_results.is_some() {
            // Neither results nor the empty-page marker: the layout moved.
            return Err(AppError::upstream(
                &self.source_id,
                UpstreamErrorKind::Parse,
                "no result items and no empty-result marker",
            ));
        }

        let now = Utc::now();
        let listings = items
            .into_iter()
            .filter_map(|item| self.parse_item(item, page_url))
            .map(|mut listing| {
                listing.listed_at.get_or_insert(now);
                listing
            })
            .collect();
        Ok(listings)
    }

    fn parse_item(&self, item: ElementRef, page_url: &Url) -> Option<Listing> {
        let c = &self.compiled;
        let title = first_text(item, &c.title)?;
        let link = item.select(&c.link).next();
        let href = link.and_then(|el| el.value().attr("href"));
        let detail_url = href.and_then(|h| page_url.join(h).ok()).map(String::from);

        let id = match &self.id_attribute {
            Some(attr) => item.value().attr(attr).map(str::to_string),
            None => detail_url.clone(),
        }?;

        let mut listing = Listing::new(&self.source_id, id, title);
        listing.detail_url = detail_url;
        listing.price = optional_text(item, &c.price).as_deref().and_then(parse_number).and_then(|v| u32::try_from(v).ok());
        listing.mileage = optional_text(item, &c.mileage).as_deref().and_then(parse_number).and_then(|v| u32::try_from(v).ok());
        listing.year = optional_text(item, &c.year)
            .as_deref()
            .and_then(parse_number)
            .and_then(|v| u16::try_from(v).ok())
            .or_else(|| year_from_title(&listing.title));
        listing.vin = optional_text(item, &c.vin);
        listing.location = optional_text(item, &c.location);
        listing.media_urls = c
            .image
            .as_ref()
            .map(|sel| {
                item.select(sel)
                    .filter_map(|img| img.value().attr("src"))
                    .filter_map(|src| page_url.join(src).ok())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Some(listing)
    }
}

fn first_text(element: ElementRef, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

fn optional_text(element: ElementRef, selector: &Option<Selector>) -> Option<String> {
    selector.as_ref().and_then(|s| first_text(element, s))
}

/// A leading four-digit model year, as in "2017 Toyota Camry".
fn year_from_title(title: &str) -> Option<u16> {
    let first = title.split_whitespace().next()?;
    let year: u16 = first.parse().ok()?;
    (1900..=2100).contains(&year).then_some(year)
}
