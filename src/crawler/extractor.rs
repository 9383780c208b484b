//! Listing extraction from category pages
//!
//! The [`Extractor`] trait turns a page body into ordered records plus the
//! pagination signals the cursor needs. [`ListingExtractor`] implements it for
//! marketplace search pages made of listing cards.

use crate::config::TargetConfig;
use crate::storage::Record;
use crate::url::{
    listing_id_from_url, page_number_in_url, parse_base_url, resolve_href, shop_name_from_url,
    strip_query,
};
use crate::UrlError;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Card containers, most specific first; the first one that matches wins
const CARD_SELECTORS: &[&str] = &[
    "div.v2-listing-card",
    "div.wt-grid__item-xs-6",
    "div[data-listing-id]",
    "article.listing-card",
];

const NEXT_LINK_SELECTORS: &[&str] = &["a[aria-label*='Next']", "a.wt-pagination__item--next"];

const DIGITAL_MARKERS: &[&str] = &[
    "digital download",
    "instant download",
    "digital file",
    "pdf download",
];

/// Extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Found {cards} listing cards but none carried a listing id")]
    NoListingIds { cards: usize },

    #[error("Invalid selector: {0}")]
    Selector(String),

    #[error("Invalid base URL: {0}")]
    Url(#[from] UrlError),
}

/// What one page yielded
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    /// Records in page order, unique by id
    pub records: Vec<Record>,

    /// True when the page shows no way to reach a following page
    pub end_of_results: bool,

    /// Highest page number advertised by the pagination links
    pub total_pages: Option<u32>,
}

/// Turns a page body into records
///
/// Implementations never touch the network.
pub trait Extractor: Send + Sync {
    fn extract(&self, body: &str, page_number: u32) -> Result<ExtractedPage, ExtractionError>;
}

fn compile(raw: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(raw).map_err(|e| ExtractionError::Selector(format!("{}: {}", raw, e)))
}

fn compile_all(raws: &[&str]) -> Result<Vec<Selector>, ExtractionError> {
    raws.iter().map(|raw| compile(raw)).collect()
}

/// Every selector the extractor uses, compiled once
#[derive(Debug, Clone)]
struct Selectors {
    cards: Vec<Selector>,
    next_links: Vec<Selector>,
    listing_link: Selector,
    title_link: Selector,
    heading: Selector,
    subheading: Selector,
    shop_link: Selector,
    bestseller: Selector,
    star_seller: Selector,
    free_shipping: Selector,
    price_container: Selector,
    price_value: Selector,
    seller_name: Selector,
    promoted: Selector,
    rating_input: Selector,
    rating_label: Selector,
    review_count: Selector,
    any_link: Selector,
}

impl Selectors {
    fn compile() -> Result<Self, ExtractionError> {
        Ok(Self {
            cards: compile_all(CARD_SELECTORS)?,
            next_links: compile_all(NEXT_LINK_SELECTORS)?,
            listing_link: compile("a[href*='/listing/']")?,
            title_link: compile("a.listing-link, a.listing-card-title")?,
            heading: compile("h3")?,
            subheading: compile("h2")?,
            shop_link: compile("a[href*='/shop/']")?,
            bestseller: compile("[class*='bestseller']")?,
            star_seller: compile(".wt-icon--star-seller")?,
            free_shipping: compile("[class*='free-shipping']")?,
            price_container: compile("div.n-listing-card__price, div.lc-price")?,
            price_value: compile("span.currency-value")?,
            seller_name: compile("p[data-seller-name-container]")?,
            promoted: compile(".promoted-listing, .ad-listing, [class*='promoted']")?,
            rating_input: compile("input[name*='rating']")?,
            rating_label: compile("[aria-label*='out of 5 stars']")?,
            review_count: compile("span.wt-text-gray")?,
            any_link: compile("a[href]")?,
        })
    }
}

/// HTML extractor for listing-card search pages
#[derive(Debug, Clone)]
pub struct ListingExtractor {
    base_url: Url,
    page_param: String,
    selectors: Selectors,
}

impl ListingExtractor {
    pub fn new(base_url: Url, page_param: impl Into<String>) -> Result<Self, ExtractionError> {
        Ok(Self {
            base_url,
            page_param: page_param.into(),
            selectors: Selectors::compile()?,
        })
    }

    pub fn from_config(target: &TargetConfig) -> Result<Self, ExtractionError> {
        Self::new(
            parse_base_url(&target.base_url)?,
            target.page_param.clone(),
        )
    }

    fn find_cards<'a>(&self, document: &'a Html) -> Vec<ElementRef<'a>> {
        for selector in &self.selectors.cards {
            let cards: Vec<_> = document.select(selector).collect();
            if !cards.is_empty() {
                return cards;
            }
        }

        // Fall back to bare listing links when the card markup is unfamiliar
        document.select(&self.selectors.listing_link).collect()
    }

    fn extract_card(&self, card: ElementRef<'_>, page_number: u32, position: u32) -> Option<Record> {
        let s = &self.selectors;
        let link = first_match(card, &s.listing_link)
            .or_else(|| first_match(card, &s.title_link))
            .or_else(|| {
                (card.value().name() == "a" && card.value().attr("href").is_some()).then_some(card)
            });

        let url = link
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_href(href, &self.base_url));

        let unique_id = card
            .value()
            .attr("data-listing-id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| url.as_ref().and_then(|u| listing_id_from_url(u.as_str())))?;

        let mut record = Record::new(unique_id, page_number, position);
        record.extraction_timestamp = Utc::now();

        if let Some(url) = &url {
            record.url = strip_query(url);
        }
        if let Some(link) = link {
            record.title = first_match(link, &s.heading)
                .or_else(|| first_match(link, &s.subheading))
                .map(element_text)
                .or_else(|| link.value().attr("title").map(|t| t.trim().to_string()))
                .unwrap_or_else(|| element_text(link));
        }

        if let Some(shop_link) = first_match(card, &s.shop_link) {
            if let Some(shop_url) = shop_link
                .value()
                .attr("href")
                .and_then(|href| resolve_href(href, &self.base_url))
            {
                record.shop_url = strip_query(&shop_url);
                record.shop_name = shop_name_from_url(shop_url.as_str())
                    .unwrap_or_else(|| element_text(shop_link));
            }
        }

        let text = element_text(card).to_lowercase();

        let (sale, original) = self.extract_prices(card);
        record.is_on_sale = original.is_some() && sale.is_some();
        record.sale_price = sale.clone().unwrap_or_default();
        record.original_price = original.or(sale).unwrap_or_default();

        record.is_advertisement = self.is_advertisement(card);
        record.is_digital_download = DIGITAL_MARKERS.iter().any(|m| text.contains(m));
        record.is_bestseller =
            first_match(card, &s.bestseller).is_some() || text.contains("bestseller");
        record.is_star_seller =
            first_match(card, &s.star_seller).is_some() || text.contains("star seller");
        record.free_shipping =
            first_match(card, &s.free_shipping).is_some() || text.contains("free shipping");

        record.rating = self.extract_rating(card);
        record.review_count = self.extract_review_count(card);

        Some(record)
    }

    /// Returns `(sale_price, original_price)`; the original is only set when struck through
    fn extract_prices(&self, card: ElementRef<'_>) -> (Option<String>, Option<String>) {
        let Some(container) = first_match(card, &self.selectors.price_container) else {
            return (None, None);
        };

        let mut sale = None;
        let mut original = None;
        for value in container.select(&self.selectors.price_value) {
            let price = clean_price(&element_text(value));
            if price.is_empty() {
                continue;
            }
            if inside_strikethrough(value) {
                original.get_or_insert(price);
            } else {
                sale.get_or_insert(price);
            }
        }
        (sale, original)
    }

    fn is_advertisement(&self, card: ElementRef<'_>) -> bool {
        if let Some(seller) = first_match(card, &self.selectors.seller_name) {
            let text = element_text(seller).to_lowercase();
            if text.contains("advertisement") || text.contains("ad by") {
                return true;
            }
        }
        first_match(card, &self.selectors.promoted).is_some()
    }

    fn extract_rating(&self, card: ElementRef<'_>) -> Option<f64> {
        if let Some(value) =
            first_match(card, &self.selectors.rating_input).and_then(|i| i.value().attr("value"))
        {
            if let Ok(rating) = value.trim().parse() {
                return Some(rating);
            }
        }

        let label = first_match(card, &self.selectors.rating_label)?
            .value()
            .attr("aria-label")?;
        let number: String = label
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        number.parse().ok()
    }

    /// Reads counts shaped like `(7,301)`
    fn extract_review_count(&self, card: ElementRef<'_>) -> Option<u32> {
        card.select(&self.selectors.review_count).find_map(|span| {
            let text = element_text(span);
            let (_, rest) = text.split_once('(')?;
            let (inner, _) = rest.split_once(')')?;
            let digits: String = inner.chars().filter(|c| *c != ',').collect();
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
    }

    fn has_next_page(&self, document: &Html) -> bool {
        self.selectors
            .next_links
            .iter()
            .any(|selector| document.select(selector).any(is_enabled_link))
    }

    fn highest_page_link(&self, document: &Html) -> Option<u32> {
        let marker = format!("{}=", self.page_param);
        document
            .select(&self.selectors.any_link)
            .filter_map(|a| a.value().attr("href"))
            .filter(|href| href.contains(&marker))
            .filter_map(|href| resolve_href(href, &self.base_url))
            .filter_map(|url| page_number_in_url(&url, &self.page_param))
            .max()
    }
}

impl Extractor for ListingExtractor {
    fn extract(&self, body: &str, page_number: u32) -> Result<ExtractedPage, ExtractionError> {
        let document = Html::parse_document(body);
        let cards = self.find_cards(&document);

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for card in &cards {
            let position = records.len() as u32 + 1;
            if let Some(record) = self.extract_card(*card, page_number, position) {
                if seen.insert(record.unique_id.clone()) {
                    records.push(record);
                }
            }
        }

        if !cards.is_empty() && records.is_empty() {
            return Err(ExtractionError::NoListingIds { cards: cards.len() });
        }

        Ok(ExtractedPage {
            records,
            end_of_results: !self.has_next_page(&document),
            total_pages: self.highest_page_link(&document),
        })
    }
}

fn first_match<'a>(element: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    element.select(selector).next()
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_enabled_link(link: ElementRef<'_>) -> bool {
    let value = link.value();
    if value.attr("aria-disabled") == Some("true") || value.attr("disabled").is_some() {
        return false;
    }
    if value.classes().any(|c| c.contains("disabled")) {
        return false;
    }
    value.attr("href").is_some_and(|href| !href.trim().is_empty())
}

/// Keeps digits, commas and dots
fn clean_price(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect()
}

fn inside_strikethrough(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().classes().any(|c| c == "wt-text-strikethrough"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ListingExtractor {
        ListingExtractor::new(
            Url::parse("https://shop.example.com/c/templates").unwrap(),
            "page",
        )
        .unwrap()
    }

    const PAGE: &str = r#"
        <html><body>
        <div data-search-results>
          <div class="v2-listing-card" data-listing-id="111">
            <a class="listing-link" href="/listing/111/budget-planner?ref=search">
              <h3> Budget Planner </h3>
            </a>
            <a href="/shop/AcmePrints?ref=card">AcmePrints</a>
            <div class="n-listing-card__price">
              <span class="currency-value">4.50</span>
              <span class="wt-text-strikethrough">$<span class="currency-value">9.00</span></span>
            </div>
            <input type="hidden" name="initial-rating" value="4.8">
            <span class="wt-text-gray">(7,301)</span>
            <span>Digital Download</span>
            <span class="wt-icon--star-seller"></span>
          </div>
          <div class="v2-listing-card">
            <a href="https://shop.example.com/listing/222/wedding-invite">
              <h2>Wedding Invite</h2>
            </a>
            <p data-seller-name-container>Ad by Etsy seller</p>
            <div class="lc-price"><span class="currency-value">12.00</span></div>
            <span aria-label="4.5 out of 5 stars"></span>
            <span>FREE shipping</span>
          </div>
          <div class="v2-listing-card" data-listing-id="111">
            <a href="/listing/111/budget-planner">dup</a>
          </div>
        </div>
        <nav>
          <a href="/c/templates?page=2">2</a>
          <a href="/c/templates?page=250">250</a>
          <a aria-label="Next page" href="/c/templates?page=2">Next</a>
        </nav>
        </body></html>
    "#;

    #[test]
    fn test_extracts_cards_in_order() {
        let page = extractor().extract(PAGE, 1).unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].unique_id, "111");
        assert_eq!(page.records[0].position_on_page, 1);
        assert_eq!(page.records[1].unique_id, "222");
        assert_eq!(page.records[1].position_on_page, 2);
        assert!(page.records.iter().all(|r| r.page_number == 1));
    }

    #[test]
    fn test_card_fields() {
        let page = extractor().extract(PAGE, 1).unwrap();
        let first = &page.records[0];

        assert_eq!(first.url, "https://shop.example.com/listing/111/budget-planner");
        assert_eq!(first.title, "Budget Planner");
        assert_eq!(first.shop_name, "AcmePrints");
        assert_eq!(first.shop_url, "https://shop.example.com/shop/AcmePrints");
        assert_eq!(first.sale_price, "4.50");
        assert_eq!(first.original_price, "9.00");
        assert!(first.is_on_sale);
        assert!(first.is_digital_download);
        assert!(first.is_star_seller);
        assert!(!first.is_advertisement);
        assert_eq!(first.rating, Some(4.8));
        assert_eq!(first.review_count, Some(7301));
    }

    #[test]
    fn test_second_card_flags() {
        let page = extractor().extract(PAGE, 1).unwrap();
        let second = &page.records[1];

        assert_eq!(second.title, "Wedding Invite");
        assert!(second.is_advertisement);
        assert!(second.free_shipping);
        assert!(!second.is_on_sale);
        assert_eq!(second.sale_price, "12.00");
        assert_eq!(second.original_price, "12.00");
        assert_eq!(second.rating, Some(4.5));
        assert_eq!(second.review_count, None);
    }

    #[test]
    fn test_pagination_signals() {
        let page = extractor().extract(PAGE, 1).unwrap();
        assert!(!page.end_of_results);
        assert_eq!(page.total_pages, Some(250));
    }

    #[test]
    fn test_disabled_next_is_end() {
        let html = r##"
            <div data-listing-id="5"><a href="/listing/5/x">x</a></div>
            <a class="wt-pagination__item--next" aria-disabled="true" href="#">Next</a>
        "##;
        let page = extractor().extract(html, 7).unwrap();
        assert!(page.end_of_results);
        assert_eq!(page.records[0].unique_id, "5");
    }

    #[test]
    fn test_empty_page() {
        let page = extractor()
            .extract("<html><body><div class='wt-pagination'></div></body></html>", 3)
            .unwrap();
        assert!(page.records.is_empty());
        assert!(page.end_of_results);
        assert_eq!(page.total_pages, None);
    }

    #[test]
    fn test_fallback_to_listing_links() {
        let html = r#"<ul><li><a href="/listing/77/thing"><h3>Thing</h3></a></li></ul>"#;
        let page = extractor().extract(html, 1).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].unique_id, "77");
        assert_eq!(page.records[0].title, "Thing");
    }

    #[test]
    fn test_cards_without_ids_are_an_error() {
        let html = r#"<article class="listing-card"><span>No link</span></article>"#;
        assert!(matches!(
            extractor().extract(html, 1),
            Err(ExtractionError::NoListingIds { cards: 1 })
        ));
    }

    #[test]
    fn test_clean_price() {
        assert_eq!(clean_price("$1,234.50 USD"), "1,234.50");
        assert_eq!(clean_price("free"), "");
    }

    #[test]
    fn test_selectors_compile() {
        let selectors = Selectors::compile().unwrap();
        assert_eq!(selectors.cards.len(), CARD_SELECTORS.len());
        assert_eq!(selectors.next_links.len(), NEXT_LINK_SELECTORS.len());
    }

    #[test]
    fn test_invalid_selector_reported() {
        assert!(matches!(compile("a[href"), Err(ExtractionError::Selector(_))));
    }

    #[test]
    fn test_from_config_rejects_bad_base_url() {
        let target = TargetConfig {
            base_url: "not a url".to_string(),
            page_param: "page".to_string(),
            ref_param: None,
        };
        assert!(matches!(
            ListingExtractor::from_config(&target),
            Err(ExtractionError::Url(_))
        ));
    }

    #[test]
    fn test_extractor_reused_across_pages() {
        let extractor = extractor();
        let first = extractor.extract(PAGE, 1).unwrap();
        let second = extractor.extract(PAGE, 2).unwrap();
        assert_eq!(first.records.len(), second.records.len());
        assert!(second.records.iter().all(|r| r.page_number == 2));
    }
}
