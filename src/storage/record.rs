//! The listing record persisted to the record store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the record store column layout
pub const RECORD_SCHEMA_VERSION: u32 = 2;

/// Column order of the record store, schema version 2
pub const RECORD_COLUMNS: &[&str] = &[
    "unique_id",
    "page_number",
    "position_on_page",
    "extraction_timestamp",
    "url",
    "title",
    "shop_name",
    "shop_url",
    "sale_price",
    "original_price",
    "is_on_sale",
    "is_advertisement",
    "is_digital_download",
    "is_bestseller",
    "is_star_seller",
    "rating",
    "review_count",
    "free_shipping",
    "page_complete",
];

/// One listing extracted from a category page
///
/// Field order matches [`RECORD_COLUMNS`]; the record store serializes rows
/// positionally. Records are immutable once persisted: a re-seen
/// `unique_id` is dropped, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub unique_id: String,
    pub page_number: u32,

    /// 1-based position among the page's records
    pub position_on_page: u32,

    pub extraction_timestamp: DateTime<Utc>,
    pub url: String,
    pub title: String,
    pub shop_name: String,
    pub shop_url: String,
    pub sale_price: String,
    pub original_price: String,
    pub is_on_sale: bool,
    pub is_advertisement: bool,
    pub is_digital_download: bool,
    pub is_bestseller: bool,
    pub is_star_seller: bool,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub free_shipping: bool,

    /// Set on the last row written for a page whose records all persisted
    pub page_complete: bool,
}

impl Record {
    /// Creates a record with only its identity fields set
    pub fn new(unique_id: impl Into<String>, page_number: u32, position_on_page: u32) -> Self {
        Self {
            unique_id: unique_id.into(),
            page_number,
            position_on_page,
            extraction_timestamp: Utc::now(),
            url: String::new(),
            title: String::new(),
            shop_name: String::new(),
            shop_url: String::new(),
            sale_price: String::new(),
            original_price: String::new(),
            is_on_sale: false,
            is_advertisement: false,
            is_digital_download: false,
            is_bestseller: false,
            is_star_seller: false,
            rating: None,
            review_count: None,
            free_shipping: false,
            page_complete: false,
        }
    }
}
