//! URL handling module for Listing-Harvest
//!
//! This module builds the URL of each category page and pulls listing
//! identifiers, shop names and page numbers out of URLs found on a page.

mod listing;
mod page;

pub use listing::{listing_id_from_url, resolve_href, shop_name_from_url, strip_query};
pub use page::{build_page_url, page_number_in_url, parse_base_url};
