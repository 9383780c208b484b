use url::Url;

/// Resolves an `href` against the page URL
///
/// Returns None for empty, `javascript:`, `mailto:`, `tel:` and `data:`
/// links, and for anything that does not resolve to http(s).
pub fn resolve_href(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let url = base.join(href).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

/// Returns the URL without query string or fragment
pub fn strip_query(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.to_string()
}

/// Extracts the numeric listing id from a `/listing/<digits>/...` path
///
/// # Examples
///
/// ```
/// use listing_harvest::url::listing_id_from_url;
///
/// assert_eq!(
///     listing_id_from_url("https://shop.example.com/listing/123456/budget-planner?ref=x"),
///     Some("123456".to_string())
/// );
/// assert_eq!(listing_id_from_url("https://shop.example.com/shop/Acme"), None);
/// ```
pub fn listing_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let mut segments = path.split('/');

    while let Some(segment) = segments.next() {
        if segment == "listing" {
            let candidate = segments.next()?;
            if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
                return Some(candidate.to_string());
            }
            return None;
        }
    }

    None
}

/// Extracts the shop name from a `/shop/<name>` URL
pub fn shop_name_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/shop/")?;
    let name = rest.split(['?', '#', '/']).next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
