use crate::UrlError;
use url::Url;

/// Parses the category base URL, accepting only http and https
pub fn parse_base_url(url_str: &str) -> Result<Url, UrlError> {
    let url = Url::parse(url_str).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    Ok(url)
}

/// Builds the URL of a category page
///
/// Page 1 is the base URL without the page (and ref) parameters. Later pages
/// set `page_param=<n>` and, when `ref_param` is given, `ref_param=pagination_<n>`.
/// Any other query parameters of the base URL are preserved in order.
///
/// # Examples
///
/// ```
/// use listing_harvest::url::build_page_url;
/// use url::Url;
///
/// let base = Url::parse("https://shop.example.com/c/jewelry?explicit=1").unwrap();
/// let url = build_page_url(&base, "page", Some("ref"), 3);
/// assert_eq!(
///     url.as_str(),
///     "https://shop.example.com/c/jewelry?explicit=1&page=3&ref=pagination_3"
/// );
/// ```
pub fn build_page_url(base: &Url, page_param: &str, ref_param: Option<&str>, page: u32) -> Url {
    let mut url = base.clone();

    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != page_param && Some(key.as_ref()) != ref_param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    let mut pairs: Vec<(String, String)> = retained;
    if page > 1 {
        pairs.push((page_param.to_string(), page.to_string()));
        if let Some(ref_param) = ref_param {
            pairs.push((ref_param.to_string(), format!("pagination_{}", page)));
        }
    }

    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }

    url
}

/// Reads the page number carried by `page_param` in a URL
pub fn page_number_in_url(url: &Url, page_param: &str) -> Option<u32> {
    url.query_pairs()
        .find(|(key, _)| key == page_param)
        .and_then(|(_, value)| value.parse::<u32>().ok())
}
