//! Endpoint URL assembly.

/// Strip trailing slashes so a configured base joins cleanly.
///
/// ```
/// use palaver::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://chat.example.org/v1/"), "https://chat.example.org/v1");
/// assert_eq!(normalize_base_url("https://chat.example.org/v1"), "https://chat.example.org/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Build a full endpoint URL from a base and a path segment. Slashes on
/// either side of the join are tolerated and never doubled.
///
/// ```
/// use palaver::utils::url::construct_api_url;
///
/// let url = construct_api_url("https://chat.example.org/v1/", "/chat/completions");
/// assert_eq!(url, "https://chat.example.org/v1/chat/completions");
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_any_number_of_trailing_slashes() {
        assert_eq!(normalize_base_url("https://a.example/v1"), "https://a.example/v1");
        assert_eq!(normalize_base_url("https://a.example/v1/"), "https://a.example/v1");
        assert_eq!(normalize_base_url("https://a.example/v1///"), "https://a.example/v1");
    }

    #[test]
    fn construct_handles_slashes_on_either_side() {
        assert_eq!(
            construct_api_url("https://a.example/v1", "models"),
            "https://a.example/v1/models"
        );
        assert_eq!(
            construct_api_url("https://a.example/v1/", "/models"),
            "https://a.example/v1/models"
        );
    }
}
