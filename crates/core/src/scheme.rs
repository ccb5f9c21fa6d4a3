//! Helpers for the `scheme://address` host strings held by connection descriptors.

pub const DEFAULT_SCHEME: &str = "neo4j";
pub const DEFAULT_ADDRESS: &str = "localhost:7687";

const ROUTED_SCHEME: &str = "neo4j";
const DIRECT_SCHEME: &str = "bolt";

#[must_use]
pub fn get_scheme(url: &str) -> Option<&str> {
    url.split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, address)| address)
}

/// Normalizes user input into a host URL using one of `allowed_schemes`.
/// Input without a scheme gets `fallback_scheme` (or the default); a scheme
/// outside the allowed list is replaced by the first allowed one.
#[must_use]
pub fn generate_bolt_url(
    allowed_schemes: &[String],
    input: &str,
    fallback_scheme: Option<&str>,
) -> String {
    let input = input.trim();
    let address = match strip_scheme(input) {
        "" => DEFAULT_ADDRESS,
        address => address,
    };
    let scheme = get_scheme(input)
        .or(fallback_scheme)
        .unwrap_or(DEFAULT_SCHEME);

    let scheme = match allowed_schemes.first() {
        Some(first) if !allowed_schemes.iter().any(|allowed| allowed == scheme) => first.as_str(),
        _ => scheme,
    };
    format!("{scheme}://{address}")
}

/// Swaps the routed and direct protocol variants, keeping any `+s`/`+ssc`
/// suffix. Unknown schemes are returned unchanged.
#[must_use]
pub fn toggle_scheme_routing(url: &str) -> String {
    let Some(scheme) = get_scheme(url) else {
        return url.to_string();
    };
    let (base, suffix) = scheme
        .split_once('+')
        .map_or((scheme, ""), |(base, _)| (base, &scheme[base.len()..]));
    let toggled = match base {
        ROUTED_SCHEME => DIRECT_SCHEME,
        DIRECT_SCHEME => ROUTED_SCHEME,
        _ => return url.to_string(),
    };
    format!("{toggled}{suffix}://{}", strip_scheme(url))
}
