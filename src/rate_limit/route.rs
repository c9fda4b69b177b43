//! Route normalization into provisional bucket keys.
//!
//! Until the remote API tells us which bucket a route belongs to, requests
//! are grouped by method plus the route with ids blanked out. The major
//! parameter (first channel, guild or webhook id) stays literal because the
//! API scopes buckets by it.

use url::Url;

/// Path segments whose following id is a major parameter.
const MAJOR_RESOURCES: &[&str] = &["channels", "guilds", "webhooks"];

/// Placeholder for non-major ids.
const ID_PLACEHOLDER: &str = ":id";

/// Extract the path portion of a route (absolute URL or bare path), without query.
fn route_path(route: &str) -> String {
    let path = match Url::parse(route) {
        Ok(url) => url.path().to_string(),
        Err(_) => route.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.trim_matches('/').to_string()
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Get the major parameter of a route, if any.
pub fn major_parameter(route: &str) -> Option<String> {
    let path = route_path(route);
    let mut segments = path.split('/');
    let first = segments.next()?;
    if MAJOR_RESOURCES.contains(&first) {
        segments.next().filter(|s| is_id(s)).map(str::to_string)
    } else {
        None
    }
}

/// Provisional bucket key for a request: `"METHOD /normalized/path"`.
pub fn route_key(method: &str, route: &str) -> String {
    let path = route_path(route);
    let mut normalized: Vec<&str> = Vec::new();
    let mut major_seen = false;
    let mut previous = "";

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if previous == "reactions" {
            // Every emoji shares one bucket.
            normalized.push("*");
            break;
        }
        if is_id(segment) {
            if !major_seen && normalized.len() == 1 && MAJOR_RESOURCES.contains(&previous) {
                major_seen = true;
                normalized.push(segment);
            } else {
                normalized.push(ID_PLACEHOLDER);
            }
        } else {
            normalized.push(segment);
        }
        previous = segment;
    }

    format!("{} /{}", method.to_ascii_uppercase(), normalized.join("/"))
}

/// Bucket key once the remote bucket identity is known.
pub fn bucket_key(bucket_id: &str, route: &str) -> String {
    match major_parameter(route) {
        Some(major) => format!("{}:{}", bucket_id, major),
        None => format!("{}:global", bucket_id),
    }
}
