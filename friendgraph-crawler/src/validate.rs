use crate::error::CrawlError;

/// Length of a 64-bit Steam profile identifier in decimal.
pub const PROFILE_ID_LEN: usize = 17;

/// Deepest crawl a request may ask for.
pub const MAX_DEPTH: u32 = 3;

/// A crawl may start from one origin or from two.
pub const MAX_ORIGINS: usize = 2;

pub fn is_valid_profile_id(id: &str) -> bool {
    id.len() == PROFILE_ID_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

/// Job and graph IDs end up in URLs and lookups, so only
/// `[A-Za-z0-9_-]` is accepted.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Checks origins and depth of a crawl request, returning the origins with
/// duplicates removed (input order kept).
pub fn validate_request(origins: &[String], max_depth: u32) -> Result<Vec<String>, CrawlError> {
    if origins.is_empty() {
        return Err(CrawlError::InvalidInput(
            "at least one origin is required".to_string(),
        ));
    }
    if origins.len() > MAX_ORIGINS {
        return Err(CrawlError::InvalidInput(format!(
            "at most {} origins are allowed, got {}",
            MAX_ORIGINS,
            origins.len()
        )));
    }
    if let Some(bad) = origins.iter().find(|id| !is_valid_profile_id(id)) {
        return Err(CrawlError::InvalidInput(format!(
            "invalid profile id '{}'",
            bad
        )));
    }
    if max_depth < 1 || max_depth > MAX_DEPTH {
        return Err(CrawlError::InvalidInput(format!(
            "depth must be between 1 and {}, got {}",
            MAX_DEPTH, max_depth
        )));
    }

    let mut unique: Vec<String> = Vec::with_capacity(origins.len());
    for origin in origins {
        if !unique.contains(origin) {
            unique.push(origin.clone());
        }
    }
    Ok(unique)
}
