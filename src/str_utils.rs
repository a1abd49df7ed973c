/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Normalizes a model-supplied file path to a site-relative one.
///
/// Backslashes become slashes, leading `./` and `/` are stripped and empty or `.` segments
/// are dropped. Returns `None` for a path that ends up empty or that climbs out of the site
/// root with `..`.
pub fn normalize_site_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut parts = Vec::new();
    for segment in unified.split('/') {
        match segment.trim() {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
