use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static REPLACER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9-._]").unwrap());

/// Transform a random string as a valid docker name (only containing alpha/num, dots,
/// underlines & dashes).
///
/// This function replaces invalid characters into double underlines `__`.
pub(crate) fn transform_string_as_docker_tag(s: &str) -> Cow<str> {
    REPLACER.replace_all(s, "__")
}
