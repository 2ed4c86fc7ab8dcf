//! Cache key construction
//!
//! Keys are built as `<module>:<part1>:<part2>:...`. Parts are concatenated
//! verbatim; a part that itself contains `:` can make two different tuples
//! produce the same key, so callers must not rely on the separator being
//! escaped.

use std::fmt::Display;

/// Separator between key segments
pub const SEPARATOR: &str = ":";

const NULL_MARKER_PREFIX: &str = "null";
const RATE_LIMIT_PREFIX: &str = "rate_limit";
const BLOOM_FILTER_PREFIX: &str = "bloom_filter";

/// Deterministic key builder shared by every component
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    /// Build `module:part1:part2:...`
    pub fn generate<I, P>(module: &str, parts: I) -> String
    where
        I: IntoIterator<Item = P>,
        P: Display,
    {
        let mut key = String::from(module);
        for part in parts {
            key.push_str(SEPARATOR);
            key.push_str(&part.to_string());
        }
        key
    }

    /// Remote key holding the data for `(module, key)`
    pub fn data_key(module: &str, key: &str) -> String {
        Self::generate(module, [key])
    }

    /// `null:<module>:<key>`
    pub fn null_marker_key(module: &str, key: &str) -> String {
        Self::generate(NULL_MARKER_PREFIX, [module, key])
    }

    /// `rate_limit:<module>:<key>`
    pub fn rate_limit_key(module: &str, key: &str) -> String {
        Self::generate(RATE_LIMIT_PREFIX, [module, key])
    }

    /// `bloom_filter:<module>`
    pub fn bloom_filter_key(module: &str) -> String {
        Self::generate(BLOOM_FILTER_PREFIX, [module])
    }

    /// Glob matching every data key of a module
    pub fn scan_pattern(module: &str) -> String {
        Self::generate(module, ["*"])
    }

    /// Recover the identifier from a data key produced by [`Self::data_key`]
    pub fn strip_module<'a>(module: &str, remote_key: &'a str) -> Option<&'a str> {
        remote_key
            .strip_prefix(module)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .filter(|rest| !rest.is_empty())
    }
}
