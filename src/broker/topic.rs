//! Topic matching
//!
//! Topic names and filters are split into levels on `/`. Empty levels (from
//! a leading, trailing or doubled slash) are significant and never
//! collapsed. An empty topic name has zero levels.
//!
//! - `#` matches zero or more remaining levels and must be the last level of
//!   the filter. `foo/#` therefore matches `foo` itself.
//! - `+` matches exactly one level, including an empty one.
//! - Any other filter level matches only an identical topic level.
//!
//! The `$` convention (wildcard-led filters skip `$` topics) is a routing
//! policy and lives in the broker engine, not here.

/// Returns `true` if `topic` is matched by the subscription `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = if topic.is_empty() {
        Vec::new()
    } else {
        topic.split('/').collect()
    };

    let mut t = 0;
    for (i, level) in filter_levels.iter().enumerate() {
        if *level == "#" {
            return i == filter_levels.len() - 1;
        }
        let Some(topic_level) = topic_levels.get(t) else {
            return false;
        };
        if *level != "+" && level != topic_level {
            return false;
        }
        t += 1;
    }
    t == topic_levels.len()
}

/// A filter is valid when it is non-empty, `#` appears only as the whole
/// final level, and `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// A topic name for PUBLISH must be non-empty and free of wildcards.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}
