use crate::broker::topic::{is_valid_filter, is_valid_topic_name, matches};

#[test]
fn test_matcher_table() {
    let cases = [
        ("#", "test/topic", true),
        ("#", "/test/topic", true),
        ("foo/#", "foo/bar/baz", true),
        ("foo/#", "foo", true),
        ("foo/+/baz", "foo/bar/baz", true),
        ("foo/+/baz", "foo/baz", false),
        ("foo/+/baz", "foo//baz", true),
        ("foo/+/baz", "foo/bar/bam", false),
        ("foo/+/baz/#", "foo/bar/baz/bar", true),
        ("foo/+/baz/#", "foo//baz", true),
        ("foo/+/baz/#", "foo//baz/bar", true),
        ("test/topic/+", "test/topic/", true),
        ("test/topic/+", "test/topic", false),
    ];
    for (filter, topic, expected) in cases {
        assert_eq!(
            matches(filter, topic),
            expected,
            "filter {filter:?} against topic {topic:?}"
        );
    }
}

#[test]
fn test_literal_levels() {
    assert!(matches("a/b", "a/b"));
    assert!(!matches("a/b", "a/b/c"));
    assert!(!matches("a/b/c", "a/b"));
    assert!(matches("/a", "/a"));
    assert!(!matches("/a", "a"));
    assert!(matches("a//b", "a//b"));
}

#[test]
fn test_plus_never_crosses_levels() {
    assert!(matches("+", "a"));
    assert!(!matches("+", "a/b"));
    assert!(matches("+/+", "/a"));
    assert!(!matches("+", ""));
}

#[test]
fn test_hash_matches_empty_topic() {
    assert!(matches("#", ""));
    assert!(!matches("a", ""));
}

#[test]
fn test_hash_must_be_last() {
    assert!(!matches("a/#/b", "a/x/b"));
}

#[test]
fn test_filter_validation() {
    for valid in ["#", "+", "a/+/b", "a/#", "+/+", "/", "a//b", "$SYS/#"] {
        assert!(is_valid_filter(valid), "{valid:?} should be valid");
    }
    for invalid in ["", "a/#/b", "a#", "a+/b", "a/b+", "#/a", "++"] {
        assert!(!is_valid_filter(invalid), "{invalid:?} should be invalid");
    }
}

#[test]
fn test_topic_name_validation() {
    assert!(is_valid_topic_name("a/b"));
    assert!(is_valid_topic_name("/"));
    assert!(!is_valid_topic_name(""));
    assert!(!is_valid_topic_name("a/+"));
    assert!(!is_valid_topic_name("a/#"));
}
