//! Topic naming scheme shared by the controller, the bus adapter, and the
//! coordinator (resource names equal version topic names).
//!
//! Version topics are named `{store}_v{n}`, real-time topics `{store}_rt`.
//! Store names may themselves contain `_v`, so parsers split on the LAST
//! occurrence of the separator.

const VERSION_SEPARATOR: &str = "_v";
const REAL_TIME_SUFFIX: &str = "_rt";

/// Reserved prefix for system stores (push status, metadata system stores).
pub const SYSTEM_STORE_PREFIX: &str = "strata_system_";

/// Topic carrying the batch push for one store version.
pub fn compose_version_topic(store_name: &str, version: i32) -> String {
    format!("{store_name}{VERSION_SEPARATOR}{version}")
}

/// Topic carrying streaming updates for a hybrid store.
pub fn compose_real_time_topic(store_name: &str) -> String {
    format!("{store_name}{REAL_TIME_SUFFIX}")
}

/// Whether `topic` is a well-formed version topic of some store.
pub fn is_version_topic(topic: &str) -> bool {
    parse_version_topic(topic).is_some()
}

pub fn is_real_time_topic(topic: &str) -> bool {
    topic.len() > REAL_TIME_SUFFIX.len() && topic.ends_with(REAL_TIME_SUFFIX)
}

/// Store name of a version topic, or `None` if the name is malformed.
pub fn parse_store_from_version_topic(topic: &str) -> Option<&str> {
    parse_version_topic(topic).map(|(store, _)| store)
}

/// Version number of a version topic, or `None` if the name is malformed.
pub fn parse_version_from_version_topic(topic: &str) -> Option<i32> {
    parse_version_topic(topic).map(|(_, version)| version)
}

pub fn parse_store_from_real_time_topic(topic: &str) -> Option<&str> {
    if is_real_time_topic(topic) {
        Some(&topic[..topic.len() - REAL_TIME_SUFFIX.len()])
    } else {
        None
    }
}

pub fn is_system_store(store_name: &str) -> bool {
    store_name.starts_with(SYSTEM_STORE_PREFIX)
}

fn parse_version_topic(topic: &str) -> Option<(&str, i32)> {
    let idx = topic.rfind(VERSION_SEPARATOR)?;
    let (store, rest) = topic.split_at(idx);
    let number = rest[VERSION_SEPARATOR.len()..].parse::<i32>().ok()?;
    if store.is_empty() || number < 1 {
        return None;
    }
    Some((store, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let t = compose_version_topic("orders", 7);
        assert_eq!(t, "orders_v7");
        assert_eq!(parse_store_from_version_topic(&t), Some("orders"));
        assert_eq!(parse_version_from_version_topic(&t), Some(7));
        assert!(is_version_topic(&t));
    }

    #[test]
    fn store_names_containing_separator() {
        // "my_video_store" contains "_v"; the parser must split on the last one.
        let t = compose_version_topic("my_video_store", 12);
        assert_eq!(parse_store_from_version_topic(&t), Some("my_video_store"));
        assert_eq!(parse_version_from_version_topic(&t), Some(12));
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_version_topic("orders"));
        assert!(!is_version_topic("orders_rt"));
        assert!(!is_version_topic("orders_vx"));
        assert!(!is_version_topic("_v3"));
        assert!(!is_version_topic("orders_v0"));
    }

    #[test]
    fn real_time_topics() {
        let t = compose_real_time_topic("orders");
        assert_eq!(t, "orders_rt");
        assert!(is_real_time_topic(&t));
        assert_eq!(parse_store_from_real_time_topic(&t), Some("orders"));
        assert!(!is_real_time_topic("_rt"));
        assert_eq!(parse_store_from_real_time_topic("orders_v3"), None);
    }

    #[test]
    fn system_store_prefix() {
        assert!(is_system_store("strata_system_push_status"));
        assert!(!is_system_store("orders"));
    }
}
