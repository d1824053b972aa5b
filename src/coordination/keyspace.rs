/// Keys used by one coordinator, all derived from the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    /// `<ns>:sync:health`
    health_space: String,
    /// `<ns>:sync:instance`
    instance_list: String,
    /// `<ns>:sync:instance:lock`
    list_lock: String,
}

impl Keyspace {
    pub fn new(namespace: &str) -> Self {
        let sync_space = format!("{namespace}:sync");
        Self {
            health_space: format!("{sync_space}:health"),
            instance_list: format!("{sync_space}:instance"),
            list_lock: format!("{sync_space}:instance:lock"),
        }
    }

    /// Health-marker key for `identity`.
    pub fn health_key(&self, identity: &str) -> String {
        format!("{}:{identity}", self.health_space)
    }

    /// Pattern matching every health marker in the namespace.
    pub fn health_pattern(&self) -> String {
        format!("{}:*", self.health_space)
    }

    pub fn instance_list(&self) -> &str {
        &self.instance_list
    }

    pub fn list_lock(&self) -> &str {
        &self.list_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_namespace() {
        let ks = Keyspace::new("uct:jet");
        assert_eq!(ks.health_key("abc"), "uct:jet:sync:health:abc");
        assert_eq!(ks.health_pattern(), "uct:jet:sync:health:*");
        assert_eq!(ks.instance_list(), "uct:jet:sync:instance");
        assert_eq!(ks.list_lock(), "uct:jet:sync:instance:lock");
    }

    #[test]
    fn lock_key_is_not_a_health_marker() {
        let ks = Keyspace::new("ns");
        let prefix = ks.health_pattern();
        let prefix = prefix.trim_end_matches('*');
        assert!(!ks.list_lock().starts_with(prefix));
        assert!(!ks.instance_list().starts_with(prefix));
    }
}
