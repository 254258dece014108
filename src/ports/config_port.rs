//! Configuration access port.

/// Raw string lookups. Typed parsing and range checks live in
/// `domain::config_validation`, which rejects bad values instead of
/// falling back to defaults.
pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
}
