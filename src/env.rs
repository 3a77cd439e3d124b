use std::collections::HashMap;

/// Key/value lookup used to resolve plugin options at execution time.
pub trait EnvLookup: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        std::env::var(key).ok()
    }
}

/// Fixed map, handy for tests and embedded configuration.
impl EnvLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}
