use crate::env::EnvLookup;

pub const ENV_GROUP_ID: &str = "HOOKS_GROUP_ID";
pub const ENV_DATABASE_URL: &str = "HOOKS_DATABASE_URL";
pub const ENV_LOG: &str = "HOOKS_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// App option category holding the shard count.
    pub max_groups_category: String,

    /// App option name holding the shard count.
    pub max_groups_name: String,

    /// Shard polled by this process.
    pub group_id: u32,

    pub database_url: Option<String>,

    /// `tracing-subscriber` filter directive.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_groups_category: "GetNotProcessed".to_string(),
            max_groups_name: "MaxGroups".to_string(),
            group_id: 1,
            database_url: None,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `HOOKS_*` variables.
    pub fn from_env(env: &dyn EnvLookup) -> Self {
        let mut config = Self::default();

        if let Some(raw) = env.get(ENV_GROUP_ID) {
            match raw.trim().parse::<u32>() {
                Ok(group_id) if group_id > 0 => config.group_id = group_id,
                _ => tracing::warn!(
                    variable = ENV_GROUP_ID,
                    value = %raw,
                    default = config.group_id,
                    "invalid shard number, using default"
                ),
            }
        }

        config.database_url = env.get(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty());

        if let Some(filter) = env.get(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            config.log_filter = filter;
        }

        config
    }

    pub fn with_group_id(mut self, group_id: u32) -> Self {
        self.group_id = group_id.max(1);
        self
    }

    pub fn with_max_groups_option(
        mut self,
        category: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.max_groups_category = category.into();
        self.max_groups_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_env(&env(&[
            (ENV_GROUP_ID, "3"),
            (ENV_DATABASE_URL, "postgres://hooks@localhost/hooks"),
            (ENV_LOG, "hook_engine=debug"),
        ]));

        assert_eq!(config.group_id, 3);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://hooks@localhost/hooks")
        );
        assert_eq!(config.log_filter, "hook_engine=debug");
        assert_eq!(config.max_groups_name, "MaxGroups");
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = EngineConfig::from_env(&env(&[(ENV_GROUP_ID, "zero"), (ENV_LOG, " ")]));
        assert_eq!(config, EngineConfig::default());

        let config = EngineConfig::from_env(&env(&[(ENV_GROUP_ID, "0")]));
        assert_eq!(config.group_id, 1);
    }

    #[test]
    fn builders_override_defaults() {
        let config = EngineConfig::default()
            .with_group_id(0)
            .with_max_groups_option("Polling", "Shards");

        assert_eq!(config.group_id, 1);
        assert_eq!(config.max_groups_category, "Polling");
        assert_eq!(config.max_groups_name, "Shards");
    }
}
