use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::PluginError;
use crate::http::HttpClient;
use crate::plugin::{Listener, ListenerTarget};
use crate::plugins::{
    AnonymousListener, OAuth2Listener, SignedListener, ANONYMOUS_LOCATION, OAUTH2_LOCATION,
    SIGNED_LOCATION,
};

/// Builds an unconfigured listener on top of the shared transport.
pub type ListenerConstructor =
    Arc<dyn Fn(Arc<dyn HttpClient>) -> Result<Box<dyn Listener>, String> + Send + Sync>;

/// Maps listener-type locations to plugin constructors.
///
/// A location names a module that may export any number of constructors;
/// resolution succeeds only when it exports exactly one. Successful
/// resolutions are cached by normalized location.
pub struct PluginResolver {
    http: Arc<dyn HttpClient>,
    modules: HashMap<String, Vec<ListenerConstructor>>,
    resolved: Mutex<HashMap<String, ListenerConstructor>>,
}

impl PluginResolver {
    /// Empty registry. Nothing resolves until modules are registered.
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            modules: HashMap::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the anonymous, OAuth2 and signed plugins.
    pub fn with_builtins(http: Arc<dyn HttpClient>) -> Self {
        let mut resolver = Self::new(http);
        resolver.register(ANONYMOUS_LOCATION, |http| {
            Ok(Box::new(AnonymousListener::new(http)) as Box<dyn Listener>)
        });
        resolver.register(OAUTH2_LOCATION, |http| {
            Ok(Box::new(OAuth2Listener::new(http)) as Box<dyn Listener>)
        });
        resolver.register(SIGNED_LOCATION, |http| {
            Ok(Box::new(SignedListener::new(http)) as Box<dyn Listener>)
        });
        resolver
    }

    /// Add one constructor to the module at `location`.
    pub fn register<F>(&mut self, location: &str, constructor: F) -> &mut Self
    where
        F: Fn(Arc<dyn HttpClient>) -> Result<Box<dyn Listener>, String> + Send + Sync + 'static,
    {
        self.modules
            .entry(normalize_location(location))
            .or_default()
            .push(Arc::new(constructor));
        self.forget(location);
        self
    }

    /// Replace the module at `location` wholesale.
    pub fn register_module(&mut self, location: &str, constructors: Vec<ListenerConstructor>) -> &mut Self {
        self.modules.insert(normalize_location(location), constructors);
        self.forget(location);
        self
    }

    pub fn resolve(&self, location: &str) -> Result<ListenerConstructor, PluginError> {
        if location.trim().is_empty() {
            return Err(PluginError::EmptyLocation);
        }
        let key = normalize_location(location);

        let mut cache = self.resolved.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(constructor) = cache.get(&key) {
            return Ok(constructor.clone());
        }

        let module = self
            .modules
            .get(&key)
            .ok_or_else(|| PluginError::NotFound { location: key.clone() })?;

        match module.as_slice() {
            [constructor] => {
                tracing::debug!(location = %key, "plugin resolved");
                cache.insert(key, constructor.clone());
                Ok(constructor.clone())
            }
            other => Err(PluginError::InterfaceMismatch {
                location: key,
                found: other.len(),
            }),
        }
    }

    /// Resolve `location`, build a listener and configure its target.
    pub fn create_instance(
        &self,
        location: &str,
        url: &str,
        timeout_minutes: u32,
        headers: &[String],
    ) -> Result<Box<dyn Listener>, PluginError> {
        let constructor = self.resolve(location)?;
        let mut listener = constructor(self.http.clone()).map_err(|reason| PluginError::Instantiation {
            location: normalize_location(location),
            reason,
        })?;
        listener.configure(ListenerTarget::new(url, timeout_minutes, headers.to_vec()));
        Ok(listener)
    }

    pub fn cached_locations(&self) -> usize {
        self.resolved.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn forget(&mut self, location: &str) {
        let key = normalize_location(location);
        if let Ok(cache) = self.resolved.get_mut() {
            cache.remove(&key);
        }
    }
}

/// Canonical form of a location: trimmed, forward slashes, no `./` prefix,
/// no empty or trailing segments.
pub fn normalize_location(location: &str) -> String {
    location
        .trim()
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
