//! Application assembly: config, schema, storage backend and processor.

use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::event::{EventProcessor, ExceptionDomain, ExceptionHandler};
use crate::manager::{
    CacheClient, CacheStateManager, DiskStateManager, MemoryCache, MemoryStateManager, StateManager,
    StateManagerMode,
};
use crate::minify::{MinifyCache, Schema};
use crate::snapshot::{declared_handler, snapshot, SnapshotRequest, SnapshotResponse};
use crate::state::{StateRegistry, StateTree};
use crate::types::{Event, UpdateSender};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builder for [`App`]. Every configuration error surfaces from
/// [`AppBuilder::build`].
pub struct AppBuilder {
    config: AppConfig,
    registry: Option<StateRegistry>,
    on_load: BTreeMap<String, Vec<String>>,
    frontend: ExceptionHandler,
    backend: ExceptionHandler,
    cache_client: Option<Arc<dyn CacheClient>>,
}

impl AppBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// The app's state types. Without one the app serves no state.
    pub fn state(mut self, registry: StateRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run the handler at declared path `handler_path` when `route` is
    /// first rendered.
    pub fn on_load(mut self, route: impl Into<String>, handler_path: impl Into<String>) -> Self {
        self.on_load
            .entry(route.into())
            .or_default()
            .push(handler_path.into());
        self
    }

    pub fn frontend_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.frontend = handler;
        self
    }

    pub fn backend_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.backend = handler;
        self
    }

    /// Client for the cache backend. Defaults to an in-process [`MemoryCache`].
    pub fn cache_client(mut self, client: Arc<dyn CacheClient>) -> Self {
        self.cache_client = Some(client);
        self
    }

    pub fn build(self) -> Result<App> {
        self.config.validate()?;

        let minify = MinifyCache::new(&self.config.minify_path);
        let state = match self.registry {
            Some(registry) => {
                let schema = Arc::new(build_schema(registry, &self.config, &minify)?);
                check_on_load(&schema, &self.on_load)?;
                let manager = create_manager(&self.config, Arc::clone(&schema), self.cache_client)?;
                let processor = EventProcessor::new(manager, self.frontend, self.backend)?;
                Some(AppState { schema, processor })
            }
            None => {
                self.frontend.validate(ExceptionDomain::Frontend)?;
                self.backend.validate(ExceptionDomain::Backend)?;
                None
            }
        };

        tracing::debug!(app = %self.config.app_name, "app built");
        Ok(App {
            config: self.config,
            state,
            on_load: self.on_load,
            minify,
        })
    }
}

struct AppState {
    schema: Arc<Schema>,
    processor: EventProcessor,
}

/// A built application.
pub struct App {
    config: AppConfig,
    state: Option<AppState>,
    on_load: BTreeMap<String, Vec<String>>,
    minify: MinifyCache,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder {
            config: AppConfig::default(),
            registry: None,
            on_load: BTreeMap::new(),
            frontend: ExceptionHandler::default_frontend(),
            backend: ExceptionHandler::default_backend(),
            cache_client: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.state.as_ref().map(|s| &s.schema)
    }

    pub fn processor(&self) -> Option<&EventProcessor> {
        self.state.as_ref().map(|s| &s.processor)
    }

    pub fn minify_cache(&self) -> &MinifyCache {
        &self.minify
    }

    /// Process one client event. See [`EventProcessor::process`].
    pub fn process(&self, event: Event, updates: &UpdateSender) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| SyncError::StateResolution("app has no state".into()))?;
        state.processor.process(event, updates)
    }

    /// Read-only copy of a client's tree.
    pub fn get_state(&self, token: &str) -> Result<StateTree> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| SyncError::StateResolution("app has no state".into()))?;
        state.processor.manager().get(token)
    }

    /// First-paint state for a page request.
    pub fn snapshot(&self, request: &SnapshotRequest) -> Result<SnapshotResponse> {
        let on_load = self
            .on_load
            .get(&request.path)
            .map(Vec::as_slice)
            .unwrap_or_default();
        snapshot(self.schema(), on_load, request)
    }

    pub fn wait_for_background(&self) {
        if let Some(state) = &self.state {
            state.processor.wait_for_background();
        }
    }
}

/// Load and check the identifier table, then name the registry's types.
fn build_schema(registry: StateRegistry, config: &AppConfig, minify: &MinifyCache) -> Result<Schema> {
    let toggles = config.minify_toggles();
    let table = if toggles.any_enabled() {
        minify.get()?
    } else {
        None
    };
    if let Some(table) = &table {
        let report = table.validate(&registry);
        if !report.is_ok() {
            return Err(SyncError::ConfigValidation(format!(
                "{}: {}",
                minify.path().display(),
                report.errors.join("; ")
            )));
        }
        for warning in &report.warnings {
            tracing::warn!(path = %minify.path().display(), %warning, "stale minify entry");
        }
        for missing in &report.missing {
            tracing::warn!(path = %minify.path().display(), %missing, "no minified id; using declared name");
        }
    }
    Ok(Schema::new(Arc::new(registry), table.as_deref(), toggles).with_policy(config.resolution))
}

fn check_on_load(schema: &Arc<Schema>, on_load: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let tree = StateTree::new(Arc::clone(schema));
    for (route, handlers) in on_load {
        for path in handlers {
            declared_handler(&tree, path).map_err(|e| {
                SyncError::ConfigValidation(format!("on_load handler for {route}: {e}"))
            })?;
        }
    }
    Ok(())
}

fn create_manager(
    config: &AppConfig,
    schema: Arc<Schema>,
    cache_client: Option<Arc<dyn CacheClient>>,
) -> Result<Arc<dyn StateManager>> {
    let timing = config.lock_timing();
    let manager: Arc<dyn StateManager> = match config.state_manager_mode {
        StateManagerMode::Memory => Arc::new(MemoryStateManager::new(schema, timing)),
        StateManagerMode::Disk => {
            let manager =
                DiskStateManager::open(&config.state_dir, schema, timing, config.state_cache_size)?;
            manager.purge_expired(config.token_expiration())?;
            Arc::new(manager)
        }
        StateManagerMode::Cache => {
            let client = cache_client.unwrap_or_else(|| Arc::new(MemoryCache::new()));
            Arc::new(CacheStateManager::new(schema, client, timing, config.token_expiration()))
        }
    };
    tracing::info!(mode = ?config.state_manager_mode, "state manager selected");
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HandlerOutput;
    use crate::state::StateType;
    use crate::types::UpdateStream;
    use serde_json::json;

    fn registry() -> StateRegistry {
        let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
        registry
            .register(
                "state",
                StateType::new("page").field("title", "").handler("load", &[], |ctx, _| {
                    ctx.set("title", "Home")?;
                    Ok(HandlerOutput::None)
                }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_stateless_app() {
        let app = App::builder().build().unwrap();
        assert!(app.schema().is_none());
        let response = app.snapshot(&SnapshotRequest::new("/")).unwrap();
        assert!(response.state.is_none());
        let stream = UpdateStream::new();
        assert!(app.process(Event::new("t", "state.x"), &stream.sender()).is_err());
    }

    #[test]
    fn test_on_load_per_route() {
        let app = App::builder()
            .state(registry())
            .on_load("/", "state.page.load")
            .build()
            .unwrap();
        let home = app.snapshot(&SnapshotRequest::new("/")).unwrap();
        assert_eq!(home.state.unwrap()["state.page"]["title"], json!("Home"));
        let other = app.snapshot(&SnapshotRequest::new("/about")).unwrap();
        assert_eq!(other.state.unwrap()["state.page"]["title"], json!(""));
    }

    #[test]
    fn test_unknown_on_load_handler_rejected() {
        let result = App::builder()
            .state(registry())
            .on_load("/", "state.page.missing")
            .build();
        assert!(matches!(result, Err(SyncError::ConfigValidation(_))));
    }

    #[test]
    fn test_invalid_exception_handler_rejected() {
        let result = App::builder()
            .state(registry())
            .backend_exception_handler(ExceptionHandler::partial("bound", |_, _| Vec::new()))
            .build();
        assert!(matches!(result, Err(SyncError::ConfigValidation(_))));

        let result = App::builder()
            .frontend_exception_handler(ExceptionHandler::closure(|_, _| Vec::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_process_through_app() {
        let app = App::builder().state(registry()).build().unwrap();
        let stream = UpdateStream::new();
        app.process(Event::new("t", "state.page.set_title").with_arg("value", json!("Hi")), &stream.sender())
            .unwrap();
        let tree = app.get_state("t").unwrap();
        assert_eq!(tree.substate("state.page").unwrap().get("title").unwrap().as_str(), Some("Hi"));
    }
}
