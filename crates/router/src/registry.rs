use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use shared::protocol::ActionSummary;
use thiserror::Error;
use tracing::{debug, warn};

use crate::handler::{ActionHandler, RequestValidator};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action name cannot be empty")]
    EmptyName,
    #[error("action '{0}' is already registered")]
    DuplicateAction(String),
}

/// Per-action metadata supplied at registration time.
#[derive(Clone, Default)]
pub struct ActionOptions {
    pub description: String,
    pub require_auth_token: bool,
    pub required_capability: Option<String>,
    pub validate: Option<Arc<dyn RequestValidator>>,
    pub log_requests: bool,
    /// Allow replacing an action registered under the same name.
    pub replace: bool,
}

impl ActionOptions {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn require_auth_token(mut self) -> Self {
        self.require_auth_token = true;
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    pub fn validator(mut self, validator: impl RequestValidator + 'static) -> Self {
        self.validate = Some(Arc::new(validator));
        self
    }

    pub fn log_requests(mut self) -> Self {
        self.log_requests = true;
        self
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }
}

impl fmt::Debug for ActionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionOptions")
            .field("description", &self.description)
            .field("require_auth_token", &self.require_auth_token)
            .field("required_capability", &self.required_capability)
            .field("has_validator", &self.validate.is_some())
            .field("log_requests", &self.log_requests)
            .field("replace", &self.replace)
            .finish()
    }
}

pub struct ActionDescriptor {
    name: String,
    handler: Arc<dyn ActionHandler>,
    description: String,
    require_auth_token: bool,
    required_capability: Option<String>,
    validate: Option<Arc<dyn RequestValidator>>,
    log_requests: bool,
}

impl ActionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &dyn ActionHandler {
        self.handler.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn require_auth_token(&self) -> bool {
        self.require_auth_token
    }

    pub fn required_capability(&self) -> Option<&str> {
        self.required_capability.as_deref()
    }

    pub fn validator(&self) -> Option<&dyn RequestValidator> {
        self.validate.as_deref()
    }

    pub fn log_requests(&self) -> bool {
        self.log_requests
    }

    pub fn summary(&self) -> ActionSummary {
        ActionSummary {
            description: self.description.clone(),
            require_auth_token: self.require_auth_token,
            required_capability: self.required_capability.clone(),
        }
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("require_auth_token", &self.require_auth_token)
            .field("required_capability", &self.required_capability)
            .field("log_requests", &self.log_requests)
            .finish_non_exhaustive()
    }
}

/// Name → descriptor table. Populated during startup, then moved into an
/// [`crate::ActionRouter`] which only reads it.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl ActionHandler + 'static,
        options: ActionOptions,
    ) -> Result<(), RegistryError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.actions.contains_key(&name) {
            if !options.replace {
                return Err(RegistryError::DuplicateAction(name));
            }
            warn!(action = %name, "registry: replacing existing action");
        }

        debug!(
            action = %name,
            require_auth_token = options.require_auth_token,
            required_capability = options.required_capability.as_deref().unwrap_or(""),
            "registry: action registered"
        );
        let descriptor = ActionDescriptor {
            name: name.clone(),
            handler: Arc::new(handler),
            description: options.description,
            require_auth_token: options.require_auth_token,
            required_capability: options.required_capability,
            validate: options.validate,
            log_requests: options.log_requests,
        };
        self.actions.insert(name, descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summaries(&self) -> BTreeMap<String, ActionSummary> {
        self.actions
            .iter()
            .map(|(name, descriptor)| (name.clone(), descriptor.summary()))
            .collect()
    }
}
