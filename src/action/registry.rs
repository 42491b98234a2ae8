//! Action Registry
//!
//! A table of action plugins keyed by the `module` property of Action
//! blocks. Each entry holds the plugin's default parameters and a factory
//! building a fresh action instance from resolved parameters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use super::builtin;
use super::lifecycle::{Action, ActionError};
use super::params::{parse_default_parameters, resolve_parameters, ParameterSet};
use crate::error::SequenceError;
use crate::sequence::{Block, BlockType, Sequence};

/// Builds an action instance from its resolved parameters.
pub type ActionFactory =
    Arc<dyn Fn(&ParameterSet) -> Result<Box<dyn Action>, ActionError> + Send + Sync>;

/// A registered action plugin.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub defaults: ParameterSet,
    factory: ActionFactory,
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Table of action plugins.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        if let Err(e) = builtin::register_builtins(&mut registry) {
            warn!("Built-in actions unavailable: {}", e);
        }
        registry
    }

    /// Registers an action plugin, replacing any plugin of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, defaults: ParameterSet, factory: F)
    where
        F: Fn(&ParameterSet) -> Result<Box<dyn Action>, ActionError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering action '{}' ({} parameters)", name, defaults.len());
        self.actions.insert(
            name.clone(),
            ActionDescriptor {
                name,
                defaults,
                factory: Arc::new(factory),
            },
        );
    }

    /// Registers an action plugin whose defaults are given as text.
    pub fn register_with_text<F>(
        &mut self,
        name: impl Into<String>,
        parameters: &str,
        factory: F,
    ) -> Result<(), SequenceError>
    where
        F: Fn(&ParameterSet) -> Result<Box<dyn Action>, ActionError> + Send + Sync + 'static,
    {
        let name = name.into();
        let defaults = parse_default_parameters(parameters).map_err(|e| {
            SequenceError::action(format!(
                "Error while parsing parameters of action module '{}': {}",
                name, e
            ))
        })?;
        self.register(name, defaults, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn descriptor_for(&self, block: &Block) -> Result<&ActionDescriptor, SequenceError> {
        let module = block.properties.module.as_deref().unwrap_or("");
        self.actions.get(module).ok_or_else(|| {
            SequenceError::action(format!(
                "Action module '{}' not found for block '{}'",
                module, block.id
            ))
        })
    }

    /// Casts the parameters of an Action block against its plugin defaults.
    pub fn resolve(&self, block: &Block) -> Result<ParameterSet, SequenceError> {
        let descriptor = self.descriptor_for(block)?;
        resolve_parameters(&block.id, &descriptor.defaults, &block.parameters)
    }

    /// Builds the action instance of an Action block.
    pub fn create(&self, block: &Block) -> Result<(Box<dyn Action>, ParameterSet), SequenceError> {
        let descriptor = self.descriptor_for(block)?;
        let parameters = resolve_parameters(&block.id, &descriptor.defaults, &block.parameters)?;
        let action = (descriptor.factory)(&parameters).map_err(|e| {
            SequenceError::action(format!("Action '{}' could not be created: {}", block.id, e))
        })?;
        Ok((action, parameters))
    }

    /// Checks every Action block of a sequence tree against the registry.
    pub fn check_sequence(&self, sequence: &Sequence) -> Result<(), SequenceError> {
        for block in sequence
            .blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Action)
        {
            self.resolve(block)?;
        }
        for sub in sequence.subsequences.values() {
            self.check_sequence(sub)?;
        }
        if let Some(backup) = &sequence.backup {
            self.check_sequence(backup)?;
        }
        Ok(())
    }
}
