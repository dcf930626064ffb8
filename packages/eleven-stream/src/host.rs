//! The capabilities this plugin consumes from its host.
//!
//! A host exposes a command registry, a service registry and a real-time
//! audio-output channel. [`HostRegistry`] is a small in-memory version of all
//! three for hosts that do not bring their own, and for tests.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::Result;

/// Service name the host's audio-output channel is registered under.
pub const AUDIO_OUTPUT_SERVICE: &str = "sip_audio_out_chunk";

/// Real-time audio sink, e.g. the outbound leg of a SIP call.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Deliver one chunk. `Ok(false)` asks the sender to stop streaming.
    async fn send_chunk(&self, chunk: Bytes) -> Result<bool>;
}

/// Looks up per-agent persona settings.
#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    async fn voice_id(&self, agent_name: &str) -> Option<String>;
}

/// Everything the host hands a command for one invocation.
#[derive(Clone, Default)]
pub struct CommandContext {
    pub agent_name: Option<String>,
    pub audio_output: Option<Arc<dyn AudioOutput>>,
    pub personas: Option<Arc<dyn PersonaDirectory>>,
}

impl CommandContext {
    pub fn with_audio_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.audio_output = Some(output);
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }
}

/// An action agents can invoke by name.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the command's arguments.
    fn parameters(&self) -> Value;

    /// Always produces text for the agent, including on failure.
    async fn call(&self, args: Value, ctx: &CommandContext) -> String;
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("command not found: {0}")]
    CommandNotFound(String),
}

type ServiceEntry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct HostRegistry {
    commands: RwLock<HashMap<String, Arc<dyn Command>>>,
    services: RwLock<HashMap<String, ServiceEntry>>,
    personas: RwLock<Option<Arc<dyn PersonaDirectory>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(&self, command: Arc<dyn Command>) {
        let name = command.name().to_string();
        info!(command = %name, "Registering command");
        self.commands.write().insert(name, command);
    }

    pub fn command(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.read().get(name).cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.commands.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `service` under `name`, replacing any previous entry.
    ///
    /// Look it up again with [`HostRegistry::service`] using the same type.
    pub fn register_service<S>(&self, name: &str, service: S)
    where
        S: Clone + Send + Sync + 'static,
    {
        info!(service = name, "Registering service");
        self.services
            .write()
            .insert(name.to_string(), Arc::new(service));
    }

    pub fn service<S>(&self, name: &str) -> Option<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let entry = self.services.read().get(name).cloned()?;
        match entry.downcast_ref::<S>() {
            Some(service) => Some(service.clone()),
            None => {
                debug!(service = name, "Service registered with a different type");
                None
            }
        }
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn set_audio_output(&self, output: Arc<dyn AudioOutput>) {
        self.register_service(AUDIO_OUTPUT_SERVICE, output);
    }

    pub fn audio_output(&self) -> Option<Arc<dyn AudioOutput>> {
        self.service(AUDIO_OUTPUT_SERVICE)
    }

    pub fn set_personas(&self, personas: Arc<dyn PersonaDirectory>) {
        *self.personas.write() = Some(personas);
    }

    /// Build the context for an invocation from the capabilities registered right now.
    pub fn context(&self, agent_name: Option<&str>) -> CommandContext {
        CommandContext {
            agent_name: agent_name.map(str::to_string),
            audio_output: self.audio_output(),
            personas: self.personas.read().clone(),
        }
    }

    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        agent_name: Option<&str>,
    ) -> std::result::Result<String, HostError> {
        let command = self
            .command(name)
            .ok_or_else(|| HostError::CommandNotFound(name.to_string()))?;
        let ctx = self.context(agent_name);
        debug!(command = name, "Invoking command");
        Ok(command.call(args, &ctx).await)
    }
}
