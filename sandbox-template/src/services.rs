use std::collections::BTreeMap as Map;

use crate::{
    error::Result,
    models::{
        Alias, BuildRequest, BuiltImage, Capacity, CommandOutput, InstanceId, TemplateDefinition,
    },
};

pub trait TemplateFrontend {
    fn definition(&mut self) -> Result<TemplateDefinition>;
}

/// A service that turns image specs into named images and runs instances of
/// them.
pub trait SandboxService {
    /// Builds `request.image` and registers it under `request.alias`.
    /// Progress lines are handed to `progress` as they arrive.
    fn build_template(
        &mut self,
        request: &BuildRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<BuiltImage>;

    /// Starts one instance of `alias`. Build-time environment variables are
    /// not carried over, every variable the instance needs goes in
    /// `runtime_env`.
    fn acquire_instance(
        &mut self,
        alias: &Alias,
        runtime_env: &Map<String, String>,
        capacity: &Capacity,
    ) -> Result<Box<dyn SandboxInstance>>;
}

pub trait SandboxInstance {
    fn id(&self) -> &InstanceId;

    /// Runs `command` through a shell. A nonzero exit is not an error.
    fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    fn kill(&mut self) -> Result<()>;
}
