use thiserror::Error;

use crate::container::{ContainerError, TypeKey};
use crate::server::ServerError;

/// Failure while building the module graph. Fatal: the app is not constructed.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("module '{module}' exports `{export}` but does not provide it")]
    UnmatchedExport {
        module: &'static str,
        export: TypeKey,
    },

    #[error("failed to create the scope of module '{module}'")]
    Scope {
        module: &'static str,
        #[source]
        source: ContainerError,
    },

    #[error("failed to register provider `{provider}` of module '{module}'")]
    Provider {
        module: &'static str,
        provider: TypeKey,
        #[source]
        source: ContainerError,
    },

    #[error("failed to register or resolve the controllers of module '{module}'")]
    Controllers {
        module: &'static str,
        #[source]
        source: ContainerError,
    },

    #[error("controller '{controller}' of module '{module}' failed to build")]
    Controller {
        module: &'static str,
        controller: &'static str,
        #[source]
        source: ControllerError,
    },

    #[error("module '{import}' imported by '{module}' failed to build")]
    Import {
        module: &'static str,
        import: &'static str,
        #[source]
        source: Box<BuildError>,
    },

    #[error("failed to expose `{export}` of module '{module}' to its importer")]
    Export {
        module: &'static str,
        export: TypeKey,
        #[source]
        source: ContainerError,
    },

    #[error("failed to provide the HTTP server in the root scope")]
    Server(#[source] ContainerError),
}

impl BuildError {
    /// The innermost build error, skipping `Import` wrappers.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Import { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to resolve {site} guards")]
    Guards {
        site: String,
        #[source]
        source: ContainerError,
    },

    #[error("failed to register route '{pattern}'")]
    Route {
        pattern: String,
        #[source]
        source: ServerError,
    },
}
