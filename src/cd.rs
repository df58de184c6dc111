//! Scoped working-directory helpers built on top of [`crate::config`].

use std::env;
use std::path::Path;

use crate::config::{self, ConfigMap, ConfigValue, ScopedContext};
use crate::error::Error;

/// Sugar for `settings({quiet: true})`.
pub fn hide() -> ScopedContext {
    config::settings([("quiet".to_string(), ConfigValue::Bool(true))].into())
}

/// Scoped `remote_working_dir` override, applied by the Remote Executor as a `cd` prefix.
pub fn rcd(dir: impl Into<String>) -> ScopedContext {
    config::settings([("remote_working_dir".to_string(), ConfigValue::Str(dir.into()))].into())
}

/// Scoped local `chdir`: changes the process's current directory on entry and restores it
/// via a cleanup callback on exit.
pub fn lcd(dir: impl AsRef<Path>) -> Result<ScopedContext, Error> {
    let previous = env::current_dir().map_err(Error::IOError)?;
    env::set_current_dir(&dir).map_err(Error::IOError)?;

    let scope = config::settings(ConfigMap::new());
    config::add_cleanup(move || {
        let _ = env::set_current_dir(&previous);
    })?;
    Ok(scope)
}
