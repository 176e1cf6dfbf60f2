use std::collections::BTreeMap;
use std::env::consts::EXE_SUFFIX;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addon_plugin::Addon;
use tracing::{debug, warn};

/// Builds a fresh instance of a built-in addon.
pub type AddonFactory = Arc<dyn Fn() -> Arc<dyn Addon> + Send + Sync>;

/// Where the code of an addon comes from.
#[derive(Clone)]
pub enum EntryPoint {
    /// Compiled into the host.
    Builtin(AddonFactory),
    /// Standalone worker executable speaking the envelope protocol on stdio.
    Executable(PathBuf),
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Builtin(_) => f.write_str("Builtin"),
            EntryPoint::Executable(path) => f.debug_tuple("Executable").field(path).finish(),
        }
    }
}

/// Built-in addons known to the host.
#[derive(Clone, Default)]
pub struct AddonCatalog {
    builtins: BTreeMap<String, AddonFactory>,
}

impl AddonCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the addons shipped with the host.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(addon_echo::NAME, || -> Arc<dyn Addon> { Arc::new(addon_echo::EchoAddon::default()) });
        catalog
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Addon> + Send + Sync + 'static,
    {
        self.builtins.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn builtin(&self, name: &str) -> Option<Arc<dyn Addon>> {
        self.builtins.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.builtins.keys().cloned().collect()
    }

    /// Built-ins win over executables found under `root/addons`.
    pub fn resolve(&self, root: &Path, name: &str) -> Option<EntryPoint> {
        if let Some(factory) = self.builtins.get(name) {
            return Some(EntryPoint::Builtin(factory.clone()));
        }
        find_executable(root, name).map(EntryPoint::Executable)
    }
}

/// `root/addons/<name>/<name>` or `root/addons/<name>/addon`.
pub fn find_executable(root: &Path, name: &str) -> Option<PathBuf> {
    let dir = root.join("addons").join(name);
    [name, "addon"]
        .iter()
        .map(|file| dir.join(format!("{file}{EXE_SUFFIX}")))
        .find(|path| path.is_file())
}

/// Names of the addon directories under `root/addons` that hold an executable.
pub fn discover_addons(root: &Path) -> Vec<String> {
    let dir = root.join("addons");
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("no addons directory at {}: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!("skipping addon directory with a non UTF-8 name: {}", path.display());
            continue;
        };
        if find_executable(root, name).is_some() {
            names.push(name.to_string());
        } else {
            debug!("{} holds no addon executable", path.display());
        }
    }
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtins_resolve_before_disk() {
        let root = tempdir().unwrap();
        let catalog = AddonCatalog::with_builtins();
        assert!(matches!(catalog.resolve(root.path(), "echo"), Some(EntryPoint::Builtin(_))));
        assert!(catalog.resolve(root.path(), "weather").is_none());
        assert_eq!(catalog.builtin("echo").unwrap().info().name, "echo");
        assert_eq!(catalog.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn executables_are_discovered() {
        let root = tempdir().unwrap();
        let weather = root.path().join("addons").join("weather");
        std::fs::create_dir_all(&weather).unwrap();
        std::fs::write(weather.join(format!("addon{EXE_SUFFIX}")), b"").unwrap();
        std::fs::create_dir_all(root.path().join("addons").join("empty")).unwrap();

        assert_eq!(discover_addons(root.path()), vec!["weather".to_string()]);
        match AddonCatalog::new().resolve(root.path(), "weather") {
            Some(EntryPoint::Executable(path)) => assert!(path.ends_with(format!("addon{EXE_SUFFIX}"))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
