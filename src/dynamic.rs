//! Module resolver that loads plugins from shared libraries (`.so`, `.dylib`, `.dll`).
//!
//! A plugin library exports `_plugin_create`, normally through
//! [`declare_plugin!`](crate::declare_plugin). The library must be built with
//! the same compiler and the same version of this crate as the host, since
//! the constructor uses the Rust ABI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use libloading::Library;
use tracing::info;

use crate::loader::{ModuleRequest, ModuleResolver};
use crate::manifest::Manifest;
use crate::plugin::{PluginDefinition, PluginFactory};

/// Symbol every plugin library exports.
pub const CREATE_SYMBOL: &[u8] = b"_plugin_create";

/// Signature of the exported constructor.
pub type CreatePluginFn = fn(&Manifest) -> std::result::Result<PluginDefinition, String>;

/// Export a constructor from a plugin library.
#[macro_export]
macro_rules! declare_plugin {
    ($constructor:path) => {
        #[no_mangle]
        pub fn _plugin_create(
            manifest: &$crate::Manifest,
        ) -> ::std::result::Result<$crate::PluginDefinition, ::std::string::String> {
            $constructor(manifest)
        }
    };
}

struct LibraryFactory {
    _library: Arc<Library>,
    create: CreatePluginFn,
}

impl PluginFactory for LibraryFactory {
    fn create(&self, manifest: &Manifest) -> std::result::Result<PluginDefinition, String> {
        (self.create)(manifest)
    }
}

/// Opens each plugin's main entry as a shared library.
///
/// Libraries stay loaded until evicted.
#[derive(Default)]
pub struct DynamicLibraryResolver {
    libraries: DashMap<PathBuf, Arc<Library>>,
}

impl DynamicLibraryResolver {
    /// Create a resolver with no libraries loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of libraries currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }
}

#[async_trait]
impl ModuleResolver for DynamicLibraryResolver {
    async fn resolve(
        &self,
        request: &ModuleRequest,
    ) -> std::result::Result<Option<Arc<dyn PluginFactory>>, String> {
        // Opening runs the library's initialisers, which may block.
        let main = request.main.clone();
        let library = tokio::task::spawn_blocking(move || {
            // SAFETY: plugin code runs with full host privilege. The loader has
            // already confirmed the main entry lives inside the plugin directory.
            unsafe { Library::new(&main) }
        })
        .await
        .map_err(|e| format!("opening {} did not complete: {}", request.main.display(), e))?
        .map_err(|e| format!("failed to open {}: {}", request.main.display(), e))?;

        // SAFETY: `declare_plugin!` exports the symbol with `CreatePluginFn`'s signature.
        let create = match unsafe { library.get::<CreatePluginFn>(CREATE_SYMBOL) } {
            Ok(symbol) => *symbol,
            Err(_) => return Ok(None),
        };

        let library = Arc::new(library);
        self.libraries.insert(request.main.clone(), library.clone());
        info!(plugin = %request.name, path = %request.main.display(), "Opened plugin library");

        Ok(Some(Arc::new(LibraryFactory {
            _library: library,
            create,
        })))
    }

    fn evict(&self, main: &Path) {
        self.libraries.remove(main);
    }
}

impl std::fmt::Debug for DynamicLibraryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibraryResolver")
            .field("loaded_count", &self.libraries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(main: PathBuf) -> ModuleRequest {
        ModuleRequest {
            name: "native".to_string(),
            plugin_dir: main.parent().map(Path::to_path_buf).unwrap_or_default(),
            main,
            manifest: Manifest::new("native", "1.0.0", "libnative.so"),
        }
    }

    #[tokio::test]
    async fn test_unopenable_library_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let main = tmp.path().join("libnative.so");
        std::fs::write(&main, b"not a shared object").unwrap();

        let resolver = DynamicLibraryResolver::new();
        let result = resolver.resolve(&request(main)).await;

        assert!(result.is_err());
        assert_eq!(resolver.loaded_count(), 0);
    }
}
