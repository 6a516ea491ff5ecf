//! Modules at rest ([`JsModule`]), modules registered in a context
//! ([`JsHandle`]), and the resolver/loader pair the engine uses for imports.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module};
use tracing::{debug, trace};

use crate::context::ContextId;
use crate::error::{ContextError, Result};

/// File extensions picked up by [`JsModule::load_dir`] and tried when an
/// import specifier omits one.
pub const MODULE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// An unloaded module: a filename and its source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsModule {
    filename: String,
    contents: String,
}

impl JsModule {
    /// Create an in-memory module. The filename is an identifier and need not exist on disk.
    pub fn new(filename: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            contents: contents.into(),
        }
    }

    /// Read a module from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ContextError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => ContextError::Io(e),
        })?;
        Ok(Self::new(path.to_string_lossy(), contents))
    }

    /// Read every module file in `directory`, sorted by path.
    ///
    /// Fails on the first file that cannot be read.
    pub fn load_dir(directory: impl AsRef<Path>) -> Result<Vec<Self>> {
        let directory = directory.as_ref();
        if !directory.exists() {
            return Err(ContextError::FileNotFound {
                path: directory.to_path_buf(),
            });
        }
        if !directory.is_dir() {
            return Err(ContextError::NotADirectory {
                path: directory.to_path_buf(),
            });
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            let is_module = path
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext));
            if is_module && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        debug!(directory = %directory.display(), count = paths.len(), "Loading module directory");
        paths.iter().map(Self::load).collect()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }
}

/// A module registered inside a specific [`Context`](crate::Context).
///
/// Only [`Context::load_module`](crate::Context::load_module) creates handles.
/// A handle is meaningless to any other context.
#[derive(Debug, Clone)]
pub struct JsHandle {
    context: ContextId,
    id: u64,
    module: JsModule,
}

impl JsHandle {
    pub(crate) fn new(context: ContextId, id: u64, module: JsModule) -> Self {
        Self {
            context,
            id,
            module,
        }
    }

    pub fn filename(&self) -> &str {
        self.module.filename()
    }

    pub fn contents(&self) -> &str {
        self.module.contents()
    }

    /// The context that owns this handle.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Import resolution state shared between a context and its loader.
#[derive(Debug)]
pub(crate) struct ModuleRegistry {
    current_dir: PathBuf,
    sources: HashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new(current_dir: PathBuf) -> Self {
        Self {
            current_dir,
            sources: HashMap::new(),
        }
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    pub fn set_current_dir(&mut self, dir: PathBuf) {
        self.current_dir = dir;
    }

    /// Make an in-memory module importable under its filename.
    pub fn register(&mut self, module: &JsModule) {
        self.sources
            .insert(module.filename().to_string(), module.contents().to_string());
    }

    fn is_registered(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Resolve `specifier` imported from the module named `base`.
    ///
    /// In-memory modules win over the filesystem. Relative specifiers are
    /// joined to the importer's directory; importers without one (in-memory
    /// names such as `main.js`) resolve against `current_dir` on disk.
    pub fn resolve(&self, base: &str, specifier: &str) -> Option<String> {
        let specifier = specifier.trim();
        if specifier.is_empty() {
            return None;
        }
        if self.is_registered(specifier) {
            return Some(specifier.to_string());
        }

        let is_relative = specifier.starts_with("./") || specifier.starts_with("../");
        let is_absolute = Path::new(specifier).is_absolute();
        if !is_relative && !is_absolute {
            return None;
        }

        let base_dir = Path::new(base)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if is_relative {
            let in_memory = normalize(&base_dir.unwrap_or(Path::new("")).join(specifier));
            let in_memory = in_memory.to_string_lossy();
            if self.is_registered(&in_memory) {
                return Some(in_memory.into_owned());
            }
        }

        let on_disk = if is_absolute {
            PathBuf::from(specifier)
        } else {
            let dir = match base_dir {
                Some(dir) if dir.is_absolute() => dir.to_path_buf(),
                Some(dir) => self.current_dir.join(dir),
                None => self.current_dir.clone(),
            };
            normalize(&dir.join(specifier))
        };
        existing_module_file(&on_disk).map(|path| path.to_string_lossy().into_owned())
    }

    /// Source for a resolved module name.
    pub fn source(&self, name: &str) -> std::result::Result<String, String> {
        if let Some(source) = self.sources.get(name) {
            return Ok(source.clone());
        }
        fs::read_to_string(name).map_err(|e| e.to_string())
    }
}

fn existing_module_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if path.extension().is_none() {
        for ext in MODULE_EXTENSIONS {
            let candidate = path.with_extension(ext);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    if path.is_dir() {
        return MODULE_EXTENSIONS
            .iter()
            .map(|ext| path.join(format!("index.{ext}")))
            .find(|candidate| candidate.is_file());
    }
    None
}

/// Lexically collapse `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryResolver {
    registry: Rc<RefCell<ModuleRegistry>>,
}

impl RegistryResolver {
    pub fn new(registry: Rc<RefCell<ModuleRegistry>>) -> Self {
        Self { registry }
    }
}

impl Resolver for RegistryResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        match self.registry.borrow().resolve(base, name) {
            Some(resolved) => {
                trace!(base, specifier = name, resolved = %resolved, "Resolved import");
                Ok(resolved)
            }
            None => Err(rquickjs::Error::new_resolving_message(
                base,
                name,
                format!("cannot resolve module specifier `{name}`"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryLoader {
    registry: Rc<RefCell<ModuleRegistry>>,
}

impl RegistryLoader {
    pub fn new(registry: Rc<RefCell<ModuleRegistry>>) -> Self {
        Self { registry }
    }
}

impl Loader for RegistryLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self
            .registry
            .borrow()
            .source(name)
            .map_err(|message| rquickjs::Error::new_loading_message(name, message))?;
        debug!(module = name, "Loading imported module");
        Module::declare(ctx.clone(), name, source)
    }
}
