//! Test support: text-described modules and on-disk deployments
//!
//! A fixture module is a `<name>.mod` file on the search path. Each line is a
//! directive:
//!
//! ```text
//! import dep other        import modules through the search path
//! value word delta        export a value
//! app app aries $KEY      export an app whose body is its tokens joined by spaces
//! broken_app app message  export an app that fails when called
//! fail message            fail to initialize
//! panic                   panic while initializing
//! ```
//!
//! Body tokens: `$KEY` reads the request environment, `@module.name` reads a
//! value exported by an imported module, `!message` yields an error chunk,
//! `%panic` panics while producing, anything else is literal text.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use tenant_gateway_sdk::{Body, Chunk, Environ, Exports, HandlerError, Importer, StartResponse};

use super::loader::{ImportScope, ModuleLoader};
use super::namespace::Module;
use crate::config::RouterConfig;
use crate::error::LoadError;

pub(crate) struct FixtureLoader;

impl ModuleLoader for FixtureLoader {
    fn load(&self, name: &str, scope: &mut ImportScope<'_>) -> Result<Module, LoadError> {
        let path = scope
            .find(&format!("{}.mod", name))
            .ok_or_else(|| scope.not_found(name))?;
        let source = fs::read_to_string(&path).map_err(|e| LoadError::Library {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let init_error = |message: String| LoadError::Init {
            module: name.to_string(),
            message,
        };

        let mut exports = Exports::new();
        let mut imports: HashMap<String, Arc<Exports>> = HashMap::new();

        for line in source.lines() {
            let mut words = line.split_whitespace();
            let Some(directive) = words.next() else { continue };
            let rest: Vec<String> = words.map(str::to_string).collect();

            match directive {
                "import" => {
                    for dep in rest {
                        let module = scope.import(&dep).map_err(|e| init_error(e.to_string()))?;
                        imports.insert(dep, module);
                    }
                }
                "value" => {
                    let (key, value) = rest.split_first().ok_or_else(|| init_error("value needs a name".into()))?;
                    exports = exports.with_value(key.clone(), value.join(" "));
                }
                "app" => {
                    let (attribute, tokens) = rest.split_first().ok_or_else(|| init_error("app needs a name".into()))?;
                    exports = exports.with_app(
                        attribute.clone(),
                        FixtureApp {
                            tokens: tokens.to_vec(),
                            imports: imports.clone(),
                        },
                    );
                }
                "broken_app" => {
                    let (attribute, message) = rest.split_first().ok_or_else(|| init_error("broken_app needs a name".into()))?;
                    let message = message.join(" ");
                    exports = exports.with_app(
                        attribute.clone(),
                        move |_: &Environ, _: &mut dyn StartResponse| -> Result<Body, HandlerError> {
                            Err(HandlerError::failed(message.clone()))
                        },
                    );
                }
                "fail" => return Err(init_error(rest.join(" "))),
                "panic" => panic!("fixture module {} panicked", name),
                other => return Err(init_error(format!("unknown directive {}", other))),
            }
        }

        Ok(Module::new(name, path, exports))
    }
}

/// A `FixtureLoader` that counts how often each module is loaded from disk
#[derive(Clone, Default)]
pub(crate) struct CountingLoader {
    loads: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingLoader {
    pub fn loads(&self, name: &str) -> usize {
        self.loads.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl ModuleLoader for CountingLoader {
    fn load(&self, name: &str, scope: &mut ImportScope<'_>) -> Result<Module, LoadError> {
        *self.loads.lock().unwrap().entry(name.to_string()).or_default() += 1;
        // Widen the window in which concurrent first requests overlap
        std::thread::sleep(Duration::from_millis(20));
        FixtureLoader.load(name, scope)
    }
}

struct FixtureApp {
    tokens: Vec<String>,
    imports: HashMap<String, Arc<Exports>>,
}

impl tenant_gateway_sdk::App for FixtureApp {
    fn call(&self, environ: &Environ, start_response: &mut dyn StartResponse) -> Result<Body, HandlerError> {
        start_response.start(200, vec![("Content-Type".into(), "text/plain".into())]);

        let environ = environ.clone();
        let imports = self.imports.clone();
        let pieces: Vec<String> = self
            .tokens
            .iter()
            .enumerate()
            .flat_map(|(i, token)| {
                let separator = (i > 0).then(|| " ".to_string());
                separator.into_iter().chain(std::iter::once(token.clone()))
            })
            .collect();

        Ok(Body::new(pieces.into_iter().map(move |piece| render(&piece, &environ, &imports))))
    }
}

fn render(piece: &str, environ: &Environ, imports: &HashMap<String, Arc<Exports>>) -> Result<Chunk, HandlerError> {
    if let Some(key) = piece.strip_prefix('$') {
        return environ
            .get(key)
            .map(|v| Chunk::from(v.to_string()))
            .ok_or_else(|| HandlerError::failed(format!("missing {}", key)));
    }
    if let Some(reference) = piece.strip_prefix('@') {
        let (module, name) = reference.split_once('.').unwrap_or((reference, ""));
        return imports
            .get(module)
            .and_then(|exports| exports.value(name))
            .map(|v| Chunk::from(v.to_string()))
            .ok_or_else(|| HandlerError::failed(format!("{} has no value {}", module, name)));
    }
    if let Some(message) = piece.strip_prefix('!') {
        return Err(HandlerError::failed(message.to_string()));
    }
    if piece == "%panic" {
        panic!("fixture body panicked");
    }
    Ok(Chunk::from(piece.to_string()))
}

/// A temporary base directory holding tenant deployments
pub(crate) struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Set a directory's modification time to `secs` after the epoch
    pub fn touch(&self, relative: &str, secs: u64) {
        let dir = fs::File::open(self.path(relative)).unwrap();
        dir.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    /// Router configuration rooted at the sandbox with a fast change detector
    pub fn config(&self) -> RouterConfig {
        RouterConfig {
            base_path: self.base().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            ..RouterConfig::default()
        }
    }

    /// Three tenants: plain, a dependency next to the code, and a dependency
    /// in the private dependency root. Two of them define a module called `dep`.
    pub fn zodiac(&self) {
        self.write("aries/wsgi/app.mod", "app app aries $SCRIPT_NAME");
        self.write("taurus/wsgi/app.mod", "import dep\napp app taurus @dep.word");
        self.write("taurus/wsgi/dep.mod", "value word delta");
        self.write("virgo/wsgi/app.mod", "import dep\napp app virgo @dep.flag");
        self.write("virgo/.venv/lib/python3.12/site-packages/dep.mod", "value flag true");
    }
}

/// A request for `host` with `SCRIPT_NAME=test`
pub(crate) fn environ(host: &str) -> Environ {
    Environ::new().with("HTTP_HOST", host).with("SCRIPT_NAME", "test")
}

/// Drain a body into a string
pub(crate) fn drain<I>(body: I) -> Result<String, HandlerError>
where
    I: Iterator<Item = Result<Chunk, HandlerError>>,
{
    let mut out = Vec::new();
    for chunk in body {
        out.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8(out).unwrap())
}

/// A start_response that ignores the head
pub(crate) fn ignore_head() -> impl FnMut(u16, Vec<(String, String)>) {
    |_, _| {}
}
