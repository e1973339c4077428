use jpnative_core::binding::FixedOpener;
use jpnative_core::build::{CompileRequest, LinkRequest};
use jpnative_core::{
    load, BindError, BuildDriver, BuildError, CancellationToken, LoadError, LoaderConfig,
    ManifestError, ModuleLoadService, ModuleManifest, ModuleRegistry, Platform, RegistryError,
    ScriptValue, StaticSymbols, Toolchain,
};
use serde_json::json;
use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

extern "C" fn jp_add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn jp_scale(value: f64, factor: f64) -> f64 {
    value * factor
}

static DISPOSED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn jp_counter_dispose() {
    DISPOSED.fetch_add(1, Ordering::SeqCst);
}

#[derive(Debug, Default)]
struct FakeToolchain {
    compiles: AtomicUsize,
    started: AtomicBool,
    compile_delay: Option<Duration>,
    block_until_cancelled: bool,
}

impl Toolchain for FakeToolchain {
    fn fingerprint(&self) -> String {
        "fake:integration".to_string()
    }

    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        if let Some(delay) = self.compile_delay {
            thread::sleep(delay);
        }
        if self.block_until_cancelled {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !cancel.is_cancelled() {
                assert!(Instant::now() < deadline, "compile was never cancelled");
                thread::sleep(Duration::from_millis(5));
            }
            return Err(BuildError::Cancelled);
        }
        std::fs::write(request.object, b"obj").unwrap();
        Ok(())
    }

    fn link(
        &self,
        request: &LinkRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        std::fs::write(request.output, b"lib").unwrap();
        Ok(())
    }
}

fn symbols() -> StaticSymbols {
    StaticSymbols::new()
        .with("jp_add", jp_add as *const c_void)
        .with("jp_scale", jp_scale as *const c_void)
        .with("jp_counter_dispose", jp_counter_dispose as *const c_void)
}

fn service_with(root: &Path, toolchain: Arc<FakeToolchain>) -> ModuleLoadService {
    let mut config = LoaderConfig::new(root, Platform::Linux);
    config.persistent_cache = false;
    let driver = BuildDriver::with_toolchain(config, toolchain).unwrap();
    ModuleLoadService::with_parts(
        Arc::new(driver),
        Arc::new(FixedOpener::new(Arc::new(symbols()))),
        Arc::new(ModuleRegistry::new()),
    )
}

fn math_manifest(name: &str, cpp_name: &str) -> ModuleManifest {
    load(
        &json!({
            "name": name,
            "version": "1.0.0",
            "description": "native math helpers",
            "native": true,
            "custom_code": format!("int {cpp_name}(int a, int b){{return a+b;}}"),
            "functions": {
                "add": {
                    "cpp_name": cpp_name,
                    "params": [{ "name": "a", "type": "int" }, { "name": "b", "type": "int" }],
                    "return": { "type": "int" }
                }
            }
        })
        .to_string(),
    )
    .unwrap()
}

#[test]
fn native_module_loads_and_calls_bound_functions() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain::default());
    let service = service_with(dir.path(), toolchain.clone());

    let module = service.load_manifest(math_manifest("math", "jp_add")).unwrap();

    let add = module.function("add").unwrap();
    assert_eq!(add.signature(), "int jp_add(int a, int b)");
    assert_eq!(
        add.call(&[ScriptValue::Int(2), ScriptValue::Int(3)]).unwrap(),
        ScriptValue::Int(5)
    );
    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(service.registry().list(), vec!["math".to_string()]);

    let info = service.registry().info("math").unwrap();
    assert!(info.native);
    assert!(!info.bundled);
    assert_eq!(info.functions.len(), 1);
}

#[test]
fn script_only_module_never_reaches_the_build_driver() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain::default());
    let service = service_with(dir.path(), toolchain.clone());
    let manifest = load(
        &json!({
            "name": "strings",
            "version": "0.1.0",
            "description": "pure script helpers",
            "functions": {
                "shout": { "params": [{ "name": "s", "type": "string" }], "return": { "type": "string" } }
            }
        })
        .to_string(),
    )
    .unwrap();

    let module = service.load_manifest(manifest).unwrap();

    assert!(module.artifact.is_none());
    assert!(module.functions.is_empty());
    assert_eq!(service.driver().toolchain_invocations(), 0);
    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 0);
    assert!(service.registry().contains("strings"));
}

#[test]
fn invalid_manifest_file_leaves_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), Arc::new(FakeToolchain::default()));
    let manifest_path = dir.path().join("module.json");
    std::fs::write(
        &manifest_path,
        json!({ "name": "broken", "description": "no version", "functions": {} }).to_string(),
    )
    .unwrap();

    let err = service.load_file(&manifest_path).unwrap_err();

    match err {
        LoadError::Manifest(ManifestError::MissingRequiredField(field)) => {
            assert_eq!(field, "version")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(service.registry().is_empty());
    assert_eq!(service.driver().toolchain_invocations(), 0);
}

#[test]
fn concurrent_loads_of_one_name_build_once() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain {
        compile_delay: Some(Duration::from_millis(50)),
        ..FakeToolchain::default()
    });
    let service = service_with(dir.path(), toolchain.clone());

    let workers = (0..2)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || service.load_manifest(math_manifest("math", "jp_add")))
        })
        .collect::<Vec<_>>();
    let results = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect::<Vec<_>>();

    let loaded = results.iter().filter(|result| result.is_ok()).count();
    let already = results
        .iter()
        .filter(|result| matches!(result, Err(err) if err.is_already_loaded()))
        .count();
    assert_eq!((loaded, already), (1, 1));
    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(service.registry().len(), 1);
}

#[test]
fn different_names_load_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain {
        compile_delay: Some(Duration::from_millis(20)),
        ..FakeToolchain::default()
    });
    let service = service_with(dir.path(), toolchain.clone());

    let first = service.spawn_load(math_manifest("math", "jp_add"));
    let second = service.spawn_load(math_manifest("more_math", "jp_add"));
    assert_eq!(first.name(), "math");

    first.wait().unwrap();
    second.wait().unwrap();
    assert_eq!(
        service.registry().list(),
        vec!["math".to_string(), "more_math".to_string()]
    );
    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 2);
}

#[test]
fn unresolved_symbol_registers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain::default());
    let service = service_with(dir.path(), toolchain.clone());

    let err = service
        .load_manifest(math_manifest("math", "jp_missing"))
        .unwrap_err();

    match err {
        LoadError::Bind(BindError::SymbolNotFound { function, symbol }) => {
            assert_eq!(function, "add");
            assert_eq!(symbol, "jp_missing");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!service.registry().contains("math"));
    assert_eq!(service.driver().cache().memory_len(), 0);

    let retry = service
        .load_manifest(math_manifest("math", "jp_missing"))
        .unwrap_err();
    assert!(matches!(
        retry,
        LoadError::Bind(BindError::SymbolNotFound { .. })
    ));
    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 2);
}

#[test]
fn reload_in_fresh_registry_reuses_cached_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain::default());
    let mut config = LoaderConfig::new(dir.path(), Platform::Linux);
    config.persistent_cache = false;
    let driver = Arc::new(BuildDriver::with_toolchain(config, toolchain.clone()).unwrap());
    let service_in = |registry: Arc<ModuleRegistry>| {
        ModuleLoadService::with_parts(
            Arc::clone(&driver),
            Arc::new(FixedOpener::new(Arc::new(symbols()))),
            registry,
        )
    };

    let first_service = service_in(Arc::new(ModuleRegistry::new()));
    let first = first_service
        .load_manifest(math_manifest("math", "jp_add"))
        .unwrap();
    assert!(first_service
        .load_manifest(math_manifest("math", "jp_add"))
        .unwrap_err()
        .is_already_loaded());

    let second = service_in(Arc::new(ModuleRegistry::new()))
        .load_manifest(math_manifest("math", "jp_add"))
        .unwrap();

    assert_eq!(toolchain.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(driver.toolchain_invocations(), 1);
    assert_eq!(first.artifact, second.artifact);
}

#[test]
fn missing_bundled_file_fails_without_registering() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), Arc::new(FakeToolchain::default()));
    let module_dir = dir.path().join("sdl");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join("module.json"),
        json!({
            "name": "sdl",
            "version": "2.0.0",
            "description": "SDL bindings",
            "native": true,
            "bundled": true,
            "bundle_info": { "linux": { "dlls": [], "libs": ["bin/linux/libSDL2.so"] } },
            "functions": {
                "add": {
                    "cpp_name": "jp_add",
                    "params": [{ "name": "a", "type": "int" }, { "name": "b", "type": "int" }],
                    "return": { "type": "int" }
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let err = service.load_file(module_dir.join("module.json")).unwrap_err();
    match err {
        LoadError::Build(BuildError::BundleFileMissing(path)) => {
            assert_eq!(path, module_dir.join("bin/linux/libSDL2.so"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!service.registry().contains("sdl"));

    std::fs::create_dir_all(module_dir.join("bin/linux")).unwrap();
    std::fs::write(module_dir.join("bin/linux/libSDL2.so"), b"lib").unwrap();
    let module = service.load_file(module_dir.join("module.json")).unwrap();
    assert!(module.info().bundled);
    assert_eq!(service.driver().toolchain_invocations(), 0);
}

#[test]
fn cancelled_background_load_registers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = Arc::new(FakeToolchain {
        block_until_cancelled: true,
        ..FakeToolchain::default()
    });
    let service = service_with(dir.path(), toolchain.clone());

    let task = service.spawn_load(math_manifest("math", "jp_add"));
    let deadline = Instant::now() + Duration::from_secs(10);
    while !toolchain.started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "compile never started");
        thread::sleep(Duration::from_millis(5));
    }
    task.cancel();

    let err = task.wait().unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(service.registry().is_empty());
    assert!(service.driver().cache().memory_len() == 0);
    let scratch = std::fs::read_dir(service.driver().config().scratch_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(scratch, 0);
}

#[test]
fn unload_all_runs_dispose_entrypoints() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), Arc::new(FakeToolchain::default()));
    let manifest = load(
        &json!({
            "name": "counter",
            "version": "1.0.0",
            "description": "counts disposals",
            "native": true,
            "custom_code": "void jp_counter_dispose(){} double jp_scale(double v, double f){return v*f;}",
            "entrypoints": { "dispose": "jp_counter_dispose" },
            "functions": {
                "scale": {
                    "cpp_name": "jp_scale",
                    "params": [{ "name": "value", "type": "double" }, { "name": "factor", "type": "double" }],
                    "return": { "type": "double" }
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let module = service.load_manifest(manifest).unwrap();
    assert_eq!(
        module
            .function("scale")
            .unwrap()
            .call(&[ScriptValue::Double(1.5), ScriptValue::Int(4)])
            .unwrap(),
        ScriptValue::Double(6.0)
    );

    let before = DISPOSED.load(Ordering::SeqCst);
    assert_eq!(service.registry().unload_all(), 1);
    assert_eq!(DISPOSED.load(Ordering::SeqCst), before + 1);
    assert!(service.registry().is_empty());

    let err = service
        .load_manifest(math_manifest("math", "jp_add"))
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::Registry(RegistryError::ShuttingDown(_))
    ));
    assert!(service.registry().is_empty());
}
