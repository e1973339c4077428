//! Function binding table.
//!
//! # Responsibility
//! - Map each script-visible function to its native entry and marshalling plan.
//! - Invoke bound functions on behalf of the interpreter.
//!
//! # Invariants
//! - Binding resolves symbols only; no native code runs while binding.
//! - A `FunctionTable` keeps its symbol source (and so its libraries) alive.
//! - A bound function's parameter list never exceeds `invoke::MAX_ARITY`.

pub mod invoke;
pub mod library;
pub mod marshal;
pub mod value;

use crate::build::ArtifactHandle;
use crate::manifest::{ModuleManifest, SemanticType};
use log::{error, info};
use marshal::{marshal_arg, unmarshal_return, ArgMarshal, ReturnMarshal};
use std::collections::BTreeMap;
use std::error::Error;
use std::ffi::{c_void, CString};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

pub use library::{
    ArtifactOpener, DynamicLibrary, FixedOpener, LibraryOpener, StaticSymbols, SymbolSource,
};
pub use value::{NativeHandle, ScriptValue};

/// Errors raised while binding a manifest to an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    SymbolNotFound {
        function: String,
        symbol: String,
    },
    UnsupportedType {
        function: String,
        param: String,
        ty: SemanticType,
    },
    UnsupportedArity {
        function: String,
        arity: usize,
    },
    ArtifactLoad {
        path: PathBuf,
        reason: String,
    },
}

impl Display for BindError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolNotFound { function, symbol } => {
                write!(f, "symbol `{symbol}` for `{function}` not found in artifact")
            }
            Self::UnsupportedType {
                function,
                param,
                ty,
            } => write!(
                f,
                "parameter `{param}` of `{function}` has unsupported type `{ty}`"
            ),
            Self::UnsupportedArity { function, arity } => write!(
                f,
                "`{function}` declares {arity} parameters; at most {} are supported",
                invoke::MAX_ARITY
            ),
            Self::ArtifactLoad { path, reason } => {
                write!(f, "cannot load `{}`: {reason}", path.display())
            }
        }
    }
}

impl Error for BindError {}

/// Errors raised when a bound function is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    TypeMismatch {
        function: String,
        param: String,
        expected: SemanticType,
        got: &'static str,
    },
    IntegerOutOfRange {
        function: String,
        param: String,
        value: i64,
    },
    InteriorNul {
        function: String,
        param: String,
    },
    UnsupportedSignature {
        function: String,
    },
}

impl Display for CallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                function,
                expected,
                got,
            } => write!(f, "`{function}` expects {expected} arguments, got {got}"),
            Self::TypeMismatch {
                function,
                param,
                expected,
                got,
            } => write!(
                f,
                "argument `{param}` of `{function}` expects {expected}, got {got}"
            ),
            Self::IntegerOutOfRange {
                function,
                param,
                value,
            } => write!(
                f,
                "argument `{param}` of `{function}`: {value} does not fit a 32-bit int"
            ),
            Self::InteriorNul { function, param } => write!(
                f,
                "argument `{param}` of `{function}` contains an interior NUL byte"
            ),
            Self::UnsupportedSignature { function } => {
                write!(f, "`{function}` has no callable signature")
            }
        }
    }
}

impl Error for CallError {}

/// One script-callable native function.
#[derive(Debug)]
pub struct BoundFunction {
    name: String,
    symbol: String,
    signature: String,
    params: Vec<(String, ArgMarshal)>,
    returns: ReturnMarshal,
    entry: *const c_void,
    _source: Arc<dyn SymbolSource>,
}

// SAFETY: `entry` is an immutable code address kept valid by `_source`, which
// is itself `Send + Sync`. Reentrancy of the native code is the module's concern.
unsafe impl Send for BoundFunction {}
// SAFETY: see `Send`; `BoundFunction` has no interior mutability.
unsafe impl Sync for BoundFunction {}

impl BoundFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Declared signature, e.g. `int jp_add(int a, int b)`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Marshals `args`, calls the native entry and marshals the result back.
    ///
    /// # Errors
    /// - `ArityMismatch` / `TypeMismatch` / `IntegerOutOfRange` / `InteriorNul`
    ///   when an argument cannot be marshalled. The native code is not called then.
    pub fn call(&self, args: &[ScriptValue]) -> Result<ScriptValue, CallError> {
        if args.len() != self.params.len() {
            return Err(CallError::ArityMismatch {
                function: self.name.clone(),
                expected: self.params.len(),
                got: args.len(),
            });
        }

        let mut strings: Vec<CString> = Vec::new();
        let words = self
            .params
            .iter()
            .zip(args)
            .map(|((param, marshal), value)| {
                marshal_arg(&self.name, param, *marshal, value, &mut strings)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // SAFETY: the entry was resolved for this exact declaration; word
        // classes follow the declared parameter types and `strings` outlives
        // the call.
        let raw = unsafe { invoke::invoke(self.entry, &words, self.returns.class()) }.ok_or_else(
            || CallError::UnsupportedSignature {
                function: self.name.clone(),
            },
        )?;

        // SAFETY: a declared `string` return is a NUL-terminated string owned
        // by the native module, or one of `strings`, still alive here.
        let result = unsafe { unmarshal_return(self.returns, raw) };
        drop(strings);
        Ok(result)
    }
}

/// Lifecycle symbol of a module (`extern "C" void fn(void)`).
#[derive(Debug)]
pub struct Entrypoint {
    symbol: String,
    entry: *const c_void,
}

// SAFETY: code address only; liveness is guaranteed by the owning table.
unsafe impl Send for Entrypoint {}
// SAFETY: see `Send`.
unsafe impl Sync for Entrypoint {}

impl Entrypoint {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn run(&self) {
        // SAFETY: declared as `void(void)` in the generated export prologue.
        let _ = unsafe { invoke::invoke(self.entry, &[], None) };
    }
}

/// All bound functions of one module.
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, BoundFunction>,
    init: Option<Entrypoint>,
    dispose: Option<Entrypoint>,
    source_paths: Vec<PathBuf>,
}

impl FunctionTable {
    /// Table of a module without native code.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&BoundFunction> {
        self.functions.get(name)
    }

    /// Script-visible names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundFunction> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Libraries the table resolves symbols from.
    pub fn source_paths(&self) -> &[PathBuf] {
        &self.source_paths
    }

    /// Runs the `init` entrypoint, if declared.
    pub fn run_init(&self) {
        if let Some(entry) = &self.init {
            entry.run();
        }
    }

    /// Runs the `dispose` entrypoint, if declared.
    pub fn run_dispose(&self) {
        if let Some(entry) = &self.dispose {
            entry.run();
        }
    }
}

/// Binds `manifest` against `artifact`, opened with the platform loader.
pub fn bind(manifest: &ModuleManifest, artifact: &ArtifactHandle) -> Result<FunctionTable, BindError> {
    bind_with(manifest, artifact, &LibraryOpener)
}

/// Binds `manifest` against `artifact`, opened through `opener`.
pub fn bind_with(
    manifest: &ModuleManifest,
    artifact: &ArtifactHandle,
    opener: &dyn ArtifactOpener,
) -> Result<FunctionTable, BindError> {
    let source = opener.open(artifact)?;
    bind_symbols(manifest, source)
}

/// Binds `manifest` against an already opened symbol source.
///
/// # Errors
/// - `UnsupportedArity` / `UnsupportedType` for signatures the binder cannot call.
/// - `SymbolNotFound` for the first declared symbol missing from `source`.
pub fn bind_symbols(
    manifest: &ModuleManifest,
    source: Arc<dyn SymbolSource>,
) -> Result<FunctionTable, BindError> {
    let result = bind_inner(manifest, source);
    match &result {
        Ok(table) => info!(
            "event=bind module=binding status=ok name={} functions={}",
            manifest.name,
            table.len()
        ),
        Err(err) => error!(
            "event=bind module=binding status=error name={} error={err}",
            manifest.name
        ),
    }
    result
}

fn bind_inner(
    manifest: &ModuleManifest,
    source: Arc<dyn SymbolSource>,
) -> Result<FunctionTable, BindError> {
    let mut functions = BTreeMap::new();
    for (name, spec) in &manifest.functions {
        let symbol = spec.cpp_name.clone().unwrap_or_else(|| name.clone());
        if spec.params.len() > invoke::MAX_ARITY {
            return Err(BindError::UnsupportedArity {
                function: name.clone(),
                arity: spec.params.len(),
            });
        }
        let params = spec
            .params
            .iter()
            .map(|param| {
                ArgMarshal::for_type(param.ty)
                    .map(|marshal| (param.name.clone(), marshal))
                    .ok_or_else(|| BindError::UnsupportedType {
                        function: name.clone(),
                        param: param.name.clone(),
                        ty: param.ty,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let entry = resolve(source.as_ref(), name, &symbol)?;
        functions.insert(
            name.clone(),
            BoundFunction {
                name: name.clone(),
                signature: spec.signature(name),
                symbol,
                params,
                returns: ReturnMarshal::for_type(spec.returns.ty),
                entry,
                _source: Arc::clone(&source),
            },
        );
    }

    let entrypoint = |role: &str, symbol: &Option<String>| -> Result<Option<Entrypoint>, BindError> {
        symbol
            .as_ref()
            .map(|symbol| {
                resolve(source.as_ref(), role, symbol).map(|entry| Entrypoint {
                    symbol: symbol.clone(),
                    entry,
                })
            })
            .transpose()
    };
    let init = entrypoint("init", &manifest.entrypoints.init)?;
    let dispose = entrypoint("dispose", &manifest.entrypoints.dispose)?;

    Ok(FunctionTable {
        functions,
        init,
        dispose,
        source_paths: source.paths(),
    })
}

fn resolve(
    source: &dyn SymbolSource,
    function: &str,
    symbol: &str,
) -> Result<*const c_void, BindError> {
    source
        .resolve(symbol)
        .ok_or_else(|| BindError::SymbolNotFound {
            function: function.to_string(),
            symbol: symbol.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::{bind_symbols, BindError, CallError, ScriptValue, StaticSymbols};
    use crate::manifest::{load, ModuleManifest, ParamSpec, SemanticType};
    use serde_json::json;
    use std::ffi::{c_char, c_void, CStr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn jp_add(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn jp_half(value: f64) -> f64 {
        value / 2.0
    }

    extern "C" fn jp_is_even(value: i64) -> bool {
        value % 2 == 0
    }

    extern "C" fn jp_greet() -> *const c_char {
        b"hello from native\0".as_ptr() as *const c_char
    }

    extern "C" fn jp_strlen(text: *const c_char) -> i64 {
        if text.is_null() {
            return -1;
        }
        unsafe { CStr::from_ptr(text) }.to_bytes().len() as i64
    }

    extern "C" fn jp_init() {
        INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn manifest() -> ModuleManifest {
        load(
            &json!({
                "name": "demo",
                "version": "0.1.0",
                "description": "binding demo",
                "native": true,
                "custom_code": "/* provided in-process */",
                "entrypoints": { "init": "jp_init" },
                "functions": {
                    "add": {
                        "cpp_name": "jp_add",
                        "params": [{ "name": "a", "type": "int" }, { "name": "b", "type": "int" }],
                        "return": { "type": "int" }
                    },
                    "half": {
                        "cpp_name": "jp_half",
                        "params": [{ "name": "value", "type": "double" }],
                        "return": { "type": "double" }
                    },
                    "is_even": {
                        "cpp_name": "jp_is_even",
                        "params": [{ "name": "value", "type": "long" }],
                        "return": { "type": "bool" }
                    },
                    "greet": { "cpp_name": "jp_greet", "params": [], "return": { "type": "string" } },
                    "strlen": {
                        "cpp_name": "jp_strlen",
                        "params": [{ "name": "text", "type": "string" }],
                        "return": { "type": "long" }
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn symbols() -> StaticSymbols {
        StaticSymbols::new()
            .with("jp_add", jp_add as *const c_void)
            .with("jp_half", jp_half as *const c_void)
            .with("jp_is_even", jp_is_even as *const c_void)
            .with("jp_greet", jp_greet as *const c_void)
            .with("jp_strlen", jp_strlen as *const c_void)
            .with("jp_init", jp_init as *const c_void)
    }

    #[test]
    fn binds_and_calls_every_type() {
        let table = bind_symbols(&manifest(), Arc::new(symbols())).unwrap();
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec!["add", "greet", "half", "is_even", "strlen"]
        );

        let add = table.get("add").unwrap();
        assert_eq!(add.symbol(), "jp_add");
        assert_eq!(add.signature(), "int jp_add(int a, int b)");
        assert_eq!(
            add.call(&[ScriptValue::Int(2), ScriptValue::Int(3)]).unwrap(),
            ScriptValue::Int(5)
        );
        assert_eq!(
            table.get("half").unwrap().call(&[ScriptValue::Int(5)]).unwrap(),
            ScriptValue::Double(2.5)
        );
        assert_eq!(
            table.get("is_even").unwrap().call(&[ScriptValue::Int(1 << 40)]).unwrap(),
            ScriptValue::Bool(true)
        );
        assert_eq!(
            table.get("greet").unwrap().call(&[]).unwrap(),
            ScriptValue::Str("hello from native".to_string())
        );
        let strlen = table.get("strlen").unwrap();
        assert_eq!(strlen.call(&["four".into()]).unwrap(), ScriptValue::Int(4));
        assert_eq!(strlen.call(&[ScriptValue::Null]).unwrap(), ScriptValue::Int(-1));
    }

    #[test]
    fn call_validates_arguments_before_invoking() {
        let table = bind_symbols(&manifest(), Arc::new(symbols())).unwrap();
        let add = table.get("add").unwrap();

        let err = add.call(&[ScriptValue::Int(1)]).unwrap_err();
        assert!(matches!(err, CallError::ArityMismatch { expected: 2, got: 1, .. }));

        let err = add
            .call(&[ScriptValue::Int(1), ScriptValue::from("two")])
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::TypeMismatch { expected: SemanticType::Int, got: "string", .. }
        ));
    }

    #[test]
    fn missing_symbol_fails_binding() {
        let symbols = StaticSymbols::new().with("jp_add", jp_add as *const c_void);
        let err = bind_symbols(&manifest(), Arc::new(symbols)).unwrap_err();
        assert!(matches!(err, BindError::SymbolNotFound { .. }));
    }

    #[test]
    fn missing_entrypoint_fails_binding() {
        let mut symbols = symbols();
        symbols.insert("jp_init", std::ptr::null());
        let err = bind_symbols(&manifest(), Arc::new(symbols)).unwrap_err();
        assert_eq!(
            err,
            BindError::SymbolNotFound {
                function: "init".to_string(),
                symbol: "jp_init".to_string()
            }
        );
    }

    #[test]
    fn entrypoints_run_only_on_request() {
        let before = INIT_CALLS.load(Ordering::SeqCst);
        let table = bind_symbols(&manifest(), Arc::new(symbols())).unwrap();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before);
        table.run_init();
        table.run_dispose();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn too_many_parameters_are_rejected() {
        let mut manifest = manifest();
        let spec = manifest.functions.get_mut("add").unwrap();
        spec.params = (0..7)
            .map(|index| ParamSpec {
                name: format!("p{index}"),
                ty: SemanticType::Int,
            })
            .collect();
        let err = bind_symbols(&manifest, Arc::new(symbols())).unwrap_err();
        assert_eq!(
            err,
            BindError::UnsupportedArity {
                function: "add".to_string(),
                arity: 7
            }
        );
    }

    #[test]
    fn void_parameters_are_rejected() {
        let mut manifest = manifest();
        manifest.functions.get_mut("half").unwrap().params[0].ty = SemanticType::Void;
        let err = bind_symbols(&manifest, Arc::new(symbols())).unwrap_err();
        assert!(matches!(err, BindError::UnsupportedType { ty: SemanticType::Void, .. }));
    }
}
