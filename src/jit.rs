//! JIT Engine
//!
//! Turns [`CodeModule`]s into callable machine code. Each added module is
//! its own Cranelift [`JITModule`]; symbols exported by earlier modules are
//! visible to later ones, and anything not defined by the engine falls back
//! to the host process.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use cranelift::codegen::ir::UserFuncName;
use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use tracing::debug;

use crate::config::JitConfig;
use crate::emitter::clif::{int_type, ClifEmitter};
use crate::error::{JitError, Result};

/// Parameter of a declared function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Integer of the given bit width, zero-extended into its container.
    Int(u32),
    Ptr,
}

/// Handle of a module added to a [`JitEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(usize);

struct LoadedModule {
    name: String,
    module: JITModule,
    exports: Vec<String>,
}

/// Look a symbol up in the running process.
#[cfg(unix)]
fn host_symbol(name: &str) -> Option<*const u8> {
    let this = libloading::os::unix::Library::this();
    let symbol = unsafe { this.get::<*const u8>(name.as_bytes()) }.ok()?;
    Some(*symbol)
}

#[cfg(windows)]
fn host_symbol(name: &str) -> Option<*const u8> {
    let this = libloading::os::windows::Library::this().ok()?;
    let symbol = unsafe { this.get::<*const u8>(name.as_bytes()) }.ok()?;
    Some(*symbol)
}

/// Exported symbol addresses, shared with the lookup of every module the
/// engine creates.
type SymbolTable = Arc<RwLock<HashMap<String, usize>>>;

fn table_lookup(symbols: &SymbolTable, name: &str) -> Option<*const u8> {
    let table = symbols.read().unwrap_or_else(PoisonError::into_inner);
    table.get(name).map(|addr| *addr as *const u8)
}

/// Minimal JIT: compile, link, look up, unload.
pub struct JitEngine {
    isa: OwnedTargetIsa,
    symbols: SymbolTable,
    modules: HashMap<usize, LoadedModule>,
    next_handle: usize,
}

impl JitEngine {
    pub fn new(config: &JitConfig) -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", config.opt_level.as_flag())
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        flag_builder.set("is_pic", "false").map_err(|e| JitError::Codegen(e.to_string()))?;
        // i128 parameters carry ports of 65..=128 bits
        flag_builder
            .set("enable_llvm_abi_extensions", "true")
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        flag_builder
            .set("enable_verifier", if config.verify { "true" } else { "false" })
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| JitError::Codegen(format!("Failed to create ISA builder: {}", e)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Codegen(format!("Failed to create ISA: {}", e)))?;

        debug!(host = %target_lexicon::HOST, opt_level = config.opt_level.as_flag(), "JIT engine ready");

        Ok(Self {
            isa,
            symbols: Arc::new(RwLock::new(HashMap::new())),
            modules: HashMap::new(),
            next_handle: 0,
        })
    }

    /// Start an empty module. Imports resolve against the modules added to
    /// this engine by the time the new module itself is added.
    pub fn create_module(&self, name: impl Into<String>) -> CodeModule {
        let known = Arc::clone(&self.symbols);
        let mut builder = JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        builder.symbol_lookup_fn(Box::new(move |name: &str| {
            table_lookup(&known, name).or_else(|| host_symbol(name))
        }));
        CodeModule {
            name: name.into(),
            module: JITModule::new(builder),
            functions: HashMap::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            builder_ctx: FunctionBuilderContext::new(),
            ir: String::new(),
        }
    }

    /// Compile and link `code`. Fails without side effects if an import is
    /// unresolved or an export clashes with an existing symbol.
    pub fn add_module(&mut self, code: CodeModule) -> Result<ModuleHandle> {
        let CodeModule { name, mut module, imports, exports, .. } = code;

        let rejected = if let Some(missing) = imports.iter().find(|sym| self.find_symbol(sym).is_none()) {
            Some(JitError::UnresolvedSymbol(missing.clone()))
        } else {
            exports
                .iter()
                .find(|(sym, _)| table_lookup(&self.symbols, sym).is_some())
                .map(|(clash, _)| JitError::DuplicateSymbol(clash.clone()))
        };
        if let Some(err) = rejected {
            unsafe { module.free_memory() };
            return Err(err);
        }

        module.finalize_definitions()?;

        {
            let mut table = self.symbols.write().unwrap_or_else(PoisonError::into_inner);
            for (sym, id) in &exports {
                let addr = module.get_finalized_function(*id);
                table.insert(sym.clone(), addr as usize);
            }
        }

        let handle = ModuleHandle(self.next_handle);
        self.next_handle += 1;
        debug!(module = %name, handle = handle.0, functions = exports.len(), "module finalized");
        self.modules.insert(
            handle.0,
            LoadedModule {
                name,
                module,
                exports: exports.into_iter().map(|(sym, _)| sym).collect(),
            },
        );
        Ok(handle)
    }

    /// Address of `name`: engine modules first, then the host process.
    pub fn find_symbol(&self, name: &str) -> Option<*const u8> {
        table_lookup(&self.symbols, name).or_else(|| host_symbol(name))
    }

    pub fn get_symbol_address(&self, name: &str) -> Result<*const u8> {
        self.find_symbol(name).ok_or_else(|| JitError::UnresolvedSymbol(name.to_string()))
    }

    /// Unlink a module and free its code. Addresses obtained from it must
    /// no longer be called.
    pub fn remove_module(&mut self, handle: ModuleHandle) -> Result<()> {
        let loaded = self.modules.remove(&handle.0).ok_or(JitError::UnknownModule(handle.0))?;
        {
            let mut table = self.symbols.write().unwrap_or_else(PoisonError::into_inner);
            for sym in &loaded.exports {
                table.remove(sym);
            }
        }
        debug!(module = %loaded.name, handle = handle.0, "module removed");
        unsafe { loaded.module.free_memory() };
        Ok(())
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl Drop for JitEngine {
    fn drop(&mut self) {
        for (_, loaded) in self.modules.drain() {
            unsafe { loaded.module.free_memory() };
        }
    }
}

/// A module under construction
pub struct CodeModule {
    name: String,
    module: JITModule,
    functions: HashMap<FuncId, (String, Signature)>,
    imports: Vec<String>,
    exports: Vec<(String, FuncId)>,
    builder_ctx: FunctionBuilderContext,
    ir: String,
}

impl CodeModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a function returning nothing. Non-exported declarations are
    /// imports that must resolve when the module is added.
    pub fn declare_function(&mut self, name: &str, params: &[Param], export: bool) -> Result<FuncId> {
        let ptr_ty = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        for param in params {
            let ty = match param {
                Param::Int(width) => int_type(*width),
                Param::Ptr => ptr_ty,
            };
            sig.params.push(AbiParam::new(ty));
        }

        let linkage = if export { Linkage::Export } else { Linkage::Import };
        let id = self.module.declare_function(name, linkage, &sig)?;
        if export {
            self.exports.push((name.to_string(), id));
        } else {
            self.imports.push(name.to_string());
        }
        self.functions.insert(id, (name.to_string(), sig));
        Ok(id)
    }

    /// Emit the body of a declared function.
    pub fn define_function<F>(&mut self, id: FuncId, body: F) -> Result<()>
    where
        F: FnOnce(&mut ClifEmitter<'_, '_>) -> Result<()>,
    {
        let (name, sig) = self
            .functions
            .get(&id)
            .cloned()
            .ok_or_else(|| JitError::Codegen(format!("function {} was not declared", id)))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, id.as_u32());
        {
            let builder = FunctionBuilder::new(&mut ctx.func, &mut self.builder_ctx);
            let mut emitter = ClifEmitter::new(builder, &mut self.module);
            body(&mut emitter)?;
            emitter.finish();
        }

        let _ = writeln!(self.ir, "; {}\n{}", name, ctx.func.display());
        debug!(function = %name, "function defined");
        self.module.define_function(id, &mut ctx)?;
        self.module.clear_context(&mut ctx);
        Ok(())
    }

    /// Textual IR of every function defined so far.
    pub fn ir(&self) -> &str {
        &self.ir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{BinaryOp, CodeEmitter};
    use std::mem;

    type BumpFn = unsafe extern "C" fn(*mut u8);

    /// `fn(ptr)`: `*ptr += amount` on a 32-bit little-endian word.
    fn bump_module(engine: &JitEngine, name: &str, symbol: &str, amount: u128) -> CodeModule {
        let mut code = engine.create_module(name);
        let id = code.declare_function(symbol, &[Param::Ptr], true).unwrap();
        code.define_function(id, |e| {
            let ptr = e.param(0);
            let v = e.load(ptr, 0, 4);
            let k = e.constant(32, amount);
            let sum = e.binary(BinaryOp::Add, 32, v, k);
            e.store(sum, ptr, 0, 4);
            Ok(())
        })
        .unwrap();
        code
    }

    #[test]
    fn test_add_and_call() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let code = bump_module(&engine, "m", "bump", 3);
        assert!(code.ir().contains("bump"));
        engine.add_module(code).unwrap();

        let addr = engine.get_symbol_address("bump").unwrap();
        let f: BumpFn = unsafe { mem::transmute::<*const u8, BumpFn>(addr) };
        let mut word = 40u32.to_le_bytes();
        unsafe { f(word.as_mut_ptr()) };
        assert_eq!(u32::from_le_bytes(word), 43);
    }

    #[test]
    fn test_cross_module_call() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let first = bump_module(&engine, "a", "bump_a", 1);
        engine.add_module(first).unwrap();

        let mut second = engine.create_module("b");
        let callee = second.declare_function("bump_a", &[Param::Ptr], false).unwrap();
        let id = second.declare_function("twice", &[Param::Ptr], true).unwrap();
        second
            .define_function(id, |e| {
                let ptr = e.param(0);
                e.call(callee, &[ptr]);
                e.call(callee, &[ptr]);
                Ok(())
            })
            .unwrap();
        engine.add_module(second).unwrap();

        let f: BumpFn = unsafe { mem::transmute::<*const u8, BumpFn>(engine.get_symbol_address("twice").unwrap()) };
        let mut word = 0u32.to_le_bytes();
        unsafe { f(word.as_mut_ptr()) };
        assert_eq!(u32::from_le_bytes(word), 2);
    }

    #[test]
    fn test_import_from_module_added_after_creation() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let mut caller = engine.create_module("b");
        let callee = caller.declare_function("bump_late", &[Param::Ptr], false).unwrap();
        let id = caller.declare_function("call_late", &[Param::Ptr], true).unwrap();
        caller
            .define_function(id, |e| {
                let ptr = e.param(0);
                e.call(callee, &[ptr]);
                Ok(())
            })
            .unwrap();

        let provider = bump_module(&engine, "a", "bump_late", 5);
        engine.add_module(provider).unwrap();
        engine.add_module(caller).unwrap();

        let f: BumpFn = unsafe { mem::transmute::<*const u8, BumpFn>(engine.get_symbol_address("call_late").unwrap()) };
        let mut word = 1u32.to_le_bytes();
        unsafe { f(word.as_mut_ptr()) };
        assert_eq!(u32::from_le_bytes(word), 6);
    }

    #[test]
    fn test_unresolved_import_fails() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let mut code = engine.create_module("m");
        let missing = code.declare_function("no_such_symbol_for_circuit_jit", &[Param::Ptr], false).unwrap();
        let id = code.declare_function("caller", &[Param::Ptr], true).unwrap();
        code.define_function(id, |e| {
            let ptr = e.param(0);
            e.call(missing, &[ptr]);
            Ok(())
        })
        .unwrap();
        let err = engine.add_module(code).unwrap_err();
        assert!(matches!(err, JitError::UnresolvedSymbol(ref s) if s == "no_such_symbol_for_circuit_jit"));
        assert!(engine.find_symbol("caller").is_none());
        assert!(engine.get_symbol_address("caller").is_err());
    }

    #[test]
    fn test_duplicate_export_fails() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let first = bump_module(&engine, "a", "bump", 1);
        engine.add_module(first).unwrap();
        let second = bump_module(&engine, "b", "bump", 2);
        assert!(matches!(engine.add_module(second), Err(JitError::DuplicateSymbol(_))));
    }

    #[test]
    fn test_remove_module() {
        let mut engine = JitEngine::new(&JitConfig::default()).unwrap();
        let code = bump_module(&engine, "m", "bump_removed", 1);
        let handle = engine.add_module(code).unwrap();
        assert_eq!(engine.module_count(), 1);
        engine.remove_module(handle).unwrap();
        assert_eq!(engine.module_count(), 0);
        assert!(engine.find_symbol("bump_removed").is_none());
        assert!(matches!(engine.remove_module(handle), Err(JitError::UnknownModule(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_host_symbol_fallback() {
        let engine = JitEngine::new(&JitConfig::default()).unwrap();
        assert!(engine.find_symbol("malloc").is_some());
    }
}
