//! In-house WebAssembly backend for the Coast C/C++-to-Web compiler.
//!
//! This crate translates Coast's lowered SSA program into the WebAssembly
//! binary format (or its textual form) without relying on external encoder
//! or runtime crates. The input has already been through register
//! allocation, pointer classification, control-flow restructuring and
//! linear-memory layout; the emitter's job is to turn those analyses into
//! byte-exact module sections.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub mod analysis;
pub mod error;
pub mod ir;

pub use error::{Error, Result};

pub(crate) const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
pub(crate) const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
/// Linear memory page size mandated by the WebAssembly specification.
pub const WASM_PAGE: u32 = 64 * 1024;

pub(crate) fn wasm_trace_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("COAST_WASM_TRACE").is_some())
}

pub(crate) fn trace_log(args: std::fmt::Arguments<'_>) {
    if wasm_trace_enabled() {
        eprintln!("[wasm::trace] {args}");
    }
}

macro_rules! wasm_debug {
    ($($arg:tt)*) => {
        $crate::trace_log(format_args!($($arg)*));
    };
}

pub mod emitter;

/// Output flavour produced by the emitter. The binary encoding is the
/// ground truth; the textual form is driven by the same emit routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Wasm,
    Wast,
}

/// How floating-point math calls are lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathMode {
    /// Call imported host builtins, promoting f32 arguments to f64.
    JsBuiltins,
    /// Call the libm implementations compiled into the module.
    WasmBuiltins,
}

/// Options controlling module emission.
#[derive(Debug, Clone)]
pub struct EmitterOptions {
    /// Maximum heap size in MiB, used to derive the memory limits.
    pub heap_size_mib: u32,
    /// When true the module is instantiated by a JavaScript loader and may
    /// call imported functions; when false calls to unknown functions
    /// lower to `unreachable`.
    pub use_wasm_loader: bool,
    /// Embed a custom `name` section mapping function ids to symbols.
    pub pretty_code: bool,
    /// Use the legacy relooper control reconstruction instead of the
    /// stackifier token stream.
    pub use_cfg_legacy: bool,
    pub shared_memory: bool,
    pub no_grow_memory: bool,
    /// Export the function table from the module.
    pub exported_table: bool,
    pub mode: OutputMode,
    /// Guard float-to-int truncations with range checks instead of
    /// letting the wasm opcode trap.
    pub avoid_wasm_traps: bool,
    pub math_mode: MathMode,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            heap_size_mib: 8,
            use_wasm_loader: false,
            pretty_code: false,
            use_cfg_legacy: false,
            shared_memory: false,
            no_grow_memory: false,
            exported_table: false,
            mode: OutputMode::Wasm,
            avoid_wasm_traps: false,
            math_mode: MathMode::WasmBuiltins,
        }
    }
}

/// Emit a Coast module as WebAssembly bytes (binary or text per options).
pub fn compile(
    module: &ir::Module,
    analysis: &analysis::ModuleAnalysis,
    options: &EmitterOptions,
) -> Result<Vec<u8>> {
    let writer = emitter::ModuleWriter::new(module, analysis, options)?;
    writer.emit()
}

/// Emit a module and write the artifact to `output`.
pub fn compile_to_path(
    module: &ir::Module,
    analysis: &analysis::ModuleAnalysis,
    options: &EmitterOptions,
    output: &Path,
) -> Result<()> {
    let bytes = compile(module, analysis, options)?;
    if let Some(parent) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, &bytes)?;
    Ok(())
}
