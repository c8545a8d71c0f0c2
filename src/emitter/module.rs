use tracing::debug;

use super::buffer::CodeBuffer;
use super::encoding::{
    encode_f32_const, encode_f64_const, encode_s32_inst, push_name, write_u32,
};
use super::ensure_u32;
use super::function::FunctionEmitter;
use super::globalize::{self, GlobalizationPlan, PlannedGlobal};
use super::sections::Section;
use super::value_kind::ValueType;
use super::wat::{escape_data_bytes, signature_text};
use crate::analysis::{const_bytes, AddrListener, ByteListener, ModuleAnalysis};
use crate::error::{Error, Result};
use crate::ir::{Constant, FuncRef, GlobalVar, IrType, Module};
use crate::{EmitterOptions, OutputMode, WASM_MAGIC, WASM_PAGE, WASM_VERSION};

/// Drives module emission: plans constant globalization, compiles every
/// function body, and writes the sections in the order the format
/// mandates.
pub struct ModuleWriter<'a> {
    module: &'a Module,
    analysis: &'a ModuleAnalysis,
    options: &'a EmitterOptions,
    plan: GlobalizationPlan,
}

struct ByteCollector {
    bytes: Vec<u8>,
}

impl ByteListener for ByteCollector {
    fn add_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
    }
}

impl<'a> ModuleWriter<'a> {
    pub fn new(
        module: &'a Module,
        analysis: &'a ModuleAnalysis,
        options: &'a EmitterOptions,
    ) -> Result<Self> {
        if analysis.functions.len() != module.functions.len() {
            return Err(Error::internal(
                "per-function analyses do not line up with the module",
            ));
        }
        let plan = globalize::plan(module, &analysis.layout);
        Ok(Self {
            module,
            analysis,
            options,
            plan,
        })
    }

    fn section(&self, id: u8, name: &'static str) -> Section {
        Section::new(id, name, self.options.mode)
    }

    fn binary(&self) -> bool {
        self.options.mode == OutputMode::Wasm
    }

    fn defined_functions(&self) -> impl Iterator<Item = (FuncRef, &'a crate::ir::Function)> {
        self.module
            .functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_declaration())
            .map(|(index, f)| (FuncRef(index as u32), f))
    }

    /// Emit the whole module in the canonical section order.
    pub fn emit(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        debug!(
            functions = self.module.functions.len(),
            globals = self.module.globals.len(),
            mode = ?self.options.mode,
            "emitting wasm module"
        );
        if self.binary() {
            out.extend_from_slice(&WASM_MAGIC);
            out.extend_from_slice(&WASM_VERSION);
        } else {
            out.extend_from_slice(b"(module\n");
        }

        self.emit_type_section()?.encode_into(&mut out)?;
        if let Some(section) = self.emit_import_section()? {
            section.encode_into(&mut out)?;
        }
        self.emit_function_section()?.encode_into(&mut out)?;
        if let Some(section) = self.emit_table_section()? {
            section.encode_into(&mut out)?;
        }
        self.emit_memory_section()?.encode_into(&mut out)?;
        self.emit_global_section()?.encode_into(&mut out)?;
        if let Some(section) = self.emit_export_section()? {
            section.encode_into(&mut out)?;
        }
        if let Some(section) = self.emit_start_section()? {
            section.encode_into(&mut out)?;
        }
        if let Some(section) = self.emit_element_section()? {
            section.encode_into(&mut out)?;
        }
        self.emit_code_section()?.encode_into(&mut out)?;
        if let Some(section) = self.emit_data_section()? {
            section.encode_into(&mut out)?;
        }
        if let Some(section) = self.emit_name_section()? {
            section.encode_into(&mut out)?;
        }

        if !self.binary() {
            out.extend_from_slice(b")\n");
        }
        Ok(out)
    }

    fn emit_type_section(&self) -> Result<Section> {
        let mut section = self.section(1, "Type");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(
                &mut payload,
                ensure_u32(
                    self.module.signatures.len(),
                    "function type count exceeds WebAssembly limits",
                )?,
            );
            for sig in &self.module.signatures {
                payload.push(0x60);
                write_u32(
                    &mut payload,
                    ensure_u32(
                        sig.params.len(),
                        "parameter count exceeds WebAssembly limits",
                    )?,
                );
                for &ty in &sig.params {
                    payload.push(scalar_type(ty)?.to_byte());
                }
                if sig.ret == IrType::Void {
                    write_u32(&mut payload, 0);
                } else {
                    write_u32(&mut payload, 1);
                    payload.push(scalar_type(sig.ret)?.to_byte());
                }
            }
            section.body().extend_from_slice(&payload);
        } else {
            for (index, sig) in self.module.signatures.iter().enumerate() {
                section.body().push_str(&format!(
                    "  (type (;{index};) (func{}))\n",
                    signature_text(sig)
                ));
            }
        }
        Ok(section)
    }

    fn emit_import_section(&self) -> Result<Option<Section>> {
        if self.module.imports.is_empty() {
            return Ok(None);
        }
        let mut section = self.section(2, "Import");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(
                &mut payload,
                ensure_u32(
                    self.module.imports.len(),
                    "import count exceeds WebAssembly limits",
                )?,
            );
            for import in &self.module.imports {
                push_name(&mut payload, &import.module);
                push_name(&mut payload, &import.field);
                payload.push(0x00);
                write_u32(&mut payload, import.sig.0);
            }
            section.body().extend_from_slice(&payload);
        } else {
            for import in &self.module.imports {
                section.body().push_str(&format!(
                    "  (import \"{}\" \"{}\" (func (type {})))\n",
                    import.module, import.field, import.sig.0
                ));
            }
        }
        Ok(Some(section))
    }

    fn emit_function_section(&self) -> Result<Section> {
        let mut section = self.section(3, "Function");
        if self.binary() {
            let mut payload = Vec::new();
            let count = self.defined_functions().count();
            write_u32(
                &mut payload,
                ensure_u32(count, "function count exceeds WebAssembly limits")?,
            );
            for (_, function) in self.defined_functions() {
                write_u32(&mut payload, function.sig.0);
            }
            section.body().extend_from_slice(&payload);
        }
        Ok(section)
    }

    fn table_size(&self) -> usize {
        self.analysis
            .layout
            .table_order
            .iter()
            .filter_map(|sig| self.analysis.layout.function_tables.get(sig))
            .map(|table| table.functions.len())
            .sum()
    }

    fn emit_table_section(&self) -> Result<Option<Section>> {
        let size = self.table_size();
        if size == 0 {
            return Ok(None);
        }
        let mut section = self.section(4, "Table");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, 1);
            payload.push(0x70); // funcref
            payload.push(0x00); // min only
            write_u32(
                &mut payload,
                ensure_u32(size, "function table size exceeds WebAssembly limits")?,
            );
            section.body().extend_from_slice(&payload);
        } else {
            section
                .body()
                .push_str(&format!("  (table (;0;) {size} funcref)\n"));
        }
        Ok(Some(section))
    }

    fn memory_limits(&self) -> (u32, u32) {
        // Heap size is MiB, pages are 64 KiB: max = MiB << 4.
        let max_memory = self.options.heap_size_mib << 4;
        let mut min_memory = (self.analysis.layout.heap_start + (WASM_PAGE - 1)) / WASM_PAGE;
        if self.options.no_grow_memory {
            min_memory = max_memory;
        }
        (min_memory, max_memory)
    }

    fn emit_memory_section(&self) -> Result<Section> {
        let (min_memory, max_memory) = self.memory_limits();
        let mut section = self.section(5, "Memory");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, 1);
            // limits: 0x01 min+max unshared, 0x03 min+max shared
            payload.push(if self.options.shared_memory { 0x03 } else { 0x01 });
            write_u32(&mut payload, min_memory);
            write_u32(&mut payload, max_memory);
            section.body().extend_from_slice(&payload);
        } else {
            let shared = if self.options.shared_memory {
                " shared"
            } else {
                ""
            };
            section.body().push_str(&format!(
                "  (memory (export \"memory\") {min_memory} {max_memory}{shared})\n"
            ));
        }
        Ok(section)
    }

    fn emit_global_section(&self) -> Result<Section> {
        let mut section = self.section(6, "Global");
        let stack_start = self.analysis.layout.stack_start;
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, self.plan.global_count());
            // The stack-top pointer: mutable i32 at index 0.
            payload.push(ValueType::I32.to_byte());
            payload.push(0x01);
            let mut init = CodeBuffer::new(OutputMode::Wasm);
            encode_s32_inst(&mut init, 0x41, "i32.const", stack_start as i32);
            payload.extend_from_slice(init.bytes());
            payload.push(0x0B);

            for planned in &self.plan.ordered {
                match planned {
                    PlannedGlobal::PromotedGlobal(g) => {
                        let global = self.module.global(*g);
                        payload.push(scalar_type(global.ty)?.to_byte());
                        payload.push(0x01); // mutable
                        let mut init = CodeBuffer::new(OutputMode::Wasm);
                        let zero = Constant::Int {
                            value: 0,
                            ty: global.ty,
                        };
                        let value = global.init.as_ref().unwrap_or(&zero);
                        self.encode_init_expr(&mut init, value, global.ty)?;
                        payload.extend_from_slice(init.bytes());
                        payload.push(0x0B);
                    }
                    PlannedGlobal::Constant(c) => {
                        payload.push(constant_type(c)?.to_byte());
                        payload.push(0x00); // immutable
                        let mut init = CodeBuffer::new(OutputMode::Wasm);
                        self.encode_init_expr(&mut init, c, c.ty())?;
                        payload.extend_from_slice(init.bytes());
                        payload.push(0x0B);
                    }
                }
            }
            section.body().extend_from_slice(&payload);
        } else {
            section
                .body()
                .push_str(&format!("  (global (mut i32) (i32.const {stack_start}))\n"));
            for planned in &self.plan.ordered {
                match planned {
                    PlannedGlobal::PromotedGlobal(g) => {
                        let global = self.module.global(*g);
                        let ty = scalar_type(global.ty)?;
                        let mut init = CodeBuffer::new(OutputMode::Wast);
                        let zero = Constant::Int {
                            value: 0,
                            ty: global.ty,
                        };
                        let value = global.init.as_ref().unwrap_or(&zero);
                        self.encode_init_expr(&mut init, value, global.ty)?;
                        let text = String::from_utf8_lossy(init.bytes()).trim_end().to_string();
                        section.body().push_str(&format!(
                            "  (global (mut {}) ({text}))\n",
                            ty.name()
                        ));
                    }
                    PlannedGlobal::Constant(c) => {
                        let ty = constant_type(c)?;
                        let mut init = CodeBuffer::new(OutputMode::Wast);
                        self.encode_init_expr(&mut init, c, c.ty())?;
                        let text = String::from_utf8_lossy(init.bytes()).trim_end().to_string();
                        section
                            .body()
                            .push_str(&format!("  (global {} ({text}))\n", ty.name()));
                    }
                }
            }
        }
        Ok(section)
    }

    /// Lower a constant to a global init expression. Addresses fold to
    /// their absolute value; anything without a byte image is rejected.
    fn encode_init_expr(&self, code: &mut CodeBuffer, c: &Constant, ty: IrType) -> Result<()> {
        match c {
            Constant::Int { value, .. } => {
                let imm = i32::try_from(*value)
                    .map_err(|_| Error::codegen("global initialiser exceeds the i32 range"))?;
                encode_s32_inst(code, 0x41, "i32.const", imm);
            }
            Constant::Float { .. } => {
                if let Some(value) = c.as_f32() {
                    encode_f32_const(code, value);
                } else if let Some(value) = c.as_f64() {
                    encode_f64_const(code, value);
                }
            }
            Constant::Null => encode_s32_inst(code, 0x41, "i32.const", 0),
            Constant::Undef(_) => match ty {
                IrType::F32 => encode_f32_const(code, 0.0),
                IrType::F64 => encode_f64_const(code, 0.0),
                _ => encode_s32_inst(code, 0x41, "i32.const", 0),
            },
            Constant::GlobalAddr(_) | Constant::FuncAddr(_) | Constant::Expr(_) => {
                let mut listener = AddrListener::default();
                const_bytes(c, &self.analysis.layout, &mut listener)?;
                encode_s32_inst(code, 0x41, "i32.const", listener.addr as i32);
            }
            Constant::Aggregate(_) | Constant::Zeroes(_) => {
                return Err(Error::codegen(
                    "aggregate constants cannot initialise a wasm global",
                ));
            }
        }
        Ok(())
    }

    fn export_entries(&self) -> Vec<(String, u32)> {
        let mut exports: Vec<(String, u32)> = Vec::new();
        let mut push = |name: String, f: FuncRef, exports: &mut Vec<(String, u32)>| {
            if exports.iter().any(|(existing, _)| *existing == name) {
                return;
            }
            if let Some(id) = self.analysis.layout.function_id(f) {
                exports.push((name, id));
            }
        };
        if let Some(entry) = self.module.entry {
            push(
                self.module.function(entry).name.clone(),
                entry,
                &mut exports,
            );
        }
        for &ctor in &self.module.constructors {
            push(self.module.function(ctor).name.clone(), ctor, &mut exports);
        }
        for export in &self.module.exports {
            push(export.symbol.clone(), export.func, &mut exports);
        }
        exports
    }

    fn emit_export_section(&self) -> Result<Option<Section>> {
        if !self.binary() {
            // Text mode exports inline on the memory and functions.
            return Ok(None);
        }
        let exports = self.export_entries();
        let mut section = self.section(7, "Export");
        let mut payload = Vec::new();
        let extra_exports: u32 = if self.options.exported_table { 2 } else { 1 };
        write_u32(
            &mut payload,
            ensure_u32(
                exports.len() + extra_exports as usize,
                "export count exceeds WebAssembly limits",
            )?,
        );
        // The memory is always exported.
        push_name(&mut payload, "memory");
        payload.push(0x02);
        write_u32(&mut payload, 0);
        if self.options.exported_table {
            push_name(&mut payload, "tbl");
            payload.push(0x01);
            write_u32(&mut payload, 0);
        }
        for (name, id) in exports {
            push_name(&mut payload, &name);
            payload.push(0x00);
            write_u32(&mut payload, id);
        }
        section.body().extend_from_slice(&payload);
        Ok(Some(section))
    }

    fn emit_start_section(&self) -> Result<Option<Section>> {
        // With a loader the heap is only usable after instantiation, so
        // the start function cannot run constructors there.
        if self.options.use_wasm_loader {
            return Ok(None);
        }
        let Some(start) = self.module.function_by_name("_start") else {
            return Ok(None);
        };
        if self.module.function(start).is_declaration() {
            return Ok(None);
        }
        let Some(id) = self.analysis.layout.function_id(start) else {
            return Ok(None);
        };
        let mut section = self.section(8, "Start");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, id);
            section.body().extend_from_slice(&payload);
        } else {
            section.body().push_str(&format!("  (start {id})\n"));
        }
        Ok(Some(section))
    }

    fn emit_element_section(&self) -> Result<Option<Section>> {
        let size = self.table_size();
        if size == 0 {
            return Ok(None);
        }
        let layout = &self.analysis.layout;
        let mut ids = Vec::new();
        for sig in &layout.table_order {
            let Some(table) = layout.function_tables.get(sig) else {
                continue;
            };
            for &f in &table.functions {
                ids.push(layout.function_id(f).ok_or_else(|| {
                    Error::codegen(format!(
                        "table entry `{}` has no function id",
                        self.module.function(f).name
                    ))
                })?);
            }
        }
        let mut section = self.section(9, "Element");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, 1); // one active segment
            write_u32(&mut payload, 0); // table index 0
            let mut offset = CodeBuffer::new(OutputMode::Wasm);
            encode_s32_inst(&mut offset, 0x41, "i32.const", 0);
            payload.extend_from_slice(offset.bytes());
            payload.push(0x0B);
            write_u32(
                &mut payload,
                ensure_u32(ids.len(), "table entry count exceeds WebAssembly limits")?,
            );
            for id in ids {
                write_u32(&mut payload, id);
            }
            section.body().extend_from_slice(&payload);
        } else {
            let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            section.body().push_str(&format!(
                "  (elem (i32.const 0) func {})\n",
                rendered.join(" ")
            ));
        }
        Ok(Some(section))
    }

    fn emit_code_section(&self) -> Result<Section> {
        let mut section = self.section(10, "Code");
        let count = self.defined_functions().count();
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(
                &mut payload,
                ensure_u32(count, "function count exceeds WebAssembly limits")?,
            );
            section.body().extend_from_slice(&payload);
        }
        for (func_ref, function) in self.defined_functions() {
            debug!(function = %function.name, "compiling function body");
            let mut emitter = FunctionEmitter::new(
                self.module,
                func_ref,
                &self.analysis.functions[func_ref.0 as usize],
                &self.analysis.layout,
                self.options,
                &self.plan,
            )?;
            let body = emitter.emit_body()?;
            if self.binary() {
                let mut framed = Vec::new();
                write_u32(
                    &mut framed,
                    ensure_u32(body.len(), "code body exceeds WebAssembly limits")?,
                );
                framed.extend_from_slice(&body);
                section.body().extend_from_slice(&framed);
            } else {
                let text = String::from_utf8_lossy(&body);
                for line in text.lines() {
                    section.body().push_str("  ");
                    section.body().push_str(line);
                    section.body().push_str("\n");
                }
            }
        }
        Ok(section)
    }

    fn global_init_bytes(&self, global: &GlobalVar) -> Result<Option<Vec<u8>>> {
        let Some(init) = &global.init else {
            return Ok(None);
        };
        let mut collector = ByteCollector { bytes: Vec::new() };
        const_bytes(init, &self.analysis.layout, &mut collector)?;
        if collector.bytes.iter().all(|&byte| byte == 0) {
            return Ok(None);
        }
        Ok(Some(collector.bytes))
    }

    fn emit_data_section(&self) -> Result<Option<Section>> {
        let layout = &self.analysis.layout;

        // Globals in address order, skipping the promoted and the
        // zero-initialised ones.
        let mut placed: Vec<(u32, Vec<u8>)> = Vec::new();
        for (index, global) in self.module.globals.iter().enumerate() {
            let g = crate::ir::GlobalId(index as u32);
            if self.plan.global_is_promoted(g) {
                continue;
            }
            let Some(bytes) = self.global_init_bytes(global)? else {
                continue;
            };
            placed.push((layout.global_address(g)?, bytes));
        }
        placed.sort_by_key(|(address, _)| *address);
        if placed.is_empty() {
            return Ok(None);
        }

        // Concatenate adjacent initialisers into one blob per run; the
        // saved chunk headers outweigh the padding bytes.
        let mut data = CodeBuffer::new(self.options.mode);
        let mut count: u32 = 0;
        let mut run_start: u32 = placed[0].0;
        let mut run: Vec<u8> = Vec::new();
        for (address, bytes) in placed {
            if run.is_empty() {
                run_start = address;
            } else {
                let end = run_start + run.len() as u32;
                if address < end {
                    return Err(Error::codegen("overlapping global initialisers"));
                }
                run.extend(std::iter::repeat_n(0u8, (address - end) as usize));
            }
            run.extend_from_slice(&bytes);
        }
        count += self.encode_data_section_chunks(&mut data, run_start, &run)?;

        let mut section = self.section(11, "Data");
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, count);
            payload.extend_from_slice(data.bytes());
            section.body().extend_from_slice(&payload);
        } else {
            section.body().extend_from_slice(data.bytes());
        }
        Ok(Some(section))
    }

    fn encode_data_section_chunk(&self, data: &mut CodeBuffer, address: u32, chunk: &[u8]) {
        debug_assert!(!chunk.is_empty());
        if self.binary() {
            let mut payload = Vec::new();
            write_u32(&mut payload, 0); // active segment, memory 0
            let mut offset = CodeBuffer::new(OutputMode::Wasm);
            encode_s32_inst(&mut offset, 0x41, "i32.const", address as i32);
            payload.extend_from_slice(offset.bytes());
            payload.push(0x0B);
            write_u32(&mut payload, chunk.len() as u32);
            payload.extend_from_slice(chunk);
            data.extend_from_slice(&payload);
        } else {
            data.push_str(&format!(
                "  (data (i32.const {address}) \"{}\")\n",
                escape_data_bytes(chunk)
            ));
        }
    }

    /// Strip leading and trailing zeros, then split on runs of six or
    /// more zero bytes; each chunk header costs at least five bytes, so
    /// shorter runs stay inline.
    fn encode_data_section_chunks(
        &self,
        data: &mut CodeBuffer,
        address: u32,
        bytes: &[u8],
    ) -> Result<u32> {
        let Some(first) = bytes.iter().position(|&byte| byte != 0) else {
            return Ok(0);
        };
        let last = bytes.iter().rposition(|&byte| byte != 0).expect("non-zero byte");
        let bytes = &bytes[first..=last];
        let address = address + first as u32;

        let mut chunks = 0;
        let mut cursor = 0;
        while cursor < bytes.len() {
            // Find the next run of >= 6 zero bytes.
            let mut split = None;
            let mut zeros = 0;
            for (index, &byte) in bytes.iter().enumerate().skip(cursor) {
                if byte == 0 {
                    zeros += 1;
                    if zeros == 6 {
                        split = Some(index + 1 - 6);
                        break;
                    }
                } else {
                    zeros = 0;
                }
            }
            match split {
                Some(split) => {
                    self.encode_data_section_chunk(
                        data,
                        address + cursor as u32,
                        &bytes[cursor..split],
                    );
                    chunks += 1;
                    let mut next = split;
                    while next < bytes.len() && bytes[next] == 0 {
                        next += 1;
                    }
                    cursor = next;
                }
                None => {
                    self.encode_data_section_chunk(data, address + cursor as u32, &bytes[cursor..]);
                    chunks += 1;
                    break;
                }
            }
        }
        Ok(chunks)
    }

    fn emit_name_section(&self) -> Result<Option<Section>> {
        if !self.binary() || !self.options.pretty_code {
            return Ok(None);
        }
        let mut section = self.section(0, "name");
        let mut entries = Vec::new();
        for (func_ref, function) in self.defined_functions() {
            let id = self.analysis.layout.function_id(func_ref).ok_or_else(|| {
                Error::codegen(format!("function `{}` has no id", function.name))
            })?;
            entries.push((id, function.name.as_str()));
        }
        let mut names = Vec::new();
        write_u32(
            &mut names,
            ensure_u32(entries.len(), "function count exceeds limits")?,
        );
        for (id, name) in entries {
            write_u32(&mut names, id);
            push_name(&mut names, name);
        }
        let mut payload = Vec::new();
        payload.push(0x01); // function-names subsection
        write_u32(
            &mut payload,
            ensure_u32(names.len(), "name subsection exceeds limits")?,
        );
        payload.extend_from_slice(&names);
        section.body().extend_from_slice(&payload);
        Ok(Some(section))
    }
}

fn scalar_type(ty: IrType) -> Result<ValueType> {
    match ty {
        IrType::I1 | IrType::I8 | IrType::I16 | IrType::I32 | IrType::Ptr => Ok(ValueType::I32),
        IrType::F32 => Ok(ValueType::F32),
        IrType::F64 => Ok(ValueType::F64),
        IrType::I64 => Err(Error::codegen(
            "64-bit integers are not supported by this emitter",
        )),
        IrType::Void => Err(Error::internal("void has no wasm value type")),
    }
}

fn constant_type(c: &Constant) -> Result<ValueType> {
    match c.ty() {
        IrType::F32 => Ok(ValueType::F32),
        IrType::F64 => Ok(ValueType::F64),
        _ => Ok(ValueType::I32),
    }
}
