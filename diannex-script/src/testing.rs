//! Developer-facing utilities: an in-memory DXB builder and a tiny bytecode
//! assembler.
//!
//! This is intentionally a module (not a test-only helper) so unit tests,
//! integration tests and host prototypes can all construct valid binaries
//! without a compiler in the loop.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{bail, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::format::STRING_REF_BIT;
use crate::vm::opcode::Opcode;

/// Tag a string-table index as a definition reference.
pub fn string_ref(index: i32) -> u32 {
    (index as u32) | STRING_REF_BIT
}

/// Bytecode assembler with label-relative branch fixup.
///
/// Branch operands are encoded relative to the first byte after the decoded
/// instruction; [`Asm::branch`] records a fixup and [`Asm::finish`] patches
/// it once every label position is known.
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset; use as a scene/function entry point or a definition
    /// program index.
    pub fn pos(&self) -> i32 {
        self.code.len() as i32
    }

    pub fn label(&mut self, name: impl Into<String>) -> &mut Self {
        self.labels.insert(name.into(), self.code.len());
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    pub fn op_i32(&mut self, op: Opcode, value: i32) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn op_f64(&mut self, op: Opcode, value: f64) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn op_pair(&mut self, op: Opcode, a: i32, b: i32) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&a.to_le_bytes());
        self.code.extend_from_slice(&b.to_le_bytes());
        self
    }

    /// Emit an opcode whose single i32 operand is a label-relative offset
    /// (`jump*`, `choice_add*`, `choose_add*`).
    pub fn branch(&mut self, op: Opcode, label: impl Into<String>) -> &mut Self {
        self.code.push(op as u8);
        self.fixups.push((self.code.len(), label.into()));
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let mut code = self.code;
        for (at, label) in self.fixups {
            let Some(&target) = self.labels.get(&label) else {
                bail!("unresolved label '{label}'");
            };
            let offset = target as i64 - (at as i64 + 4);
            code[at..at + 4].copy_from_slice(&(offset as i32).to_le_bytes());
        }
        Ok(code)
    }
}

/// Assembles a complete DXB image in memory.
#[derive(Default)]
pub struct DxbBuilder {
    version4: bool,
    compress: bool,
    strings: Vec<String>,
    translations: Vec<String>,
    code: Vec<u8>,
    scenes: Vec<(u32, Vec<i32>)>,
    functions: Vec<(u32, Vec<i32>)>,
    definitions: Vec<(u32, u32, i32)>,
    externals: Vec<u32>,
}

impl DxbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version4(&mut self) -> &mut Self {
        self.version4 = true;
        self
    }

    pub fn compressed(&mut self) -> &mut Self {
        self.compress = true;
        self
    }

    /// Intern a string-table entry and return its index.
    pub fn string(&mut self, s: &str) -> i32 {
        intern(&mut self.strings, s)
    }

    /// Intern a translation-table entry and return its index.
    pub fn translation(&mut self, s: &str) -> i32 {
        intern(&mut self.translations, s)
    }

    pub fn set_code(&mut self, code: Vec<u8>) -> &mut Self {
        self.code = code;
        self
    }

    pub fn scene(&mut self, name: &str, instruction_indices: Vec<i32>) -> &mut Self {
        let symbol = self.string(name) as u32;
        self.scenes.push((symbol, instruction_indices));
        self
    }

    pub fn function(&mut self, name: &str, instruction_indices: Vec<i32>) -> &mut Self {
        let symbol = self.string(name) as u32;
        self.functions.push((symbol, instruction_indices));
        self
    }

    pub fn definition(&mut self, name: &str, reference: u32, instruction_index: i32) -> &mut Self {
        let symbol = self.string(name) as u32;
        self.definitions.push((symbol, reference, instruction_index));
        self
    }

    pub fn external(&mut self, value: u32) -> &mut Self {
        self.externals.push(value);
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        self.section(&mut payload, code_entries(&self.scenes));
        self.section(&mut payload, code_entries(&self.functions));

        let mut defs = Vec::new();
        put_u32(&mut defs, self.definitions.len() as u32);
        for &(symbol, reference, index) in &self.definitions {
            put_u32(&mut defs, symbol);
            put_u32(&mut defs, reference);
            defs.extend_from_slice(&index.to_le_bytes());
        }
        self.section(&mut payload, defs);

        // The bytecode blob carries its own length in both versions.
        put_u32(&mut payload, self.code.len() as u32);
        payload.extend_from_slice(&self.code);

        self.section(&mut payload, string_table(&self.strings));
        let has_translations = !self.translations.is_empty();
        if has_translations {
            self.section(&mut payload, string_table(&self.translations));
        }

        let mut ext = Vec::new();
        put_u32(&mut ext, self.externals.len() as u32);
        for &e in &self.externals {
            put_u32(&mut ext, e);
        }
        self.section(&mut payload, ext);

        let mut out = Vec::with_capacity(payload.len() + 16);
        out.extend_from_slice(b"DNX");
        out.push(if self.version4 { 4 } else { 3 });
        let mut flags = 0u8;
        if self.compress {
            flags |= 1 << 0;
        }
        if has_translations {
            flags |= 1 << 1;
        }
        out.push(flags);
        put_u32(&mut out, payload.len() as u32);

        if self.compress {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&payload)?;
            let compressed = enc.finish()?;
            put_u32(&mut out, compressed.len() as u32);
            out.extend_from_slice(&compressed);
        } else {
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }

    fn section(&self, payload: &mut Vec<u8>, body: Vec<u8>) {
        if self.version4 {
            put_u32(payload, body.len() as u32);
        }
        payload.extend_from_slice(&body);
    }
}

fn intern(table: &mut Vec<String>, s: &str) -> i32 {
    if let Some(i) = table.iter().position(|e| e == s) {
        return i as i32;
    }
    table.push(s.to_owned());
    (table.len() - 1) as i32
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn code_entries(entries: &[(u32, Vec<i32>)]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, entries.len() as u32);
    for (symbol, indices) in entries {
        put_u32(&mut out, *symbol);
        out.extend_from_slice(&(indices.len() as u16).to_le_bytes());
        for &i in indices {
            out.extend_from_slice(&i.to_le_bytes());
        }
    }
    out
}

fn string_table(table: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, table.len() as u32);
    for s in table {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Binary;

    #[test]
    fn asm_patches_forward_branches() {
        let mut asm = Asm::new();
        asm.branch(Opcode::Jump, "end");
        asm.op_i32(Opcode::PushInt, 1);
        asm.label("end");
        asm.op(Opcode::Exit);
        let code = asm.finish().unwrap();
        // jump operand: skip the 5-byte push_int.
        assert_eq!(i32::from_le_bytes(code[1..5].try_into().unwrap()), 5);
    }

    #[test]
    fn asm_rejects_unknown_labels() {
        let mut asm = Asm::new();
        asm.branch(Opcode::Jump, "nowhere");
        assert!(asm.finish().is_err());
    }

    #[test]
    fn builder_output_decodes() {
        let mut asm = Asm::new();
        let entry = asm.pos();
        asm.op(Opcode::Exit);
        let code = asm.finish().unwrap();

        let mut b = DxbBuilder::new();
        b.translation("Hello!");
        b.scene("intro", vec![entry]);
        b.set_code(code);
        let bytes = b.build().unwrap();

        let binary = Binary::from_bytes(&bytes).unwrap();
        assert!(binary.translation_loaded);
        assert_eq!(binary.translation_table, vec!["Hello!"]);
        assert!(binary.scene_by_name("intro").is_some());
    }
}
