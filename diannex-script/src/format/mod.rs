//! The DXB container format.
//!
//! A DXB file is a small envelope around one deflated-or-raw payload:
//!
//! ```text
//! 0x00  "DNX"                 signature
//! 0x03  u8   version          3 (4 adds per-section size prefixes)
//! 0x04  u8   flags            bit 0: payload zlib-compressed
//!                             bit 1: internal translation table present
//! 0x05  u32  uncompressed size
//! (0x09 u32  compressed size, only when bit 0 is set)
//! ....  payload
//! ```
//!
//! Payload sections, in order: scene metadata, function metadata, definition
//! metadata, bytecode (u32 length + blob), string table, translation table
//! (only when flag bit 1 is set), external function list. All integers are
//! little-endian; strings are null-terminated UTF-8. Version 4 prefixes every
//! section except the bytecode blob with a u32 byte size so consumers can
//! skip sections lazily; this decoder reads eagerly and discards the sizes.

pub mod translation;

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;

use crate::cursor::ByteCursor;

const SIGNATURE: &[u8] = b"DNX";
const FLAG_COMPRESSED: u8 = 1 << 0;
const FLAG_INTERNAL_TRANSLATION: u8 = 1 << 1;

/// High bit of a definition reference: set means the low 31 bits index the
/// string table, clear means the whole value indexes the translation table.
pub const STRING_REF_BIT: u32 = 1 << 31;

/// Scene or function metadata.
///
/// `instruction_indices[0]` is the entry point; the remaining entries are
/// `(value program, name program)` pairs that initialize flags. The index
/// count is always odd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeEntry {
    /// String-table index of the scene/function name.
    pub symbol: u32,
    pub instruction_indices: Vec<i32>,
}

impl CodeEntry {
    #[inline]
    pub fn entry_point(&self) -> i32 {
        self.instruction_indices[0]
    }

    /// The `(value program, name program)` flag-initializer pairs.
    pub fn flag_initializers(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.instruction_indices[1..]
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
    }
}

/// A named, optionally interpolated string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefinitionEntry {
    /// String-table index of the definition name.
    pub symbol: u32,
    /// Tagged string reference; see [`Binary::resolve_reference`].
    pub reference: u32,
    /// Entry of the interpolation program, or -1 when the raw string is final.
    pub instruction_index: i32,
}

/// An immutable snapshot of a decoded DXB file.
///
/// Only [`Binary::set_translation_table`] mutates it after decoding, as part
/// of overlaying an external translation file.
#[derive(Clone, Debug, Default)]
pub struct Binary {
    /// True when the binary carries its own translation strings, or after a
    /// translation file has been overlaid.
    pub translation_loaded: bool,
    /// Internal identifiers: scene/function names, variable and flag names.
    pub string_table: Vec<String>,
    /// User-visible, translatable strings.
    pub translation_table: Vec<String>,
    /// The raw instruction blob.
    pub instructions: Vec<u8>,
    /// Reserved indirection table; externals dispatch by name.
    pub external_functions: Vec<u32>,
    pub scenes: Vec<CodeEntry>,
    pub functions: Vec<CodeEntry>,
    pub definitions: Vec<DefinitionEntry>,
}

impl Binary {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(&path)
            .with_context(|| format!("read {:?}", path.as_ref()))?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = ByteCursor::new(data);

        let signature = cur.read_bytes(3).context("read signature")?;
        if signature != SIGNATURE {
            bail!("invalid signature");
        }
        let version = cur.read_u8().context("read version")?;
        if version != 3 && version != 4 {
            bail!("binary is not for this version (got {version}, expected 3)");
        }
        let flags = cur.read_u8().context("read flags")?;
        let uncompressed_size = cur.read_u32().context("read uncompressed size")? as usize;

        let payload: Cow<[u8]> = if flags & FLAG_COMPRESSED != 0 {
            let compressed_size = cur.read_u32().context("read compressed size")? as usize;
            let compressed = cur
                .read_bytes(compressed_size)
                .context("read compressed payload")?;
            let mut out = Vec::with_capacity(uncompressed_size);
            ZlibDecoder::new(compressed)
                .read_to_end(&mut out)
                .context("decompression failure")?;
            if out.len() != uncompressed_size {
                log::warn!(
                    "payload inflated to {} bytes, header said {}",
                    out.len(),
                    uncompressed_size
                );
            }
            Cow::Owned(out)
        } else {
            Cow::Borrowed(cur.read_rest())
        };

        let binary = Self::parse_payload(&payload, version, flags & FLAG_INTERNAL_TRANSLATION != 0)?;
        binary.validate()?;
        Ok(binary)
    }

    fn parse_payload(payload: &[u8], version: u8, internal_translation: bool) -> Result<Self> {
        let mut cur = ByteCursor::new(payload);
        let sized = version >= 4;

        skip_section_size(&mut cur, sized).context("read scene section size")?;
        let scenes = read_code_entries(&mut cur).context("read scene metadata")?;
        skip_section_size(&mut cur, sized).context("read function section size")?;
        let functions = read_code_entries(&mut cur).context("read function metadata")?;
        skip_section_size(&mut cur, sized).context("read definition section size")?;
        let definitions = read_definitions(&mut cur).context("read definition metadata")?;

        let code_len = cur.read_u32().context("read bytecode length")? as usize;
        let instructions = cur.read_bytes(code_len).context("read bytecode")?.to_vec();

        skip_section_size(&mut cur, sized).context("read string table section size")?;
        let string_table = read_string_table(&mut cur).context("read string table")?;

        let translation_table = if internal_translation {
            skip_section_size(&mut cur, sized).context("read translation section size")?;
            read_string_table(&mut cur).context("read translation table")?
        } else {
            Vec::new()
        };

        skip_section_size(&mut cur, sized).context("read external list section size")?;
        let external_count = cur.read_u32().context("read external function count")? as usize;
        let mut external_functions = Vec::with_capacity(external_count);
        for _ in 0..external_count {
            external_functions.push(cur.read_u32().context("read external function entry")?);
        }

        Ok(Binary {
            translation_loaded: internal_translation,
            string_table,
            translation_table,
            instructions,
            external_functions,
            scenes,
            functions,
            definitions,
        })
    }

    fn validate(&self) -> Result<()> {
        let strings = self.string_table.len();
        for (kind, entries) in [("scene", &self.scenes), ("function", &self.functions)] {
            for entry in entries.iter() {
                if entry.symbol as usize >= strings {
                    bail!(
                        "{kind} symbol {} out of range of string table ({strings} entries)",
                        entry.symbol
                    );
                }
                if entry.instruction_indices.len() % 2 == 0 {
                    bail!(
                        "{kind} '{}' has an even instruction index count ({})",
                        self.string_table[entry.symbol as usize],
                        entry.instruction_indices.len()
                    );
                }
            }
        }
        for def in &self.definitions {
            if def.symbol as usize >= strings {
                bail!(
                    "definition symbol {} out of range of string table ({strings} entries)",
                    def.symbol
                );
            }
        }
        Ok(())
    }

    #[inline]
    pub fn string(&self, index: usize) -> Option<&str> {
        self.string_table.get(index).map(String::as_str)
    }

    #[inline]
    pub fn translation(&self, index: usize) -> Option<&str> {
        self.translation_table.get(index).map(String::as_str)
    }

    pub fn symbol_name(&self, symbol: u32) -> Option<&str> {
        self.string(symbol as usize)
    }

    pub fn scene_by_name(&self, name: &str) -> Option<&CodeEntry> {
        self.scenes
            .iter()
            .find(|s| self.symbol_name(s.symbol) == Some(name))
    }

    pub fn function_by_name(&self, name: &str) -> Option<&CodeEntry> {
        self.functions
            .iter()
            .find(|f| self.symbol_name(f.symbol) == Some(name))
    }

    pub fn definition_by_name(&self, name: &str) -> Option<&DefinitionEntry> {
        self.definitions
            .iter()
            .find(|d| self.symbol_name(d.symbol) == Some(name))
    }

    /// Decode a tagged string reference: high bit set selects the string
    /// table through the low 31 bits, otherwise the whole value indexes the
    /// translation table.
    pub fn resolve_reference(&self, reference: u32) -> Option<&str> {
        if reference & STRING_REF_BIT != 0 {
            self.string((reference & !STRING_REF_BIT) as usize)
        } else {
            self.translation(reference as usize)
        }
    }

    /// Overlay a translation table, replacing any internal one.
    pub fn set_translation_table(&mut self, table: Vec<String>) {
        self.translation_table = table;
        self.translation_loaded = true;
    }
}

fn skip_section_size(cur: &mut ByteCursor, sized: bool) -> Result<()> {
    if sized {
        cur.read_u32()?;
    }
    Ok(())
}

fn read_code_entries(cur: &mut ByteCursor) -> Result<Vec<CodeEntry>> {
    let count = cur.read_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let symbol = cur.read_u32()?;
        let index_count = cur.read_u16()? as usize;
        let mut instruction_indices = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            instruction_indices.push(cur.read_i32()?);
        }
        entries.push(CodeEntry {
            symbol,
            instruction_indices,
        });
    }
    Ok(entries)
}

fn read_definitions(cur: &mut ByteCursor) -> Result<Vec<DefinitionEntry>> {
    let count = cur.read_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(DefinitionEntry {
            symbol: cur.read_u32()?,
            reference: cur.read_u32()?,
            instruction_index: cur.read_i32()?,
        });
    }
    Ok(entries)
}

fn read_string_table(cur: &mut ByteCursor) -> Result<Vec<String>> {
    let count = cur.read_u32()? as usize;
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        table.push(cur.read_cstring()?);
    }
    Ok(table)
}
