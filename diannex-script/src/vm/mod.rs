//! The Diannex stack machine.
//!
//! Execution is cooperative: the host calls [`Interpreter::update`] (usually
//! once per frame) and the machine runs exactly one instruction per call.
//! Suspension happens at `text_run` (a line is ready in
//! [`Interpreter::current_text`]), at `choice_select` (the host must pick
//! with [`Interpreter::choose_choice`]), and at `exit` at the bottom of the
//! call stack (the scene is over). Nothing else pauses the machine.
//!
//! Flag initializers and definition interpolation programs are small
//! sub-programs that must terminate with `exit`; the interpreter drains them
//! to their pause internally, so the host never observes them.

pub mod interpolate;
pub mod local;
pub mod opcode;
pub mod save;

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use crate::cursor::ByteCursor;
use crate::format::{translation, Binary, CodeEntry};
use crate::handler::FunctionHandler;
use crate::variant::{NumericPair, Variant};

use self::local::LocalStore;
use self::opcode::Inst;

/// Decides whether a choice with the given chance value is offered.
pub type ChanceCallback = Box<dyn FnMut(f64) -> bool>;
/// Picks an index from a weight list for `choose_select`.
pub type WeightedChanceCallback = Box<dyn FnMut(&[f64]) -> usize>;

#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("invalid opcode 0x{opcode:02X} at 0x{at:X}")]
    InvalidOpcode { opcode: u8, at: usize },
    #[error("instruction pointer {0} outside of bytecode")]
    IpOutOfRange(i64),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("no scene named '{0}'")]
    SceneNotFound(String),
    #[error("no function with id {0}")]
    FunctionNotFound(i32),
    #[error("no definition named '{0}'")]
    DefinitionNotFound(String),
    #[error("string table index {0} out of range")]
    StringOutOfRange(i32),
    #[error("translation table index {0} out of range")]
    TranslationOutOfRange(i32),
    #[error("array index {index} out of range ({len} elements)")]
    ArrayIndexOutOfRange { index: i32, len: usize },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("choice already in progress")]
    ChoiceAlreadyBegun,
    #[error("choice instruction outside of an active choice")]
    NotInChoice,
    #[error("choice selection with no accumulated choices")]
    EmptyChoices,
    #[error("weighted selection returned {index} with {len} options")]
    ChooseOutOfRange { index: usize, len: usize },
    #[error("choice index {index} out of range ({len} choices)")]
    ChoiceIndexOutOfRange { index: usize, len: usize },
    #[error("no choice is awaiting selection")]
    NoPendingChoice,
    #[error("{0} is not allowed inside a definition program")]
    ForbiddenInDefinition(&'static str),
}

/// A pending user choice: where to jump and what to show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Choice {
    pub address: i32,
    pub text: String,
}

#[derive(Clone, Copy, Debug)]
struct ChooseOption {
    weight: f64,
    pointer: i32,
}

/// A suspended caller: restored on `ret`/`exit`.
#[derive(Debug)]
struct Frame {
    return_ip: i32,
    stack: Vec<Variant>,
    locals: LocalStore,
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
}

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Clone, Copy)]
enum BitOp {
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

fn default_chance(chance: f64) -> bool {
    chance >= 1.0 || rand::thread_rng().gen::<f64>() < chance
}

fn default_weighted_chance(weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0;
    }
    let roll = rand::thread_rng().gen::<f64>() * total;
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if roll < acc {
            return i;
        }
    }
    weights.len() - 1
}

/// The virtual machine. One scene runs at a time; `run_scene` discards any
/// prior execution state (globals and flags persist).
pub struct Interpreter {
    binary: Binary,
    handler: Box<dyn FunctionHandler>,
    chance: ChanceCallback,
    weighted_chance: WeightedChanceCallback,
    strict: bool,

    ip: i32,
    stack: Vec<Variant>,
    save_register: Variant,
    locals: LocalStore,
    call_stack: Vec<Frame>,
    globals: HashMap<String, Variant>,
    flags: HashMap<String, Variant>,
    choices: Vec<Choice>,
    choose_options: Vec<ChooseOption>,
    definitions_cache: HashMap<String, String>,

    in_choice: bool,
    select_choice: bool,
    running_text: bool,
    paused: bool,
    scene_completed: bool,
    in_definition: bool,

    current_scene: Option<String>,
    current_text: Option<String>,
}

impl Interpreter {
    pub fn new<H: FunctionHandler + 'static>(binary: Binary, handler: H) -> Result<Self> {
        let mut vm = Self {
            binary,
            handler: Box::new(handler),
            chance: Box::new(default_chance),
            weighted_chance: Box::new(default_weighted_chance),
            strict: false,
            ip: -1,
            stack: Vec::with_capacity(32),
            save_register: Variant::Nil,
            locals: LocalStore::new(),
            call_stack: Vec::new(),
            globals: HashMap::new(),
            flags: HashMap::new(),
            choices: Vec::new(),
            choose_options: Vec::new(),
            definitions_cache: HashMap::new(),
            in_choice: false,
            select_choice: false,
            running_text: false,
            paused: true,
            scene_completed: false,
            in_definition: false,
            current_scene: None,
            current_text: None,
        };
        if vm.binary.translation_loaded {
            vm.resolve_all_definitions().context("resolve definitions")?;
        }
        Ok(vm)
    }

    // -------------------------
    // Host-facing surface
    // -------------------------

    pub fn binary(&self) -> &Binary {
        &self.binary
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn running_text(&self) -> bool {
        self.running_text
    }

    pub fn select_choice(&self) -> bool {
        self.select_choice
    }

    pub fn scene_completed(&self) -> bool {
        self.scene_completed
    }

    pub fn current_text(&self) -> Option<&str> {
        self.current_text.as_deref()
    }

    pub fn current_scene(&self) -> Option<&str> {
        self.current_scene.as_deref()
    }

    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    pub fn get_flag(&self, name: &str) -> Variant {
        self.flags.get(name).cloned().unwrap_or_default()
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: Variant) {
        self.flags.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Variant {
        self.globals.get(name).cloned().unwrap_or_default()
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Variant) {
        self.globals.insert(name.into(), value);
    }

    /// Turn silent type-mismatch no-ops into errors.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn set_chance_callback(&mut self, cb: impl FnMut(f64) -> bool + 'static) {
        self.chance = Box::new(cb);
    }

    pub fn set_weighted_chance_callback(&mut self, cb: impl FnMut(&[f64]) -> usize + 'static) {
        self.weighted_chance = Box::new(cb);
    }

    /// Start a scene: reset the runtime state, run its flag initializers and
    /// leave the machine unpaused at the scene entry point.
    pub fn run_scene(&mut self, name: &str) -> Result<()> {
        let scene = self
            .binary
            .scene_by_name(name)
            .ok_or_else(|| anyhow!(VmError::SceneNotFound(name.to_owned())))?
            .clone();

        self.stack.clear();
        self.save_register = Variant::Nil;
        self.locals = LocalStore::new();
        self.call_stack.clear();
        self.choices.clear();
        self.choose_options.clear();
        self.in_choice = false;
        self.select_choice = false;
        self.running_text = false;
        self.scene_completed = false;
        self.paused = false;
        self.current_text = None;
        self.current_scene = Some(name.to_owned());
        self.ip = -1;

        self.run_flag_initializers(&scene)
            .with_context(|| format!("initialize flags for scene '{name}'"))?;

        self.ip = scene.entry_point();
        Ok(())
    }

    /// Execute one instruction; a no-op while paused or with no active scene.
    pub fn update(&mut self) -> Result<()> {
        if self.paused || self.ip < 0 {
            return Ok(());
        }
        self.step()
    }

    /// Acknowledge a `text_run` pause. Does nothing while a choice selection
    /// is pending or after the scene has completed.
    pub fn resume(&mut self) {
        self.running_text = false;
        if self.select_choice || self.scene_completed {
            return;
        }
        self.paused = false;
    }

    /// Answer a pending `choice_select` by index into [`Interpreter::choices`].
    pub fn choose_choice(&mut self, index: usize) -> Result<()> {
        if !self.select_choice {
            return Err(VmError::NoPendingChoice.into());
        }
        let len = self.choices.len();
        let choice = self
            .choices
            .get(index)
            .ok_or(VmError::ChoiceIndexOutOfRange { index, len })?;
        self.ip = choice.address;
        self.select_choice = false;
        self.paused = false;
        self.in_choice = false;
        self.choices.clear();
        Ok(())
    }

    /// Resolve a definition by name, caching the result.
    pub fn get_definition(&mut self, name: &str) -> Result<String> {
        if let Some(s) = self.definitions_cache.get(name) {
            return Ok(s.clone());
        }
        let resolved = self.resolve_definition(name)?;
        self.definitions_cache.insert(name.to_owned(), resolved.clone());
        Ok(resolved)
    }

    /// Overlay a translation file, replacing the translation table and
    /// re-resolving every definition.
    pub fn load_translation_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let table = translation::load_translation_file(path)?;
        self.apply_translation_table(table)
    }

    /// Same as [`Interpreter::load_translation_file`], for preloaded text.
    pub fn load_translation_text(&mut self, text: &str) -> Result<()> {
        self.apply_translation_table(translation::parse_translation_text(text))
    }

    fn apply_translation_table(&mut self, table: Vec<String>) -> Result<()> {
        self.binary.set_translation_table(table);
        self.definitions_cache.clear();
        self.resolve_all_definitions()
    }

    // -------------------------
    // Sub-program execution
    // -------------------------

    /// Run a sub-program that must terminate with `exit`. The call stack is
    /// swapped out so the terminating `exit` bottoms out here instead of
    /// unwinding the caller; `ip` and the pause booleans are restored
    /// afterwards. The operand stack and locals are shared with the caller.
    fn run_to_pause(&mut self, entry: i32) -> Result<()> {
        let saved_ip = self.ip;
        let saved_paused = self.paused;
        let saved_completed = self.scene_completed;
        let saved_running_text = self.running_text;
        let saved_select_choice = self.select_choice;
        let saved_call_stack = std::mem::take(&mut self.call_stack);

        self.ip = entry;
        self.paused = false;
        self.scene_completed = false;

        let mut run_err = None;
        while !self.paused {
            if let Err(e) = self.step() {
                run_err = Some(e);
                break;
            }
        }

        self.ip = saved_ip;
        self.paused = saved_paused;
        self.scene_completed = saved_completed;
        self.running_text = saved_running_text;
        self.select_choice = saved_select_choice;
        self.call_stack = saved_call_stack;

        match run_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_program_for_value(&mut self, entry: i32) -> Result<Variant> {
        let depth = self.stack.len();
        self.run_to_pause(entry)?;
        if self.stack.len() <= depth {
            return Err(anyhow!("initializer program at {entry} produced no value"));
        }
        self.pop()
    }

    /// Run the `(value program, name program)` pairs of a scene or function.
    /// A flag is only seeded when it is not already set; the alias is
    /// recorded either way so local IDs line up.
    fn run_flag_initializers(&mut self, entry: &CodeEntry) -> Result<()> {
        for (value_ip, name_ip) in entry.flag_initializers() {
            let value = self.run_program_for_value(value_ip)?;
            let name = self.run_program_for_value(name_ip)?;
            match name {
                Variant::Str(name) => {
                    if !self.flags.contains_key(&name) {
                        self.flags.insert(name.clone(), value);
                    }
                    self.locals.push_flag_alias(name);
                }
                other => {
                    log::warn!(
                        "flag initializer produced {} instead of a name; pair skipped",
                        other.type_name()
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve_definition(&mut self, name: &str) -> Result<String> {
        let def = *self
            .binary
            .definition_by_name(name)
            .ok_or_else(|| anyhow!(VmError::DefinitionNotFound(name.to_owned())))?;
        let raw = self
            .binary
            .resolve_reference(def.reference)
            .ok_or_else(|| {
                anyhow!(
                    "definition '{name}' has a dangling string reference 0x{:08X}",
                    def.reference
                )
            })?
            .to_owned();
        if def.instruction_index < 0 {
            return Ok(raw);
        }

        let depth = self.stack.len();
        self.in_definition = true;
        let run = self.run_to_pause(def.instruction_index);
        self.in_definition = false;
        run.with_context(|| format!("run interpolation program for definition '{name}'"))?;

        let mut values = Vec::new();
        while self.stack.len() > depth {
            if let Some(v) = self.stack.pop() {
                values.push(v);
            }
        }
        Ok(interpolate::interpolate(&raw, &values))
    }

    fn resolve_all_definitions(&mut self) -> Result<()> {
        for def in self.binary.definitions.clone() {
            if let Some(name) = self.binary.symbol_name(def.symbol).map(str::to_owned) {
                let resolved = self.resolve_definition(&name)?;
                self.definitions_cache.insert(name, resolved);
            }
        }
        Ok(())
    }

    // -------------------------
    // Dispatch
    // -------------------------

    fn step(&mut self) -> Result<()> {
        let ip = self.ip;
        if ip < 0 {
            return Err(VmError::IpOutOfRange(ip as i64).into());
        }
        let (inst, next_ip) = {
            let mut cur = ByteCursor::new(&self.binary.instructions);
            cur.seek(ip as usize)
                .map_err(|_| VmError::IpOutOfRange(ip as i64))?;
            let inst = Inst::decode(&mut cur)?;
            (inst, cur.position() as i32)
        };
        self.ip = next_ip;
        self.exec(inst)
    }

    fn exec(&mut self, inst: Inst) -> Result<()> {
        match inst {
            Inst::Nop => {}

            Inst::FreeLocal(id) => {
                if id >= 0 {
                    self.locals.free(id as usize);
                }
            }

            Inst::Save => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or(VmError::StackUnderflow)?;
                self.save_register = top;
            }
            Inst::Load => self.stack.push(self.save_register.clone()),

            Inst::PushUndefined => self.stack.push(Variant::Nil),
            Inst::PushInt(v) => self.stack.push(Variant::Int(v)),
            Inst::PushDouble(v) => self.stack.push(Variant::Double(v)),
            Inst::PushString(idx) => {
                let s = self.translation_at(idx)?;
                self.stack.push(Variant::Str(s));
            }
            Inst::PushBinaryString(idx) => {
                let s = self.string_at(idx)?;
                self.stack.push(Variant::Str(s));
            }
            Inst::PushInterpString(idx, count) => {
                let template = self.translation_at(idx)?;
                self.push_interpolated(template, count)?;
            }
            Inst::PushBinaryInterpString(idx, count) => {
                let template = self.string_at(idx)?;
                self.push_interpolated(template, count)?;
            }

            Inst::MakeArray(count) => {
                let count = usize::try_from(count)
                    .map_err(|_| anyhow!("make_array with negative count {count}"))?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.stack.push(Variant::array(items));
            }
            Inst::PushArrayIndex => self.op_push_array_index()?,
            Inst::SetArrayIndex => self.op_set_array_index()?,

            Inst::SetVarGlobal(idx) => {
                let value = self.pop()?;
                let name = self.string_at(idx)?;
                self.globals.insert(name, value);
            }
            Inst::PushVarGlobal(idx) => {
                let name = self.string_at(idx)?;
                let value = self.globals.get(&name).cloned().unwrap_or_default();
                self.stack.push(value);
            }
            Inst::SetVarLocal(id) => {
                let value = self.pop()?;
                let id = usize::try_from(id).map_err(|_| anyhow!("negative local id {id}"))?;
                self.locals.set(id, value, &mut self.flags);
            }
            Inst::PushVarLocal(id) => {
                let id = usize::try_from(id).map_err(|_| anyhow!("negative local id {id}"))?;
                let value = self.locals.get(id, &self.flags);
                self.stack.push(value);
            }

            Inst::Pop => {
                self.pop()?;
            }
            Inst::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or(VmError::StackUnderflow)?;
                self.stack.push(top);
            }
            Inst::Dup2 => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow.into());
                }
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.stack.push(a);
                self.stack.push(b);
            }

            Inst::Add => self.arithmetic(ArithOp::Add)?,
            Inst::Sub => self.arithmetic(ArithOp::Sub)?,
            Inst::Mul => self.arithmetic(ArithOp::Mul)?,
            Inst::Div => self.arithmetic(ArithOp::Div)?,
            Inst::Mod => self.arithmetic(ArithOp::Mod)?,
            Inst::Power => self.arithmetic(ArithOp::Power)?,

            Inst::Neg => {
                let value = self.pop()?;
                match value {
                    Variant::Int(v) => self.stack.push(Variant::Int(v.wrapping_neg())),
                    Variant::Double(v) => self.stack.push(Variant::Double(-v)),
                    other => self.discard_mismatch("negation", other.type_name())?,
                }
            }
            Inst::Invert => {
                let value = self.pop()?;
                self.stack
                    .push(Variant::Int(if value.truthy() { 0 } else { 1 }));
            }
            Inst::BitNegate => {
                let value = self.pop()?;
                match value {
                    Variant::Int(v) => self.stack.push(Variant::Int(!v)),
                    other => self.discard_mismatch("bitwise negation", other.type_name())?,
                }
            }

            Inst::BitLeftShift => self.bitwise(BitOp::Shl)?,
            Inst::BitRightShift => self.bitwise(BitOp::Shr)?,
            Inst::BitAnd => self.bitwise(BitOp::And)?,
            Inst::BitOr => self.bitwise(BitOp::Or)?,
            Inst::BitXor => self.bitwise(BitOp::Xor)?,

            Inst::CompareEqual => self.comparison(CmpOp::Eq)?,
            Inst::CompareNotEqual => self.comparison(CmpOp::Ne)?,
            Inst::CompareGreater => self.comparison(CmpOp::Gt)?,
            Inst::CompareLess => self.comparison(CmpOp::Lt)?,
            Inst::CompareGreaterEqual => self.comparison(CmpOp::Ge)?,
            Inst::CompareLessEqual => self.comparison(CmpOp::Le)?,

            Inst::Jump(off) => self.ip += off,
            Inst::JumpTruthy(off) => {
                let value = self.pop()?;
                if value.truthy() {
                    self.ip += off;
                }
            }
            Inst::JumpFalsey(off) => {
                let value = self.pop()?;
                if !value.truthy() {
                    self.ip += off;
                }
            }

            Inst::Exit => {
                self.locals.clear();
                match self.call_stack.pop() {
                    Some(frame) => {
                        self.ip = frame.return_ip;
                        self.stack = frame.stack;
                        self.locals = frame.locals;
                        self.stack.push(Variant::Nil);
                    }
                    None => {
                        self.ip = -1;
                        self.paused = true;
                        self.scene_completed = true;
                    }
                }
            }
            Inst::Return => {
                let value = self.pop()?;
                match self.call_stack.pop() {
                    Some(frame) => {
                        self.ip = frame.return_ip;
                        self.stack = frame.stack;
                        self.locals = frame.locals;
                        self.stack.push(value);
                    }
                    None => {
                        log::warn!("return at the bottom of the call stack; scene ends, value discarded");
                        self.locals.clear();
                        self.ip = -1;
                        self.paused = true;
                        self.scene_completed = true;
                    }
                }
            }

            Inst::Call(id, argc) => self.op_call(id, argc)?,
            Inst::CallExternal(id, argc) => {
                let name = self.string_at(id)?;
                let mut args = Vec::with_capacity(argc.max(0) as usize);
                for _ in 0..argc {
                    args.push(self.pop()?);
                }
                let result = self.handler.invoke(&name, args)?;
                self.stack.push(result);
            }

            Inst::ChoiceBegin => {
                self.forbid_in_definition("choice_begin")?;
                if self.in_choice {
                    return Err(VmError::ChoiceAlreadyBegun.into());
                }
                self.in_choice = true;
                self.choices.clear();
            }
            Inst::ChoiceAdd(off) => self.op_choice_add(off, false)?,
            Inst::ChoiceAddTruthy(off) => self.op_choice_add(off, true)?,
            Inst::ChoiceSelect => {
                self.forbid_in_definition("choice_select")?;
                if !self.in_choice {
                    return Err(VmError::NotInChoice.into());
                }
                if self.choices.is_empty() {
                    return Err(VmError::EmptyChoices.into());
                }
                self.select_choice = true;
                self.paused = true;
            }

            Inst::ChooseAdd(off) => self.op_choose_add(off, false)?,
            Inst::ChooseAddTruthy(off) => self.op_choose_add(off, true)?,
            Inst::ChooseSelect => {
                self.forbid_in_definition("choose_select")?;
                let weights: Vec<f64> = self.choose_options.iter().map(|o| o.weight).collect();
                let index = (self.weighted_chance)(&weights);
                let len = self.choose_options.len();
                if index >= len {
                    return Err(VmError::ChooseOutOfRange { index, len }.into());
                }
                self.ip = self.choose_options[index].pointer;
                self.choose_options.clear();
            }

            Inst::TextRun => {
                self.forbid_in_definition("text_run")?;
                let value = self.pop()?;
                match value {
                    Variant::Str(text) => {
                        self.current_text = Some(text);
                        self.running_text = true;
                        self.paused = true;
                    }
                    other => self.discard_mismatch("text_run", other.type_name())?,
                }
            }
        }
        Ok(())
    }

    // -------------------------
    // Opcode helpers
    // -------------------------

    fn pop(&mut self) -> Result<Variant> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(VmError::StackUnderflow.into()),
        }
    }

    fn string_at(&self, index: i32) -> Result<String> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.binary.string(i))
            .map(str::to_owned)
            .ok_or_else(|| VmError::StringOutOfRange(index).into())
    }

    fn translation_at(&self, index: i32) -> Result<String> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.binary.translation(i))
            .map(str::to_owned)
            .ok_or_else(|| VmError::TranslationOutOfRange(index).into())
    }

    /// Type-mismatch policy: operands are already consumed; push nothing and
    /// warn, or fail in strict mode.
    fn discard_mismatch(&mut self, context: &str, found: &str) -> Result<()> {
        if self.strict {
            return Err(VmError::TypeMismatch(format!("{context} ({found})")).into());
        }
        log::warn!("{context} ({found}); operands discarded");
        Ok(())
    }

    fn forbid_in_definition(&self, op: &'static str) -> Result<()> {
        if self.in_definition {
            return Err(VmError::ForbiddenInDefinition(op).into());
        }
        Ok(())
    }

    fn push_interpolated(&mut self, template: String, count: i32) -> Result<()> {
        let count = usize::try_from(count)
            .map_err(|_| anyhow!("interpolation with negative value count {count}"))?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        let text = interpolate::interpolate(&template, &values);
        self.stack.push(Variant::Str(text));
        Ok(())
    }

    fn arithmetic(&mut self, op: ArithOp) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let Some(pair) = Variant::numeric_pair(&a, &b) else {
            return self.discard_mismatch(
                "arithmetic",
                &format!("{} and {}", a.type_name(), b.type_name()),
            );
        };
        if let (ArithOp::Div | ArithOp::Mod, NumericPair::Int(_, 0)) = (op, pair) {
            return self.discard_mismatch("integer division", "zero divisor");
        }
        let out = match (op, pair) {
            (ArithOp::Add, NumericPair::Int(x, y)) => Variant::Int(x.wrapping_add(y)),
            (ArithOp::Add, NumericPair::Double(x, y)) => Variant::Double(x + y),
            (ArithOp::Sub, NumericPair::Int(x, y)) => Variant::Int(x.wrapping_sub(y)),
            (ArithOp::Sub, NumericPair::Double(x, y)) => Variant::Double(x - y),
            (ArithOp::Mul, NumericPair::Int(x, y)) => Variant::Int(x.wrapping_mul(y)),
            (ArithOp::Mul, NumericPair::Double(x, y)) => Variant::Double(x * y),
            (ArithOp::Div, NumericPair::Int(x, y)) => Variant::Int(x.wrapping_div(y)),
            (ArithOp::Div, NumericPair::Double(x, y)) => Variant::Double(x / y),
            (ArithOp::Mod, NumericPair::Int(x, y)) => Variant::Int(x.wrapping_rem(y)),
            (ArithOp::Mod, NumericPair::Double(x, y)) => Variant::Double(x % y),
            (ArithOp::Power, NumericPair::Int(x, y)) => {
                Variant::Double((x as f64).powf(y as f64))
            }
            (ArithOp::Power, NumericPair::Double(x, y)) => Variant::Double(x.powf(y)),
        };
        self.stack.push(out);
        Ok(())
    }

    fn comparison(&mut self, op: CmpOp) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let Some(pair) = Variant::numeric_pair(&a, &b) else {
            return self.discard_mismatch(
                "comparison",
                &format!("{} and {}", a.type_name(), b.type_name()),
            );
        };
        let truth = match pair {
            NumericPair::Int(x, y) => match op {
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
                CmpOp::Gt => x > y,
                CmpOp::Lt => x < y,
                CmpOp::Ge => x >= y,
                CmpOp::Le => x <= y,
            },
            NumericPair::Double(x, y) => match op {
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
                CmpOp::Gt => x > y,
                CmpOp::Lt => x < y,
                CmpOp::Ge => x >= y,
                CmpOp::Le => x <= y,
            },
        };
        self.stack.push(Variant::Int(truth as i32));
        Ok(())
    }

    fn bitwise(&mut self, op: BitOp) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Variant::Int(x), Variant::Int(y)) = (&a, &b) else {
            return self.discard_mismatch(
                "bitwise arithmetic",
                &format!("{} and {}", a.type_name(), b.type_name()),
            );
        };
        let out = match op {
            BitOp::Shl => x.wrapping_shl(*y as u32),
            BitOp::Shr => x.wrapping_shr(*y as u32),
            BitOp::And => x & y,
            BitOp::Or => x | y,
            BitOp::Xor => x ^ y,
        };
        self.stack.push(Variant::Int(out));
        Ok(())
    }

    fn op_push_array_index(&mut self) -> Result<()> {
        let index = self.pop()?;
        let array = self.pop()?;
        if let (Variant::Array(items), Some(i)) = (&array, index.as_int()) {
            let items = items.borrow();
            if i < 0 || i as usize >= items.len() {
                return Err(VmError::ArrayIndexOutOfRange {
                    index: i,
                    len: items.len(),
                }
                .into());
            }
            let value = items[i as usize].clone();
            drop(items);
            self.stack.push(value);
            Ok(())
        } else {
            self.discard_mismatch(
                "array read",
                &format!("{} indexed by {}", array.type_name(), index.type_name()),
            )
        }
    }

    fn op_set_array_index(&mut self) -> Result<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let array = self.pop()?;
        if let (Variant::Array(items), Some(i)) = (&array, index.as_int()) {
            {
                let mut items = items.borrow_mut();
                if i < 0 || i as usize >= items.len() {
                    return Err(VmError::ArrayIndexOutOfRange {
                        index: i,
                        len: items.len(),
                    }
                    .into());
                }
                items[i as usize] = value;
            }
            // Push the same handle back; copies observe the store.
            self.stack.push(Variant::Array(Rc::clone(items)));
            Ok(())
        } else {
            self.discard_mismatch(
                "array store",
                &format!("{} indexed by {}", array.type_name(), index.type_name()),
            )
        }
    }

    /// The call convention: arguments are popped (first popped becomes
    /// argument 0), the caller's frame is parked, the callee's flag
    /// initializers run on the fresh frame, then the arguments are appended
    /// to the callee's local store. A function's `k` flag aliases therefore
    /// hold local IDs `0..k-1` and its arguments follow at `k..k+argc-1`;
    /// the flag overlay is consulted by ID, so the two ranges cannot share
    /// the leading slots.
    fn op_call(&mut self, id: i32, argc: i32) -> Result<()> {
        let func = usize::try_from(id)
            .ok()
            .and_then(|i| self.binary.functions.get(i))
            .cloned()
            .ok_or(VmError::FunctionNotFound(id))?;

        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }

        let frame = Frame {
            return_ip: self.ip,
            stack: std::mem::take(&mut self.stack),
            locals: std::mem::take(&mut self.locals),
        };
        let mut parked = std::mem::take(&mut self.call_stack);
        parked.push(frame);

        self.run_flag_initializers(&func)?;

        self.call_stack = parked;
        self.ip = func.entry_point();
        for arg in args {
            self.locals.push_value(arg);
        }
        Ok(())
    }

    fn op_choice_add(&mut self, off: i32, conditional: bool) -> Result<()> {
        self.forbid_in_definition("choice_add")?;
        if !self.in_choice {
            return Err(VmError::NotInChoice.into());
        }
        let chance = self.pop()?;
        let text = self.pop()?;
        let condition_met = if conditional { self.pop()?.truthy() } else { true };
        let address = self.ip + off;

        let Some(chance) = chance.as_number() else {
            return self.discard_mismatch("choice chance", chance.type_name());
        };
        let text = match text {
            Variant::Str(s) => s,
            other => return self.discard_mismatch("choice text", other.type_name()),
        };
        if condition_met && (self.chance)(chance) {
            self.choices.push(Choice { address, text });
        }
        Ok(())
    }

    fn op_choose_add(&mut self, off: i32, conditional: bool) -> Result<()> {
        self.forbid_in_definition("choose_add")?;
        let weight = self.pop()?;
        let condition_met = if conditional { self.pop()?.truthy() } else { true };
        let pointer = self.ip + off;

        let Some(weight) = weight.as_number() else {
            return self.discard_mismatch("choose weight", weight.type_name());
        };
        if condition_met {
            self.choose_options.push(ChooseOption { weight, pointer });
        }
        Ok(())
    }
}
