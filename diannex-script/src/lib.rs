//! diannex-script
//!
//! A decoder for the Diannex `DXB` dialogue container and a cooperative
//! stack VM that executes it. The host owns the loop:
//!
//! 1. decode a [`Binary`] from bytes,
//! 2. build an [`Interpreter`] over it with a [`FunctionHandler`],
//! 3. call [`Interpreter::run_scene`], then poll [`Interpreter::update`]
//!    until the machine pauses,
//! 4. show [`Interpreter::current_text`] and call [`Interpreter::resume`],
//!    or present [`Interpreter::choices`] and answer with
//!    [`Interpreter::choose_choice`],
//! 5. repeat until [`Interpreter::scene_completed`].
//!
//! One scene runs at a time; global variables and flags persist across
//! scenes and can be saved with [`SaveData`].

pub mod cursor;
pub mod format;
pub mod handler;
pub mod testing;
pub mod variant;
pub mod vm;

pub use format::{Binary, CodeEntry, DefinitionEntry};
pub use handler::{FunctionHandler, FunctionRegistry};
pub use variant::Variant;
pub use vm::save::SaveData;
pub use vm::{Choice, Interpreter, VmError};
