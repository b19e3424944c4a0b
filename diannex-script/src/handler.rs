//! Host-side dispatch for externally callable functions.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::variant::Variant;

/// The interface the interpreter calls external functions through.
///
/// Implement this on your game state, or use [`FunctionRegistry`] when a
/// plain name-to-closure map is enough. Errors returned here abort the
/// current `update()` and propagate to the host unchanged. Handlers run
/// synchronously on the caller's thread and must not call back into the
/// interpreter.
pub trait FunctionHandler {
    fn invoke(&mut self, name: &str, args: Vec<Variant>) -> Result<Variant>;
}

pub type ExternalFn = Box<dyn FnMut(Vec<Variant>) -> Result<Variant>>;

/// A simple name-to-closure registry (useful for tests and prototyping).
#[derive(Default)]
pub struct FunctionRegistry {
    fns: HashMap<String, ExternalFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnMut(Vec<Variant>) -> Result<Variant> + 'static,
    {
        self.fns.insert(name.into(), Box::new(f));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }
}

impl FunctionHandler for FunctionRegistry {
    fn invoke(&mut self, name: &str, args: Vec<Variant>) -> Result<Variant> {
        match self.fns.get_mut(name) {
            Some(f) => f(args),
            None => bail!("unregistered external function: {name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_by_name() {
        let mut reg = FunctionRegistry::new();
        reg.register("double", |args| {
            let n = args[0].as_int().unwrap_or(0);
            Ok(Variant::Int(n * 2))
        });

        assert!(reg.is_registered("double"));
        let out = reg.invoke("double", vec![Variant::Int(21)]).unwrap();
        assert_eq!(out, Variant::Int(42));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let mut reg = FunctionRegistry::new();
        assert!(reg.invoke("missing", Vec::new()).is_err());
    }
}
