//! Native modules: named tables of host functions the engine can import and call.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;

use super::object::{BorrowedRef, Ref};
use super::Held;

pub type NativeFn = Arc<dyn Fn(Held<'_>, &Args<'_>) -> Result<Ref, EngineError> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Native {
    pub name: String,
    pub func: NativeFn,
}

/// Arguments as seen by a native: borrowed views into the caller's call frame.
pub struct Args<'a> {
    positional: Vec<BorrowedRef<'a>>,
    keywords: Vec<(String, BorrowedRef<'a>)>,
}

impl<'a> Args<'a> {
    pub(crate) fn new(positional: Vec<BorrowedRef<'a>>, keywords: Vec<(String, BorrowedRef<'a>)>) -> Self {
        Args {
            positional: positional,
            keywords: keywords,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<BorrowedRef<'a>> {
        self.positional.get(index).cloned()
    }

    pub fn keyword(&self, name: &str) -> Option<BorrowedRef<'a>> {
        self.keywords.iter().find(|&&(ref k, _)| k == name).map(|&(_, v)| v)
    }

    /// Positional `index`, falling back to keyword `name`.
    pub fn arg(&self, index: usize, name: &str) -> Option<BorrowedRef<'a>> {
        self.get(index).or_else(|| self.keyword(name))
    }
}

/// A module definition registered with the interpreter before import.
pub struct ModuleDef {
    name: String,
    functions: Vec<(String, NativeFn)>,
}

impl ModuleDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ModuleDef {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn function<S, F>(mut self, name: S, f: F) -> Self where
    S: Into<String>,
    F: Fn(Held<'_>, &Args<'_>) -> Result<Ref, EngineError> + Send + Sync + 'static,
    {
        let func: NativeFn = Arc::new(f);
        self.functions.push((name.into(), func));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// (attribute name, native) pairs for building the module object.
    pub(crate) fn natives(&self) -> impl Iterator<Item = (&str, Native)> {
        self.functions.iter().map(move |&(ref name, ref func)| {
            (name.as_str(), Native {
                name: format!("{}.{}", self.name, name),
                func: func.clone(),
            })
        })
    }

    pub(crate) fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|&(ref name, _)| name.as_str())
    }
}

impl fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleDef")
            .field("name", &self.name)
            .field("functions", &self.function_names().collect::<Vec<_>>())
            .finish()
    }
}
