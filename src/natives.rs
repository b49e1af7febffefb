//! A small native module for driving the engine from the command line and from tests.

use std::sync::Arc;

use crate::engine::{Args, Held, ModuleDef, Ref};
use crate::error::EngineError;

/// Where the counting natives send their lines.
pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// A module with `print_odds(limit)` and `print_even(limit)`. Each emits one line per number
/// below `limit` with the matching parity and returns None.
///
/// `limit` may be passed positionally or as a keyword.
pub fn counting_module<S: Into<String>>(name: S, sink: LineSink) -> ModuleDef {
    let odds_sink = sink.clone();
    ModuleDef::new(name)
        .function("print_odds", move |held, args| count(held, args, 1, "odds", &odds_sink))
        .function("print_even", move |held, args| count(held, args, 0, "even", &sink))
}

fn count(held: Held<'_>, args: &Args<'_>, parity: i64, label: &str, sink: &LineSink) -> Result<Ref, EngineError> {
    let limit = match args.arg(0, "limit") {
        Some(limit) => held.int_value(&limit)?,
        None => return Err(EngineError::Invocation("missing required argument 'limit'".into())),
    };
    for i in (0..limit).filter(|i| i % 2 == parity) {
        sink(format!("{}: {}", label, i));
    }
    Ok(held.make_none())
}
