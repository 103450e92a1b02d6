//! Context accumulator.
//!
//! The context is a plain JSON object passed by value into each step and
//! replaced by the merged result. Merges are shallow and last-writer-wins.

use keel_types::Context;

/// Merge `update` into `context`, overwriting keys that already exist.
pub fn merge_into(context: &mut Context, update: &Context) {
    for (key, value) in update {
        context.insert(key.clone(), value.clone());
    }
}

/// Rebuild a run's working context: the original input overlaid with
/// everything accumulated before the interruption.
pub fn rehydrate(input: &Context, accumulated: &Context) -> Context {
    let mut context = input.clone();
    merge_into(&mut context, accumulated);
    context
}
