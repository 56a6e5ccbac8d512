//! Transform composition into a single static pull field.

mod binding;
mod chain;

pub use binding::{LinkBinding, LinkFiles};
pub use chain::{ComposedTransform, TransformChain};
