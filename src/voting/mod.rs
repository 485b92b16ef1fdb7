pub mod positional;

pub use positional::{score, weight};
