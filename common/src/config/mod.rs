pub mod load_style;

pub use load_style::{Format, LoadStyle};
