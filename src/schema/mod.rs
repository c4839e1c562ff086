pub mod object;
pub mod output;
pub mod story;
pub mod value;
