pub mod atom;
pub mod catalog;
pub mod error;
pub mod geom;
pub mod pipeline;
pub mod program;
pub mod queue;
pub mod settings;
pub mod task;

pub use error::{Error, Result};


/// from [StackOverflow](https://stackoverflow.com/a/45145246)
#[macro_export]
macro_rules! string {
    // match a list of expressions separated by comma:
    ($($str:expr),*) => ({
        // create a Vec with this list of expressions,
        // calling String::from on each:
        vec![$(String::from($str),)*] as Vec<String>
    });
}
