mod data;
mod file;
mod page_manager;

pub use data::{DataArray, DataSchema, FieldType, Value};
pub use file::VectorFile;
pub use page_manager::{Operation, PageManager};
