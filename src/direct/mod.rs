mod file;

pub use file::DirectAreaFile;
