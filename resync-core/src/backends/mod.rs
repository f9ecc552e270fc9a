pub mod local;

pub use local::LocalUploader;
