//! Output of image products.

pub mod error;
pub mod fits;

pub use error::ExportError;
pub use fits::{write_image_fits, ExportMeta, ExportTarget};
