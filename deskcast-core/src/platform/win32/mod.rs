//! Windows capture stack: DXGI desktop duplication, GDI `BitBlt`
//! fallback, monitor enumeration and cursor queries.
//!
//! All unsafe FFI is confined to this module tree.

mod cursor;
mod displays;
mod dxgi;
mod gdi;

pub use cursor::WindowsCursor;
pub use displays::WindowsDisplays;
pub use dxgi::{DxgiOutput, DxgiOutputFactory};
pub use gdi::GdiBackend;
