#[macro_use]
pub mod named;
pub mod rustls;

pub use named::named;
