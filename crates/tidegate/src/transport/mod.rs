pub mod buffered;
pub mod stock;
pub mod stream;
pub mod tls;
