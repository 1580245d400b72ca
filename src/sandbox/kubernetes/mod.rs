pub mod pod;
pub mod transport;
