pub mod rotator;

pub use rotator::ProxyRotator;
