// Domain layer - Plain data and pure rules
pub mod device;
pub mod power;
