pub mod audit;
pub mod execution;
pub mod tenant;
