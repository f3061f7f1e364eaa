pub mod browser;
pub mod clock;
pub mod git;
pub mod http_probe;
pub mod persistence;
pub mod sandbox;
pub mod screenshots;
