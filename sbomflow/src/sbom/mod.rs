pub mod document;
pub mod generator;

pub use document::{Bom, ComponentId, SbomResult, SbomYield, parse_sbom_file};
pub use generator::{HostEnvironment, SBOM_FILE, SbomCommand, SbomGenerator, execute_all};
