pub mod analyze;
pub mod build;
pub mod fix;
pub mod llm;
pub mod testgen;
