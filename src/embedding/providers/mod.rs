pub mod local;
pub mod ollama;
pub mod remote;
