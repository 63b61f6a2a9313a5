pub mod chunking;
pub mod config;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod gemini;
pub mod generation;
pub mod index;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod rag;
pub mod retriever;
