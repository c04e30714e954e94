pub mod gemini;
pub mod upstream;
