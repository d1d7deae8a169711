pub mod db;
pub mod extraction_llm;

pub use db::DbAdapter;
pub use extraction_llm::OpenAiExtractionAdapter;
