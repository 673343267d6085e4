pub mod access;
pub mod ingestion;
pub mod storage;
