pub mod buildings;
pub mod issues;
pub mod projects;
pub mod storage;
