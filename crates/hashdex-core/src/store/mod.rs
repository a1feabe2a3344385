pub mod database;
pub mod hash_store;
pub mod schema;
pub mod storage;
