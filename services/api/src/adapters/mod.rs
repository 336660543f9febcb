pub mod db;

pub use db::PgRecordStore;
