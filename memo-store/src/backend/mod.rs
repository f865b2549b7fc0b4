pub mod car;
pub mod embedded;
pub mod http;
pub mod sqlite;
