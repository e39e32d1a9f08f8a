pub mod chain;
pub mod proxy;
pub mod redis;
pub mod routes;
pub mod server;

pub mod stages {
    pub mod headers;
    pub mod path;
}
