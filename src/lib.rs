pub mod config;
pub mod fetcher;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod projector;
pub mod retry;
pub mod sink;
pub mod source;
pub mod store;

pub mod util {
    pub mod db;
    pub mod env;
}
