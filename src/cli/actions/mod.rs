pub mod server;

use crate::config::EngineConfig;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        config: EngineConfig,
    },
}
