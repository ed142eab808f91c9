#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid connection tracker configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Failed to spawn connection reaper thread")]
    SpawnReaper(#[source] std::io::Error),
}
