use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registry read failed: {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error for {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("no perf_event RAPL support found (requires Linux 3.14 or later)")]
    RaplUnsupported,

    #[error(
        "permission denied opening energy counters; run as root or lower kernel.perf_event_paranoid"
    )]
    PermissionDenied,

    #[error("failed to open energy counter for cpu {cpu}, domain {domain}: {source}")]
    CounterOpen {
        cpu: u32,
        domain: &'static str,
        source: std::io::Error,
    },

    #[error("energy counter read failed: {0}")]
    CounterRead(std::io::Error),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("gpu query failed: {0}")]
    Gpu(String),

    #[error("child output read failed: {0}")]
    ChildRead(std::io::Error),

    #[error("failed to reap child: {0}")]
    Reap(std::io::Error),

    #[error("output write failed: {0}")]
    Output(#[from] std::io::Error),

    #[error("event wait failed: {0}")]
    EventLoop(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
