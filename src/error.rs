use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("runtime not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("executor is shut down")]
    Shutdown,

    #[error("wait deadline elapsed")]
    Timeout,

    #[error("task was cancelled")]
    Cancelled,

    #[error("cannot cross the process boundary: {0}")]
    Unserializable(String),

    #[error("call from the loop thread would deadlock the event loop")]
    ReentrantCall,

    #[error("no job registered under {0:?}")]
    UnknownJob(String),

    #[error("task panicked: {0}")]
    Panic(String),

    #[error("task failed: {0}")]
    Work(Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Wrap an error raised by a unit of work. The original error is kept
    /// intact and shared, so every holder of the task handle observes it.
    pub fn work<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Work(Arc::new(err))
    }

    /// A work error that only exists as a message, e.g. one relayed from a
    /// worker process.
    pub fn work_message<S: Into<String>>(msg: S) -> Self {
        Error::Work(Arc::new(MessageError(msg.into())))
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn unserializable<S: Into<String>>(msg: S) -> Self {
        Error::Unserializable(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[derive(Debug)]
pub(crate) struct MessageError(pub(crate) String);

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}
