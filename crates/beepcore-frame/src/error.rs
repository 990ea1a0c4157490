/// Errors that can occur while building or interpreting frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame type keyword is not one of MSG, RPY, ERR, ANS, NUL.
    #[error("unknown frame type '{0}'")]
    UnknownFrameType(String),

    /// The payload does not fit in the 32-bit size field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
