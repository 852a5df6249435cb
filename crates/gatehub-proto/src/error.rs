use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("payload size exceeds the limit: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("reply type registry already installed")]
    RegistryInstalled,

    #[error("unknown reply type for service {service} code {code}")]
    UnknownReplyType { service: i32, code: i32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
