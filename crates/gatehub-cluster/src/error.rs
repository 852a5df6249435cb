use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("no node available")]
    NoNodeAvailable,

    #[error("no node or node is down")]
    NoNodeOrDown,

    #[error("grpc service code {0} not found")]
    ServiceNotFound(i32),

    #[error("lease not granted")]
    LeaseNotGranted,

    #[error("keeper already started")]
    AlreadyStarted,

    #[error("invalid node entry: {0}")]
    InvalidEntry(String),

    #[error("kv backend error: {0}")]
    Kv(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("grpc status: {0}")]
    Status(#[from] tonic::Status),
}
