use thiserror::Error;

use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("cluster error: {0}")]
    Cluster(#[from] gatehub_cluster::ClusterError),

    #[error("bus error: {0}")]
    Bus(#[from] gatehub_bus::BusError),

    #[error("deny by authorizer")]
    DenyByAuthorizer,

    #[error("connect interceptor: {0}")]
    ConnectRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
