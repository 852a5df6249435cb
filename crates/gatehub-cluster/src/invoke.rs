//! Dynamic unary gRPC invocation.
//!
//! The gateway forwards opaque protobuf payloads without knowing their
//! message types, so calls go through a raw codec that passes bytes straight
//! through. The method path is assembled from the service descriptor's path
//! prefix and the request's method name.

use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Request, Status};

/// Joins a service path prefix and a method name into a gRPC method path.
pub fn join_method_path(prefix: &str, method: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        method.trim_start_matches('/')
    )
}

/// Identity codec: both directions are raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Invokes `path` on `channel` with an opaque payload.
///
/// `metadata` becomes the outgoing request metadata; the reply payload comes
/// back as raw bytes. All failures surface as [`Status`] so the caller can
/// map them onto the client-facing error taxonomy.
pub async fn invoke_unary(
    channel: Channel,
    path: &str,
    metadata: MetadataMap,
    payload: Bytes,
) -> Result<Bytes, Status> {
    let path = path
        .parse::<PathAndQuery>()
        .map_err(|err| Status::internal(format!("invalid method path {path:?}: {err}")))?;

    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|err| Status::unavailable(format!("connect upstream: {err}")))?;

    let mut request = Request::new(payload);
    *request.metadata_mut() = metadata;

    let response = grpc.unary(request, path, RawCodec).await?;
    Ok(response.into_inner())
}
