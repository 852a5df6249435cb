//! Process-wide reply-type registry.
//!
//! Maps `(service code, reply code)` to a payload decoder so client-side
//! tooling can turn opaque reply bytes back into typed values. The registry
//! is built once during startup and installed into a process-wide slot;
//! after that it is read-only.

use std::any::Any;
use std::collections::HashMap;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;

use crate::error::ProtoError;

type PayloadDecoder =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, ProtoError> + Send + Sync>;

static GLOBAL: OnceLock<ReplyTypeRegistry> = OnceLock::new();

/// Registry of reply payload decoders.
#[derive(Default)]
pub struct ReplyTypeRegistry {
    decoders: HashMap<(i32, i32), PayloadDecoder>,
}

impl ReplyTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the payload type for a `(service, code)` pair.
    ///
    /// Later registrations for the same pair replace earlier ones.
    pub fn register<T>(&mut self, service_code: i32, reply_code: i32) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.decoders.insert(
            (service_code, reply_code),
            Box::new(|data| {
                let value: T = postcard::from_bytes(data)?;
                Ok(Box::new(value))
            }),
        );
        self
    }

    /// Whether a decoder is registered for the pair.
    pub fn contains(&self, service_code: i32, reply_code: i32) -> bool {
        self.decoders.contains_key(&(service_code, reply_code))
    }

    /// Decodes a reply payload through the registered decoder.
    pub fn decode(
        &self,
        service_code: i32,
        reply_code: i32,
        data: &[u8],
    ) -> Result<Box<dyn Any + Send>, ProtoError> {
        let decoder = self
            .decoders
            .get(&(service_code, reply_code))
            .ok_or(ProtoError::UnknownReplyType {
                service: service_code,
                code: reply_code,
            })?;
        decoder(data)
    }

    /// Installs this registry as the process-wide one.
    ///
    /// Fails if a registry was already installed; the registry is meant to
    /// be assembled once during startup.
    pub fn install(self) -> Result<(), ProtoError> {
        GLOBAL.set(self).map_err(|_| ProtoError::RegistryInstalled)
    }

    /// The process-wide registry, if one has been installed.
    pub fn global() -> Option<&'static ReplyTypeRegistry> {
        GLOBAL.get()
    }
}
