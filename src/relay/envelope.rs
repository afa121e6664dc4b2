//! Wire messages of the log ingestion service (`loggregator.v2`)
//!
//! Only the subset the relay sends is declared: log envelopes, the batch
//! wrapper and the empty response of `Ingress/Send`.

#![allow(missing_docs)]

use std::collections::HashMap;

/// Full gRPC path of the batch send method
pub const INGRESS_SEND_PATH: &str = "/loggregator.v2.Ingress/Send";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub source_id: String,
    #[prost(string, tag = "8")]
    pub instance_id: String,
    #[prost(map = "string, string", tag = "9")]
    pub tags: HashMap<String, String>,
    #[prost(oneof = "envelope::Message", tags = "4")]
    pub message: Option<envelope::Message>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "4")]
        Log(super::Log),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Log {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(enumeration = "LogType", tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogType {
    Out = 0,
    Err = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeBatch {
    #[prost(message, repeated, tag = "1")]
    pub batch: Vec<Envelope>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SendResponse {}

impl Envelope {
    /// Payload of a log envelope, if this is one
    pub fn log_payload(&self) -> Option<&[u8]> {
        match &self.message {
            Some(envelope::Message::Log(log)) => Some(&log.payload),
            None => None,
        }
    }
}
