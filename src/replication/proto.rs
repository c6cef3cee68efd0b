//! Wire messages for replication sessions. Every frame on the stream is one length-prefixed
//! `ProtoFrame`.

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoFrame {
    #[prost(oneof = "proto_frame::Body", tags = "1, 2, 3, 4, 5")]
    pub body: Option<proto_frame::Body>,
}

pub(crate) mod proto_frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub(crate) enum Body {
        #[prost(message, tag = "1")]
        Handshake(super::ProtoHandshake),
        #[prost(message, tag = "2")]
        Have(super::ProtoHave),
        #[prost(message, tag = "3")]
        Entries(super::ProtoEntries),
        #[prost(message, tag = "4")]
        SyncComplete(super::ProtoSyncComplete),
        #[prost(message, tag = "5")]
        Extension(super::ProtoExtension),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoHandshake {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub discovery_handle: Vec<u8>,
    #[prost(string, repeated, tag = "3")]
    pub extensions: Vec<String>,
    #[prost(bool, tag = "4")]
    pub live: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoHave {
    #[prost(message, repeated, tag = "1")]
    pub logs: Vec<ProtoLogHead>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoLogHead {
    #[prost(bytes = "vec", tag = "1")]
    pub read_key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub length: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoEntries {
    #[prost(bytes = "vec", tag = "1")]
    pub read_key: Vec<u8>,
    /// Each entry in its stored byte layout.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub entries: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoSyncComplete {}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoExtension {
    /// Index into the sender's handshake `extensions`.
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}
